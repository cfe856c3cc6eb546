//! Low-precision tensor kernels for the transformer project.
//!
//! Tensors reach the kernels as an [`Operand`]: either a plain `f32` candle
//! tensor or a [`PackedTensor`] that stores two IEEE half-precision values per
//! 32-bit lane. Every op matches on that capability tag to choose between the
//! packed and the plain code path, and every op ships a forward function that
//! returns the state its gradient rule needs plus a backward function that
//! consumes it.
//!
//! The CPU reference implementations in this crate are the correctness oracle
//! for any accelerated backend registered through [`registry::KernelRegistry`].

use thiserror::Error;

pub mod activations;
pub mod checks;
pub mod dropout;
pub mod matmul;
pub mod norm;
pub mod operand;
pub mod packed;
pub mod reduce;
pub mod registry;
pub mod softmax;
pub mod variable;

pub use operand::Operand;
pub use packed::{pack, unpack, PackOptions, PackedTensor};
pub use variable::Variable;

/// Errors surfaced by kernel construction and dispatch.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Static configuration is invalid (odd rotary dims, mismatched lengths, ...).
    #[error("configuration error: {0}")]
    Config(String),
    /// A public call received arguments that violate its contract.
    #[error("usage error: {0}")]
    Usage(String),
    /// Operands disagree on packed/unpacked representation.
    #[error("precision error: {0}")]
    Precision(String),
    /// The requested combination has no implementation.
    #[error("{op} does not support {detail}")]
    Unsupported { op: &'static str, detail: String },
    /// Failure bubbled up from the candle runtime.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl From<std::convert::Infallible> for KernelError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

/// Result alias used across the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
