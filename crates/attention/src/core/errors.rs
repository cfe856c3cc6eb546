//! Error types emitted by attention implementations.

use kernels::KernelError;

/// Attention-specific error category.
#[derive(Debug)]
pub enum AttentionError {
    /// Static configuration is invalid (odd rotary dims, mismatched mask lengths, ...).
    Config { message: String },
    /// A call received arguments that violate its contract; nothing was mutated.
    Usage { message: String },
    /// The supplied tensor shapes do not align with the documented contract.
    InvalidShape { context: String },
    /// Operands disagree on packed/unpacked representation.
    Precision { message: String },
    /// The requested combination has no implementation.
    Unsupported { op: &'static str, detail: String },
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl AttentionError {
    pub fn config(message: impl Into<String>) -> Self {
        AttentionError::Config {
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        AttentionError::Usage {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::Config { message } => write!(f, "configuration error: {message}"),
            AttentionError::Usage { message } => write!(f, "usage error: {message}"),
            AttentionError::InvalidShape { context } => {
                write!(f, "invalid tensor shape for {context}")
            }
            AttentionError::Precision { message } => write!(f, "precision error: {message}"),
            AttentionError::Unsupported { op, detail } => write!(f, "{op} does not support {detail}"),
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {}

impl From<KernelError> for AttentionError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Config(message) => AttentionError::Config { message },
            KernelError::Usage(message) => AttentionError::Usage { message },
            KernelError::Precision(message) => AttentionError::Precision { message },
            KernelError::Unsupported { op, detail } => AttentionError::Unsupported { op, detail },
            KernelError::Candle(err) => AttentionError::Backend {
                message: err.to_string(),
            },
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}

/// Result alias used across the attention crate.
pub type Result<T> = std::result::Result<T, AttentionError>;
