//! Lightweight validation helpers shared across kernels.
//!
//! These routines provide concise shape and representation assertions that can
//! be wired into op entry points. They return [`crate::Result`] so call sites
//! can propagate errors without panicking.

use crate::{KernelError, Operand, Result};

/// Ensures a shape has exactly `rank` dimensions.
pub fn expect_rank(context: &str, dims: &[usize], rank: usize) -> Result<()> {
    if dims.len() == rank {
        Ok(())
    } else {
        Err(KernelError::Usage(format!(
            "{context}: expected rank {rank}, got {:?}",
            dims
        )))
    }
}

/// Ensures a shape has at least `rank` dimensions.
pub fn expect_min_rank(context: &str, dims: &[usize], rank: usize) -> Result<()> {
    if dims.len() >= rank {
        Ok(())
    } else {
        Err(KernelError::Usage(format!(
            "{context}: expected rank >= {rank}, got {:?}",
            dims
        )))
    }
}

/// Ensures a shape matches the expected dimensions exactly.
pub fn expect_shape(context: &str, dims: &[usize], expected: &[usize]) -> Result<()> {
    if dims == expected {
        Ok(())
    } else {
        Err(KernelError::Usage(format!(
            "{context}: expected shape {:?}, got {:?}",
            expected, dims
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size and
/// returns `(batch, seq)`.
pub fn expect_batch_seq_hidden(context: &str, dims: &[usize], hidden: usize) -> Result<(usize, usize)> {
    match dims {
        [batch, seq, actual] if *actual == hidden => Ok((*batch, *seq)),
        _ => Err(KernelError::Usage(format!(
            "{context}: expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Packed storage pairs adjacent elements of the last axis, so it must be even.
pub fn expect_even_last(context: &str, dims: &[usize]) -> Result<()> {
    match dims.last() {
        Some(last) if last % 2 == 0 => Ok(()),
        _ => Err(KernelError::Config(format!(
            "{context}: packed layout requires an even last dimension, got {:?}",
            dims
        ))),
    }
}

/// Rejects operand pairs that mix packed and plain representations.
pub fn expect_same_representation(context: &str, a: &Operand, b: &Operand) -> Result<()> {
    if a.is_packed() == b.is_packed() {
        Ok(())
    } else {
        Err(KernelError::Precision(format!(
            "{context}: operands must both be packed or both be plain (got packed={} and packed={})",
            a.is_packed(),
            b.is_packed()
        )))
    }
}

/// Number of elements described by `dims`.
pub fn elem_count(dims: &[usize]) -> usize {
    dims.iter().product()
}
