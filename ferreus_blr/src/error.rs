/////////////////////////////////////////////////////////////////////////////////////////////
//
// Declares the error taxonomy shared by clustering, formats, compression and block matrices.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use thiserror::Error;

/// Error reported by a [`BlockKernel`](crate::BlockKernel) when it cannot
/// produce the requested entries.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct KernelError {
    pub message: String,
}

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that can occur while building or applying a block low-rank matrix.
#[derive(Debug, Error)]
pub enum BlrError {
    /// Malformed shapes, empty blocks, inconsistent symmetry flags or
    /// out of range block indices.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A buffer of `bytes` bytes could not be allocated.
    #[error("Out of memory: failed to allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// A dense factorisation did not converge.
    #[error("Numerical failure: {message}")]
    NumericalFailure { message: String },

    /// The kernel callback signalled an error.
    #[error("Kernel failure: {0}")]
    KernelFailure(#[from] KernelError),
}

impl BlrError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        BlrError::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn numerical(message: impl Into<String>) -> Self {
        BlrError::NumericalFailure {
            message: message.into(),
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, BlrError>;

/// Allocates a zero-initialised vector, reporting allocation failure as
/// [`BlrError::OutOfMemory`] instead of aborting.
pub(crate) fn try_zeroed<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| BlrError::OutOfMemory {
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
        })?;
    buffer.resize(len, T::default());
    Ok(buffer)
}
