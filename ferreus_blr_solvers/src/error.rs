/////////////////////////////////////////////////////////////////////////////////////////////
//
// Defines the error type returned by the iterative solvers.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use ferreus_blr::BlrError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolverError {
    /// The operator failed to apply, e.g. a kernel evaluation error.
    #[error(transparent)]
    Blr(#[from] BlrError),

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// `pᵗAp <= 0` was met, so the operator is not symmetric positive definite.
    #[error(
        "Conjugate gradient breakdown in column {column} at iteration {iteration}: \
         operator is not positive definite"
    )]
    Breakdown { column: usize, iteration: usize },
}

impl SolverError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        SolverError::InvalidArgument {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SolverError>;
