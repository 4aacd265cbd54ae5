/////////////////////////////////////////////////////////////////////////////////////////////
//
// Defines the configuration types for the iterative solvers.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use serde::{Deserialize, Serialize};

/// Options for [`cg`](crate::cg).
///
/// ### Default Values
/// - `tolerance`: `1e-8`
/// - `max_iterations`: `None`, meaning the order of the operator
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
pub struct CgParams {
    /// A column has converged once `||b - A x|| <= tolerance * ||b||`.
    pub tolerance: f64,

    /// Upper bound on the number of iterations.
    pub max_iterations: Option<usize>,
}

impl Default for CgParams {
    fn default() -> Self {
        CgParams {
            tolerance: 1e-8,
            max_iterations: None,
        }
    }
}
