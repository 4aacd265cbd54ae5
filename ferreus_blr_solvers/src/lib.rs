/////////////////////////////////////////////////////////////////////////////////////////////
//
// Exposes iterative solvers operating on block low-rank matrices.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Iterative solvers for block low-rank matrices.
//!
//! The solvers only need the product `Y := alpha * A * X + beta * Y`, so they
//! accept anything implementing [`ferreus_blr::LinearOperator`], in
//! particular a compressed [`ferreus_blr::BlockMatrix`].
//!
//! - [`cg`] - conjugate gradient for symmetric positive definite operators,
//!   solving several right-hand sides together.
pub mod config;

mod cg;

mod error;

pub use {
    cg::{CgOutcome, cg},
    config::CgParams,
    error::{Result, SolverError},
};
