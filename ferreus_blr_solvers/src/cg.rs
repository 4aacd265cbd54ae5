/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements a conjugate gradient solver for several right-hand sides at once.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use crate::{
    config::CgParams,
    error::{Result, SolverError},
};
use faer::{Mat, MatRef};
use ferreus_blr::{
    LinearOperator,
    progress::{ProgressMsg, ProgressSink, progress_from_rel},
};
use std::sync::Arc;

/// Result of a [`cg`] solve.
#[derive(Debug, Clone)]
pub struct CgOutcome {
    /// `n x nrhs` approximate solution.
    pub solution: Mat<f64>,

    /// Number of iterations performed, i.e. the iteration count of the
    /// slowest column.
    pub iterations: usize,

    /// Final relative residual `||b - A x|| / ||b||` of every column, as
    /// tracked by the recurrence.
    pub residuals: Vec<f64>,

    /// Whether every column reached the tolerance.
    pub converged: bool,
}

fn column_dot(a: MatRef<f64>, b: MatRef<f64>, k: usize) -> f64 {
    a.col(k)
        .iter()
        .zip(b.col(k).iter())
        .map(|(a, b)| a * b)
        .sum::<f64>()
}

/// Conjugate gradient for a symmetric positive definite operator `A`.
///
/// Solves `A X = B` for all columns of `B` together: every iteration applies
/// the operator once to the whole block of search directions, while the
/// scalar recurrences run per column. A column stops updating once its
/// residual satisfies `||r|| <= tolerance * ||b||`; the others carry on.
///
/// # Parameters
/// - `op`: Square operator, typically a [`BlockMatrix`](ferreus_blr::BlockMatrix)
/// - `b`: `n x nrhs` right-hand sides
/// - `x0`: Optional initial guess, zero otherwise
/// - `params`: Tolerance and iteration limit
/// - `callback`: Optional sink receiving a `SolverIteration` event per iteration
///
/// # Errors
/// - [`SolverError::InvalidArgument`] on dimension mismatches or a negative
///   tolerance,
/// - [`SolverError::Breakdown`] if a search direction has `pᵗAp <= 0`,
/// - [`SolverError::Blr`] if applying the operator fails.
///
/// Running out of iterations is not an error, see [`CgOutcome::converged`].
pub fn cg<A>(
    op: &A,
    b: MatRef<f64>,
    x0: Option<MatRef<f64>>,
    params: &CgParams,
    callback: Option<Arc<dyn ProgressSink>>,
) -> Result<CgOutcome>
where
    A: LinearOperator + ?Sized,
{
    let n = op.nrows();
    if op.ncols() != n {
        return Err(SolverError::invalid(format!(
            "conjugate gradient needs a square operator, got {}x{}",
            n,
            op.ncols()
        )));
    }
    if b.nrows() != n {
        return Err(SolverError::invalid(format!(
            "right-hand side has {} rows, operator has {}",
            b.nrows(),
            n
        )));
    }
    if !(params.tolerance >= 0.0) {
        return Err(SolverError::invalid("tolerance must be non-negative"));
    }
    let nrhs = b.ncols();

    let mut x = match x0 {
        Some(x0) if x0.shape() != b.shape() => {
            return Err(SolverError::invalid(format!(
                "initial guess has shape {:?}, expected {:?}",
                x0.shape(),
                b.shape()
            )));
        }
        Some(x0) => x0.to_owned(),
        None => Mat::zeros(n, nrhs),
    };
    let max_iterations = params.max_iterations.unwrap_or(n);

    // r = b - A x
    let mut r = b.to_owned();
    if x0.is_some() {
        op.apply(-1.0, x.as_ref(), 1.0, r.as_mut())?;
    }

    let b_norms: Vec<f64> = (0..nrhs).map(|k| b.col(k).norm_l2()).collect();
    let thresholds: Vec<f64> = b_norms.iter().map(|nb| params.tolerance * nb).collect();
    let relative = |residual: f64, k: usize| {
        if b_norms[k] > 0.0 { residual / b_norms[k] } else { residual }
    };

    let mut rs_old: Vec<f64> = (0..nrhs).map(|k| column_dot(r.as_ref(), r.as_ref(), k)).collect();
    let mut active: Vec<bool> = (0..nrhs)
        .map(|k| rs_old[k].sqrt() > thresholds[k])
        .collect();
    let mut residuals: Vec<f64> = (0..nrhs).map(|k| relative(rs_old[k].sqrt(), k)).collect();
    let start_residual = residuals.iter().copied().fold(0.0, f64::max);

    let mut p = r.clone();
    let mut ap = Mat::<f64>::zeros(n, nrhs);
    let mut iterations = 0usize;

    while iterations < max_iterations && active.iter().any(|&a| a) {
        iterations += 1;
        op.apply(1.0, p.as_ref(), 0.0, ap.as_mut())?;

        for k in 0..nrhs {
            if !active[k] {
                continue;
            }

            let p_ap = column_dot(p.as_ref(), ap.as_ref(), k);
            if !(p_ap > 0.0) {
                return Err(SolverError::Breakdown {
                    column: k,
                    iteration: iterations,
                });
            }

            let alpha = rs_old[k] / p_ap;
            for i in 0..n {
                x[(i, k)] += alpha * p[(i, k)];
                r[(i, k)] -= alpha * ap[(i, k)];
            }

            let rs_new = column_dot(r.as_ref(), r.as_ref(), k);
            residuals[k] = relative(rs_new.sqrt(), k);
            if rs_new.sqrt() <= thresholds[k] {
                active[k] = false;
                continue;
            }

            let beta = rs_new / rs_old[k];
            for i in 0..n {
                p[(i, k)] = r[(i, k)] + beta * p[(i, k)];
            }
            rs_old[k] = rs_new;
        }

        let worst = residuals.iter().copied().fold(0.0, f64::max);
        if let Some(sink) = &callback {
            sink.emit(ProgressMsg::SolverIteration {
                iter: iterations,
                residual: worst,
                progress: progress_from_rel(worst, start_residual, params.tolerance),
            });
        }
    }

    let converged = active.iter().all(|&a| !a);
    if converged {
        log::debug!("cg converged in {} iterations for {} right-hand sides", iterations, nrhs);
    } else {
        log::warn!(
            "cg stopped after {} iterations with relative residuals {:?}",
            iterations,
            residuals
        );
    }

    Ok(CgOutcome {
        solution: x,
        iterations,
        residuals,
        converged,
    })
}
