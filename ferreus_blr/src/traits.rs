/////////////////////////////////////////////////////////////////////////////////////////////
//
// Declares the kernel evaluation and linear operator traits used at the crate boundaries.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use crate::{array::Element, error::{KernelError, Result}};
use faer::{MatMut, MatRef, RowRef};

/// Evaluates a kernel function between a target and source point.
///
/// Implementors define how the kernel is computed given two
/// [`faer::RowRef<f64>`](https://docs.rs/faer/latest/faer/row/type.RowRef.html)
/// arguments representing the target and source locations. Wrap an
/// implementor in a [`PointKernel`](crate::PointKernel) to build a
/// [`Problem`](crate::Problem) over point clouds.
pub trait KernelFunction: Send + Sync {
    fn evaluate(&self, target: RowRef<f64>, source: RowRef<f64>) -> f64;
}

/// Computes entries of a matrix on the intersection of given rows and columns.
///
/// The kernel never sees the whole matrix: it receives the (pivoted) row and
/// column indices of a block together with the physical data of the row and
/// column sides, and writes the block into `out` in column-major order.
/// For problems with `ndim > 2` every (row, column) pair produces an entry of
/// several elements and `out` has layout `rows x entry x cols`.
///
/// Implementations must be deterministic and free of side effects, since
/// blocks are evaluated concurrently and may be evaluated more than once.
pub trait BlockKernel: Send + Sync {
    type Elem: Element;
    type RowData: ?Sized + Send + Sync;
    type ColData: ?Sized + Send + Sync;

    fn evaluate(
        &self,
        row_indices: &[usize],
        col_indices: &[usize],
        row_data: &Self::RowData,
        col_data: &Self::ColData,
        out: &mut [Self::Elem],
    ) -> std::result::Result<(), KernelError>;
}

/// A linear map `Y := alpha * A * X + beta * Y`, the only interface iterative
/// solvers need.
pub trait LinearOperator: Sync {
    fn nrows(&self) -> usize;

    fn ncols(&self) -> usize;

    fn apply(&self, alpha: f64, x: MatRef<f64>, beta: f64, y: MatMut<f64>) -> Result<()>;
}
