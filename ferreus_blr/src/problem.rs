/////////////////////////////////////////////////////////////////////////////////////////////
//
// Couples a block kernel with its row/column physical data to produce submatrices on demand.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use crate::{
    array::{Element, ElementKind, NdArray, Order},
    error::{BlrError, KernelError, Result, try_zeroed},
    traits::{BlockKernel, KernelFunction},
};
use faer::{Mat, MatRef};
use std::fmt;
use std::sync::Arc;

/// Everything needed to reconstruct a matrix whose entries are computed on
/// demand by a [`BlockKernel`].
///
/// Rows correspond to the first dimension and columns to the last
/// dimension. For non-scalar kernels (`ndim > 2`) the middle dimensions
/// describe the shape of a single entry.
///
/// The row and column data are shared, not copied: the problem only holds
/// an [`Arc`] to them.
pub struct Problem<K: BlockKernel> {
    shape: Vec<usize>,
    symmetric: bool,
    entry_len: usize,
    row_data: Arc<K::RowData>,
    col_data: Arc<K::ColData>,
    kernel: K,
    name: String,
}

impl<K: BlockKernel> Problem<K> {
    /// Creates a new problem.
    ///
    /// # Errors
    /// [`BlrError::InvalidArgument`] if `shape` has fewer than two
    /// dimensions or a zero dimension, or if `symmetric` is requested for a
    /// non-square shape or for distinct row and column data.
    pub fn new(
        shape: &[usize],
        symmetric: bool,
        row_data: Arc<K::RowData>,
        col_data: Arc<K::ColData>,
        kernel: K,
        name: impl Into<String>,
    ) -> Result<Self> {
        if shape.len() < 2 {
            return Err(BlrError::invalid(format!(
                "problem needs at least 2 dimensions, got {}",
                shape.len()
            )));
        }
        if shape.iter().any(|&n| n == 0) {
            return Err(BlrError::invalid(format!(
                "problem shape {:?} has an empty dimension",
                shape
            )));
        }
        if symmetric {
            if shape[0] != shape[shape.len() - 1] {
                return Err(BlrError::invalid(format!(
                    "symmetric problem must be square, got shape {:?}",
                    shape
                )));
            }
            if !std::ptr::addr_eq(Arc::as_ptr(&row_data), Arc::as_ptr(&col_data)) {
                return Err(BlrError::invalid(
                    "symmetric problem must use the same row and column data",
                ));
            }
        }

        let entry_len = shape[1..shape.len() - 1].iter().product();

        Ok(Self {
            shape: shape.to_vec(),
            symmetric,
            entry_len,
            row_data,
            col_data,
            kernel,
            name: name.into(),
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn nrows(&self) -> usize {
        self.shape[0]
    }

    pub fn ncols(&self) -> usize {
        self.shape[self.shape.len() - 1]
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn kind(&self) -> ElementKind {
        K::Elem::KIND
    }

    pub fn element_size(&self) -> usize {
        std::mem::size_of::<K::Elem>()
    }

    /// Size in bytes of the entry produced by one (row, column) pair.
    pub fn entry_size(&self) -> usize {
        self.entry_len * self.element_size()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Evaluates the kernel into a caller provided column-major buffer of
    /// `rows * entry * cols` elements.
    pub fn evaluate_into(
        &self,
        row_indices: &[usize],
        col_indices: &[usize],
        out: &mut [K::Elem],
    ) -> Result<()> {
        let expected = row_indices.len() * self.entry_len * col_indices.len();
        if out.len() != expected {
            return Err(BlrError::invalid(format!(
                "output buffer has {} elements, expected {}",
                out.len(),
                expected
            )));
        }
        if let Some(&row) = row_indices.iter().find(|&&r| r >= self.nrows()) {
            return Err(BlrError::invalid(format!("row index {} out of range", row)));
        }
        if let Some(&col) = col_indices.iter().find(|&&c| c >= self.ncols()) {
            return Err(BlrError::invalid(format!("column index {} out of range", col)));
        }
        self.kernel.evaluate(
            row_indices,
            col_indices,
            &self.row_data,
            &self.col_data,
            out,
        )?;
        Ok(())
    }

    /// Evaluates the submatrix on the intersection of the given rows and
    /// columns. The result has shape `[rows, entry shape..., cols]` in
    /// column-major order.
    pub fn get_block(
        &self,
        row_indices: &[usize],
        col_indices: &[usize],
    ) -> Result<NdArray<K::Elem>> {
        let mut shape = self.shape.clone();
        shape[0] = row_indices.len();
        let last = shape.len() - 1;
        shape[last] = col_indices.len();

        let mut block = NdArray::zeros(&shape, Order::ColMajor)?;
        self.evaluate_into(row_indices, col_indices, block.as_mut_slice()?)?;
        Ok(block)
    }

    /// Evaluates the whole matrix. Intended for validation on small problems.
    pub fn to_array(&self) -> Result<NdArray<K::Elem>> {
        let rows: Vec<usize> = (0..self.nrows()).collect();
        let cols: Vec<usize> = (0..self.ncols()).collect();
        self.get_block(&rows, &cols)
    }
}

impl Problem<DenseKernel> {
    /// Wraps an explicitly stored 2-D matrix as a problem.
    ///
    /// # Errors
    /// [`BlrError::InvalidArgument`] if the array is not 2-D, or if
    /// `symmetric` is requested for a non-square matrix.
    pub fn from_array(array: NdArray<f64>, symmetric: bool) -> Result<Self> {
        if array.ndim() != 2 {
            return Err(BlrError::invalid(format!(
                "expected a 2-D array, got shape {:?}",
                array.shape()
            )));
        }
        let shape = array.shape().to_vec();
        let data = Arc::new(array);
        Problem::new(
            &shape,
            symmetric,
            data.clone(),
            data,
            DenseKernel,
            "dense array",
        )
    }
}

impl<K: BlockKernel> fmt::Display for Problem<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Problem \"{}\": shape {:?}, {}, {:?}, entry size {} bytes>",
            self.name,
            self.shape,
            if self.symmetric { "symmetric" } else { "non-symmetric" },
            self.kind(),
            self.entry_size()
        )
    }
}

/// Kernel reading entries of an explicitly stored dense matrix.
#[derive(Debug, Clone, Copy)]
pub struct DenseKernel;

impl BlockKernel for DenseKernel {
    type Elem = f64;
    type RowData = NdArray<f64>;
    type ColData = NdArray<f64>;

    fn evaluate(
        &self,
        row_indices: &[usize],
        col_indices: &[usize],
        row_data: &NdArray<f64>,
        _col_data: &NdArray<f64>,
        out: &mut [f64],
    ) -> std::result::Result<(), KernelError> {
        let matrix = row_data
            .as_mat_ref()
            .map_err(|e| KernelError::new(e.to_string()))?;
        let nrows = row_indices.len();
        for (j, &col) in col_indices.iter().enumerate() {
            for (i, &row) in row_indices.iter().enumerate() {
                out[i + j * nrows] = matrix[(row, col)];
            }
        }
        Ok(())
    }
}

/// Adapts a pairwise [`KernelFunction`] to a [`BlockKernel`] over point
/// clouds stored as rows of a `faer::Mat<f64>`.
///
/// Rows of the problem are target points and columns are source points.
#[derive(Debug, Clone)]
pub struct PointKernel<F: KernelFunction> {
    pub function: F,
}

impl<F: KernelFunction> PointKernel<F> {
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

impl<F: KernelFunction> BlockKernel for PointKernel<F> {
    type Elem = f64;
    type RowData = Mat<f64>;
    type ColData = Mat<f64>;

    fn evaluate(
        &self,
        row_indices: &[usize],
        col_indices: &[usize],
        row_data: &Mat<f64>,
        col_data: &Mat<f64>,
        out: &mut [f64],
    ) -> std::result::Result<(), KernelError> {
        if row_data.ncols() != col_data.ncols() {
            return Err(KernelError::new(format!(
                "target points are {}-D but source points are {}-D",
                row_data.ncols(),
                col_data.ncols()
            )));
        }
        let m = row_indices.len();

        for (j, &source_idx) in col_indices.iter().enumerate() {
            let source = col_data.row(source_idx);

            for (i, &target_idx) in row_indices.iter().enumerate() {
                let target = row_data.row(target_idx);

                out[i + j * m] = self.function.evaluate(target, source);
            }
        }

        Ok(())
    }
}

impl<F: KernelFunction> Problem<PointKernel<F>> {
    /// Builds a problem whose entry `(i, j)` is `function(targets[i], sources[j])`.
    ///
    /// Passing the same `Arc` for targets and sources with `symmetric = true`
    /// builds a symmetric problem.
    pub fn from_points(
        targets: Arc<Mat<f64>>,
        sources: Arc<Mat<f64>>,
        function: F,
        symmetric: bool,
        name: impl Into<String>,
    ) -> Result<Self> {
        if targets.ncols() != sources.ncols() {
            return Err(BlrError::invalid(format!(
                "target points are {}-D but source points are {}-D",
                targets.ncols(),
                sources.ncols()
            )));
        }
        let shape = [targets.nrows(), sources.nrows()];
        Problem::new(&shape, symmetric, targets, sources, PointKernel::new(function), name)
    }
}

/// Object safe view of a scalar `f64` problem.
///
/// Formats and matrices hold an `Arc<dyn BlockSource>` so that they do not
/// need to be generic over the concrete kernel type.
pub trait BlockSource: Send + Sync {
    fn nrows(&self) -> usize;

    fn ncols(&self) -> usize;

    fn is_symmetric(&self) -> bool;

    fn name(&self) -> &str;

    /// Evaluates the `rows x cols` submatrix on the given index sets.
    fn block(&self, row_indices: &[usize], col_indices: &[usize]) -> Result<Mat<f64>>;
}

impl<K> BlockSource for Problem<K>
where
    K: BlockKernel<Elem = f64>,
{
    fn nrows(&self) -> usize {
        Problem::nrows(self)
    }

    fn ncols(&self) -> usize {
        Problem::ncols(self)
    }

    fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block(&self, row_indices: &[usize], col_indices: &[usize]) -> Result<Mat<f64>> {
        if self.entry_len != 1 {
            return Err(BlrError::invalid(format!(
                "block low-rank approximation needs a scalar kernel, problem \"{}\" has shape {:?}",
                self.name, self.shape
            )));
        }
        let (m, n) = (row_indices.len(), col_indices.len());
        let mut buffer = try_zeroed::<f64>(m * n)?;
        self.evaluate_into(row_indices, col_indices, &mut buffer)?;
        Ok(MatRef::from_column_major_slice(&buffer, m, n).to_owned())
    }
}
