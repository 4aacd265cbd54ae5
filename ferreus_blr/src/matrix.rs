/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements the block low-rank matrix: storage, multiply, error estimation and reconstruction.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # matrix
//!
//! A [`BlockMatrix`] stores, for every far-field block of its
//! [`BlockFormat`], a rank and two factors `U` (`rows x rank`) and `V`
//! (`cols x rank`) such that the block is approximately `U Vᵗ`. Near-field
//! blocks are stored densely, or recomputed from the problem kernel when the
//! matrix was built with `on_fly`.
//!
//! Vectors passed to [`BlockMatrix::multiply`] are in the original index
//! order of the problem; the cluster pivots are applied internally.

use crate::{
    arena::{self, Arena},
    array::{NdArray, Order},
    config::AllocationMode,
    error::{BlrError, Result},
    format::BlockFormat,
    traits::LinearOperator,
    utils,
};
use faer::{Mat, MatMut, MatRef, prelude::ReborrowMut};
use rayon::prelude::*;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// A single block of a [`BlockMatrix`].
#[derive(Debug, Clone)]
pub enum BlockView<'a> {
    /// Far-field block `U Vᵗ`.
    LowRank {
        rank: usize,
        u: &'a NdArray<f64>,
        v: &'a NdArray<f64>,
    },
    /// Near-field block, borrowed if stored or evaluated on request.
    Dense(Cow<'a, NdArray<f64>>),
}

impl BlockView<'_> {
    /// Dense copy of the block.
    pub fn to_mat(&self) -> Result<Mat<f64>> {
        match self {
            BlockView::LowRank { u, v, .. } => Ok(u.as_mat_ref()? * v.as_mat_ref()?.transpose()),
            BlockView::Dense(d) => d.to_mat(),
        }
    }
}

/// Block low-rank approximation of a kernel matrix.
pub struct BlockMatrix {
    format: Arc<BlockFormat>,
    far_rank: Vec<usize>,
    far_u: Vec<NdArray<f64>>,
    far_v: Vec<NdArray<f64>>,
    near_d: Option<Vec<NdArray<f64>>>,
    on_fly: bool,
    allocation: AllocationMode,
    arenas: Vec<Arena>,
    data_nbytes: usize,
    nbytes: usize,
}

fn check_shape(
    array: &NdArray<f64>,
    expected: [usize; 2],
    what: &str,
    i: usize,
    j: usize,
) -> Result<()> {
    if array.shape() != &expected[..] {
        return Err(BlrError::invalid(format!(
            "{} of block ({}, {}) has shape {:?}, expected {:?}",
            what,
            i,
            j,
            array.shape(),
            expected
        )));
    }
    Ok(())
}

impl BlockMatrix {
    /// Creates a matrix from precomputed far-field factors and near-field
    /// blocks, indexed by block position in the format.
    ///
    /// `near_d` must be `None` exactly when `on_fly` is set. With
    /// [`AllocationMode::Consolidated`] the arrays are repacked into up to
    /// three arenas (all `U`, all `V`, all `D`).
    ///
    /// # Errors
    /// [`BlrError::InvalidArgument`] on any count or shape mismatch, or if a
    /// rank exceeds `min(rows, cols)`.
    pub fn new(
        format: Arc<BlockFormat>,
        far_rank: Vec<usize>,
        far_u: Vec<NdArray<f64>>,
        far_v: Vec<NdArray<f64>>,
        on_fly: bool,
        near_d: Option<Vec<NdArray<f64>>>,
        allocation: AllocationMode,
    ) -> Result<Self> {
        let nfar = format.nblocks_far();
        if far_rank.len() != nfar || far_u.len() != nfar || far_v.len() != nfar {
            return Err(BlrError::invalid(format!(
                "format has {} far-field blocks but {} ranks, {} U and {} V factors were given",
                nfar,
                far_rank.len(),
                far_u.len(),
                far_v.len()
            )));
        }

        for (position, &(i, j)) in format.far().iter().enumerate() {
            let (rows, cols) = format.block_shape(i, j);
            let rank = far_rank[position];
            if rank > rows.min(cols) {
                return Err(BlrError::invalid(format!(
                    "rank {} of block ({}, {}) exceeds min({}, {})",
                    rank, i, j, rows, cols
                )));
            }
            check_shape(&far_u[position], [rows, rank], "U", i, j)?;
            check_shape(&far_v[position], [cols, rank], "V", i, j)?;
        }

        match (&near_d, on_fly) {
            (Some(_), true) => {
                return Err(BlrError::invalid(
                    "near-field blocks cannot be stored when computed on the fly",
                ));
            }
            (None, false) => {
                return Err(BlrError::invalid(
                    "near-field blocks are required unless computed on the fly",
                ));
            }
            (Some(near_d), false) => {
                if near_d.len() != format.nblocks_near() {
                    return Err(BlrError::invalid(format!(
                        "format has {} near-field blocks but {} were given",
                        format.nblocks_near(),
                        near_d.len()
                    )));
                }
                for (position, &(i, j)) in format.near().iter().enumerate() {
                    let (rows, cols) = format.block_shape(i, j);
                    check_shape(&near_d[position], [rows, cols], "D", i, j)?;
                }
            }
            (None, true) => {}
        }

        let mut arenas = Vec::new();
        let (arena_u, far_u) = arena::store(allocation, far_u)?;
        arenas.extend(arena_u);
        let (arena_v, far_v) = arena::store(allocation, far_v)?;
        arenas.extend(arena_v);
        let near_d = match near_d {
            Some(near_d) => {
                let (arena_d, near_d) = arena::store(allocation, near_d)?;
                arenas.extend(arena_d);
                Some(near_d)
            }
            None => None,
        };

        let data_nbytes = far_u
            .iter()
            .chain(far_v.iter())
            .chain(near_d.iter().flatten())
            .map(|a| a.data_nbytes())
            .sum::<usize>();
        let narrays = far_u.len() + far_v.len() + near_d.as_ref().map_or(0, |d| d.len());
        let nbytes = std::mem::size_of::<Self>()
            + far_rank.len() * std::mem::size_of::<usize>()
            + narrays * std::mem::size_of::<NdArray<f64>>()
            + data_nbytes;

        Ok(Self {
            format,
            far_rank,
            far_u,
            far_v,
            near_d,
            on_fly,
            allocation,
            arenas,
            data_nbytes,
            nbytes,
        })
    }

    /// Format of the matrix. After false far-field blocks were reclassified
    /// during compression this is the replacement format, not the one the
    /// compression started from.
    pub fn format(&self) -> &Arc<BlockFormat> {
        &self.format
    }

    pub fn nrows(&self) -> usize {
        self.format.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.format.ncols()
    }

    pub fn far_rank(&self) -> &[usize] {
        &self.far_rank
    }

    pub fn far_u(&self) -> &[NdArray<f64>] {
        &self.far_u
    }

    pub fn far_v(&self) -> &[NdArray<f64>] {
        &self.far_v
    }

    /// Stored near-field blocks, `None` for on-the-fly matrices.
    pub fn near_d(&self) -> Option<&[NdArray<f64>]> {
        self.near_d.as_deref()
    }

    pub fn on_fly(&self) -> bool {
        self.on_fly
    }

    pub fn allocation(&self) -> AllocationMode {
        self.allocation
    }

    /// Arenas backing the arrays in consolidated mode.
    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    /// Bytes used by factor and dense block data.
    pub fn data_nbytes(&self) -> usize {
        self.data_nbytes
    }

    /// Total bytes used by the matrix, bookkeeping included.
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Near-field block at `position`, copied from storage or evaluated.
    fn near_block(&self, position: usize) -> Result<Mat<f64>> {
        match &self.near_d {
            Some(near_d) => near_d[position].to_mat(),
            None => {
                let (i, j) = self.format.near()[position];
                self.format.get_block(i, j)
            }
        }
    }

    /// Dense reconstruction of the far-field block at `position`.
    fn far_block(&self, position: usize) -> Result<Mat<f64>> {
        let u = self.far_u[position].as_mat_ref()?;
        let v = self.far_v[position].as_mat_ref()?;
        Ok(u * v.transpose())
    }

    /// Computes `Y := alpha * M * X + beta * Y`.
    ///
    /// # Arguments
    /// * `x` - `ncols x nrhs` input, in the original column order of the problem.
    /// * `y` - `nrows x nrhs` output, in the original row order of the problem.
    ///
    /// Far-field blocks are applied as `U (Vᵗ X_j)` without forming the
    /// block. Symmetric formats also apply the mirror of every off-diagonal
    /// block. Contributions of each block row are computed in parallel and
    /// accumulated additively, so overlapping row ranges are handled.
    pub fn multiply(
        &self,
        alpha: f64,
        x: MatRef<f64>,
        beta: f64,
        mut y: MatMut<f64>,
    ) -> Result<()> {
        let format = &self.format;
        if x.nrows() != format.ncols() || y.nrows() != format.nrows() || x.ncols() != y.ncols() {
            return Err(BlrError::invalid(format!(
                "cannot multiply a {}x{} matrix with X of shape {:?} into Y of shape {:?}",
                format.nrows(),
                format.ncols(),
                x.shape(),
                y.shape()
            )));
        }

        scale(y.rb_mut(), beta);
        if alpha == 0.0 || x.ncols() == 0 {
            return Ok(());
        }

        let row_cluster = format.row_cluster();
        let col_cluster = format.col_cluster();

        let direct: Vec<(usize, Mat<f64>)> = (0..format.nbrows())
            .into_par_iter()
            .filter_map(|i| {
                let far = format.row_far_blocks(i);
                let near = format.row_near_blocks(i);
                if far.is_empty() && near.is_empty() {
                    return None;
                }
                Some(self.block_row_product(i, far, near, x).map(|acc| (i, acc)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mirrored: Vec<(usize, Mat<f64>)> = if format.is_symmetric() {
            (0..format.nbcols())
                .into_par_iter()
                .filter_map(|j| {
                    let far: Vec<usize> = format
                        .col_far_blocks(j)
                        .iter()
                        .copied()
                        .filter(|&p| format.far()[p].0 != j)
                        .collect();
                    let near: Vec<usize> = format
                        .col_near_blocks(j)
                        .iter()
                        .copied()
                        .filter(|&p| format.near()[p].0 != j)
                        .collect();
                    if far.is_empty() && near.is_empty() {
                        return None;
                    }
                    Some(self.block_col_product(j, &far, &near, x).map(|acc| (j, acc)))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        for (i, mut acc) in direct {
            acc *= alpha;
            utils::scatter_add_rows(y.rb_mut(), row_cluster.block_indices(i), acc.as_ref());
        }
        for (j, mut acc) in mirrored {
            acc *= alpha;
            utils::scatter_add_rows(y.rb_mut(), col_cluster.block_indices(j), acc.as_ref());
        }

        Ok(())
    }

    /// Sum over the given blocks of row `i` of `block * X_j`.
    fn block_row_product(
        &self,
        i: usize,
        far: &[usize],
        near: &[usize],
        x: MatRef<f64>,
    ) -> Result<Mat<f64>> {
        let format = &self.format;
        let col_cluster = format.col_cluster();
        let mut acc = Mat::<f64>::zeros(format.row_cluster().block_size(i), x.ncols());

        for &position in far {
            let (_, j) = format.far()[position];
            let x_j = utils::select_mat_rows(x, col_cluster.block_indices(j));
            let u = self.far_u[position].as_mat_ref()?;
            let v = self.far_v[position].as_mat_ref()?;
            let vt_x = v.transpose() * &x_j;
            acc += u * &vt_x;
        }

        for &position in near {
            let (_, j) = format.near()[position];
            let x_j = utils::select_mat_rows(x, col_cluster.block_indices(j));
            match &self.near_d {
                Some(near_d) => acc += near_d[position].as_mat_ref()? * &x_j,
                None => {
                    let d = format.get_block(i, j)?;
                    acc += &d * &x_j;
                }
            }
        }

        Ok(acc)
    }

    /// Sum over the given blocks of column `j` of `blockᵗ * X_i`, the mirrored
    /// contributions of a symmetric format.
    fn block_col_product(
        &self,
        j: usize,
        far: &[usize],
        near: &[usize],
        x: MatRef<f64>,
    ) -> Result<Mat<f64>> {
        let format = &self.format;
        let row_cluster = format.row_cluster();
        let mut acc = Mat::<f64>::zeros(format.col_cluster().block_size(j), x.ncols());

        for &position in far {
            let (i, _) = format.far()[position];
            let x_i = utils::select_mat_rows(x, row_cluster.block_indices(i));
            let u = self.far_u[position].as_mat_ref()?;
            let v = self.far_v[position].as_mat_ref()?;
            let ut_x = u.transpose() * &x_i;
            acc += v * &ut_x;
        }

        for &position in near {
            let (i, _) = format.near()[position];
            let x_i = utils::select_mat_rows(x, row_cluster.block_indices(i));
            let d = self.near_block(position)?;
            acc += d.transpose() * &x_i;
        }

        Ok(acc)
    }

    /// Relative Frobenius error of the approximation,
    /// `sqrt(sum ||approx - exact||²) / sqrt(sum ||exact||²)` over every
    /// block, with the exact blocks evaluated by the problem kernel.
    ///
    /// Off-diagonal blocks of symmetric formats are counted twice.
    pub fn estimate_error(&self) -> Result<f64> {
        let format = &self.format;
        let weight = |i: usize, j: usize| {
            if format.is_symmetric() && i != j { 2.0 } else { 1.0 }
        };

        let far_terms = format
            .far()
            .par_iter()
            .enumerate()
            .map(|(position, &(i, j))| {
                let exact = format.get_block(i, j)?;
                let approx = self.far_block(position)?;
                let diff = (&approx - &exact).norm_l2();
                let norm = exact.norm_l2();
                Ok((weight(i, j) * diff * diff, weight(i, j) * norm * norm))
            })
            .collect::<Result<Vec<(f64, f64)>>>()?;

        let near_terms = format
            .near()
            .par_iter()
            .enumerate()
            .map(|(position, &(i, j))| {
                let exact = format.get_block(i, j)?;
                let diff = match &self.near_d {
                    Some(near_d) => (near_d[position].as_mat_ref()? - exact.as_ref()).norm_l2(),
                    None => 0.0,
                };
                let norm = exact.norm_l2();
                Ok((weight(i, j) * diff * diff, weight(i, j) * norm * norm))
            })
            .collect::<Result<Vec<(f64, f64)>>>()?;

        let (diff, norm) = far_terms
            .iter()
            .chain(near_terms.iter())
            .fold((0.0, 0.0), |(d, n), &(bd, bn)| (d + bd, n + bn));

        if norm == 0.0 {
            return Ok(if diff == 0.0 { 0.0 } else { f64::INFINITY });
        }
        Ok((diff / norm).sqrt())
    }

    /// Materialises the whole matrix as a column-major 2-D array in the
    /// original index order.
    pub fn to_dense(&self) -> Result<NdArray<f64>> {
        let format = &self.format;
        let (nrows, ncols) = (format.nrows(), format.ncols());
        let mut dense = NdArray::<f64>::zeros(&[nrows, ncols], Order::ColMajor)?;
        let data = dense.as_mut_slice()?;

        let mut write = |i: usize, j: usize, block: MatRef<f64>| {
            let (rows, cols) = format.block_indices(i, j);
            let mirror = format.is_symmetric() && i != j;
            for (c_local, &c) in cols.iter().enumerate() {
                for (r_local, &r) in rows.iter().enumerate() {
                    let value = block[(r_local, c_local)];
                    data[r + c * nrows] = value;
                    if mirror {
                        data[c + r * nrows] = value;
                    }
                }
            }
        };

        for (position, &(i, j)) in format.far().iter().enumerate() {
            let block = self.far_block(position)?;
            write(i, j, block.as_ref());
        }
        for (position, &(i, j)) in format.near().iter().enumerate() {
            let block = self.near_block(position)?;
            write(i, j, block.as_ref());
        }

        Ok(dense)
    }

    /// Returns block `(i, j)` as stored in the matrix.
    ///
    /// # Errors
    /// [`BlrError::InvalidArgument`] if the block is neither far-field nor
    /// near-field in the format (for symmetric formats, only `j <= i` is stored).
    pub fn get_block(&self, i: usize, j: usize) -> Result<BlockView<'_>> {
        let format = &self.format;
        if i >= format.nbrows() || j >= format.nbcols() {
            return Err(BlrError::invalid(format!(
                "block ({}, {}) is outside the {}x{} block grid",
                i,
                j,
                format.nbrows(),
                format.nbcols()
            )));
        }

        if let Some(&position) = format
            .row_far_blocks(i)
            .iter()
            .find(|&&p| format.far()[p].1 == j)
        {
            return Ok(BlockView::LowRank {
                rank: self.far_rank[position],
                u: &self.far_u[position],
                v: &self.far_v[position],
            });
        }

        if let Some(&position) = format
            .row_near_blocks(i)
            .iter()
            .find(|&&p| format.near()[p].1 == j)
        {
            return Ok(BlockView::Dense(match &self.near_d {
                Some(near_d) => Cow::Borrowed(&near_d[position]),
                None => Cow::Owned(NdArray::from_mat(format.get_block(i, j)?.as_ref())?),
            }));
        }

        Err(BlrError::invalid(format!(
            "block ({}, {}) is not stored in the format",
            i, j
        )))
    }

    /// Per-block `(row block, column block, rank)` triples. Near-field blocks
    /// report `min(rows, cols)`.
    pub fn rank_map(&self) -> Vec<(usize, usize, usize)> {
        let format = &self.format;
        let far = format
            .far()
            .iter()
            .zip(&self.far_rank)
            .map(|(&(i, j), &rank)| (i, j, rank));
        let near = format.near().iter().map(|&(i, j)| {
            let (rows, cols) = format.block_shape(i, j);
            (i, j, rows.min(cols))
        });
        far.chain(near).collect()
    }
}

/// `y := beta * y`, with `beta == 0` clearing `y`.
fn scale(mut y: MatMut<f64>, beta: f64) {
    for j in 0..y.ncols() {
        for i in 0..y.nrows() {
            y[(i, j)] = if beta == 0.0 { 0.0 } else { beta * y[(i, j)] };
        }
    }
}

impl LinearOperator for BlockMatrix {
    fn nrows(&self) -> usize {
        self.format.nrows()
    }

    fn ncols(&self) -> usize {
        self.format.ncols()
    }

    fn apply(&self, alpha: f64, x: MatRef<f64>, beta: f64, y: MatMut<f64>) -> Result<()> {
        self.multiply(alpha, x, beta, y)
    }
}

impl fmt::Debug for BlockMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMatrix")
            .field("format", &self.format)
            .field("far_rank", &self.far_rank)
            .field("on_fly", &self.on_fly)
            .field("allocation", &self.allocation)
            .field("nbytes", &self.nbytes)
            .finish()
    }
}

impl fmt::Display for BlockMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nfar = self.far_rank.len();
        let max_rank = self.far_rank.iter().copied().max().unwrap_or(0);
        let mean_rank = if nfar > 0 {
            self.far_rank.iter().sum::<usize>() as f64 / nfar as f64
        } else {
            0.0
        };
        write!(
            f,
            "<BlockMatrix of \"{}\": {} far-field blocks (mean rank {:.2}, max rank {}), \
             {} near-field blocks{}, {:?} allocation, {} data bytes, {} bytes total>",
            self.format.problem().name(),
            nfar,
            mean_rank,
            max_rank,
            self.format.nblocks_near(),
            if self.on_fly { " (on the fly)" } else { "" },
            self.allocation,
            self.data_nbytes,
            self.nbytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admissibility::DistanceDiameter,
        cluster::{Cluster, PrincipalAxisSplit},
        config::CompressionParams,
        problem::{BlockSource, Problem},
        traits::KernelFunction,
    };
    use faer::RowRef;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct InverseDistance;

    impl KernelFunction for InverseDistance {
        fn evaluate(&self, target: RowRef<f64>, source: RowRef<f64>) -> f64 {
            let distance: f64 = (0..target.ncols())
                .map(|d| (target[d] - source[d]).powi(2))
                .sum::<f64>()
                .sqrt();
            1.0 / (1.0 + distance)
        }
    }

    /// Kernel matrix of `points` with itself, both as an approximation
    /// source and as an exact dense reference.
    fn kernel_problem(points: Mat<f64>) -> (Arc<dyn BlockSource>, Mat<f64>) {
        let points = Arc::new(points);
        let problem =
            Problem::from_points(points.clone(), points, InverseDistance, true, "inverse").unwrap();
        let dense = problem.to_array().unwrap().to_mat().unwrap();
        (Arc::new(problem), dense)
    }

    fn line_points(n: usize) -> Mat<f64> {
        Mat::from_fn(n, 1, |i, _| i as f64 / n as f64)
    }

    fn tiled_matrix(
        n: usize,
        block_size: usize,
        symmetric: bool,
        tolerance: f64,
    ) -> (BlockMatrix, Mat<f64>) {
        let (problem, dense) = kernel_problem(line_points(n));
        let cluster = Arc::new(Cluster::tiled(n, block_size).unwrap());
        let format =
            Arc::new(BlockFormat::tiled(problem, cluster.clone(), cluster, symmetric).unwrap());
        let params = CompressionParams::builder().tolerance(tolerance).build().unwrap();
        (BlockMatrix::builder(format, params).build().unwrap(), dense)
    }

    fn random_rhs(n: usize, nrhs: usize, seed: u64) -> Mat<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Mat::from_fn(n, nrhs, |_, _| rng.random_range(-1.0..1.0))
    }

    fn relative_error(approx: MatRef<f64>, exact: MatRef<f64>) -> f64 {
        (approx - exact).norm_l2() / exact.norm_l2()
    }

    #[test]
    fn symmetric_tiled_matrix_meets_tolerance() {
        let (matrix, dense) = tiled_matrix(100, 10, true, 1e-6);

        assert!(matrix.format().nblocks_far() > 0);
        assert!(matrix.estimate_error().unwrap() <= 1e-6);

        let reconstructed = matrix.to_dense().unwrap().to_mat().unwrap();
        assert!(relative_error(reconstructed.as_ref(), dense.as_ref()) <= 1e-6);
        assert!(matrix.data_nbytes() < 100 * 100 * std::mem::size_of::<f64>());
    }

    #[test]
    fn integer_spaced_kernel_reclassifies_and_meets_tolerance() {
        // 1 / (1 + |i - j|) on integer indices: blocks next to the diagonal
        // are not compressible enough and move to the near field.
        let n = 100;
        let (problem, dense) = kernel_problem(Mat::from_fn(n, 1, |i, _| i as f64));
        let cluster = Arc::new(Cluster::tiled(n, 10).unwrap());
        let format = Arc::new(BlockFormat::tiled(problem, cluster.clone(), cluster, true).unwrap());
        assert_eq!(format.nblocks_far(), 45);
        assert_eq!(format.nblocks_near(), 10);

        let params = CompressionParams::builder().tolerance(1e-6).build().unwrap();
        let matrix = BlockMatrix::builder(format.clone(), params).build().unwrap();

        let reclassified = matrix.format();
        assert!(!Arc::ptr_eq(reclassified, &format));
        assert!(reclassified.nblocks_far() < 45);
        assert!(reclassified.nblocks_near() > 10);
        assert_eq!(reclassified.nblocks_far() + reclassified.nblocks_near(), 55);
        assert_eq!(format.nblocks_far(), 45);

        assert!(matrix.estimate_error().unwrap() <= 1e-6);
        let reconstructed = matrix.to_dense().unwrap().to_mat().unwrap();
        assert!(relative_error(reconstructed.as_ref(), dense.as_ref()) <= 1e-6);
    }

    #[test]
    fn multiply_matches_dense_product() {
        for symmetric in [false, true] {
            let (matrix, dense) = tiled_matrix(90, 12, symmetric, 1e-8);
            let x = random_rhs(90, 3, 1);
            let mut y = Mat::<f64>::zeros(90, 3);
            matrix.multiply(1.0, x.as_ref(), 0.0, y.as_mut()).unwrap();

            let expected = &dense * &x;
            assert!(relative_error(y.as_ref(), expected.as_ref()) <= 1e-6);
        }
    }

    #[test]
    fn hierarchical_multiply_matches_dense_product() {
        let mut rng = StdRng::seed_from_u64(9);
        let points = Mat::from_fn(200, 2, |_, _| rng.random_range(0.0..1.0));
        let cluster =
            Arc::new(Cluster::hierarchical(points.as_ref(), 16, &PrincipalAxisSplit).unwrap());
        let (problem, dense) = kernel_problem(points);

        for symmetric in [false, true] {
            let format = Arc::new(
                BlockFormat::hierarchical(
                    problem.clone(),
                    cluster.clone(),
                    cluster.clone(),
                    symmetric,
                    &DistanceDiameter::default(),
                )
                .unwrap(),
            );
            let params = CompressionParams::builder().tolerance(1e-8).build().unwrap();
            let matrix = BlockMatrix::builder(format, params).build().unwrap();

            let x = random_rhs(200, 2, 2);
            let mut y = Mat::<f64>::zeros(200, 2);
            matrix.multiply(1.0, x.as_ref(), 0.0, y.as_mut()).unwrap();

            let expected = &dense * &x;
            assert!(relative_error(y.as_ref(), expected.as_ref()) <= 1e-6);

            let reconstructed = matrix.to_dense().unwrap().to_mat().unwrap();
            assert!(relative_error(reconstructed.as_ref(), dense.as_ref()) <= 1e-6);
        }
    }

    #[test]
    fn multiply_is_linear() {
        let (matrix, _) = tiled_matrix(50, 10, true, 1e-6);
        let x1 = random_rhs(50, 1, 10);
        let x2 = random_rhs(50, 1, 11);
        let (a, b) = (1.5, -0.25);

        let apply = |x: &Mat<f64>| {
            let mut y = Mat::<f64>::zeros(50, 1);
            matrix.multiply(1.0, x.as_ref(), 0.0, y.as_mut()).unwrap();
            y
        };

        let combined = Mat::from_fn(50, 1, |i, j| a * x1[(i, j)] + b * x2[(i, j)]);
        let lhs = apply(&combined);
        let (y1, y2) = (apply(&x1), apply(&x2));
        let rhs = Mat::from_fn(50, 1, |i, j| a * y1[(i, j)] + b * y2[(i, j)]);
        assert!(relative_error(lhs.as_ref(), rhs.as_ref()) <= 1e-12);
    }

    #[test]
    fn multiply_applies_alpha_and_beta() {
        let (matrix, _) = tiled_matrix(40, 10, true, 1e-8);
        let x = random_rhs(40, 2, 3);
        let y0 = random_rhs(40, 2, 4);

        let mut ax = Mat::<f64>::zeros(40, 2);
        matrix.multiply(1.0, x.as_ref(), 0.0, ax.as_mut()).unwrap();

        let mut y = y0.clone();
        matrix.multiply(2.0, x.as_ref(), -0.5, y.as_mut()).unwrap();
        let expected = Mat::from_fn(40, 2, |i, j| 2.0 * ax[(i, j)] - 0.5 * y0[(i, j)]);
        assert!(relative_error(y.as_ref(), expected.as_ref()) <= 1e-12);

        // beta == 0 overwrites whatever y holds.
        let mut y = Mat::from_fn(40, 2, |_, _| f64::NAN);
        matrix.multiply(1.0, x.as_ref(), 0.0, y.as_mut()).unwrap();
        assert!(relative_error(y.as_ref(), ax.as_ref()) <= 1e-12);

        // alpha == 0 only scales y.
        let mut y = y0.clone();
        matrix.multiply(0.0, x.as_ref(), 3.0, y.as_mut()).unwrap();
        let expected = Mat::from_fn(40, 2, |i, j| 3.0 * y0[(i, j)]);
        assert!(relative_error(y.as_ref(), expected.as_ref()) <= 1e-15);
    }

    #[test]
    fn multiply_rejects_mismatched_dimensions() {
        let (matrix, _) = tiled_matrix(20, 5, false, 1e-6);
        let x = Mat::<f64>::zeros(19, 1);
        let mut y = Mat::<f64>::zeros(20, 1);
        assert!(matches!(
            matrix.multiply(1.0, x.as_ref(), 0.0, y.as_mut()),
            Err(BlrError::InvalidArgument { .. })
        ));

        let x = Mat::<f64>::zeros(20, 2);
        assert!(matrix.multiply(1.0, x.as_ref(), 0.0, y.as_mut()).is_err());
    }

    #[test]
    fn linear_operator_delegates_to_multiply() {
        let (matrix, dense) = tiled_matrix(30, 10, true, 1e-10);
        let op: &dyn LinearOperator = &matrix;
        assert_eq!((op.nrows(), op.ncols()), (30, 30));

        let x = random_rhs(30, 1, 5);
        let mut y = Mat::<f64>::zeros(30, 1);
        op.apply(1.0, x.as_ref(), 0.0, y.as_mut()).unwrap();
        let expected = &dense * &x;
        assert!(relative_error(y.as_ref(), expected.as_ref()) <= 1e-8);
    }

    #[test]
    fn blocks_and_rank_map() {
        let (matrix, dense) = tiled_matrix(60, 10, true, 1e-6);
        let format = matrix.format().clone();
        assert!(format.nblocks_far() > 0);

        let (i, j) = format.far()[0];
        match matrix.get_block(i, j).unwrap() {
            BlockView::LowRank { rank, u, v } => {
                assert_eq!(rank, matrix.far_rank()[0]);
                assert_eq!(u.shape(), &[10, rank]);
                assert_eq!(v.shape(), &[10, rank]);
            }
            BlockView::Dense(_) => panic!("block ({}, {}) should be far-field", i, j),
        }

        let diagonal = matrix.get_block(1, 1).unwrap().to_mat().unwrap();
        let exact = dense.submatrix(10, 10, 10, 10);
        assert!(relative_error(diagonal.as_ref(), exact) <= 1e-15);

        // Upper blocks of a symmetric format are not stored.
        assert!(matrix.get_block(0, 2).is_err());
        assert!(matrix.get_block(6, 0).is_err());

        let ranks = matrix.rank_map();
        assert_eq!(ranks.len(), format.nblocks_far() + format.nblocks_near());
        assert!(ranks.contains(&(1, 1, 10)));
        for (position, &(i, j)) in format.far().iter().enumerate() {
            assert_eq!(ranks[position], (i, j, matrix.far_rank()[position]));
        }
    }

    #[test]
    fn new_rejects_inconsistent_storage() {
        let (matrix, _) = tiled_matrix(40, 10, false, 1e-6);
        let format = matrix.format().clone();
        assert!(format.nblocks_far() > 0);
        let far_u = matrix.far_u().to_vec();
        let far_v = matrix.far_v().to_vec();
        let near_d = matrix.near_d().map(|d| d.to_vec());
        let far_rank = matrix.far_rank().to_vec();

        // Missing near field without on_fly.
        assert!(
            BlockMatrix::new(
                format.clone(),
                far_rank.clone(),
                far_u.clone(),
                far_v.clone(),
                false,
                None,
                AllocationMode::Separate
            )
            .is_err()
        );

        // Rank inconsistent with the factor shapes.
        let mut wrong_rank = far_rank.clone();
        wrong_rank[0] += 1;
        assert!(
            BlockMatrix::new(
                format.clone(),
                wrong_rank,
                far_u.clone(),
                far_v.clone(),
                false,
                near_d.clone(),
                AllocationMode::Separate
            )
            .is_err()
        );

        let rebuilt = BlockMatrix::new(
            format,
            far_rank,
            far_u,
            far_v,
            false,
            near_d,
            AllocationMode::Consolidated,
        )
        .unwrap();
        assert_eq!(rebuilt.data_nbytes(), matrix.data_nbytes());
        assert_eq!(rebuilt.to_dense().unwrap().diff(&matrix.to_dense().unwrap()).unwrap(), 0.0);
    }
}
