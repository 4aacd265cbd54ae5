/////////////////////////////////////////////////////////////////////////////////////////////
//
// Compresses the far-field blocks of a block format into a block low-rank matrix.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # compression
//!
//! Builds a [`BlockMatrix`] from a [`BlockFormat`]:
//!
//! 1. Every far-field block is evaluated and factorised independently, in
//!    parallel, with the configured [`CompressionMethod`](crate::CompressionMethod).
//! 2. Blocks whose numerical rank is not a sufficient reduction are false
//!    far-field blocks. Once all blocks are done, they are appended to the
//!    near field and a replacement format is built.
//! 3. Unless `on_fly` is set, every near-field block of the final format is
//!    evaluated and stored.

use crate::{
    array::NdArray,
    config::CompressionParams,
    error::Result,
    format::BlockFormat,
    lowrank::{self, LowRankFactors},
    matrix::BlockMatrix,
    progress::{self, ProgressMsg, ProgressSink},
};
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Convenience builder for compressing a [`BlockFormat`] into a [`BlockMatrix`].
///
/// The builder should be called via the [`BlockMatrix::builder`] method.
pub struct BlockMatrixBuilder {
    format: Arc<BlockFormat>,
    params: CompressionParams,
    progress_callback: Option<Arc<dyn ProgressSink>>,
}

impl BlockMatrixBuilder {
    /// Optional sink receiving compression progress and reclassification events.
    pub fn progress_callback(mut self, progress_callback: Arc<dyn ProgressSink>) -> Self {
        self.progress_callback = Some(progress_callback);
        self
    }

    /// Runs the compression.
    pub fn build(self) -> Result<BlockMatrix> {
        compress(self.format, &self.params, self.progress_callback)
    }
}

impl BlockMatrix {
    /// Creates a [`BlockMatrixBuilder`] compressing `format` with `params`.
    ///
    /// This is the way to construct a matrix from a kernel problem.
    pub fn builder(format: Arc<BlockFormat>, params: CompressionParams) -> BlockMatrixBuilder {
        BlockMatrixBuilder {
            format,
            params,
            progress_callback: None,
        }
    }
}

/// Compresses every far-field block of `format`.
///
/// If false far-field blocks are found, the returned matrix refers to a new
/// format (see [`BlockMatrix::format`]) in which they are near-field; the
/// `format` passed in is never modified.
///
/// # Errors
/// - [`BlrError::InvalidArgument`](crate::BlrError::InvalidArgument) for
///   invalid parameters,
/// - [`BlrError::KernelFailure`](crate::BlrError::KernelFailure) if any
///   block evaluation fails,
/// - [`BlrError::NumericalFailure`](crate::BlrError::NumericalFailure) if a
///   factorisation does not converge,
/// - [`BlrError::OutOfMemory`](crate::BlrError::OutOfMemory) if storage
///   cannot be allocated.
///
/// No partial matrix is returned on error.
pub fn compress(
    format: Arc<BlockFormat>,
    params: &CompressionParams,
    progress_callback: Option<Arc<dyn ProgressSink>>,
) -> Result<BlockMatrix> {
    params.validate()?;
    let start = Instant::now();

    let total = format.nblocks_far();
    let report_every = (total / 20).max(1);
    let done = AtomicUsize::new(0);
    let problem = format.problem();

    let outcomes: Vec<Option<LowRankFactors>> = format
        .far()
        .par_iter()
        .enumerate()
        .map(|(position, &(i, j))| {
            let (rows, cols) = format.block_indices(i, j);
            let seed = params.seed.wrapping_add(position as u64);
            let outcome = lowrank::compress_block(problem.as_ref(), rows, cols, params, seed)?;

            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            if finished % report_every == 0 || finished == total {
                progress::emit(
                    &progress_callback,
                    ProgressMsg::BlocksCompressed {
                        done: finished,
                        total,
                    },
                );
            }

            Ok(outcome)
        })
        .collect::<Result<Vec<_>>>()?;

    let format = reclassify(format, &outcomes, &progress_callback)?;

    // Compact the factors of the blocks that stayed far-field.
    let accepted: Vec<LowRankFactors> = outcomes.into_iter().flatten().collect();
    let far_rank: Vec<usize> = accepted.iter().map(|f| f.rank()).collect();
    let mut far_u = Vec::with_capacity(accepted.len());
    let mut far_v = Vec::with_capacity(accepted.len());
    for factors in &accepted {
        far_u.push(NdArray::from_mat(factors.u.as_ref())?);
        far_v.push(NdArray::from_mat(factors.v.as_ref())?);
    }
    drop(accepted);

    let near_d = if params.on_fly {
        None
    } else {
        Some(
            format
                .near()
                .par_iter()
                .map(|&(i, j)| NdArray::from_mat(format.get_block(i, j)?.as_ref()))
                .collect::<Result<Vec<_>>>()?,
        )
    };

    let matrix = BlockMatrix::new(
        format,
        far_rank,
        far_u,
        far_v,
        params.on_fly,
        near_d,
        params.allocation,
    )?;

    log::debug!("{} built in {:?}", matrix, start.elapsed());
    progress::emit(
        &progress_callback,
        ProgressMsg::Message {
            message: format!(
                "Took {:?} to compress {} far-field blocks with {:?} at tolerance {:e}",
                start.elapsed(),
                total,
                params.method,
                params.tolerance
            ),
        },
    );

    Ok(matrix)
}

/// Moves false far-field blocks (`None` outcomes) to the end of the near
/// field, keeping the relative order of both lists, and returns the format
/// to use from now on.
fn reclassify(
    format: Arc<BlockFormat>,
    outcomes: &[Option<LowRankFactors>],
    progress_callback: &Option<Arc<dyn ProgressSink>>,
) -> Result<Arc<BlockFormat>> {
    let false_far: Vec<(usize, usize)> = format
        .far()
        .iter()
        .zip(outcomes)
        .filter(|(_, outcome)| outcome.is_none())
        .map(|(&block, _)| block)
        .collect();

    if false_far.is_empty() {
        return Ok(format);
    }

    let far: Vec<(usize, usize)> = format
        .far()
        .iter()
        .zip(outcomes)
        .filter(|(_, outcome)| outcome.is_some())
        .map(|(&block, _)| block)
        .collect();

    let mut near = format.near().to_vec();
    near.extend_from_slice(&false_far);

    let replaced = Arc::new(format.replace_after_reclassification(far, near)?);

    log::warn!(
        "format was modified due to {} false far-field blocks \
         ({} far-field and {} near-field blocks remain)",
        false_far.len(),
        replaced.nblocks_far(),
        replaced.nblocks_near()
    );
    progress::emit(
        progress_callback,
        ProgressMsg::FormatReclassified {
            false_far: false_far.len(),
            far: replaced.nblocks_far(),
            near: replaced.nblocks_near(),
        },
    );

    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        array::Order,
        cluster::Cluster,
        config::{AllocationMode, CompressionMethod},
        error::{BlrError, KernelError},
        matrix::BlockView,
        problem::{BlockSource, Problem},
        progress::closure_sink,
        traits::BlockKernel,
    };
    use faer::Mat;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    fn dense_format(matrix: Mat<f64>, block_size: usize) -> Arc<BlockFormat> {
        let n = matrix.nrows();
        let array = NdArray::from_mat(matrix.as_ref()).unwrap();
        let problem: Arc<dyn BlockSource> = Arc::new(Problem::from_array(array, false).unwrap());
        let rows = Arc::new(Cluster::tiled(n, block_size).unwrap());
        let cols = Arc::new(Cluster::tiled(matrix.ncols(), block_size).unwrap());
        Arc::new(BlockFormat::tiled(problem, rows, cols, false).unwrap())
    }

    /// Smooth matrix with one block of rows 20..40 and columns 0..20 replaced
    /// by random noise.
    fn noisy_matrix() -> Mat<f64> {
        let mut rng = StdRng::seed_from_u64(21);
        let mut matrix = Mat::from_fn(40, 40, |i, j| {
            let d = (i as f64 - j as f64) / 40.0;
            (-d * d).exp()
        });
        for j in 0..20 {
            for i in 20..40 {
                matrix[(i, j)] = rng.random_range(-1.0..1.0);
            }
        }
        matrix
    }

    #[test]
    fn low_rank_blocks_are_compressed_within_tolerance() {
        let mut rng = StdRng::seed_from_u64(5);
        let a = Mat::from_fn(100, 5, |_, _| rng.random_range(-1.0..1.0));
        let b = Mat::from_fn(100, 5, |_, _| rng.random_range(-1.0..1.0));
        let format = dense_format(&a * b.transpose(), 50);

        let params = CompressionParams::builder().tolerance(1e-10).build().unwrap();
        let matrix = BlockMatrix::builder(format.clone(), params).build().unwrap();

        assert_eq!(matrix.format().nblocks_far(), 2);
        assert!(Arc::ptr_eq(matrix.format(), &format));
        for (position, &(i, j)) in format.far().iter().enumerate() {
            assert!(matrix.far_rank()[position] <= 5);
            let exact = format.get_block(i, j).unwrap();
            let approx = matrix.get_block(i, j).unwrap().to_mat().unwrap();
            assert!((&approx - &exact).norm_l2() / exact.norm_l2() <= 1e-8);
        }
    }

    #[test]
    fn compactly_supported_kernel_keeps_zero_blocks_at_rank_zero() {
        // max(0, 1 - |i - j| / 5): every tile away from the diagonal band is zero
        let matrix = Mat::from_fn(100, 100, |i, j| {
            (1.0 - (i as f64 - j as f64).abs() / 5.0).max(0.0)
        });

        for method in [
            CompressionMethod::Qp3,
            CompressionMethod::Svd,
            CompressionMethod::Randomized,
            CompressionMethod::Aca,
        ] {
            let format = dense_format(matrix.clone(), 10);
            let params = CompressionParams::builder()
                .method(method)
                .tolerance(1e-6)
                .build()
                .unwrap();
            let compressed = BlockMatrix::builder(format, params).build().unwrap();

            assert!(compressed.far_rank().iter().any(|&rank| rank == 0), "{:?}", method);
            assert!(compressed.estimate_error().unwrap() <= 1e-6, "{:?}", method);
        }
    }

    #[test]
    fn false_far_field_blocks_are_moved_to_near_field() {
        let format = dense_format(noisy_matrix(), 20);
        assert_eq!(format.nblocks_far(), 2);
        assert_eq!(format.nblocks_near(), 2);

        let messages = Arc::new(Mutex::new(Vec::new()));
        let collected = messages.clone();
        let (sink, handle) = closure_sink(256, move |msg| collected.lock().unwrap().push(msg));

        let params = CompressionParams::default();
        let matrix = BlockMatrix::builder(format.clone(), params)
            .progress_callback(sink.clone())
            .build()
            .unwrap();
        drop(sink);
        handle.join().unwrap();

        let new_format = matrix.format();
        assert_eq!(new_format.nblocks_far(), 1);
        assert_eq!(new_format.nblocks_near(), 3);
        assert_eq!(new_format.far(), &[(0, 1)]);
        assert_eq!(new_format.near()[2], (1, 0));

        // The original format is left untouched.
        assert_eq!(format.nblocks_far(), 2);
        assert_eq!(format.nblocks_near(), 2);

        assert_eq!(matrix.far_rank().len(), 1);
        let stored = match matrix.get_block(1, 0).unwrap() {
            BlockView::Dense(d) => d.into_owned(),
            BlockView::LowRank { .. } => panic!("noise block kept as low-rank"),
        };
        let exact = NdArray::from_mat(new_format.get_block(1, 0).unwrap().as_ref()).unwrap();
        assert_eq!(stored.diff(&exact).unwrap(), 0.0);
        assert!(matrix.estimate_error().unwrap() <= 1e-6);

        let messages = messages.lock().unwrap();
        assert!(messages.contains(&ProgressMsg::FormatReclassified {
            false_far: 1,
            far: 1,
            near: 3
        }));
        assert!(messages.contains(&ProgressMsg::BlocksCompressed { done: 2, total: 2 }));
    }

    #[test]
    fn on_fly_matrices_store_no_near_field() {
        let format = dense_format(noisy_matrix(), 10);
        let params = CompressionParams::builder().on_fly(true).build().unwrap();
        let matrix = BlockMatrix::builder(format, params).build().unwrap();

        assert!(matrix.on_fly());
        assert!(matrix.near_d().is_none());
        assert!(matrix.estimate_error().unwrap() <= 1e-6);

        let stored = CompressionParams::default();
        let reference = BlockMatrix::builder(matrix.format().clone(), stored).build().unwrap();
        assert!(reference.data_nbytes() > matrix.data_nbytes());
    }

    #[test]
    fn consolidated_allocation_packs_arrays_into_arenas() {
        let format = dense_format(noisy_matrix(), 10);

        let separate = BlockMatrix::builder(format.clone(), CompressionParams::default())
            .build()
            .unwrap();
        let params = CompressionParams::builder()
            .allocation(AllocationMode::Consolidated)
            .build()
            .unwrap();
        let consolidated = BlockMatrix::builder(format, params).build().unwrap();

        assert!(separate.arenas().is_empty());
        assert_eq!(consolidated.arenas().len(), 3);
        assert!(consolidated.far_u().iter().all(|u| !u.is_owned()));
        assert!(consolidated.near_d().unwrap().iter().all(|d| !d.is_owned()));
        assert_eq!(separate.data_nbytes(), consolidated.data_nbytes());

        let a = separate.to_dense().unwrap();
        let b = consolidated.to_dense().unwrap();
        assert_eq!(a.diff(&b).unwrap(), 0.0);
    }

    #[test]
    fn every_method_meets_the_tolerance() {
        for method in [
            CompressionMethod::Qp3,
            CompressionMethod::Svd,
            CompressionMethod::Randomized,
            CompressionMethod::Aca,
        ] {
            let format = dense_format(noisy_matrix(), 10);
            let params = CompressionParams::builder()
                .method(method)
                .tolerance(1e-8)
                .build()
                .unwrap();
            let matrix = BlockMatrix::builder(format, params).build().unwrap();
            assert!(matrix.estimate_error().unwrap() <= 1e-7, "{:?}", method);
        }
    }

    struct FailingKernel;

    impl BlockKernel for FailingKernel {
        type Elem = f64;
        type RowData = ();
        type ColData = ();

        fn evaluate(
            &self,
            row_indices: &[usize],
            col_indices: &[usize],
            _: &(),
            _: &(),
            out: &mut [f64],
        ) -> std::result::Result<(), KernelError> {
            if row_indices.contains(&17) {
                return Err(KernelError::new("row 17 is unavailable"));
            }
            let m = row_indices.len();
            for (j, &c) in col_indices.iter().enumerate() {
                for (i, &r) in row_indices.iter().enumerate() {
                    out[i + j * m] = 1.0 / (1.0 + (r as f64 - c as f64).abs());
                }
            }
            Ok(())
        }
    }

    #[test]
    fn kernel_failures_abort_compression() {
        let data = Arc::new(());
        let problem: Arc<dyn BlockSource> = Arc::new(
            Problem::new(&[30, 30], true, data.clone(), data, FailingKernel, "failing").unwrap(),
        );
        let cluster = Arc::new(Cluster::tiled(30, 10).unwrap());
        let format = Arc::new(BlockFormat::tiled(problem, cluster.clone(), cluster, true).unwrap());

        let result = BlockMatrix::builder(format, CompressionParams::default()).build();
        assert!(matches!(result, Err(BlrError::KernelFailure(_))));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let format = dense_format(noisy_matrix(), 20);
        let params = CompressionParams {
            tolerance: f64::NAN,
            ..CompressionParams::default()
        };
        assert!(matches!(
            compress(format, &params, None),
            Err(BlrError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn dense_matrix_round_trip_through_array() {
        let matrix = noisy_matrix();
        let format = dense_format(matrix.clone(), 8);
        let blr = BlockMatrix::builder(format, CompressionParams::default())
            .build()
            .unwrap();
        let dense = blr.to_dense().unwrap();
        assert_eq!(dense.order(), Order::ColMajor);
        let expected = NdArray::from_mat(matrix.as_ref()).unwrap();
        assert!(dense.diff(&expected).unwrap() / expected.norm() <= 1e-6);
    }
}
