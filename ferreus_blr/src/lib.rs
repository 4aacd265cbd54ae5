/////////////////////////////////////////////////////////////////////////////////////////////
//
// Exposes the public API and high-level documentation for block low-rank kernel matrices.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Block low-rank (BLR) approximation of kernel matrices.
//!
//! Dense kernel matrices, such as the interaction matrices of radial basis
//! functions or boundary element methods, need **O(N²)** memory and time to
//! store and apply. For smooth kernels, blocks of the matrix that couple
//! well separated groups of points are numerically low-rank and can be
//! stored as `U Vᵗ` factors instead.
//!
//! This crate never forms the full matrix. It evaluates a user supplied
//! kernel on demand, block by block, and:
//!
//! - partitions the row and column indices into blocks with a [`Cluster`]
//!   (uniform tiles or a geometric cluster tree),
//! - classifies every pair of blocks as far-field (compressible) or
//!   near-field (dense) in a [`BlockFormat`],
//! - compresses far-field blocks in parallel with rank revealing QR (QP3),
//!   SVD, randomised sketching or adaptive cross approximation, moving blocks
//!   that turn out not to be low-rank to the near field,
//! - provides matrix products, error estimates and dense reconstruction on
//!   the resulting [`BlockMatrix`].
//!
//! Linear algebra is built on [`faer`](https://docs.rs/faer/latest/faer/)
//! and block work is parallelised with [`rayon`](https://docs.rs/rayon/latest/rayon/).
//!
//! # Examples
//!
//! ```
//! use ferreus_blr::{
//!     BlockFormat, BlockMatrix, BlockSource, Cluster, CompressionParams, KernelFunction, Problem,
//! };
//! use faer::{Mat, RowRef};
//! use std::sync::Arc;
//!
//! struct InverseDistance;
//!
//! impl KernelFunction for InverseDistance {
//!     fn evaluate(&self, target: RowRef<f64>, source: RowRef<f64>) -> f64 {
//!         1.0 / (1.0 + (target[0] - source[0]).abs())
//!     }
//! }
//!
//! // 200 points on the unit interval
//! let n = 200;
//! let points = Arc::new(Mat::from_fn(n, 1, |i, _| i as f64 / n as f64));
//! let problem: Arc<dyn BlockSource> = Arc::new(Problem::from_points(
//!     points.clone(),
//!     points,
//!     InverseDistance,
//!     true,
//!     "inverse distance",
//! )?);
//!
//! // Uniform tiles of 25 indices, every off-diagonal block is far-field
//! let cluster = Arc::new(Cluster::tiled(n, 25)?);
//! let format = Arc::new(BlockFormat::tiled(problem, cluster.clone(), cluster, true)?);
//!
//! let params = CompressionParams::builder().tolerance(1e-8).build()?;
//! let matrix = BlockMatrix::builder(format, params).build()?;
//! assert!(matrix.estimate_error()? <= 1e-8);
//!
//! // y = M x
//! let x = Mat::from_fn(n, 1, |_, _| 1.0);
//! let mut y = Mat::<f64>::zeros(n, 1);
//! matrix.multiply(1.0, x.as_ref(), 0.0, y.as_mut())?;
//! # Ok::<(), ferreus_blr::BlrError>(())
//! ```
//!
//! # References
//! 1.  M. Bebendorf. Hierarchical Matrices. Lecture Notes in Computational
//!     Science and Engineering, vol. 63. Springer, 2008.
//! 2.  P. Amestoy, C. Ashcraft, O. Boiteau, A. Buttari, J.-Y. L'Excellent and
//!     C. Weisbecker. Improving multifrontal methods by means of block low-rank
//!     representations. SIAM J. Sci. Comput., 37(3):A1451–A1474, 2015.
//! 3.  N. Halko, P. G. Martinsson and J. A. Tropp. Finding structure with
//!     randomness. SIAM Review, 53(2):217–288, 2011.
pub mod config;

pub mod progress;

mod error;

mod array;

mod traits;

pub mod utils;

mod problem;

mod cluster;

mod admissibility;

mod format;

mod rank;

mod lowrank;

mod arena;

mod compression;

mod matrix;

pub use {
    admissibility::{Admissibility, Diagonal, DistanceDiameter},
    arena::Arena,
    array::{Element, ElementKind, NdArray, Order},
    cluster::{Cluster, ClusterKind, MedianSplit, PrincipalAxisSplit, SplitPolicy},
    compression::{BlockMatrixBuilder, compress},
    config::{
        AllocationMode, CompressionMethod, CompressionParams, CompressionParamsBuilder, NormType,
        RankPolicy,
    },
    error::{BlrError, KernelError, Result},
    format::{BlockFormat, FormatKind},
    lowrank::{LowRankFactors, compress_dense},
    matrix::{BlockMatrix, BlockView},
    problem::{BlockSource, DenseKernel, PointKernel, Problem},
    progress::{ProgressMsg, ProgressSink, closure_sink},
    rank::rank_from_singular_values,
    traits::{BlockKernel, KernelFunction, LinearOperator},
};
