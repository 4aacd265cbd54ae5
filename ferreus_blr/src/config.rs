/////////////////////////////////////////////////////////////////////////////////////////////
//
// Declares configuration types for block compression, rank policy and storage layout.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Declares configuration types for block compression, rank policy and storage layout.

use crate::error::{BlrError, Result};
use serde::{Deserialize, Serialize};

/// Rank-revealing factorisation used on each far-field block.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// Column pivoted QR truncated to a candidate rank, followed by an SVD
    /// of the reduced triangular factor.
    #[default]
    Qp3,

    /// Thin Singular Value Decomposition of the whole block.
    Svd,

    /// Randomised range finder (Gaussian sketch) followed by an SVD of
    /// the projected block.
    Randomized,

    /// Adaptive cross approximation (ACA) with partial pivoting, followed
    /// by QR + SVD recompression.
    Aca,
}

/// Norm in which the truncation tolerance is measured.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NormType {
    /// Relative Frobenius norm of the discarded tail.
    #[default]
    Frobenius,

    /// Relative spectral (2-) norm, i.e. `sigma_k <= tol * sigma_0`.
    Spectral,
}

/// Layout of the factor and dense buffers of a block low-rank matrix.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AllocationMode {
    /// Every factor and dense block owns its own buffer.
    #[default]
    Separate,

    /// All `U` factors, all `V` factors and all dense blocks are packed into
    /// three contiguous arenas.
    Consolidated,
}

/// Parameters deciding how far a far-field block must be compressible to be
/// kept as low-rank.
///
/// For a block with `mn = min(rows, cols)`:
/// - the factorisation works with `min(mn, floor(mn * candidate_ratio) + oversample)`
///   candidate columns (only used by [`CompressionMethod::Qp3`] and
///   [`CompressionMethod::Randomized`]),
/// - the block is accepted if its numerical rank is strictly less than
///   `floor(mn * acceptance_ratio)` and does not exceed `max_rank`.
///
/// ### Default Values
/// - `oversample`: `10`
/// - `candidate_ratio`: `0.5`
/// - `acceptance_ratio`: `0.5`
/// - `max_rank`: `None`
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankPolicy {
    pub oversample: usize,
    pub candidate_ratio: f64,
    pub acceptance_ratio: f64,
    pub max_rank: Option<usize>,
}

impl Default for RankPolicy {
    fn default() -> Self {
        RankPolicy {
            oversample: 10,
            candidate_ratio: 0.5,
            acceptance_ratio: 0.5,
            max_rank: None,
        }
    }
}

impl RankPolicy {
    /// Number of candidate columns kept by the truncated factorisations.
    pub fn candidate_rank(&self, rows: usize, cols: usize) -> usize {
        let mn = rows.min(cols);
        let candidate = (mn as f64 * self.candidate_ratio).floor() as usize + self.oversample;
        candidate.min(mn)
    }

    /// Whether a block of the given shape with numerical rank `rank` is
    /// stored as low-rank.
    pub fn accepts(&self, rank: usize, rows: usize, cols: usize) -> bool {
        let mn = rows.min(cols);
        let threshold = (mn as f64 * self.acceptance_ratio).floor() as usize;
        let within_cap = self.max_rank.map_or(true, |max_rank| rank <= max_rank);
        rank < threshold && within_cap
    }
}

/// Parameters for building a [`BlockMatrix`](crate::BlockMatrix) from a
/// [`BlockFormat`](crate::BlockFormat).
///
/// ### Default Values
/// - `method`: [`CompressionMethod::Qp3`]
/// - `tolerance`: `1e-6`
/// - `norm_type`: [`NormType::Frobenius`]
/// - `rank_policy`: [`RankPolicy::default`]
/// - `on_fly`: `false`
/// - `allocation`: [`AllocationMode::Separate`]
/// - `seed`: `42`
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionParams {
    /// Factorisation applied to far-field blocks.
    pub method: CompressionMethod,

    /// Relative truncation tolerance.
    pub tolerance: f64,

    /// Norm the tolerance refers to.
    pub norm_type: NormType,

    /// Candidate rank and acceptance policy.
    pub rank_policy: RankPolicy,

    /// If `true`, near-field blocks are not stored and are recomputed from
    /// the kernel whenever they are needed.
    pub on_fly: bool,

    /// Buffer layout of the resulting matrix.
    pub allocation: AllocationMode,

    /// Seed of the random sketches used by [`CompressionMethod::Randomized`].
    pub seed: u64,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self {
            method: CompressionMethod::Qp3,
            tolerance: 1e-6,
            norm_type: NormType::Frobenius,
            rank_policy: RankPolicy::default(),
            on_fly: false,
            allocation: AllocationMode::Separate,
            seed: 42,
        }
    }
}

impl CompressionParams {
    /// Returns a new [`CompressionParamsBuilder`] populated with defaults.
    pub fn builder() -> CompressionParamsBuilder {
        CompressionParamsBuilder {
            params: CompressionParams::default(),
        }
    }

    /// Checks that the parameters describe a usable compression.
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() {
            return Err(BlrError::invalid("tolerance must be finite"));
        }
        let policy = &self.rank_policy;
        if !(policy.candidate_ratio.is_finite() && policy.candidate_ratio >= 0.0) {
            return Err(BlrError::invalid(
                "candidate_ratio must be a non-negative finite number",
            ));
        }
        if !(policy.acceptance_ratio.is_finite() && policy.acceptance_ratio >= 0.0) {
            return Err(BlrError::invalid(
                "acceptance_ratio must be a non-negative finite number",
            ));
        }
        // Without oversampling the candidates must reach past the acceptance
        // threshold, otherwise a truncated spectrum cannot reject a block.
        if policy.oversample == 0
            && (policy.candidate_ratio == 0.0 || policy.candidate_ratio < policy.acceptance_ratio)
        {
            return Err(BlrError::invalid(
                "rank policy without oversampling needs candidate_ratio >= acceptance_ratio",
            ));
        }
        Ok(())
    }
}

/// A convenience builder for constructing a [`CompressionParams`] instance.
///
/// The builder should be called via the [`CompressionParams::builder`] method.
///
/// See [`CompressionParams`] for details on each field.
#[derive(Debug, Clone)]
pub struct CompressionParamsBuilder {
    params: CompressionParams,
}

impl CompressionParamsBuilder {
    /// Sets the factorisation method.
    pub fn method(mut self, method: CompressionMethod) -> Self {
        self.params.method = method;
        self
    }

    /// Sets the relative truncation tolerance.
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.params.tolerance = tolerance;
        self
    }

    /// Sets the norm the tolerance refers to.
    pub fn norm_type(mut self, norm_type: NormType) -> Self {
        self.params.norm_type = norm_type;
        self
    }

    /// Sets the candidate rank and acceptance policy.
    pub fn rank_policy(mut self, rank_policy: RankPolicy) -> Self {
        self.params.rank_policy = rank_policy;
        self
    }

    /// Enables or disables on-the-fly near-field evaluation.
    pub fn on_fly(mut self, on_fly: bool) -> Self {
        self.params.on_fly = on_fly;
        self
    }

    /// Sets the buffer layout.
    pub fn allocation(mut self, allocation: AllocationMode) -> Self {
        self.params.allocation = allocation;
        self
    }

    /// Sets the seed of the randomised sketches.
    pub fn seed(mut self, seed: u64) -> Self {
        self.params.seed = seed;
        self
    }

    /// Validates and returns the [`CompressionParams`].
    pub fn build(self) -> Result<CompressionParams> {
        self.params.validate()?;
        Ok(self.params)
    }
}
