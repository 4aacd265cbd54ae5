/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements rank-revealing factorisations of far-field blocks (QP3, SVD, randomized, ACA).
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # lowrank
//!
//! Every method produces a truncated factorisation `A ≈ U diag(S) Vᵗ`, whose
//! rank is then selected with [`rank_from_singular_values`]. Accepted blocks
//! are returned as `(U, V)` with `V` pre-scaled by the singular values so
//! that `A ≈ U Vᵗ`. Blocks whose rank is not a sufficient reduction are
//! reported as `None` (false far-field).

use crate::{
    config::{CompressionMethod, CompressionParams},
    error::{BlrError, Result},
    problem::BlockSource,
    rank::rank_from_singular_values,
};
use faer::{Mat, MatRef, RowRef};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;
use std::ops::Range;

/// Low-rank factors of a block, `block ≈ u * vᵗ`.
#[derive(Debug, Clone)]
pub struct LowRankFactors {
    /// `rows x rank`
    pub u: Mat<f64>,
    /// `cols x rank`, scaled by the singular values.
    pub v: Mat<f64>,
}

impl LowRankFactors {
    pub fn rank(&self) -> usize {
        self.u.ncols()
    }

    /// Reconstructs the dense block.
    pub fn to_dense(&self) -> Mat<f64> {
        &self.u * self.v.transpose()
    }
}

/// Factorisation `A ≈ u diag(s) vᵗ` before truncation.
struct Spectrum {
    u: Mat<f64>,
    s: Vec<f64>,
    v: Mat<f64>,
}

/// Compresses a block that has already been evaluated.
///
/// # Returns
/// `Some(factors)` if the block is accepted as low-rank by the rank policy,
/// `None` if it must be treated as dense.
pub fn compress_dense(
    block: MatRef<f64>,
    params: &CompressionParams,
    seed: u64,
) -> Result<Option<LowRankFactors>> {
    let (nrows, ncols) = block.shape();
    if nrows == 0 || ncols == 0 {
        return Err(BlrError::invalid("cannot compress an empty block"));
    }

    // All singular values are zero: rank 0 regardless of the method
    if block.norm_l2() == 0.0 {
        let spectrum = Spectrum {
            u: Mat::zeros(nrows, 0),
            s: Vec::new(),
            v: Mat::zeros(ncols, 0),
        };
        return Ok(truncate(spectrum, nrows, ncols, params, false));
    }

    let spectrum = match params.method {
        CompressionMethod::Qp3 => {
            let k = params.rank_policy.candidate_rank(nrows, ncols);
            qp3(block, k)?
        }
        CompressionMethod::Svd => svd(block)?,
        CompressionMethod::Randomized => {
            let k = params.rank_policy.candidate_rank(nrows, ncols);
            randomized(block, k, seed)?
        }
        CompressionMethod::Aca => {
            let max_rank = params.rank_policy.candidate_rank(nrows, ncols);
            let generator = |rows: Range<usize>, cols: Range<usize>| -> Result<Mat<f64>> {
                Ok(block
                    .submatrix(rows.start, cols.start, rows.len(), cols.len())
                    .to_owned())
            };
            match aca_partial_pivoting(nrows, ncols, generator, params.tolerance, max_rank)? {
                Some((u, v)) => recompress_aca(&u, &v)?,
                None => return Ok(None),
            }
        }
    };

    let sketched = matches!(
        params.method,
        CompressionMethod::Qp3 | CompressionMethod::Randomized
    );
    Ok(truncate(spectrum, nrows, ncols, params, sketched))
}

/// Compresses the block of `source` on the intersection of `row_indices`
/// and `col_indices`.
///
/// ACA samples individual rows and columns from the kernel. The other
/// methods evaluate the whole block first.
pub(crate) fn compress_block(
    source: &dyn BlockSource,
    row_indices: &[usize],
    col_indices: &[usize],
    params: &CompressionParams,
    seed: u64,
) -> Result<Option<LowRankFactors>> {
    let (nrows, ncols) = (row_indices.len(), col_indices.len());
    if nrows == 0 || ncols == 0 {
        return Err(BlrError::invalid("cannot compress an empty block"));
    }

    match params.method {
        CompressionMethod::Aca => {
            let max_rank = params.rank_policy.candidate_rank(nrows, ncols);
            let generator = |rows: Range<usize>, cols: Range<usize>| {
                source.block(&row_indices[rows], &col_indices[cols])
            };
            match aca_partial_pivoting(nrows, ncols, generator, params.tolerance, max_rank)? {
                Some((u, v)) => Ok(truncate(recompress_aca(&u, &v)?, nrows, ncols, params, false)),
                None => Ok(None),
            }
        }
        _ => {
            let block = source.block(row_indices, col_indices)?;
            compress_dense(block.as_ref(), params, seed)
        }
    }
}

/// Selects the rank and applies the acceptance policy.
///
/// `sketched` marks spectra computed from fewer than `min(rows, cols)`
/// candidate columns. If such a spectrum is exhausted by the selected rank,
/// the tail beyond the candidates is unknown and the block is rejected.
fn truncate(
    spectrum: Spectrum,
    nrows: usize,
    ncols: usize,
    params: &CompressionParams,
    sketched: bool,
) -> Option<LowRankFactors> {
    let rank = rank_from_singular_values(&spectrum.s, params.tolerance, params.norm_type);
    let saturated = sketched && rank == spectrum.s.len() && rank < nrows.min(ncols);
    if saturated || !params.rank_policy.accepts(rank, nrows, ncols) {
        return None;
    }

    let u = spectrum.u.subcols(0, rank).to_owned();
    let v = Mat::from_fn(spectrum.v.nrows(), rank, |i, j| spectrum.v[(i, j)] * spectrum.s[j]);

    Some(LowRankFactors { u, v })
}

/// Column-pivoted QR truncated to `k` columns, followed by an SVD of the
/// projected `k x cols` factor.
fn qp3(block: MatRef<f64>, k: usize) -> Result<Spectrum> {
    let qr = block.col_piv_qr();
    let q = qr.compute_thin_Q();
    let q_k = q.subcols(0, k);

    // Projection onto the leading pivoted columns: W = Q_kᵗ A (k x cols)
    let w = q_k.transpose() * block;

    let svd = w
        .thin_svd()
        .map_err(|e| BlrError::numerical(format!("SVD of projected block failed: {:?}", e)))?;

    Ok(Spectrum {
        u: q_k * svd.U(),
        s: svd.S().column_vector().iter().cloned().collect(),
        v: svd.V().to_owned(),
    })
}

fn svd(block: MatRef<f64>) -> Result<Spectrum> {
    let svd = block
        .thin_svd()
        .map_err(|e| BlrError::numerical(format!("SVD of block failed: {:?}", e)))?;

    Ok(Spectrum {
        u: svd.U().to_owned(),
        s: svd.S().column_vector().iter().cloned().collect(),
        v: svd.V().to_owned(),
    })
}

/// Randomized range finder with a Gaussian sketch of `k` columns.
fn randomized(block: MatRef<f64>, k: usize, seed: u64) -> Result<Spectrum> {
    let mut rng = StdRng::seed_from_u64(seed);
    let omega: Mat<f64> = Mat::from_fn(block.ncols(), k, |_, _| rng.sample(StandardNormal));

    let sample = block * &omega;
    let q = sample.qr().compute_thin_Q();

    let w = q.transpose() * block;
    let svd = w
        .thin_svd()
        .map_err(|e| BlrError::numerical(format!("SVD of sketched block failed: {:?}", e)))?;

    Ok(Spectrum {
        u: &q * svd.U(),
        s: svd.S().column_vector().iter().cloned().collect(),
        v: svd.V().to_owned(),
    })
}

/// Adaptive Cross Approximation (ACA) with partial pivoting
///
/// # Arguments
/// * `num_rows` - Number of rows in the target block
/// * `num_columns` - Number of columns in the target block
/// * `matrix_subset_generator` - Closure evaluating a sub-block (local row range, local col range)
/// * `epsilon` - Desired accuracy (Frobenius norm relative tolerance)
/// * `max_rank` - Maximum number of cross terms
///
/// # Returns
/// `Some((U, V))` with `A ≈ U * V^T`, or `None` if the stopping criterion
/// was not met within `max_rank` terms.
fn aca_partial_pivoting<F>(
    num_rows: usize,
    num_columns: usize,
    matrix_subset_generator: F,
    epsilon: f64,
    max_rank: usize,
) -> Result<Option<(Mat<f64>, Mat<f64>)>>
where
    F: Fn(Range<usize>, Range<usize>) -> Result<Mat<f64>>,
{
    // Track unused rows and columns with binary flags (1 = unused, 0 = used)
    let mut unused_rows = vec![1u8; num_rows];
    let mut unused_columns = vec![1u8; num_columns];

    let max_iterations = max_rank.min(num_rows).min(num_columns);

    // Relative tolerance on squared residual norm
    let tolerance = epsilon * epsilon;

    let mut u = Mat::<f64>::zeros(num_rows, max_iterations);
    let mut v = Mat::<f64>::zeros(num_columns, max_iterations);

    // Estimate of ||A_k||_F^2
    let mut approximation_norm = 0.0;

    let mut i = 0usize;
    let mut k = 0usize;
    let mut converged = false;

    while k < max_iterations {
        let mut v_row = matrix_subset_generator(i..i + 1, 0..num_columns)?;
        unused_rows[i] = 0;

        if k > 0 {
            v_row -= u.submatrix(i, 0, 1, k) * v.submatrix(0, 0, num_columns, k).transpose();
        }

        // Residual row vanishes on the unused columns: move to another row
        let Some(j) = argmax_masked(v_row.row(0), &unused_columns) else {
            match unused_rows.iter().position(|&flag| flag == 1) {
                Some(next) => {
                    i = next;
                    continue;
                }
                None => {
                    converged = true;
                    break;
                }
            }
        };

        let pivot = 1.0 / v_row[(0, j)];
        v_row *= pivot;

        let mut u_column = matrix_subset_generator(0..num_rows, j..j + 1)?;
        unused_columns[j] = 0;

        if k > 0 {
            u_column -= u.submatrix(0, 0, num_rows, k) * v.submatrix(j, 0, 1, k).transpose();
        }

        // Cross terms with previous updates: sum_{l<k} <u_l, u_k> <v_l, v_k>
        let sum_k = if k > 0 {
            let part1 = u.subcols(0, k).transpose() * &u_column;
            let part2 = v.subcols(0, k).transpose() * v_row.transpose();
            (0..k).map(|l| part1[(l, 0)] * part2[(l, 0)]).sum()
        } else {
            0.0
        };

        let norm_u = u_column.norm_l2();
        let norm_v = v_row.norm_l2();
        let norm_u_v_2 = norm_u * norm_u * norm_v * norm_v;

        approximation_norm += norm_u_v_2 + 2.0 * sum_k;

        u.col_mut(k).copy_from(&u_column.col(0));
        v.col_mut(k).copy_from(&v_row.row(0).transpose());
        k += 1;

        // Stopping criteria is:
        //   ||u_k||2 ||v_k||2 <= epsilon ||A_k||F
        if norm_u_v_2 <= tolerance * approximation_norm {
            converged = true;
            break;
        }

        // Next pivot row: largest residual in the new column
        match argmax_masked(u_column.col(0).transpose(), &unused_rows)
            .or_else(|| unused_rows.iter().position(|&flag| flag == 1))
        {
            Some(next) => i = next,
            None => {
                // Every row interpolated exactly
                converged = true;
                break;
            }
        }
    }

    if !converged {
        return Ok(None);
    }

    Ok(Some((u.subcols(0, k).to_owned(), v.subcols(0, k).to_owned())))
}

/// Index of the maximum absolute value among unmasked entries, or `None`
/// if they are all zero.
fn argmax_masked(data: RowRef<f64>, mask: &[u8]) -> Option<usize> {
    let mut max_index = None;
    let mut max_value = 0.0;

    for (idx, &value) in data.iter().enumerate() {
        let weighted_value = value.abs() * mask[idx] as f64;

        if weighted_value > max_value {
            max_value = weighted_value;
            max_index = Some(idx);
        }
    }

    max_index
}

/// Recompresses ACA factors with QR + SVD, exposing the singular values of
/// `U Vᵗ`.
fn recompress_aca(u_aca: &Mat<f64>, v_aca: &Mat<f64>) -> Result<Spectrum> {
    let k = u_aca.ncols();
    if k == 0 {
        return Ok(Spectrum {
            u: Mat::zeros(u_aca.nrows(), 0),
            s: Vec::new(),
            v: Mat::zeros(v_aca.nrows(), 0),
        });
    }

    let u_qr = u_aca.qr();
    let qu = u_qr.compute_thin_Q(); // m × k orthonormal basis
    let ru = u_qr.thin_R(); // k × k upper triangular

    let v_qr = v_aca.qr();
    let qv = v_qr.compute_thin_Q(); // n × k orthonormal basis
    let rv = v_qr.thin_R(); // k × k upper triangular

    let core = ru * rv.transpose();

    let svd = core
        .svd()
        .map_err(|e| BlrError::numerical(format!("SVD of ACA core failed: {:?}", e)))?;

    Ok(Spectrum {
        u: &qu * svd.U(),
        s: svd.S().column_vector().iter().cloned().collect(),
        v: &qv * svd.V(),
    })
}
