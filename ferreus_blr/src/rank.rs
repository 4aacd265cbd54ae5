/////////////////////////////////////////////////////////////////////////////////////////////
//
// Selects the numerical rank of a block from its singular values.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use crate::config::NormType;

/// Determines the number of singular values to keep so that the truncation
/// error is within `tolerance`, relative to the norm of the full spectrum.
///
/// # Arguments
/// * `sigma` - Singular values, sorted in descending order.
/// * `tolerance` - Relative truncation tolerance.
/// * `norm_type` - Norm in which the truncation error is measured:
///   - [`NormType::Frobenius`]: smallest `r` with
///     `sum_{k >= r} sigma[k]^2 <= tolerance^2 * sum_k sigma[k]^2`,
///   - [`NormType::Spectral`]: number of values with `sigma[k] > tolerance * sigma[0]`.
///
/// # Returns
/// The retained rank. A non-positive `tolerance` keeps every value, and a
/// spectrum of zeros has rank `0`.
pub fn rank_from_singular_values(sigma: &[f64], tolerance: f64, norm_type: NormType) -> usize {
    if tolerance <= 0.0 {
        return sigma.len();
    }
    if sigma.iter().all(|&s| s == 0.0) {
        return 0;
    }

    match norm_type {
        NormType::Frobenius => frobenius_cutoff(sigma, tolerance),
        NormType::Spectral => {
            let threshold = tolerance * sigma[0];
            sigma.iter().take_while(|&&s| s > threshold).count()
        }
    }
}

fn frobenius_cutoff(sigma: &[f64], tolerance: f64) -> usize {
    // Backward cumulative sum of squared singular values
    let cumulative_sum_sqr = inverse_cumulative_sum_of_squares(sigma);

    // Allowable residual
    let threshold = cumulative_sum_sqr[0] * tolerance * tolerance;

    // Smallest index where the dropped tail is within the threshold
    cumulative_sum_sqr
        .iter()
        .position(|&tail| tail <= threshold)
        .unwrap_or(cumulative_sum_sqr.len())
}

/// result[i] = sum_{j=i}^{n-1} sigma[j]^2
fn inverse_cumulative_sum_of_squares(sigma: &[f64]) -> Vec<f64> {
    let cumulative_sum_squared: Vec<f64> = sigma
        .iter()
        .rev()
        .scan(0.0, |acc, &x| {
            *acc += x * x;
            Some(*acc)
        })
        .collect();

    cumulative_sum_squared.into_iter().rev().collect()
}
