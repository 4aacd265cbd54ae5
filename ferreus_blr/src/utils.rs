/////////////////////////////////////////////////////////////////////////////////////////////
//
// Provides utility routines for bounding boxes, row selection, sorting and scatter/gather.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use faer::{Mat, MatMut, MatRef};

/// Computes the axis aligned bounding box (AABB) extents of a subset of the
/// rows of a matrix of points.
///
/// The result is arranged as:
///
/// `[min_0, min_1, ..., min_n, max_0, max_1, ..., max_n]`
///
/// where `n` is the number of columns in the matrix. An empty subset yields
/// an empty vector.
pub fn get_pointarray_extents(points: MatRef<f64>, row_indices: &[usize]) -> Vec<f64> {
    let ncols = points.ncols();

    let Some(&first) = row_indices.first() else {
        return Vec::new();
    };

    let mut extents = vec![0.0; 2 * ncols];

    for col in 0..ncols {
        extents[col] = points[(first, col)];
        extents[col + ncols] = points[(first, col)];
    }

    for &row in row_indices {
        for col in 0..ncols {
            let item = points[(row, col)];
            if item < extents[col] {
                extents[col] = item;
            }
            if item > extents[col + ncols] {
                extents[col + ncols] = item;
            }
        }
    }

    extents
}

/// Length of the diagonal of a bounding box given as `[mins..., maxs...]`.
pub fn extents_diameter(extents: &[f64]) -> f64 {
    let dim = extents.len() / 2;
    (0..dim)
        .map(|d| (extents[d + dim] - extents[d]).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Euclidean distance between two bounding boxes (zero if they intersect).
pub fn extents_distance(a: &[f64], b: &[f64]) -> f64 {
    let dim = a.len() / 2;
    (0..dim)
        .map(|d| {
            let gap = (b[d] - a[d + dim]).max(a[d] - b[d + dim]).max(0.0);
            gap * gap
        })
        .sum::<f64>()
        .sqrt()
}

#[inline(always)]
pub fn select_mat_rows(existing_mat: MatRef<f64>, row_indices: &[usize]) -> Mat<f64> {
    Mat::from_fn(row_indices.len(), existing_mat.ncols(), |i, j| {
        existing_mat[(row_indices[i], j)]
    })
}

/// Adds `values` into the rows `row_indices` of `target`.
#[inline(always)]
pub fn scatter_add_rows(mut target: MatMut<f64>, row_indices: &[usize], values: MatRef<f64>) {
    for j in 0..values.ncols() {
        for (i, &row) in row_indices.iter().enumerate() {
            target[(row, j)] += values[(i, j)];
        }
    }
}

/// Returns the index of the largest value.
pub fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best_idx, best), (idx, &v)| {
            if v > best { (idx, v) } else { (best_idx, best) }
        })
        .0
}

/// Returns the indices that would sort the input slice.
#[inline(always)]
pub fn argsort<T: PartialOrd>(data: &[T]) -> Vec<usize> {
    let mut indices = (0..data.len()).collect::<Vec<_>>();
    indices.sort_by(|&i, &j| data[i].partial_cmp(&data[j]).unwrap_or(std::cmp::Ordering::Equal));
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn extents_of_subset() {
        let points = mat![[0.0, 5.0], [2.0, -1.0], [10.0, 10.0]];
        let extents = get_pointarray_extents(points.as_ref(), &[0, 1]);
        assert_eq!(extents, vec![0.0, -1.0, 2.0, 5.0]);
        assert!(get_pointarray_extents(points.as_ref(), &[]).is_empty());
    }

    #[test]
    fn box_distance_and_diameter() {
        let a = [0.0, 0.0, 1.0, 1.0];
        let b = [4.0, 5.0, 6.0, 6.0];
        assert!((extents_distance(&a, &b) - 5.0).abs() < 1e-14);
        assert_eq!(extents_distance(&a, &a), 0.0);
        assert!((extents_diameter(&a) - 2f64.sqrt()).abs() < 1e-14);
    }

    #[test]
    fn scatter_add_accumulates() {
        let mut target = Mat::<f64>::zeros(3, 1);
        let values = mat![[1.0], [2.0]];
        scatter_add_rows(target.as_mut(), &[2, 0], values.as_ref());
        scatter_add_rows(target.as_mut(), &[2, 0], values.as_ref());
        assert_eq!(target[(0, 0)], 4.0);
        assert_eq!(target[(1, 0)], 0.0);
        assert_eq!(target[(2, 0)], 2.0);
    }

    #[test]
    fn argsort_and_argmax() {
        let data = [3.0, 1.0, 2.0];
        assert_eq!(argsort(&data), vec![1, 2, 0]);
        assert_eq!(argmax(&data), 0);
    }
}
