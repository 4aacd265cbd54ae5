/////////////////////////////////////////////////////////////////////////////////////////////
//
// Partitions the block grid into far-field and near-field blocks with CSR block indices.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # format
//!
//! A [`BlockFormat`] couples a problem with a row and a column [`Cluster`]
//! and lists which `(row block, column block)` pairs are far-field
//! (compressible) and which are near-field (dense).
//!
//! Both lists are stored flat, and additionally as four compressed sparse
//! indices mapping each block row (or block column) to the positions of its
//! far (or near) blocks in the flat lists, ordered by partner block.
//!
//! For symmetric formats only pairs with `j <= i` are stored; their mirrors
//! are implied.

use crate::{
    admissibility::{Admissibility, Diagonal},
    cluster::{Cluster, ClusterKind},
    error::{BlrError, Result},
    problem::BlockSource,
};
use faer::Mat;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// How the block lists were produced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FormatKind {
    Tiled,
    Hierarchical,
}

/// Compressed sparse index of block positions, grouped by block row or
/// block column.
#[derive(Debug, Clone)]
struct BlockIndex {
    start: Vec<usize>,
    index: Vec<usize>,
}

impl BlockIndex {
    /// Groups `blocks` by `key(block).0` and sorts each group by
    /// `key(block).1`, keeping list order among ties.
    fn build<F>(nbins: usize, blocks: &[(usize, usize)], key: F) -> Self
    where
        F: Fn(&(usize, usize)) -> (usize, usize),
    {
        let mut start = vec![0usize; nbins + 1];
        for block in blocks {
            start[key(block).0 + 1] += 1;
        }
        for bin in 0..nbins {
            start[bin + 1] += start[bin];
        }

        let mut index: Vec<usize> = (0..blocks.len()).collect();
        index.sort_by_key(|&position| key(&blocks[position]));

        Self { start, index }
    }

    fn get(&self, bin: usize) -> &[usize] {
        match (self.start.get(bin), self.start.get(bin + 1)) {
            (Some(&begin), Some(&end)) => &self.index[begin..end],
            _ => &[],
        }
    }
}

/// Block low-rank format: far-field and near-field block lists over a pair
/// of clusters.
pub struct BlockFormat {
    problem: Arc<dyn BlockSource>,
    row_cluster: Arc<Cluster>,
    col_cluster: Arc<Cluster>,
    symmetric: bool,
    far: Vec<(usize, usize)>,
    near: Vec<(usize, usize)>,
    row_far: BlockIndex,
    col_far: BlockIndex,
    row_near: BlockIndex,
    col_near: BlockIndex,
    kind: FormatKind,
}

impl BlockFormat {
    /// Creates a format from explicit far and near block lists.
    ///
    /// # Errors
    /// [`BlrError::InvalidArgument`] if:
    /// - the problem shape does not match the clusters,
    /// - `symmetric` is set but the problem is not symmetric or the row and
    ///   column clusters differ,
    /// - a block index is out of range, duplicated, or listed as both far and near,
    /// - a symmetric format lists a block with `j > i`.
    pub fn new(
        problem: Arc<dyn BlockSource>,
        row_cluster: Arc<Cluster>,
        col_cluster: Arc<Cluster>,
        symmetric: bool,
        far: Vec<(usize, usize)>,
        near: Vec<(usize, usize)>,
        kind: FormatKind,
    ) -> Result<Self> {
        if problem.nrows() != row_cluster.ndata() || problem.ncols() != col_cluster.ndata() {
            return Err(BlrError::invalid(format!(
                "problem is {}x{} but clusters have {} rows and {} columns",
                problem.nrows(),
                problem.ncols(),
                row_cluster.ndata(),
                col_cluster.ndata()
            )));
        }
        if symmetric {
            if !problem.is_symmetric() {
                return Err(BlrError::invalid(
                    "symmetric format requires a symmetric problem",
                ));
            }
            if !Arc::ptr_eq(&row_cluster, &col_cluster) {
                return Err(BlrError::invalid(
                    "symmetric format requires the same row and column cluster",
                ));
            }
        }

        let (nbrows, nbcols) = (row_cluster.nblocks(), col_cluster.nblocks());
        let mut seen = HashSet::with_capacity(far.len() + near.len());
        for &(i, j) in far.iter().chain(near.iter()) {
            if i >= nbrows || j >= nbcols {
                return Err(BlrError::invalid(format!(
                    "block ({}, {}) is outside the {}x{} block grid",
                    i, j, nbrows, nbcols
                )));
            }
            if symmetric && j > i {
                return Err(BlrError::invalid(format!(
                    "symmetric format stores only the lower triangle, got block ({}, {})",
                    i, j
                )));
            }
            if !seen.insert((i, j)) {
                return Err(BlrError::invalid(format!(
                    "block ({}, {}) is listed more than once",
                    i, j
                )));
            }
        }

        let row_far = BlockIndex::build(nbrows, &far, |&(i, j)| (i, j));
        let col_far = BlockIndex::build(nbcols, &far, |&(i, j)| (j, i));
        let row_near = BlockIndex::build(nbrows, &near, |&(i, j)| (i, j));
        let col_near = BlockIndex::build(nbcols, &near, |&(i, j)| (j, i));

        Ok(Self {
            problem,
            row_cluster,
            col_cluster,
            symmetric,
            far,
            near,
            row_far,
            col_far,
            row_near,
            col_near,
            kind,
        })
    }

    /// Tiled format with the diagonal rule: diagonal blocks are near-field,
    /// every other block is far-field.
    pub fn tiled(
        problem: Arc<dyn BlockSource>,
        row_cluster: Arc<Cluster>,
        col_cluster: Arc<Cluster>,
        symmetric: bool,
    ) -> Result<Self> {
        Self::tiled_with(problem, row_cluster, col_cluster, symmetric, &Diagonal)
    }

    /// Tiled format classifying every block of the grid with `admissibility`.
    pub fn tiled_with(
        problem: Arc<dyn BlockSource>,
        row_cluster: Arc<Cluster>,
        col_cluster: Arc<Cluster>,
        symmetric: bool,
        admissibility: &dyn Admissibility,
    ) -> Result<Self> {
        if row_cluster.kind() != ClusterKind::Tiled || col_cluster.kind() != ClusterKind::Tiled {
            return Err(BlrError::invalid("tiled format requires tiled clusters"));
        }

        let mut far = Vec::new();
        let mut near = Vec::new();
        for i in 0..row_cluster.nblocks() {
            let ncols = if symmetric { i + 1 } else { col_cluster.nblocks() };
            for j in 0..ncols {
                if admissibility.is_admissible(&row_cluster, i, &col_cluster, j) {
                    far.push((i, j));
                } else {
                    near.push((i, j));
                }
            }
        }

        Self::new(problem, row_cluster, col_cluster, symmetric, far, near, FormatKind::Tiled)
    }

    /// Hierarchical format from a dual traversal of the two cluster trees.
    ///
    /// Starting from every pair of roots, an admissible pair becomes a far
    /// block, an inadmissible pair of leaves becomes a near block, and any
    /// other pair is replaced by the pairs of its children (only the
    /// non-leaf side is split). The result covers the matrix without overlaps.
    pub fn hierarchical(
        problem: Arc<dyn BlockSource>,
        row_cluster: Arc<Cluster>,
        col_cluster: Arc<Cluster>,
        symmetric: bool,
        admissibility: &dyn Admissibility,
    ) -> Result<Self> {
        let mut far = Vec::new();
        let mut near = Vec::new();

        // Symmetric formats keep the lower triangle: (max, min) of each pair.
        let canonical = |i: usize, j: usize| {
            if symmetric && j > i { (j, i) } else { (i, j) }
        };

        let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
        for &r in &row_cluster.roots() {
            for &c in &col_cluster.roots() {
                if !symmetric || c <= r {
                    queue.push_back((r, c));
                }
            }
        }

        while let Some((i, j)) = queue.pop_front() {
            if admissibility.is_admissible(&row_cluster, i, &col_cluster, j) {
                far.push(canonical(i, j));
                continue;
            }

            let row_children = row_cluster.children(i);
            let col_children = col_cluster.children(j);

            match (row_children.is_empty(), col_children.is_empty()) {
                (true, true) => near.push(canonical(i, j)),
                (false, true) => queue.extend(row_children.iter().map(|&a| (a, j))),
                (true, false) => queue.extend(col_children.iter().map(|&b| (i, b))),
                (false, false) => {
                    for &a in row_children {
                        for &b in col_children {
                            // Diagonal pairs of a symmetric format: lower triangle only
                            if symmetric && i == j && b > a {
                                continue;
                            }
                            queue.push_back((a, b));
                        }
                    }
                }
            }
        }

        log::debug!(
            "hierarchical format: {} far-field and {} near-field blocks",
            far.len(),
            near.len()
        );

        Self::new(
            problem,
            row_cluster,
            col_cluster,
            symmetric,
            far,
            near,
            FormatKind::Hierarchical,
        )
    }

    /// Builds a new format sharing the problem and clusters of `self`, with
    /// new far and near block lists. `self` is left unchanged.
    pub fn replace_after_reclassification(
        &self,
        far: Vec<(usize, usize)>,
        near: Vec<(usize, usize)>,
    ) -> Result<Self> {
        Self::new(
            self.problem.clone(),
            self.row_cluster.clone(),
            self.col_cluster.clone(),
            self.symmetric,
            far,
            near,
            self.kind,
        )
    }

    pub fn problem(&self) -> &Arc<dyn BlockSource> {
        &self.problem
    }

    pub fn row_cluster(&self) -> &Arc<Cluster> {
        &self.row_cluster
    }

    pub fn col_cluster(&self) -> &Arc<Cluster> {
        &self.col_cluster
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn kind(&self) -> FormatKind {
        self.kind
    }

    /// Number of block rows.
    pub fn nbrows(&self) -> usize {
        self.row_cluster.nblocks()
    }

    /// Number of block columns.
    pub fn nbcols(&self) -> usize {
        self.col_cluster.nblocks()
    }

    pub fn nrows(&self) -> usize {
        self.row_cluster.ndata()
    }

    pub fn ncols(&self) -> usize {
        self.col_cluster.ndata()
    }

    pub fn far(&self) -> &[(usize, usize)] {
        &self.far
    }

    pub fn near(&self) -> &[(usize, usize)] {
        &self.near
    }

    pub fn nblocks_far(&self) -> usize {
        self.far.len()
    }

    pub fn nblocks_near(&self) -> usize {
        self.near.len()
    }

    /// Positions (in [`far`](Self::far)) of the far blocks of block row `i`.
    pub fn row_far_blocks(&self, i: usize) -> &[usize] {
        self.row_far.get(i)
    }

    /// Positions (in [`far`](Self::far)) of the far blocks of block column `j`.
    pub fn col_far_blocks(&self, j: usize) -> &[usize] {
        self.col_far.get(j)
    }

    /// Positions (in [`near`](Self::near)) of the near blocks of block row `i`.
    pub fn row_near_blocks(&self, i: usize) -> &[usize] {
        self.row_near.get(i)
    }

    /// Positions (in [`near`](Self::near)) of the near blocks of block column `j`.
    pub fn col_near_blocks(&self, j: usize) -> &[usize] {
        self.col_near.get(j)
    }

    pub fn block_shape(&self, i: usize, j: usize) -> (usize, usize) {
        (self.row_cluster.block_size(i), self.col_cluster.block_size(j))
    }

    /// Original row and column indices of block `(i, j)`.
    pub fn block_indices(&self, i: usize, j: usize) -> (&[usize], &[usize]) {
        (
            self.row_cluster.block_indices(i),
            self.col_cluster.block_indices(j),
        )
    }

    /// Evaluates block `(i, j)` with the problem kernel.
    pub fn get_block(&self, i: usize, j: usize) -> Result<Mat<f64>> {
        if i >= self.nbrows() || j >= self.nbcols() {
            return Err(BlrError::invalid(format!(
                "block ({}, {}) is outside the {}x{} block grid",
                i,
                j,
                self.nbrows(),
                self.nbcols()
            )));
        }
        let (rows, cols) = self.block_indices(i, j);
        self.problem.block(rows, cols)
    }
}

impl fmt::Debug for BlockFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFormat")
            .field("problem", &self.problem.name())
            .field("kind", &self.kind)
            .field("symmetric", &self.symmetric)
            .field("nbrows", &self.nbrows())
            .field("nbcols", &self.nbcols())
            .field("far", &self.far.len())
            .field("near", &self.near.len())
            .finish()
    }
}

impl fmt::Display for BlockFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<BlockFormat {:?} of \"{}\": {}x{} blocks, {}, {} far-field, {} near-field>",
            self.kind,
            self.problem.name(),
            self.nbrows(),
            self.nbcols(),
            if self.symmetric { "symmetric" } else { "non-symmetric" },
            self.far.len(),
            self.near.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admissibility::DistanceDiameter,
        cluster::MedianSplit,
        problem::Problem,
        traits::KernelFunction,
    };
    use faer::RowRef;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Exponential;

    impl KernelFunction for Exponential {
        fn evaluate(&self, target: RowRef<f64>, source: RowRef<f64>) -> f64 {
            let distance: f64 = (0..target.ncols())
                .map(|d| (target[d] - source[d]).powi(2))
                .sum::<f64>()
                .sqrt();
            (-distance).exp()
        }
    }

    fn point_problem(n: usize, dim: usize, seed: u64) -> (Arc<Mat<f64>>, Arc<dyn BlockSource>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let points = Arc::new(Mat::from_fn(n, dim, |_, _| rng.random_range(0.0..1.0)));
        let problem =
            Problem::from_points(points.clone(), points.clone(), Exponential, true, "exp").unwrap();
        (points, Arc::new(problem))
    }

    /// Checks disjointness and that the CSR indices reproduce the flat lists.
    fn assert_consistent(format: &BlockFormat) {
        let far: HashSet<_> = format.far().iter().collect();
        assert!(format.near().iter().all(|b| !far.contains(b)));

        for (list, by_row, by_col) in [
            (
                format.far(),
                (0..format.nbrows()).map(|i| format.row_far_blocks(i)).collect::<Vec<_>>(),
                (0..format.nbcols()).map(|j| format.col_far_blocks(j)).collect::<Vec<_>>(),
            ),
            (
                format.near(),
                (0..format.nbrows()).map(|i| format.row_near_blocks(i)).collect(),
                (0..format.nbcols()).map(|j| format.col_near_blocks(j)).collect(),
            ),
        ] {
            let mut from_rows = Vec::new();
            for (i, positions) in by_row.iter().enumerate() {
                let partners: Vec<usize> = positions.iter().map(|&p| list[p].1).collect();
                assert!(partners.windows(2).all(|w| w[0] <= w[1]));
                for &p in positions.iter() {
                    assert_eq!(list[p].0, i);
                    from_rows.push(p);
                }
            }
            from_rows.sort_unstable();
            assert_eq!(from_rows, (0..list.len()).collect::<Vec<_>>());

            let mut from_cols = Vec::new();
            for (j, positions) in by_col.iter().enumerate() {
                for &p in positions.iter() {
                    assert_eq!(list[p].1, j);
                    from_cols.push(p);
                }
            }
            from_cols.sort_unstable();
            assert_eq!(from_cols, (0..list.len()).collect::<Vec<_>>());
        }
    }

    /// Counts how many times each matrix entry is covered, mirrors included.
    fn coverage(format: &BlockFormat) -> Vec<usize> {
        let (m, n) = (format.nrows(), format.ncols());
        let mut count = vec![0usize; m * n];
        for &(i, j) in format.far().iter().chain(format.near()) {
            let (rows, cols) = format.block_indices(i, j);
            for &r in rows {
                for &c in cols {
                    count[r + c * m] += 1;
                    if format.is_symmetric() && i != j {
                        count[c + r * m] += 1;
                    }
                }
            }
        }
        count
    }

    #[test]
    fn tiled_format_classifies_every_block() {
        let (_, problem) = point_problem(23, 2, 1);
        let cluster = Arc::new(Cluster::tiled(23, 5).unwrap());

        let format =
            BlockFormat::tiled(problem.clone(), cluster.clone(), cluster.clone(), false).unwrap();
        assert_eq!(format.nblocks_near(), 5);
        assert_eq!(format.nblocks_far(), 20);
        assert_consistent(&format);
        assert!(coverage(&format).iter().all(|&c| c == 1));

        let symmetric = BlockFormat::tiled(problem, cluster.clone(), cluster, true).unwrap();
        assert_eq!(symmetric.nblocks_near(), 5);
        assert_eq!(symmetric.nblocks_far(), 10);
        assert!(symmetric.far().iter().all(|&(i, j)| j < i));
        assert_consistent(&symmetric);
        assert!(coverage(&symmetric).iter().all(|&c| c == 1));
    }

    #[test]
    fn new_rejects_invalid_block_lists() {
        let (_, problem) = point_problem(10, 2, 2);
        let cluster = Arc::new(Cluster::tiled(10, 5).unwrap());
        let build = |far: Vec<(usize, usize)>, near: Vec<(usize, usize)>, symmetric| {
            BlockFormat::new(
                problem.clone(),
                cluster.clone(),
                cluster.clone(),
                symmetric,
                far,
                near,
                FormatKind::Tiled,
            )
        };

        assert!(build(vec![(0, 1)], vec![(0, 1)], false).is_err());
        assert!(build(vec![(2, 0)], vec![], false).is_err());
        assert!(build(vec![(1, 0), (1, 0)], vec![], false).is_err());
        assert!(build(vec![(0, 1)], vec![], true).is_err());
        assert!(build(vec![(1, 0)], vec![(0, 0), (1, 1)], true).is_ok());
    }

    #[test]
    fn symmetric_format_needs_shared_cluster() {
        let (_, problem) = point_problem(10, 2, 3);
        let rows = Arc::new(Cluster::tiled(10, 5).unwrap());
        let cols = Arc::new(Cluster::tiled(10, 5).unwrap());
        assert!(BlockFormat::tiled(problem, rows, cols, true).is_err());
    }

    #[test]
    fn csr_lists_follow_partner_order() {
        let (_, problem) = point_problem(12, 1, 4);
        let cluster = Arc::new(Cluster::tiled(12, 4).unwrap());
        let format = BlockFormat::new(
            problem,
            cluster.clone(),
            cluster,
            false,
            vec![(0, 2), (2, 1), (0, 1), (1, 0)],
            vec![(0, 0), (1, 1), (2, 2)],
            FormatKind::Tiled,
        )
        .unwrap();

        assert_eq!(format.row_far_blocks(0), &[2, 0]);
        assert_eq!(format.col_far_blocks(1), &[2, 1]);
        assert_eq!(format.row_far_blocks(1), &[3]);
        assert_eq!(format.row_near_blocks(2), &[2]);
        assert_consistent(&format);
    }

    #[test]
    fn hierarchical_format_covers_matrix_once() {
        let (points, problem) = point_problem(300, 2, 5);
        let cluster =
            Arc::new(Cluster::hierarchical((*points).as_ref(), 20, &MedianSplit).unwrap());

        for symmetric in [false, true] {
            let format = BlockFormat::hierarchical(
                problem.clone(),
                cluster.clone(),
                cluster.clone(),
                symmetric,
                &DistanceDiameter::default(),
            )
            .unwrap();

            assert_eq!(format.kind(), FormatKind::Hierarchical);
            assert!(format.nblocks_far() > 0);
            assert_consistent(&format);
            assert!(coverage(&format).iter().all(|&c| c == 1));

            for &(i, j) in format.near() {
                assert!(cluster.is_leaf(i) && cluster.is_leaf(j));
            }
        }
    }

    #[test]
    fn reclassification_builds_a_new_format() {
        let (_, problem) = point_problem(20, 2, 6);
        let cluster = Arc::new(Cluster::tiled(20, 5).unwrap());
        let format = BlockFormat::tiled(problem, cluster.clone(), cluster, false).unwrap();

        let mut near = format.near().to_vec();
        near.push(format.far()[0]);
        let far = format.far()[1..].to_vec();

        let replaced = format.replace_after_reclassification(far, near).unwrap();
        assert_eq!(replaced.nblocks_far(), format.nblocks_far() - 1);
        assert_eq!(replaced.nblocks_near(), format.nblocks_near() + 1);
        assert!(Arc::ptr_eq(replaced.row_cluster(), format.row_cluster()));
        assert_eq!(format.nblocks_far(), 12);
        assert_consistent(&replaced);
    }

    #[test]
    fn get_block_evaluates_kernel() {
        let (points, problem) = point_problem(10, 2, 7);
        let cluster = Arc::new(Cluster::tiled(10, 4).unwrap());
        let format = BlockFormat::tiled(problem, cluster.clone(), cluster, false).unwrap();

        let block = format.get_block(2, 0).unwrap();
        assert_eq!(block.shape(), (2, 4));
        let expected = Exponential.evaluate(points.row(8), points.row(3));
        assert!((block[(0, 3)] - expected).abs() < 1e-15);
        assert!(format.get_block(3, 0).is_err());
    }
}
