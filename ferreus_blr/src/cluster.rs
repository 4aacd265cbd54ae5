/////////////////////////////////////////////////////////////////////////////////////////////
//
// Partitions discrete elements into tiled or hierarchical clusters of index ranges.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # cluster
//!
//! A [`Cluster`] splits `ndata` discrete elements (particles, grid nodes,
//! mesh elements...) into blocks. Elements of a block are contiguous in the
//! `pivot` permutation, so a block is fully described by a start offset and
//! a size.
//!
//! Two kinds of clusterisation are supported:
//! - **Tiled**: a single level of contiguous blocks with an identity pivot.
//! - **Hierarchical**: a binary tree built by recursive bisection of point
//!   coordinates. Blocks are numbered breadth first, so the blocks of level
//!   `l` are `level_start[l]..level_start[l + 1]` and children of a block
//!   cover exactly the index range of their parent.

use crate::{
    error::{BlrError, Result},
    utils,
};
use faer::{Mat, MatRef};
use std::fmt;
use std::ops::Range;

/// Type of clusterisation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClusterKind {
    Tiled,
    Hierarchical,
}

/// Strategy used to bisect the points of a block when building a
/// hierarchical cluster.
pub trait SplitPolicy: Send + Sync {
    /// Reorders `indices` (rows of `points`) in place and returns the number
    /// of indices that belong to the first half. Returning `0` or
    /// `indices.len()` stops the recursion for this block.
    fn split(&self, points: MatRef<f64>, indices: &mut [usize]) -> usize;
}

/// Median split along the longest axis of the bounding box of the block.
#[derive(Debug, Clone, Copy, Default)]
pub struct MedianSplit;

impl SplitPolicy for MedianSplit {
    fn split(&self, points: MatRef<f64>, indices: &mut [usize]) -> usize {
        let dimensions = points.ncols();
        let extents = utils::get_pointarray_extents(points, indices);
        if extents.is_empty() {
            return 0;
        }

        let axis_lengths: Vec<f64> = (0..dimensions)
            .map(|idx| extents[idx + dimensions] - extents[idx])
            .collect();

        // Split by the longest axis relative to the points within the block.
        let split_axis = utils::argmax(&axis_lengths);
        let coordinates: Vec<f64> = indices.iter().map(|&i| points[(i, split_axis)]).collect();

        reorder_by_key(indices, &coordinates)
    }
}

/// Median split along the first principal axis of the points of the block.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalAxisSplit;

impl SplitPolicy for PrincipalAxisSplit {
    fn split(&self, points: MatRef<f64>, indices: &mut [usize]) -> usize {
        let n = indices.len();
        let dimensions = points.ncols();
        if n < 2 || dimensions == 0 {
            return 0;
        }

        let mut centroid = vec![0.0; dimensions];
        for &i in indices.iter() {
            for (d, c) in centroid.iter_mut().enumerate() {
                *c += points[(i, d)];
            }
        }
        centroid.iter_mut().for_each(|c| *c /= n as f64);

        let centred = Mat::from_fn(n, dimensions, |r, d| points[(indices[r], d)] - centroid[d]);

        let Ok(svd) = centred.thin_svd() else {
            return MedianSplit.split(points, indices);
        };
        let axis = svd.V().col(0);

        let projections: Vec<f64> = (0..n)
            .map(|r| (0..dimensions).map(|d| centred[(r, d)] * axis[d]).sum())
            .collect();

        reorder_by_key(indices, &projections)
    }
}

/// Sorts `indices` by `keys` and returns the median position.
fn reorder_by_key(indices: &mut [usize], keys: &[f64]) -> usize {
    let order = utils::argsort(keys);
    let sorted: Vec<usize> = order.iter().map(|&k| indices[k]).collect();
    indices.copy_from_slice(&sorted);
    indices.len() / 2
}

/// Clusterisation of discrete elements into blocks.
#[derive(Debug, Clone)]
pub struct Cluster {
    ndata: usize,
    pivot: Vec<usize>,
    nlevels: usize,
    level_start: Option<Vec<usize>>,
    block_start: Vec<usize>,
    block_size: Vec<usize>,
    parent: Vec<Option<usize>>,
    child_start: Option<Vec<usize>>,
    child_index: Option<Vec<usize>>,
    kind: ClusterKind,
    extents: Option<Vec<Vec<f64>>>,
}

impl Cluster {
    /// Creates a cluster from explicit arrays, validating every invariant.
    ///
    /// For [`ClusterKind::Tiled`] the blocks must be listed in pivot order and
    /// cover `[0, ndata)` without gaps or overlaps; `level_start`,
    /// `child_start` and `child_index` must be `None`. For
    /// [`ClusterKind::Hierarchical`] all three must be present and the
    /// children of each block must partition its range.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ndata: usize,
        pivot: Vec<usize>,
        block_start: Vec<usize>,
        block_size: Vec<usize>,
        parent: Vec<Option<usize>>,
        level_start: Option<Vec<usize>>,
        child_start: Option<Vec<usize>>,
        child_index: Option<Vec<usize>>,
        kind: ClusterKind,
    ) -> Result<Self> {
        if ndata == 0 {
            return Err(BlrError::invalid("cluster needs at least one element"));
        }
        if pivot.len() != ndata {
            return Err(BlrError::invalid(format!(
                "pivot has {} entries, expected {}",
                pivot.len(),
                ndata
            )));
        }
        let mut seen = vec![false; ndata];
        for &p in &pivot {
            if p >= ndata || seen[p] {
                return Err(BlrError::invalid("pivot is not a permutation"));
            }
            seen[p] = true;
        }

        let nblocks = block_start.len();
        if nblocks == 0 || block_size.len() != nblocks || parent.len() != nblocks {
            return Err(BlrError::invalid(
                "block_start, block_size and parent must have the same non-zero length",
            ));
        }
        for b in 0..nblocks {
            if block_size[b] == 0 || block_start[b] + block_size[b] > ndata {
                return Err(BlrError::invalid(format!(
                    "block {} range [{}, {}) is empty or exceeds {} elements",
                    b,
                    block_start[b],
                    block_start[b] + block_size[b],
                    ndata
                )));
            }
            if parent[b].is_some_and(|p| p >= nblocks) {
                return Err(BlrError::invalid(format!("block {} has invalid parent", b)));
            }
        }

        let nlevels = match kind {
            ClusterKind::Tiled => {
                if level_start.is_some() || child_start.is_some() || child_index.is_some() {
                    return Err(BlrError::invalid("tiled cluster cannot have a hierarchy"));
                }
                let mut next = 0;
                for b in 0..nblocks {
                    if block_start[b] != next || parent[b].is_some() {
                        return Err(BlrError::invalid(
                            "tiled blocks must partition the pivot contiguously",
                        ));
                    }
                    next += block_size[b];
                }
                if next != ndata {
                    return Err(BlrError::invalid("tiled blocks do not cover every element"));
                }
                0
            }
            ClusterKind::Hierarchical => {
                let (Some(levels), Some(starts), Some(children)) =
                    (&level_start, &child_start, &child_index)
                else {
                    return Err(BlrError::invalid(
                        "hierarchical cluster needs level_start, child_start and child_index",
                    ));
                };
                if levels.len() < 2
                    || levels[0] != 0
                    || levels[levels.len() - 1] != nblocks
                    || levels.windows(2).any(|w| w[0] >= w[1])
                {
                    return Err(BlrError::invalid("level_start is malformed"));
                }
                if starts.len() != nblocks + 1
                    || starts[0] != 0
                    || starts[nblocks] != children.len()
                    || starts.windows(2).any(|w| w[0] > w[1])
                {
                    return Err(BlrError::invalid("child_start is malformed"));
                }
                for b in 0..nblocks {
                    let kids = &children[starts[b]..starts[b + 1]];
                    if kids.is_empty() {
                        continue;
                    }
                    let mut next = block_start[b];
                    for &c in kids {
                        if c >= nblocks || parent[c] != Some(b) || block_start[c] != next {
                            return Err(BlrError::invalid(format!(
                                "children of block {} do not partition its range",
                                b
                            )));
                        }
                        next += block_size[c];
                    }
                    if next != block_start[b] + block_size[b] {
                        return Err(BlrError::invalid(format!(
                            "children of block {} do not cover its range",
                            b
                        )));
                    }
                }
                levels.len() - 1
            }
        };

        Ok(Self {
            ndata,
            pivot,
            nlevels,
            level_start,
            block_start,
            block_size,
            parent,
            child_start,
            child_index,
            kind,
            extents: None,
        })
    }

    /// Splits `[0, ndata)` into contiguous blocks of `block_size` elements,
    /// the last one possibly smaller, with an identity pivot.
    pub fn tiled(ndata: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(BlrError::invalid("block size must be positive"));
        }
        if ndata == 0 {
            return Err(BlrError::invalid("cluster needs at least one element"));
        }
        let nblocks = ndata.div_ceil(block_size);
        let block_start: Vec<usize> = (0..nblocks).map(|b| b * block_size).collect();
        let block_sizes: Vec<usize> = block_start
            .iter()
            .map(|&start| block_size.min(ndata - start))
            .collect();

        Self::new(
            ndata,
            (0..ndata).collect(),
            block_start,
            block_sizes,
            vec![None; nblocks],
            None,
            None,
            None,
            ClusterKind::Tiled,
        )
    }

    /// Builds a binary cluster tree over the rows of `points` by recursive
    /// bisection until blocks hold at most `leaf_size` elements.
    ///
    /// Blocks are numbered breadth first; the bounding box of every block is
    /// recorded for geometric admissibility checks.
    pub fn hierarchical(
        points: MatRef<f64>,
        leaf_size: usize,
        policy: &dyn SplitPolicy,
    ) -> Result<Self> {
        let ndata = points.nrows();
        if leaf_size == 0 {
            return Err(BlrError::invalid("leaf size must be positive"));
        }
        if ndata == 0 {
            return Err(BlrError::invalid("cluster needs at least one element"));
        }

        let mut pivot: Vec<usize> = (0..ndata).collect();
        let mut block_start = vec![0usize];
        let mut block_size = vec![ndata];
        let mut parent: Vec<Option<usize>> = vec![None];
        let mut children: Vec<Vec<usize>> = vec![Vec::new()];
        let mut level_start = vec![0usize];

        let mut current_level = vec![0usize];

        while !current_level.is_empty() {
            let mut next_level = Vec::new();

            for &block in &current_level {
                let (start, size) = (block_start[block], block_size[block]);
                if size <= leaf_size {
                    continue;
                }

                let split = policy.split(points, &mut pivot[start..start + size]);
                if split == 0 || split >= size {
                    continue;
                }

                for (child_start, child_size) in [(start, split), (start + split, size - split)] {
                    let id = block_start.len();
                    block_start.push(child_start);
                    block_size.push(child_size);
                    parent.push(Some(block));
                    children.push(Vec::new());
                    children[block].push(id);
                    next_level.push(id);
                }
            }

            if let Some(&first) = next_level.first() {
                level_start.push(first);
            }
            current_level = next_level;
        }

        let nblocks = block_start.len();
        level_start.push(nblocks);

        let mut child_start = Vec::with_capacity(nblocks + 1);
        let mut child_index = Vec::new();
        child_start.push(0);
        for kids in &children {
            child_index.extend_from_slice(kids);
            child_start.push(child_index.len());
        }

        let cluster = Self::new(
            ndata,
            pivot,
            block_start,
            block_size,
            parent,
            Some(level_start),
            Some(child_start),
            Some(child_index),
            ClusterKind::Hierarchical,
        )?;

        cluster.with_geometry(points)
    }

    /// Records the bounding box of every block, computed from `points`.
    pub fn with_geometry(mut self, points: MatRef<f64>) -> Result<Self> {
        if points.nrows() != self.ndata {
            return Err(BlrError::invalid(format!(
                "cluster has {} elements but {} points were given",
                self.ndata,
                points.nrows()
            )));
        }
        let extents = (0..self.nblocks())
            .map(|b| utils::get_pointarray_extents(points, self.block_indices(b)))
            .collect();
        self.extents = Some(extents);
        Ok(self)
    }

    pub fn ndata(&self) -> usize {
        self.ndata
    }

    pub fn nblocks(&self) -> usize {
        self.block_start.len()
    }

    /// Number of levels of the hierarchy, `0` for tiled clusters.
    pub fn nlevels(&self) -> usize {
        self.nlevels
    }

    pub fn kind(&self) -> ClusterKind {
        self.kind
    }

    pub fn pivot(&self) -> &[usize] {
        &self.pivot
    }

    pub fn block_start(&self, block: usize) -> usize {
        self.block_start[block]
    }

    pub fn block_size(&self, block: usize) -> usize {
        self.block_size[block]
    }

    pub fn block_sizes(&self) -> &[usize] {
        &self.block_size
    }

    pub fn parent(&self, block: usize) -> Option<usize> {
        self.parent[block]
    }

    /// Original element indices of a block.
    pub fn block_indices(&self, block: usize) -> &[usize] {
        let start = self.block_start[block];
        &self.pivot[start..start + self.block_size[block]]
    }

    pub fn children(&self, block: usize) -> &[usize] {
        match (&self.child_start, &self.child_index) {
            (Some(starts), Some(children)) => &children[starts[block]..starts[block + 1]],
            _ => &[],
        }
    }

    pub fn is_leaf(&self, block: usize) -> bool {
        self.children(block).is_empty()
    }

    /// Blocks without children. For tiled clusters, every block.
    pub fn leaves(&self) -> Vec<usize> {
        (0..self.nblocks()).filter(|&b| self.is_leaf(b)).collect()
    }

    /// Root blocks: the single root of a hierarchy, or every tiled block.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.nblocks()).filter(|&b| self.parent[b].is_none()).collect()
    }

    /// Blocks on a given level of the hierarchy. For tiled clusters, level
    /// `0` holds every block.
    pub fn level_blocks(&self, level: usize) -> Range<usize> {
        match &self.level_start {
            Some(levels) if level + 1 < levels.len() => levels[level]..levels[level + 1],
            Some(_) => 0..0,
            None if level == 0 => 0..self.nblocks(),
            None => 0..0,
        }
    }

    /// Bounding box `[mins..., maxs...]` of a block, if geometry is attached.
    pub fn extents(&self, block: usize) -> Option<&[f64]> {
        self.extents.as_ref().map(|e| e[block].as_slice())
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Cluster {:?}: {} elements, {} blocks, {} levels>",
            self.kind,
            self.ndata,
            self.nblocks(),
            self.nlevels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(n: usize, dim: usize, seed: u64) -> Mat<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Mat::from_fn(n, dim, |_, _| rng.random_range(0.0..1.0))
    }

    #[test]
    fn tiled_clusters_partition_the_elements() {
        for (ndata, block) in [(100, 10), (101, 10), (7, 3), (5, 8), (1, 1)] {
            let cluster = Cluster::tiled(ndata, block).unwrap();

            assert_eq!(cluster.nblocks(), ndata.div_ceil(block));
            assert_eq!(cluster.block_sizes().iter().sum::<usize>(), ndata);
            assert_eq!(cluster.nlevels(), 0);

            let mut covered = vec![0; ndata];
            for b in 0..cluster.nblocks() {
                for &i in cluster.block_indices(b) {
                    covered[i] += 1;
                }
            }
            assert!(covered.iter().all(|&c| c == 1));
        }
    }

    #[test]
    fn tiled_cluster_rejects_zero_block_size() {
        assert!(matches!(
            Cluster::tiled(10, 0),
            Err(BlrError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn new_rejects_non_permutation_pivot() {
        let result = Cluster::new(
            3,
            vec![0, 0, 2],
            vec![0],
            vec![3],
            vec![None],
            None,
            None,
            None,
            ClusterKind::Tiled,
        );
        assert!(result.is_err());
    }

    #[test]
    fn hierarchical_children_partition_parents() {
        let points = random_points(500, 3, 7);

        for policy in [&MedianSplit as &dyn SplitPolicy, &PrincipalAxisSplit] {
            let cluster = Cluster::hierarchical(points.as_ref(), 32, policy).unwrap();

            assert_eq!(cluster.kind(), ClusterKind::Hierarchical);
            assert_eq!(cluster.roots(), vec![0]);
            assert_eq!(cluster.block_size(0), 500);

            for b in 0..cluster.nblocks() {
                let kids = cluster.children(b);
                if kids.is_empty() {
                    assert!(cluster.block_size(b) <= 32);
                    continue;
                }
                let covered: usize = kids.iter().map(|&c| cluster.block_size(c)).sum();
                assert_eq!(covered, cluster.block_size(b));
                for &c in kids {
                    assert_eq!(cluster.parent(c), Some(b));
                }
            }

            let leaf_total: usize = cluster
                .leaves()
                .iter()
                .map(|&l| cluster.block_size(l))
                .sum();
            assert_eq!(leaf_total, 500);
        }
    }

    #[test]
    fn hierarchical_levels_are_breadth_first() {
        let points = random_points(64, 2, 11);
        let cluster = Cluster::hierarchical(points.as_ref(), 8, &MedianSplit).unwrap();

        // 64 -> 32 -> 16 -> 8: four levels of a perfect binary tree.
        assert_eq!(cluster.nlevels(), 4);
        assert_eq!(cluster.level_blocks(0), 0..1);
        assert_eq!(cluster.level_blocks(1), 1..3);
        assert_eq!(cluster.level_blocks(3), 7..15);
        assert_eq!(cluster.leaves().len(), 8);
    }

    #[test]
    fn median_split_separates_along_longest_axis() {
        // Points spread along x only.
        let points = Mat::from_fn(10, 2, |i, j| if j == 0 { (9 - i) as f64 } else { 0.5 });
        let cluster = Cluster::hierarchical(points.as_ref(), 5, &MedianSplit).unwrap();

        let left = cluster.extents(1).unwrap();
        let right = cluster.extents(2).unwrap();
        assert!(left[2] < right[0]);
        assert_eq!(cluster.block_indices(1).len(), 5);
    }

    #[test]
    fn geometry_must_match_element_count() {
        let cluster = Cluster::tiled(10, 5).unwrap();
        let points = random_points(9, 2, 1);
        assert!(cluster.with_geometry(points.as_ref()).is_err());
    }
}
