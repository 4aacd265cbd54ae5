/////////////////////////////////////////////////////////////////////////////////////////////
//
// Defines admissibility rules classifying block pairs as far-field or near-field.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use crate::{cluster::Cluster, utils};

/// Decides whether the interaction between a row block and a column block
/// is compressible (far-field).
///
/// Implementations must be symmetric under swapping the two blocks when used
/// with symmetric formats.
pub trait Admissibility: Send + Sync {
    fn is_admissible(
        &self,
        row_cluster: &Cluster,
        row_block: usize,
        col_cluster: &Cluster,
        col_block: usize,
    ) -> bool;
}

/// Structural rule of the tiled baseline: every off-diagonal block is far-field.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagonal;

impl Admissibility for Diagonal {
    fn is_admissible(&self, _: &Cluster, row_block: usize, _: &Cluster, col_block: usize) -> bool {
        row_block != col_block
    }
}

/// Geometric rule `min(diam(r), diam(c)) <= eta * dist(r, c)` on the
/// bounding boxes of the two blocks.
///
/// Blocks without attached geometry, or whose boxes touch, are never admissible.
#[derive(Debug, Clone, Copy)]
pub struct DistanceDiameter {
    pub eta: f64,
}

impl DistanceDiameter {
    pub fn new(eta: f64) -> Self {
        Self { eta }
    }
}

impl Default for DistanceDiameter {
    fn default() -> Self {
        Self { eta: 1.0 }
    }
}

impl Admissibility for DistanceDiameter {
    fn is_admissible(
        &self,
        row_cluster: &Cluster,
        row_block: usize,
        col_cluster: &Cluster,
        col_block: usize,
    ) -> bool {
        let (Some(row_box), Some(col_box)) = (
            row_cluster.extents(row_block),
            col_cluster.extents(col_block),
        ) else {
            return false;
        };
        if row_box.len() != col_box.len() {
            return false;
        }

        let distance = utils::extents_distance(row_box, col_box);
        if distance <= 0.0 {
            return false;
        }

        let diameter = utils::extents_diameter(row_box).min(utils::extents_diameter(col_box));
        diameter <= self.eta * distance
    }
}
