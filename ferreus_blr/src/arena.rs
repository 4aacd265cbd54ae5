/////////////////////////////////////////////////////////////////////////////////////////////
//
// Packs factor and dense block arrays into contiguous shared arenas.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use crate::{
    array::NdArray,
    config::AllocationMode,
    error::{Result, try_zeroed},
};
use std::sync::Arc;

/// A contiguous buffer holding the data of many arrays.
///
/// Arrays packed into an arena are read-only views that keep the arena
/// alive through a shared reference count.
#[derive(Debug, Clone)]
pub struct Arena {
    buffer: Arc<[f64]>,
}

impl Arena {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn nbytes(&self) -> usize {
        self.buffer.len() * std::mem::size_of::<f64>()
    }

    /// Copies `arrays` back to back into a new arena and returns views of the
    /// copies, in the same order and with the same shapes and memory orders.
    pub fn pack(arrays: Vec<NdArray<f64>>) -> Result<(Self, Vec<NdArray<f64>>)> {
        let total: usize = arrays.iter().map(|a| a.len()).sum();

        let mut data = try_zeroed::<f64>(total)?;
        let mut offset = 0;
        for array in &arrays {
            data[offset..offset + array.len()].copy_from_slice(array.as_slice());
            offset += array.len();
        }

        let buffer: Arc<[f64]> = Arc::from(data);

        let mut views = Vec::with_capacity(arrays.len());
        let mut offset = 0;
        for array in &arrays {
            views.push(NdArray::shared(
                buffer.clone(),
                offset,
                array.shape(),
                array.order(),
            )?);
            offset += array.len();
        }

        Ok((Self { buffer }, views))
    }
}

/// Lays out a group of arrays according to `mode`.
///
/// [`AllocationMode::Separate`] keeps each array in its own buffer, while
/// [`AllocationMode::Consolidated`] moves a non-empty group into a single
/// [`Arena`].
pub(crate) fn store(
    mode: AllocationMode,
    arrays: Vec<NdArray<f64>>,
) -> Result<(Option<Arena>, Vec<NdArray<f64>>)> {
    match mode {
        AllocationMode::Separate => Ok((None, arrays)),
        AllocationMode::Consolidated if arrays.is_empty() => Ok((None, arrays)),
        AllocationMode::Consolidated => {
            let (arena, views) = Arena::pack(arrays)?;
            Ok((Some(arena), views))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Order;

    #[test]
    fn packed_views_match_originals() {
        let a = NdArray::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], Order::ColMajor).unwrap();
        let b = NdArray::from_vec(vec![5.0, 6.0, 7.0], &[3, 1], Order::RowMajor).unwrap();
        let empty = NdArray::<f64>::zeros(&[4, 0], Order::ColMajor).unwrap();

        let (arena, views) =
            Arena::pack(vec![a.clone(), empty.clone(), b.clone()]).unwrap();

        assert_eq!(arena.len(), 7);
        assert_eq!(arena.nbytes(), 56);
        assert_eq!(views.len(), 3);
        for (view, original) in views.iter().zip([&a, &empty, &b]) {
            assert!(!view.is_owned());
            assert_eq!(view.shape(), original.shape());
            assert_eq!(view.order(), original.order());
            assert_eq!(view.as_slice(), original.as_slice());
        }
    }

    #[test]
    fn views_outlive_the_arena_handle() {
        let a = NdArray::from_vec(vec![1.0, 2.0], &[2, 1], Order::ColMajor).unwrap();
        let (arena, mut views) = Arena::pack(vec![a]).unwrap();
        drop(arena);
        let view = views.pop().unwrap();
        assert_eq!(view.as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn separate_mode_keeps_owned_arrays() {
        let a = NdArray::from_vec(vec![1.0], &[1, 1], Order::ColMajor).unwrap();
        let (arena, arrays) = store(AllocationMode::Separate, vec![a]).unwrap();
        assert!(arena.is_none());
        assert!(arrays[0].is_owned());

        let (arena, arrays) = store(AllocationMode::Consolidated, Vec::new()).unwrap();
        assert!(arena.is_none());
        assert!(arrays.is_empty());
    }
}
