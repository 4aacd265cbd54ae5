/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements the typed, strided N-dimensional buffer used for problem blocks, factors and tiles.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use crate::error::{BlrError, Result, try_zeroed};
use faer::{Mat, MatRef, c32, c64};
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Memory order of an [`NdArray`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Order {
    /// C order, the last index varies fastest.
    RowMajor,
    /// Fortran order, the first index varies fastest.
    ColMajor,
}

impl Order {
    fn flipped(self) -> Self {
        match self {
            Order::RowMajor => Order::ColMajor,
            Order::ColMajor => Order::RowMajor,
        }
    }
}

/// Precision of the elements stored in an [`NdArray`], in the spirit of the
/// `s`, `d`, `c`, `z` prefixes of LAPACK routines.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Single,
    Double,
    ComplexSingle,
    ComplexDouble,
}

/// Scalar types that can be stored in an [`NdArray`].
pub trait Element: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    const KIND: ElementKind;
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::Single;
}

impl Element for f64 {
    const KIND: ElementKind = ElementKind::Double;
}

impl Element for c32 {
    const KIND: ElementKind = ElementKind::ComplexSingle;
}

impl Element for c64 {
    const KIND: ElementKind = ElementKind::ComplexDouble;
}

#[derive(Debug, Clone)]
enum Storage<T> {
    Owned(Vec<T>),
    /// Non-owning view into an arena. Holding the `Arc` keeps the arena alive.
    Shared { buffer: Arc<[T]>, offset: usize },
}

/// A contiguous N-dimensional array with explicit shape, strides and order.
#[derive(Clone)]
pub struct NdArray<T: Element> {
    shape: Vec<usize>,
    stride: Vec<usize>,
    order: Order,
    len: usize,
    storage: Storage<T>,
}

fn contiguous_strides(shape: &[usize], order: Order) -> Vec<usize> {
    let mut stride = vec![0; shape.len()];
    let mut step = 1usize;
    match order {
        Order::ColMajor => {
            for (s, &n) in stride.iter_mut().zip(shape.iter()) {
                *s = step;
                step *= n.max(1);
            }
        }
        Order::RowMajor => {
            for (s, &n) in stride.iter_mut().zip(shape.iter()).rev() {
                *s = step;
                step *= n.max(1);
            }
        }
    }
    stride
}

fn checked_len(shape: &[usize]) -> Result<usize> {
    if shape.is_empty() {
        return Err(BlrError::invalid("array must have at least one dimension"));
    }
    shape
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| BlrError::invalid(format!("array shape {:?} overflows", shape)))
}

impl<T: Element> NdArray<T> {
    /// Allocates a zero-filled array.
    pub fn zeros(shape: &[usize], order: Order) -> Result<Self> {
        let len = checked_len(shape)?;
        let data = try_zeroed::<T>(len)?;
        Ok(Self {
            shape: shape.to_vec(),
            stride: contiguous_strides(shape, order),
            order,
            len,
            storage: Storage::Owned(data),
        })
    }

    /// Wraps an existing buffer without copying it.
    pub fn from_vec(buffer: Vec<T>, shape: &[usize], order: Order) -> Result<Self> {
        let len = checked_len(shape)?;
        if buffer.len() != len {
            return Err(BlrError::invalid(format!(
                "buffer of length {} does not match shape {:?}",
                buffer.len(),
                shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            stride: contiguous_strides(shape, order),
            order,
            len,
            storage: Storage::Owned(buffer),
        })
    }

    /// Creates a non-owning view of `len(shape)` elements starting at `offset`
    /// inside a shared arena.
    pub(crate) fn shared(
        buffer: Arc<[T]>,
        offset: usize,
        shape: &[usize],
        order: Order,
    ) -> Result<Self> {
        let len = checked_len(shape)?;
        if offset + len > buffer.len() {
            return Err(BlrError::invalid(format!(
                "view [{}, {}) exceeds arena of length {}",
                offset,
                offset + len,
                buffer.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            stride: contiguous_strides(shape, order),
            order,
            len,
            storage: Storage::Shared { buffer, offset },
        })
    }

    /// Allocates a zero-filled array with the same shape and order as `other`.
    pub fn new_like(other: &Self) -> Result<Self> {
        Self::zeros(&other.shape, other.order)
    }

    /// Returns an owned copy in the requested memory order.
    pub fn copy_with_order(&self, order: Order) -> Result<Self> {
        if order == self.order {
            let mut data = try_zeroed::<T>(self.len)?;
            data.copy_from_slice(self.as_slice());
            return Self::from_vec(data, &self.shape, order);
        }

        let mut copy = Self::zeros(&self.shape, order)?;
        let mut index = vec![0usize; self.ndim()];
        let src = self.as_slice();
        let dst_stride = copy.stride.clone();
        let dst = copy.as_mut_slice()?;
        for _ in 0..self.len {
            let src_offset: usize = index.iter().zip(&self.stride).map(|(i, s)| i * s).sum();
            let dst_offset: usize = index.iter().zip(&dst_stride).map(|(i, s)| i * s).sum();
            dst[dst_offset] = src[src_offset];
            advance_index(&mut index, &self.shape);
        }
        Ok(copy)
    }

    /// Transposes the array in place by reversing the shape.
    ///
    /// The data is not moved: reversing the shape and switching the memory
    /// order describes exactly the transposed array.
    pub fn transpose_inplace(&mut self) {
        self.shape.reverse();
        self.stride.reverse();
        self.order = self.order.flipped();
    }

    /// Returns the element at `index`, or `None` when out of bounds.
    pub fn get(&self, index: &[usize]) -> Option<T> {
        if index.len() != self.ndim() || index.iter().zip(&self.shape).any(|(i, n)| i >= n) {
            return None;
        }
        let offset: usize = index.iter().zip(&self.stride).map(|(i, s)| i * s).sum();
        Some(self.as_slice()[offset])
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.storage {
            Storage::Owned(data) => data,
            Storage::Shared { buffer, offset } => &buffer[*offset..*offset + self.len],
        }
    }

    /// Mutable access to the elements. Views into an arena are read only.
    pub fn as_mut_slice(&mut self) -> Result<&mut [T]> {
        match &mut self.storage {
            Storage::Owned(data) => Ok(data),
            Storage::Shared { .. } => Err(BlrError::invalid(
                "arrays viewing a shared arena cannot be modified",
            )),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn kind(&self) -> ElementKind {
        T::KIND
    }

    pub fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the data buffer in bytes.
    pub fn data_nbytes(&self) -> usize {
        self.len * self.element_size()
    }

    /// Whether the array owns its buffer (as opposed to viewing an arena).
    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }
}

/// Increments a column-major multi-index.
fn advance_index(index: &mut [usize], shape: &[usize]) {
    for (i, &n) in index.iter_mut().zip(shape.iter()) {
        *i += 1;
        if *i < n {
            return;
        }
        *i = 0;
    }
}

impl NdArray<f64> {
    /// Copies a faer matrix into a column-major 2-D array.
    pub fn from_mat(mat: MatRef<f64>) -> Result<Self> {
        let (nrows, ncols) = mat.shape();
        let mut array = Self::zeros(&[nrows, ncols], Order::ColMajor)?;
        let data = array.as_mut_slice()?;
        for j in 0..ncols {
            for i in 0..nrows {
                data[i + j * nrows] = mat[(i, j)];
            }
        }
        Ok(array)
    }

    /// Borrows a 2-D array as a faer matrix view.
    pub fn as_mat_ref(&self) -> Result<MatRef<'_, f64>> {
        if self.ndim() != 2 {
            return Err(BlrError::invalid(format!(
                "expected a 2-D array, got shape {:?}",
                self.shape
            )));
        }
        let (nrows, ncols) = (self.shape[0], self.shape[1]);
        Ok(match self.order {
            Order::ColMajor => MatRef::from_column_major_slice(self.as_slice(), nrows, ncols),
            Order::RowMajor => MatRef::from_row_major_slice(self.as_slice(), nrows, ncols),
        })
    }

    /// Copies a 2-D array into an owned faer matrix.
    pub fn to_mat(&self) -> Result<Mat<f64>> {
        Ok(self.as_mat_ref()?.to_owned())
    }

    /// Frobenius norm.
    pub fn norm(&self) -> f64 {
        self.as_slice().iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Frobenius norm of `self - other`.
    pub fn diff(&self, other: &Self) -> Result<f64> {
        if self.shape != other.shape {
            return Err(BlrError::invalid(format!(
                "cannot compare arrays of shapes {:?} and {:?}",
                self.shape, other.shape
            )));
        }
        let aligned;
        let other = if other.order == self.order {
            other
        } else {
            aligned = other.copy_with_order(self.order)?;
            &aligned
        };
        Ok(self
            .as_slice()
            .iter()
            .zip(other.as_slice())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt())
    }

    /// Matrix product of two 2-D arrays.
    pub fn dot(&self, other: &Self) -> Result<Self> {
        let a = self.as_mat_ref()?;
        let b = other.as_mat_ref()?;
        if a.ncols() != b.nrows() {
            return Err(BlrError::invalid(format!(
                "inner dimensions do not match: {:?} x {:?}",
                self.shape, other.shape
            )));
        }
        Self::from_mat((a * b).as_ref())
    }
}

impl<T: Element> Debug for NdArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("shape", &self.shape)
            .field("order", &self.order)
            .field("kind", &T::KIND)
            .field("owned", &self.is_owned())
            .finish()
    }
}

impl<T: Element> fmt::Display for NdArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<NdArray at {:p}, {:?} {:?} shape {:?}, stride {:?}, {} elements, {} bytes>",
            self.as_slice().as_ptr(),
            T::KIND,
            self.order,
            self.shape,
            self.stride,
            self.len,
            self.data_nbytes()
        )
    }
}
