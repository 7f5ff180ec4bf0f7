//! Core Tensor Structure and Parameters
//!
//! Tensors keep their elements in a contiguous row-major buffer so they can be
//! handed to the convolution backend as plain slices, and expose `ndarray`
//! views for index-heavy host code.

use crate::{Result, Shape, TensorError};
use ndarray::{ArrayView4, ArrayViewD, ArrayViewMut4, IxDyn};
use num_traits::Zero;

/// Dense tensor that holds data and its shape
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    data: Vec<T>,
    shape: Shape,
}

impl<T> Tensor<T> {
    /// Create a tensor from a flat buffer, validating the element count
    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let shape = Shape::from_slice(shape);
        if data.len() != shape.size() {
            return Err(TensorError::shape_mismatch(
                "from_vec",
                &format!("{} elements for shape {}", shape.size(), shape),
                &format!("{} elements", data.len()),
            ));
        }
        Ok(Self { data, shape })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Get memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }

    /// Dynamic-rank view over the tensor data
    pub fn view(&self) -> Result<ArrayViewD<'_, T>> {
        ArrayViewD::from_shape(IxDyn(self.shape.dims()), &self.data)
            .map_err(|e| TensorError::invalid_shape("view", &e.to_string(), self.shape.dims()))
    }

    /// Four-dimensional `[N, C, H, W]` view
    pub fn view4(&self) -> Result<ArrayView4<'_, T>> {
        let dims = self.dims4("view4")?;
        ArrayView4::from_shape(dims, &self.data)
            .map_err(|e| TensorError::invalid_shape("view4", &e.to_string(), self.shape.dims()))
    }

    pub fn view4_mut(&mut self) -> Result<ArrayViewMut4<'_, T>> {
        let dims = self.dims4("view4_mut")?;
        ArrayViewMut4::from_shape(dims, &mut self.data).map_err(|e| {
            TensorError::invalid_shape("view4_mut", &e.to_string(), self.shape.dims())
        })
    }

    fn dims4(&self, operation: &str) -> Result<(usize, usize, usize, usize)> {
        match *self.shape.dims() {
            [n, c, h, w] => Ok((n, c, h, w)),
            _ => Err(TensorError::invalid_shape(
                operation,
                "expected a 4D [N, C, H, W] tensor",
                self.shape.dims(),
            )),
        }
    }
}

impl<T: Clone + Zero> Tensor<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        let shape = Shape::from_slice(shape);
        Self {
            data: vec![T::zero(); shape.size()],
            shape,
        }
    }

    /// Set every element to `value`
    pub fn fill(&mut self, value: T) {
        self.data.iter_mut().for_each(|x| *x = value.clone());
    }

    /// Reshape in place; the contents are reset to zero when the element count changes
    pub fn reshape(&mut self, shape: &[usize]) {
        let shape = Shape::from_slice(shape);
        if shape.size() != self.data.len() {
            self.data = vec![T::zero(); shape.size()];
        }
        self.shape = shape;
    }
}

/// Learnable parameter: value plus the gradient accumulated into it
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter<T> {
    pub data: Tensor<T>,
    pub grad: Tensor<T>,
}

impl<T: Clone + Zero> Parameter<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: Tensor::zeros(shape),
            grad: Tensor::zeros(shape),
        }
    }

    /// Build a parameter from existing values with a zeroed gradient
    pub fn from_data(data: Tensor<T>) -> Self {
        let grad = Tensor::zeros(data.shape().dims());
        Self { data, grad }
    }

    pub fn shape(&self) -> &Shape {
        self.data.shape()
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(T::zero());
    }

    pub fn reshape(&mut self, shape: &[usize]) {
        self.data.reshape(shape);
        self.grad.reshape(shape);
    }
}
