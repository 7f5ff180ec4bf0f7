//! # depthflow-core
//!
//! Tensor storage, the shared error taxonomy and the convolution backend
//! capability used by `depthflow-neural`.

#![allow(clippy::result_large_err)]

pub mod dtype;
pub mod error;
pub mod gpu;
pub mod shape;
pub mod tensor;

pub use dtype::{dtype_of, ConvElement, DataType};
pub use error::{Result, TensorError};
pub use shape::Shape;
pub use tensor::{Parameter, Tensor};
