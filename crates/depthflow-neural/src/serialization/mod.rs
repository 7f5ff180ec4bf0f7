//! Parameter persistence
//!
//! Only compact parameters ever leave a layer: an accelerated layer converts
//! its grouped weight back to compact layout before producing a
//! [`LayerState`], and converts to backend layout again after loading one.

use crate::layers::conv::{AcceleratedDepthwiseConv2D, DepthwiseConv2D};
use crate::layers::Layer;
use depthflow_core::gpu::ConvBackend;
use depthflow_core::{ConvElement, Parameter, Result, Tensor, TensorError};
#[cfg(feature = "serialize")]
use serde::{de::DeserializeOwned, Deserialize, Serialize};
#[cfg(feature = "serialize")]
use std::path::Path;

/// One persisted parameter
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct BlobState<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
    /// Present only when gradients were requested
    #[cfg_attr(feature = "serialize", serde(skip_serializing_if = "Option::is_none"))]
    pub grad: Option<Vec<T>>,
}

impl<T: ConvElement> BlobState<T> {
    pub fn from_parameter(param: &Parameter<T>, write_grad: bool) -> Self {
        Self {
            shape: param.shape().to_vec(),
            data: param.data.as_slice().to_vec(),
            grad: write_grad.then(|| param.grad.as_slice().to_vec()),
        }
    }

    /// Overwrite `param` with this blob; the shapes must agree
    pub fn apply_to(&self, param: &mut Parameter<T>) -> Result<()> {
        if param.shape().dims() != self.shape.as_slice() {
            return Err(TensorError::serialization_error_simple(format!(
                "blob shape {:?} does not match parameter shape {}",
                self.shape,
                param.shape()
            )));
        }
        param.data = Tensor::from_vec(self.data.clone(), &self.shape)?;
        if let Some(grad) = &self.grad {
            param.grad = Tensor::from_vec(grad.clone(), &self.shape)?;
        }
        Ok(())
    }
}

/// Persisted parameters of one layer: weight first, then bias if present
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct LayerState<T> {
    pub layer_type: String,
    pub blobs: Vec<BlobState<T>>,
}

impl<T: ConvElement> LayerState<T> {
    pub fn from_layer<L: Layer<T>>(layer: &L, write_grad: bool) -> Self {
        Self {
            layer_type: layer.layer_type().as_str().to_string(),
            blobs: layer
                .parameters()
                .into_iter()
                .map(|p| BlobState::from_parameter(p, write_grad))
                .collect(),
        }
    }

    /// Copy every blob into the matching parameter of `layer`
    pub fn apply_to<L: Layer<T>>(&self, layer: &mut L) -> Result<()> {
        let expected = layer.layer_type().as_str();
        if self.layer_type != expected {
            return Err(TensorError::serialization_error_simple(format!(
                "state was written by a '{}' layer, expected '{expected}'",
                self.layer_type
            )));
        }
        let mut params = layer.parameters_mut();
        if params.len() != self.blobs.len() {
            return Err(TensorError::serialization_error_simple(format!(
                "Parameter count mismatch: expected {}, found {}",
                params.len(),
                self.blobs.len()
            )));
        }
        // validate everything before touching any parameter
        for (param, blob) in params.iter().zip(&self.blobs) {
            if param.shape().dims() != blob.shape.as_slice() {
                return Err(TensorError::serialization_error_simple(format!(
                    "blob shape {:?} does not match parameter shape {}",
                    blob.shape,
                    param.shape()
                )));
            }
        }
        for (param, blob) in params.iter_mut().zip(&self.blobs) {
            blob.apply_to(param)?;
        }
        Ok(())
    }

    #[cfg(feature = "serialize")]
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()>
    where
        T: Serialize,
    {
        let path = path.as_ref();
        let serialized = serde_json::to_string_pretty(self).map_err(|e| {
            TensorError::serialization_error_simple(format!("Serialization failed: {}", e))
        })?;
        std::fs::write(path, serialized).map_err(|e| {
            TensorError::io_error("save_json", &e.to_string(), Some(path))
        })
    }

    #[cfg(feature = "serialize")]
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self>
    where
        T: DeserializeOwned,
    {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TensorError::io_error("load_json", &e.to_string(), Some(path))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            TensorError::serialization_error_simple(format!("Deserialization failed: {}", e))
        })
    }
}

impl<T: ConvElement> DepthwiseConv2D<T> {
    pub fn to_state(&self, write_grad: bool) -> LayerState<T> {
        LayerState::from_layer(self, write_grad)
    }

    pub fn load_state(&mut self, state: &LayerState<T>) -> Result<()> {
        state.apply_to(self)
    }
}

impl<T: ConvElement, B: ConvBackend> AcceleratedDepthwiseConv2D<T, B> {
    /// Convert to compact layout, then capture the compact weight and bias
    pub fn to_state(&mut self, write_grad: bool) -> Result<LayerState<T>> {
        self.to_compact_layout()?;
        Ok(LayerState::from_layer(&*self, write_grad))
    }

    /// Overwrite the compact parameters, then convert them to backend layout
    pub fn load_state(&mut self, state: &LayerState<T>) -> Result<()> {
        state.apply_to(self)?;
        self.to_backend_layout()
    }

    #[cfg(feature = "serialize")]
    pub fn save_json<P: AsRef<Path>>(&mut self, path: P, write_grad: bool) -> Result<()>
    where
        T: Serialize,
    {
        self.to_state(write_grad)?.save_json(path)
    }

    #[cfg(feature = "serialize")]
    pub fn load_json<P: AsRef<Path>>(&mut self, path: P) -> Result<()>
    where
        T: DeserializeOwned,
    {
        let state = LayerState::load_json(path)?;
        self.load_state(&state)
    }
}
