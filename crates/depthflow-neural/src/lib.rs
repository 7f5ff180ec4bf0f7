//! # depthflow-neural
//!
//! Depthwise convolution layers built on `depthflow-core`.
//!
//! - [`layers::DepthwiseConv2D`] evaluates the convolution on the host and
//!   owns the configuration, shape math and compact parameters.
//! - [`layers::AcceleratedDepthwiseConv2D`] runs the same layer through a
//!   grouped-convolution [`depthflow_core::gpu::ConvBackend`], translating
//!   weights between layouts and managing descriptors, algorithm plans,
//!   scratch memory and execution streams.
//! - [`serialization`] persists compact parameters.

#![allow(clippy::result_large_err)]

pub mod layers;
pub mod serialization;

pub use layers::{
    AcceleratedConvConfig, AcceleratedDepthwiseConv2D, ConvGeometry, ConvolutionParam,
    DepthwiseConv2D, Layer, LayerType, LifecycleState,
};
pub use serialization::{BlobState, LayerState};
