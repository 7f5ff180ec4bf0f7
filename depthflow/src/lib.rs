//! # depthflow - depthwise convolution on grouped-convolution backends
//!
//! depthflow runs depthwise convolutions through math libraries that only
//! understand grouped convolution. It keeps the compact "one filter per
//! channel" parameters as the visible representation and handles the rest:
//!
//! - **Layout translation**: compact weights to the backend's grouped
//!   layout with a validity mask, and back
//! - **Planning**: per-shape algorithm selection under a workspace limit
//!   with a grow-only scratch pool that degrades instead of failing
//! - **Execution**: forward and backward passes spread over independent
//!   streams for bias, filter and input gradients
//! - **Lifecycle**: explicit setup, reshape and idempotent teardown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use depthflow::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let shape = Shape::from([8, 32, 56, 56]);
//! let param = ConvolutionParam::depthwise(32, 1, 3).with_pad(1, 1);
//! let backend = Arc::new(HostBackend::new());
//!
//! let mut layer = AcceleratedDepthwiseConv2D::<f32, _>::new(
//!     &param,
//!     &shape,
//!     AcceleratedConvConfig::default(),
//!     backend,
//! )?;
//! layer.setup()?;
//! layer.reshape(&[shape.clone()])?;
//!
//! let x = Tensor::<f32>::zeros(shape.dims());
//! let y = layer.forward(&[&x])?;
//! let dx = layer.backward(&[&x], &[&y[0]], true)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: tensors, errors and the convolution backend capability
//! - [`neural`]: depthwise layers and parameter persistence
//!
//! ## Feature Flags
//!
//! - `serialize` (default): serde support and JSON persistence

#![deny(missing_docs)]
#![warn(clippy::all)]

pub use depthflow_core as core;
pub use depthflow_neural as neural;

/// Prelude module for convenient imports
///
/// ```rust
/// use depthflow::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::gpu::{ConvBackend, HostBackend};
    pub use crate::core::{DataType, Parameter, Shape, Tensor, TensorError};

    // Layers
    pub use crate::neural::layers::{
        AcceleratedConvConfig, AcceleratedDepthwiseConv2D, ConvolutionParam, DepthwiseConv2D,
        Layer, LifecycleState,
    };

    // Persistence
    pub use crate::neural::{BlobState, LayerState};
}

/// The version of depthflow
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the version string of depthflow
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert_eq!(version(), VERSION);
    }
}
