pub mod accelerated;
pub mod config;
pub mod depthwise;

pub use accelerated::{AcceleratedDepthwiseConv2D, LifecycleState};
pub use config::{AcceleratedConvConfig, ConvGeometry, ConvolutionParam, DEFAULT_STREAM_COUNT};
pub use depthwise::DepthwiseConv2D;
