//! Convolution backend integration
//!
//! The layers talk to a vendor convolution library only through
//! [`backend::ConvBackend`]. [`host::HostBackend`] implements it on host
//! memory.

pub mod backend;
pub mod descriptor;
pub mod host;

pub use backend::{
    BackwardDataAlgorithm, BackwardFilterAlgorithm, ConvBackend, ConvProblem, ForwardAlgorithm,
    WorkspaceMemory, DEFAULT_WORKSPACE_LIMIT,
};
pub use descriptor::{
    ConvolutionDescriptor, ConvolutionMode, FilterDescriptor, TensorDescriptor, TensorFormat,
};
pub use host::{HostBackend, HostStats, StreamOp};
