//! Convolution math-library capability
//!
//! [`ConvBackend`] is the seam between the layers and a vendor convolution
//! library: it owns execution streams and library handles, hands out
//! descriptors, answers "best algorithm under a workspace budget" and
//! "required workspace" queries, allocates scratch memory and runs the
//! convolution kernels on a stream.
//!
//! Contract every implementation honours:
//! - algorithm choice is deterministic for a fixed (descriptors, budget) pair;
//! - the workspace size reported for an algorithm is sufficient to run it;
//! - a zero-workspace default exists for every pass and accepts `None` as
//!   workspace;
//! - execution only reads and writes the buffers and descriptors it is given.

use super::descriptor::{ConvolutionDescriptor, FilterDescriptor, TensorDescriptor};
use crate::{ConvElement, DataType, Result};

/// Workspace ceiling used for algorithm selection unless configured otherwise
pub const DEFAULT_WORKSPACE_LIMIT: usize = 8 * 1024 * 1024;

/// Forward convolution algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForwardAlgorithm {
    /// Direct evaluation, needs no workspace
    #[default]
    ImplicitGemm,
    /// Explicit im2col followed by a matrix product
    Gemm,
}

impl ForwardAlgorithm {
    pub const ZERO_WORKSPACE: Self = Self::ImplicitGemm;
}

/// Backward-filter algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackwardFilterAlgorithm {
    /// Direct accumulation, needs no workspace
    #[default]
    Algo0,
    /// im2col based accumulation
    Algo1,
}

impl BackwardFilterAlgorithm {
    pub const ZERO_WORKSPACE: Self = Self::Algo0;
}

/// Backward-data algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackwardDataAlgorithm {
    /// Direct scatter, needs no workspace
    #[default]
    Algo0,
    /// Column product followed by col2im
    Algo1,
}

impl BackwardDataAlgorithm {
    pub const ZERO_WORKSPACE: Self = Self::Algo0;
}

/// Descriptors of one convolution: `input (*) filter -> output`
#[derive(Debug, Clone, Copy)]
pub struct ConvProblem<'a> {
    pub input: &'a TensorDescriptor,
    pub filter: &'a FilterDescriptor,
    pub conv: &'a ConvolutionDescriptor,
    pub output: &'a TensorDescriptor,
}

/// Device scratch memory returned by [`ConvBackend::allocate_workspace`].
/// Dropping it frees the allocation.
pub trait WorkspaceMemory {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_mut_bytes(&mut self) -> &mut [u8];
}

/// Convolution library bound to one device
pub trait ConvBackend: Send + Sync {
    type Stream;
    type Handle;
    type Workspace: WorkspaceMemory;

    /// Human readable backend name, used in log lines
    fn name(&self) -> &str;

    fn create_stream(&self) -> Result<Self::Stream>;
    fn destroy_stream(&self, stream: Self::Stream);

    /// Create a library handle whose work is issued on `stream`
    fn create_handle(&self, stream: &Self::Stream) -> Result<Self::Handle>;
    fn destroy_handle(&self, handle: Self::Handle);

    /// Block until all work enqueued on `stream` has completed
    fn synchronize(&self, stream: &Self::Stream) -> Result<()>;

    fn create_tensor_descriptor(&self, data_type: DataType) -> Result<TensorDescriptor>;
    fn destroy_tensor_descriptor(&self, desc: TensorDescriptor);
    fn create_filter_descriptor(&self, data_type: DataType) -> Result<FilterDescriptor>;
    fn destroy_filter_descriptor(&self, desc: FilterDescriptor);
    fn create_convolution_descriptor(&self, data_type: DataType)
        -> Result<ConvolutionDescriptor>;
    fn destroy_convolution_descriptor(&self, desc: ConvolutionDescriptor);

    fn forward_algorithm(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        workspace_limit: usize,
    ) -> Result<ForwardAlgorithm>;

    fn forward_workspace_size(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        algo: ForwardAlgorithm,
    ) -> Result<usize>;

    fn backward_filter_algorithm(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        workspace_limit: usize,
    ) -> Result<BackwardFilterAlgorithm>;

    fn backward_filter_workspace_size(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        algo: BackwardFilterAlgorithm,
    ) -> Result<usize>;

    fn backward_data_algorithm(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        workspace_limit: usize,
    ) -> Result<BackwardDataAlgorithm>;

    fn backward_data_workspace_size(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        algo: BackwardDataAlgorithm,
    ) -> Result<usize>;

    /// Allocate `bytes` of scratch memory.
    /// Fails with [`crate::TensorError::AllocationError`] when the device is out of memory.
    fn allocate_workspace(&self, bytes: usize) -> Result<Self::Workspace>;

    /// `y = conv(x, w)`, or `y += conv(x, w)` when `accumulate` is set
    #[allow(clippy::too_many_arguments)]
    fn convolution_forward<T: ConvElement>(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        algo: ForwardAlgorithm,
        workspace: Option<&mut [u8]>,
        x: &[T],
        w: &[T],
        y: &mut [T],
        accumulate: bool,
    ) -> Result<()>;

    /// Broadcast-add a `[1, C, 1, 1]` bias over `y`
    fn add_bias<T: ConvElement>(
        &self,
        handle: &Self::Handle,
        bias_desc: &TensorDescriptor,
        bias: &[T],
        y_desc: &TensorDescriptor,
        y: &mut [T],
    ) -> Result<()>;

    /// Gradient with respect to the convolution input
    #[allow(clippy::too_many_arguments)]
    fn convolution_backward_data<T: ConvElement>(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        algo: BackwardDataAlgorithm,
        workspace: Option<&mut [u8]>,
        w: &[T],
        dy: &[T],
        dx: &mut [T],
        accumulate: bool,
    ) -> Result<()>;

    /// Gradient with respect to the filter
    #[allow(clippy::too_many_arguments)]
    fn convolution_backward_filter<T: ConvElement>(
        &self,
        handle: &Self::Handle,
        problem: ConvProblem<'_>,
        algo: BackwardFilterAlgorithm,
        workspace: Option<&mut [u8]>,
        x: &[T],
        dy: &[T],
        dw: &mut [T],
        accumulate: bool,
    ) -> Result<()>;

    /// Gradient with respect to a `[1, C, 1, 1]` bias
    #[allow(clippy::too_many_arguments)]
    fn convolution_backward_bias<T: ConvElement>(
        &self,
        handle: &Self::Handle,
        dy_desc: &TensorDescriptor,
        dy: &[T],
        bias_desc: &TensorDescriptor,
        db: &mut [T],
        accumulate: bool,
    ) -> Result<()>;
}
