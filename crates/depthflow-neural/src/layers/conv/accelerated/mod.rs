//! Backend-accelerated depthwise convolution
//!
//! [`AcceleratedDepthwiseConv2D`] runs a depthwise convolution through a
//! [`ConvBackend`] that only knows grouped convolution. It wraps the generic
//! [`DepthwiseConv2D`] for configuration, shape math and the compact
//! parameters, and adds:
//!
//! - a [`LayoutTranslator`] between the compact weight and the backend's
//!   grouped weight plus validity mask,
//! - a [`DescriptorSet`] rebuilt on every reshape,
//! - a [`Planner`] choosing algorithms and growing the [`ScratchPool`],
//! - an [`ExecutionEngine`] issuing work on a [`StreamSet`].
//!
//! The layer moves through `Uninitialized -> Ready -> Configured -> Destroyed`:
//!
//! ```rust,ignore
//! let mut layer = AcceleratedDepthwiseConv2D::new(&param, &shape, config, backend)?;
//! layer.setup()?;                    // streams, handles, grouped weight
//! layer.reshape(&[shape.clone()])?;  // descriptors, algorithms, scratch
//! let y = layer.forward(&[&x])?;
//! layer.teardown();
//! ```

pub mod descriptors;
pub mod engine;
pub mod layout;
pub mod planner;

pub use descriptors::{DescriptorGeometry, DescriptorSet, InputDescriptors};
pub use engine::{ExecutionEngine, StreamRole, StreamSet};
pub use layout::{GroupedWeight, LayoutTranslator};
pub use planner::{AlgorithmChoice, PlanOutcome, Planner, ScratchPool};

use super::config::{AcceleratedConvConfig, ConvGeometry, ConvolutionParam};
use super::depthwise::DepthwiseConv2D;
use crate::layers::{Layer, LayerType};
use depthflow_core::gpu::ConvBackend;
use depthflow_core::{ConvElement, Parameter, Result, Shape, Tensor, TensorError};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Lifecycle of an accelerated layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Constructed; no backend resources held
    Uninitialized,
    /// Streams, handles and shared descriptors exist; no shape bound
    Ready,
    /// Descriptors and algorithm plans match the bound shape
    Configured,
    /// Every backend resource has been released
    Destroyed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Ready => "ready",
            LifecycleState::Configured => "configured",
            LifecycleState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Depthwise convolution executed by a grouped-convolution backend
pub struct AcceleratedDepthwiseConv2D<T: ConvElement, B: ConvBackend> {
    base: DepthwiseConv2D<T>,
    config: AcceleratedConvConfig,
    backend: Arc<B>,
    state: LifecycleState,
    translator: LayoutTranslator,
    planner: Planner,
    grouped: Option<GroupedWeight<T>>,
    streams: Option<StreamSet<B>>,
    descriptors: Option<DescriptorSet>,
    plans: Vec<AlgorithmChoice>,
    plan_epoch: Option<u64>,
    degraded: bool,
    pool: ScratchPool<B::Workspace>,
    /// Compact parameters changed since the last conversion to backend layout
    compact_is_newer: bool,
}

impl<T: ConvElement, B: ConvBackend> AcceleratedDepthwiseConv2D<T, B> {
    /// Validate the configuration against `input_shape` (`[N, C, H, W]`).
    ///
    /// Fails with [`TensorError::InvalidConfiguration`] for anything other
    /// than two spatial axes or a channel count the groups do not divide.
    pub fn new(
        param: &ConvolutionParam,
        input_shape: &Shape,
        config: AcceleratedConvConfig,
        backend: Arc<B>,
    ) -> Result<Self> {
        config.validate()?;
        check_spatial_axes("accelerated_depthwise_new", input_shape)?;
        let base = DepthwiseConv2D::new(param, input_shape)?;
        let translator = LayoutTranslator::new(base.geometry());
        let planner = Planner::new(config.workspace_limit_bytes);
        let pool = ScratchPool::new(config.stream_count);

        Ok(Self {
            base,
            config,
            backend,
            state: LifecycleState::Uninitialized,
            translator,
            planner,
            grouped: None,
            streams: None,
            descriptors: None,
            plans: Vec::new(),
            plan_epoch: None,
            degraded: false,
            pool,
            compact_is_newer: false,
        })
    }

    /// Create streams, handles and the shared descriptors, then convert the
    /// compact weight into backend layout.
    pub fn setup(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(TensorError::invalid_lifecycle("setup", self.state));
        }
        let backend = Arc::clone(&self.backend);
        let streams = StreamSet::create(&*backend, self.config.stream_count)?;
        let descriptors =
            match DescriptorSet::create(&*backend, T::DATA_TYPE, self.base.bias().is_some()) {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    streams.release(&*backend);
                    return Err(e);
                }
            };

        self.streams = Some(streams);
        self.descriptors = Some(descriptors);
        self.grouped = Some(GroupedWeight::zeros(self.translator.grouped_shape()));
        self.plans.clear();
        self.plan_epoch = None;
        self.state = LifecycleState::Ready;
        self.to_backend_layout()?;

        log::debug!(
            "depthwise convolution set up on '{}': {} channels, multiplier {}, {} streams",
            backend.name(),
            self.base.channels(),
            self.base.multiplier(),
            self.config.stream_count
        );
        Ok(())
    }

    /// Bind new input shapes: rebuild descriptors and re-plan algorithms and scratch.
    ///
    /// Calling it again with the same shapes redoes the work and yields the same plans.
    pub fn reshape(&mut self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        if !matches!(
            self.state,
            LifecycleState::Ready | LifecycleState::Configured
        ) {
            return Err(TensorError::invalid_lifecycle("reshape", self.state));
        }
        for shape in input_shapes {
            check_spatial_axes("reshape", shape)?;
        }
        let output = self.base.compute_output_shape(input_shapes)?;
        let geometry = self.descriptor_geometry(&input_shapes[0], &output);

        self.state = LifecycleState::Ready;
        self.plan_epoch = None;
        self.plans.clear();

        let backend = Arc::clone(&self.backend);
        let descriptors = self.descriptors.as_mut().ok_or_else(|| {
            TensorError::invalid_lifecycle("reshape", "descriptors missing")
        })?;
        let epoch = descriptors.rebuild(&*backend, input_shapes.len(), &geometry)?;
        self.replan(epoch)?;

        Ok(vec![output; input_shapes.len()])
    }

    fn descriptor_geometry(&self, input: &Shape, output: &Shape) -> DescriptorGeometry {
        let g = self.base.geometry();
        DescriptorGeometry {
            batch: input[0],
            channels: g.channels,
            height: input[2],
            width: input[3],
            num_output: g.num_output,
            height_out: output[2],
            width_out: output[3],
            group: g.group,
            kernel_h: g.kernel.0,
            kernel_w: g.kernel.1,
            pad_h: g.pad.0,
            pad_w: g.pad.1,
            stride_h: g.stride.0,
            stride_w: g.stride.1,
            spatial_axes: input.num_spatial_axes(),
        }
    }

    fn replan(&mut self, epoch: u64) -> Result<()> {
        let (Some(streams), Some(descriptors)) = (self.streams.as_ref(), self.descriptors.as_ref())
        else {
            return Err(TensorError::invalid_lifecycle("plan", self.state));
        };
        let handle = streams.handle(StreamRole::Bias)?;
        let outcome = self
            .planner
            .plan(&*self.backend, handle, descriptors, &mut self.pool)?;

        self.plans = outcome.plans;
        self.degraded = outcome.degraded;
        self.plan_epoch = Some(epoch);
        self.state = LifecycleState::Configured;
        Ok(())
    }

    fn ensure_configured(&self, operation: &str) -> Result<()> {
        if self.state != LifecycleState::Configured {
            return Err(TensorError::invalid_lifecycle(operation, self.state));
        }
        match (&self.descriptors, self.plan_epoch) {
            (Some(descriptors), Some(epoch)) if descriptors.epoch() == epoch => Ok(()),
            _ => Err(TensorError::invalid_lifecycle(
                operation,
                "algorithm plan does not match the current descriptors",
            )),
        }
    }

    fn check_bound_input(&self, operation: &str, index: usize, x: &Tensor<T>) -> Result<()> {
        let expected = self.base.input_shapes().get(index).ok_or_else(|| {
            TensorError::invalid_argument_op(
                operation,
                &format!(
                    "input {index} is not bound ({} bound)",
                    self.base.input_shapes().len()
                ),
            )
        })?;
        if x.shape() != expected {
            return Err(TensorError::shape_mismatch(
                operation,
                &expected.to_string(),
                &x.shape().to_string(),
            ));
        }
        Ok(())
    }

    fn check_output_grad(&self, operation: &str, dy: &Tensor<T>) -> Result<()> {
        if Some(dy.shape()) != self.base.output_shape() {
            return Err(TensorError::shape_mismatch(
                operation,
                &self
                    .base
                    .output_shape()
                    .map(Shape::to_string)
                    .unwrap_or_default(),
                &dy.shape().to_string(),
            ));
        }
        Ok(())
    }

    /// Forward pass of bound input `index`, issued on the bias stream
    pub fn forward_at(&mut self, index: usize, x: &Tensor<T>) -> Result<Tensor<T>> {
        const OP: &str = "forward";
        self.ensure_configured(OP)?;
        self.sync_backend_layout()?;
        self.check_bound_input(OP, index, x)?;
        let output_shape = self.base.output_shape().cloned().ok_or_else(|| {
            TensorError::invalid_lifecycle(OP, "output shape unknown")
        })?;
        let mut y = Tensor::zeros(output_shape.dims());

        let (Some(streams), Some(descriptors), Some(grouped)) = (
            self.streams.as_ref(),
            self.descriptors.as_ref(),
            self.grouped.as_ref(),
        ) else {
            return Err(TensorError::invalid_lifecycle(OP, self.state));
        };
        let plan = plan_for(&self.plans, OP, index)?;
        let engine = ExecutionEngine::new(&*self.backend, streams, descriptors)?;
        engine.forward(
            index,
            &plan,
            &mut self.pool,
            x.as_slice(),
            grouped.param().data.as_slice(),
            self.base.bias().map(|b| b.data.as_slice()),
            y.as_slice_mut(),
        )?;
        Ok(y)
    }

    /// Input gradient of bound input `index`, issued on the data stream
    pub fn backward_data(&mut self, index: usize, dy: &Tensor<T>) -> Result<Tensor<T>> {
        const OP: &str = "backward_data";
        self.ensure_configured(OP)?;
        self.sync_backend_layout()?;
        self.check_output_grad(OP, dy)?;
        let input_shape = self.base.input_shapes().get(index).cloned().ok_or_else(|| {
            TensorError::invalid_argument_op(OP, &format!("input {index} is not bound"))
        })?;
        let mut dx = Tensor::zeros(input_shape.dims());

        let (Some(streams), Some(descriptors), Some(grouped)) = (
            self.streams.as_ref(),
            self.descriptors.as_ref(),
            self.grouped.as_ref(),
        ) else {
            return Err(TensorError::invalid_lifecycle(OP, self.state));
        };
        let plan = plan_for(&self.plans, OP, index)?;
        let engine = ExecutionEngine::new(&*self.backend, streams, descriptors)?;
        engine.backward_data(
            index,
            &plan,
            &mut self.pool,
            grouped.param().data.as_slice(),
            dy.as_slice(),
            dx.as_slice_mut(),
        )?;
        Ok(dx)
    }

    /// Accumulate the grouped weight gradient for bound input `index` on the
    /// filter stream, then clear every masked-out position
    pub fn backward_filter(&mut self, index: usize, x: &Tensor<T>, dy: &Tensor<T>) -> Result<()> {
        const OP: &str = "backward_filter";
        self.ensure_configured(OP)?;
        self.sync_backend_layout()?;
        self.check_bound_input(OP, index, x)?;
        self.check_output_grad(OP, dy)?;

        let (Some(streams), Some(descriptors), Some(grouped)) = (
            self.streams.as_ref(),
            self.descriptors.as_ref(),
            self.grouped.as_mut(),
        ) else {
            return Err(TensorError::invalid_lifecycle(OP, self.state));
        };
        let plan = plan_for(&self.plans, OP, index)?;
        let engine = ExecutionEngine::new(&*self.backend, streams, descriptors)?;
        engine.backward_filter(
            index,
            &plan,
            &mut self.pool,
            x.as_slice(),
            dy.as_slice(),
            grouped.param_mut().grad.as_slice_mut(),
        )?;
        grouped.mask_gradient();
        Ok(())
    }

    /// Accumulate the bias gradient for bound input `index` on the bias stream.
    /// Does nothing when the layer has no bias term.
    pub fn backward_bias(&mut self, index: usize, dy: &Tensor<T>) -> Result<()> {
        const OP: &str = "backward_bias";
        self.ensure_configured(OP)?;
        self.check_output_grad(OP, dy)?;
        let Some(bias) = self.base.bias_mut() else {
            return Ok(());
        };
        let (Some(streams), Some(descriptors)) = (self.streams.as_ref(), self.descriptors.as_ref())
        else {
            return Err(TensorError::invalid_lifecycle(OP, self.state));
        };
        let engine = ExecutionEngine::new(&*self.backend, streams, descriptors)?;
        engine.backward_bias(index, dy.as_slice(), bias.grad.as_slice_mut())
    }

    /// Wait for every stream to drain
    pub fn synchronize(&self) -> Result<()> {
        match self.streams.as_ref() {
            Some(streams) => streams.synchronize(&*self.backend),
            None => Err(TensorError::invalid_lifecycle("synchronize", self.state)),
        }
    }

    /// Copy the compact weight (data and gradient) into the grouped weight and
    /// rebuild the mask. No-op until `setup` has run.
    pub fn to_backend_layout(&mut self) -> Result<()> {
        if let Some(grouped) = self.grouped.as_mut() {
            self.translator
                .to_backend_layout(self.base.weight(), grouped)?;
            self.compact_is_newer = false;
        }
        Ok(())
    }

    /// Copy the grouped weight (data and gradient) back into the compact weight.
    ///
    /// No-op until `setup` has run, and while the compact weight holds
    /// changes not yet converted to backend layout.
    pub fn to_compact_layout(&mut self) -> Result<()> {
        if self.compact_is_newer {
            return Ok(());
        }
        if let Some(grouped) = self.grouped.as_ref() {
            self.translator
                .to_compact_layout(grouped, self.base.weight_mut())?;
        }
        Ok(())
    }

    fn sync_backend_layout(&mut self) -> Result<()> {
        if self.compact_is_newer {
            self.to_backend_layout()?;
        }
        Ok(())
    }

    /// Zero compact, grouped and bias gradients
    pub fn zero_grad(&mut self) {
        self.base.zero_grad();
        if let Some(grouped) = self.grouped.as_mut() {
            grouped.zero_grad();
        }
    }

    /// Release the scratch pool and, when configured, re-plan so the pool is
    /// sized for the current shapes only
    pub fn reset_workspace(&mut self) -> Result<()> {
        self.pool.release();
        if self.state == LifecycleState::Configured {
            let epoch = self.plan_epoch.ok_or_else(|| {
                TensorError::invalid_lifecycle("reset_workspace", self.state)
            })?;
            self.replan(epoch)?;
        }
        Ok(())
    }

    /// Release every descriptor, handle, stream and the scratch pool.
    ///
    /// Safe to call repeatedly; only the first call after `setup` releases anything.
    pub fn teardown(&mut self) {
        match self.state {
            LifecycleState::Destroyed => return,
            LifecycleState::Uninitialized => {
                self.state = LifecycleState::Destroyed;
                return;
            }
            LifecycleState::Ready | LifecycleState::Configured => {}
        }
        let backend = Arc::clone(&self.backend);
        self.pool.release();
        if let Some(descriptors) = self.descriptors.take() {
            descriptors.release(&*backend);
        }
        if let Some(streams) = self.streams.take() {
            streams.release(&*backend);
        }
        self.plans.clear();
        self.plan_epoch = None;
        self.state = LifecycleState::Destroyed;
        log::debug!("depthwise convolution on '{}' torn down", backend.name());
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &AcceleratedConvConfig {
        &self.config
    }

    pub fn geometry(&self) -> &ConvGeometry {
        self.base.geometry()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The generic layer holding shapes and compact parameters
    pub fn base(&self) -> &DepthwiseConv2D<T> {
        &self.base
    }

    pub fn translator(&self) -> &LayoutTranslator {
        &self.translator
    }

    /// Compact weight, `[num_output, 1, KH, KW]`
    pub fn weight(&self) -> &Parameter<T> {
        self.base.weight()
    }

    /// Mutable compact weight. The next forward or backward converts it to
    /// backend layout again.
    pub fn weight_mut(&mut self) -> &mut Parameter<T> {
        self.compact_is_newer = true;
        self.base.weight_mut()
    }

    pub fn bias(&self) -> Option<&Parameter<T>> {
        self.base.bias()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Parameter<T>> {
        self.base.bias_mut()
    }

    pub fn grouped_weight(&self) -> Option<&GroupedWeight<T>> {
        self.grouped.as_ref()
    }

    pub fn mask(&self) -> Option<&Tensor<T>> {
        self.grouped.as_ref().map(GroupedWeight::mask)
    }

    pub fn descriptors(&self) -> Option<&DescriptorSet> {
        self.descriptors.as_ref()
    }

    /// One plan per bound input
    pub fn plans(&self) -> &[AlgorithmChoice] {
        &self.plans
    }

    /// Whether the last plan fell back to zero-workspace algorithms
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Scratch pool size in bytes
    pub fn workspace_size(&self) -> usize {
        self.pool.size()
    }

    pub fn workspace_regions(&self) -> &[Option<Range<usize>>] {
        self.pool.regions()
    }
}

fn plan_for(plans: &[AlgorithmChoice], operation: &str, index: usize) -> Result<AlgorithmChoice> {
    plans.get(index).copied().ok_or_else(|| {
        TensorError::invalid_argument_op(
            operation,
            &format!("no algorithm plan for input {index} ({} planned)", plans.len()),
        )
    })
}

fn check_spatial_axes(operation: &str, shape: &Shape) -> Result<()> {
    if shape.num_spatial_axes() != 2 {
        return Err(TensorError::invalid_configuration(
            operation,
            &format!(
                "only 2D convolution is supported, input {shape} has {} spatial axes",
                shape.num_spatial_axes()
            ),
        ));
    }
    Ok(())
}

impl<T: ConvElement, B: ConvBackend> Layer<T> for AcceleratedDepthwiseConv2D<T, B> {
    fn layer_type(&self) -> LayerType {
        LayerType::AcceleratedDepthwiseConv2D
    }

    fn reshape(&mut self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        AcceleratedDepthwiseConv2D::reshape(self, input_shapes)
    }

    fn forward(&mut self, inputs: &[&Tensor<T>]) -> Result<Vec<Tensor<T>>> {
        self.sync_backend_layout()?;
        let outputs = inputs
            .iter()
            .enumerate()
            .map(|(i, x)| self.forward_at(i, x))
            .collect::<Result<Vec<_>>>()?;
        self.synchronize()?;
        Ok(outputs)
    }

    fn backward(
        &mut self,
        inputs: &[&Tensor<T>],
        output_grads: &[&Tensor<T>],
        propagate_down: bool,
    ) -> Result<Vec<Option<Tensor<T>>>> {
        if inputs.len() != output_grads.len() {
            return Err(TensorError::invalid_argument_op(
                "backward",
                "one output gradient is required per input",
            ));
        }
        self.sync_backend_layout()?;
        let mut input_grads = Vec::with_capacity(inputs.len());
        for (i, (x, dy)) in inputs.iter().zip(output_grads).enumerate() {
            self.backward_bias(i, dy)?;
            self.backward_filter(i, x, dy)?;
            let dx = if propagate_down {
                Some(self.backward_data(i, dy)?)
            } else {
                None
            };
            input_grads.push(dx);
        }
        self.synchronize()?;
        self.to_compact_layout()?;
        Ok(input_grads)
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        self.base.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        self.compact_is_newer = true;
        self.base.parameters_mut()
    }

    fn set_training(&mut self, training: bool) {
        self.base.set_training(training);
    }
}

impl<T: ConvElement, B: ConvBackend> fmt::Debug for AcceleratedDepthwiseConv2D<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratedDepthwiseConv2D")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("geometry", self.base.geometry())
            .field("plans", &self.plans)
            .field("degraded", &self.degraded)
            .field("workspace_size", &self.pool.size())
            .finish()
    }
}

impl<T: ConvElement, B: ConvBackend> Drop for AcceleratedDepthwiseConv2D<T, B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
