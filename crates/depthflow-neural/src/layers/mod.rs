pub mod conv;

pub use conv::{
    AcceleratedConvConfig, AcceleratedDepthwiseConv2D, ConvGeometry, ConvolutionParam,
    DepthwiseConv2D, LifecycleState,
};

use depthflow_core::{Parameter, Result, Shape, Tensor};

/// Represents the kinds of layers in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    DepthwiseConv2D,
    AcceleratedDepthwiseConv2D,
}

impl LayerType {
    /// Name written into serialized layer state
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::DepthwiseConv2D => "DepthwiseConvolution",
            LayerType::AcceleratedDepthwiseConv2D => "DepthwiseConvolution",
        }
    }
}

/// A layer bound to one or more inputs of identical shape.
///
/// `reshape` must run whenever the input shapes change; `forward` and
/// `backward` assume the shapes last passed to `reshape`.
pub trait Layer<T> {
    fn layer_type(&self) -> LayerType;

    /// Recompute internal state for new input shapes and return the output shapes
    fn reshape(&mut self, input_shapes: &[Shape]) -> Result<Vec<Shape>>;

    fn forward(&mut self, inputs: &[&Tensor<T>]) -> Result<Vec<Tensor<T>>>;

    /// Accumulate parameter gradients and, when `propagate_down` is set,
    /// return the gradient for each input
    fn backward(
        &mut self,
        inputs: &[&Tensor<T>],
        output_grads: &[&Tensor<T>],
        propagate_down: bool,
    ) -> Result<Vec<Option<Tensor<T>>>>;

    /// Externally visible parameters: weight first, then bias if present
    fn parameters(&self) -> Vec<&Parameter<T>>;
    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>>;

    fn set_training(&mut self, training: bool);
}
