//! Depthwise convolution layer
//!
//! [`DepthwiseConv2D`] holds the bookkeeping every depthwise implementation
//! shares: validated geometry, the compact weight with one `[KH, KW]` filter
//! per output channel, the optional bias and the bound input/output shapes.
//! It also evaluates the convolution directly on the host, which makes it
//! both the plain CPU layer and the collaborator the backend-accelerated
//! layer delegates its shape math to.

use super::config::{ConvGeometry, ConvolutionParam};
use crate::layers::{Layer, LayerType};
use depthflow_core::{ConvElement, Parameter, Result, Shape, Tensor, TensorError};

/// Depthwise 2D convolution: output channel `o` reads only input channel `o / multiplier`
#[derive(Debug, Clone)]
pub struct DepthwiseConv2D<T> {
    geometry: ConvGeometry,
    /// Compact weight, `[num_output, 1, kernel_h, kernel_w]`
    weight: Parameter<T>,
    /// `[num_output]`
    bias: Option<Parameter<T>>,
    input_shapes: Vec<Shape>,
    output_shape: Option<Shape>,
    training: bool,
}

impl<T: ConvElement> DepthwiseConv2D<T> {
    /// Set the layer up against the shape of its first input.
    ///
    /// Input layout is `[N, C, spatial...]`; the channel count is read from axis 1.
    pub fn new(param: &ConvolutionParam, input_shape: &Shape) -> Result<Self> {
        if input_shape.rank() < 2 {
            return Err(TensorError::invalid_shape(
                "depthwise_setup",
                "input must be laid out as [N, C, spatial...]",
                input_shape.dims(),
            ));
        }
        let geometry = param.resolve(input_shape[1])?;
        let (kernel_h, kernel_w) = geometry.kernel;
        let weight = Parameter::zeros(&[geometry.num_output, 1, kernel_h, kernel_w]);
        let bias = geometry
            .bias_term
            .then(|| Parameter::zeros(&[geometry.num_output]));

        Ok(Self {
            geometry,
            weight,
            bias,
            input_shapes: Vec::new(),
            output_shape: None,
            training: false,
        })
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    pub fn channels(&self) -> usize {
        self.geometry.channels
    }

    pub fn num_output(&self) -> usize {
        self.geometry.num_output
    }

    pub fn multiplier(&self) -> usize {
        self.geometry.multiplier
    }

    /// Elements per filter, `kernel_h * kernel_w`
    pub fn kernel_dim(&self) -> usize {
        self.geometry.kernel_dim()
    }

    pub fn weight(&self) -> &Parameter<T> {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Parameter<T> {
        &mut self.weight
    }

    pub fn bias(&self) -> Option<&Parameter<T>> {
        self.bias.as_ref()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Parameter<T>> {
        self.bias.as_mut()
    }

    /// Shapes of the inputs last passed to `reshape`
    pub fn input_shapes(&self) -> &[Shape] {
        &self.input_shapes
    }

    pub fn output_shape(&self) -> Option<&Shape> {
        self.output_shape.as_ref()
    }

    /// Replace the compact weight values, keeping the gradient
    pub fn set_weight(&mut self, weight: Tensor<T>) -> Result<()> {
        if weight.shape() != self.weight.shape() {
            return Err(TensorError::shape_mismatch(
                "set_weight",
                &self.weight.shape().to_string(),
                &weight.shape().to_string(),
            ));
        }
        self.weight.data = weight;
        Ok(())
    }

    /// Replace the bias values; fails when the layer has no bias term
    pub fn set_bias(&mut self, bias: Tensor<T>) -> Result<()> {
        let slot = self.bias.as_mut().ok_or_else(|| {
            TensorError::invalid_argument_op("set_bias", "layer was configured without bias")
        })?;
        if bias.shape() != slot.shape() {
            return Err(TensorError::shape_mismatch(
                "set_bias",
                &slot.shape().to_string(),
                &bias.shape().to_string(),
            ));
        }
        slot.data = bias;
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.weight.zero_grad();
        if let Some(bias) = self.bias.as_mut() {
            bias.zero_grad();
        }
    }

    /// Bind new input shapes and compute the output shape shared by every input.
    ///
    /// All inputs must have the same 4D shape with the configured channel count.
    pub fn compute_output_shape(&mut self, input_shapes: &[Shape]) -> Result<Shape> {
        let first = input_shapes.first().ok_or_else(|| {
            TensorError::invalid_argument_op("depthwise_reshape", "at least one input is required")
        })?;
        if let Some(other) = input_shapes.iter().find(|s| *s != first) {
            return Err(TensorError::shape_mismatch(
                "depthwise_reshape",
                &first.to_string(),
                &other.to_string(),
            ));
        }
        let [batch, channels, height, width] = *first.dims() else {
            return Err(TensorError::invalid_shape(
                "depthwise_reshape",
                "expected a 4D [N, C, H, W] input",
                first.dims(),
            ));
        };
        if channels != self.geometry.channels {
            return Err(TensorError::shape_mismatch(
                "depthwise_reshape",
                &format!("{} input channels", self.geometry.channels),
                &format!("{channels} input channels"),
            ));
        }
        let (height_out, width_out) = self.geometry.output_hw(height, width)?;
        let output = Shape::from([batch, self.geometry.num_output, height_out, width_out]);
        self.input_shapes = input_shapes.to_vec();
        self.output_shape = Some(output.clone());
        Ok(output)
    }

    fn check_input(&self, operation: &str, input: &Tensor<T>) -> Result<()> {
        if !self.input_shapes.iter().any(|s| s == input.shape()) {
            return Err(TensorError::shape_mismatch(
                operation,
                &format!("{:?}", self.input_shapes.first().map(Shape::to_vec)),
                &input.shape().to_string(),
            ));
        }
        Ok(())
    }

    /// Evaluate the convolution for one input on the host
    pub fn forward_host(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        self.check_input("depthwise_forward", input)?;
        let output_shape = self.output_shape.clone().ok_or_else(|| {
            TensorError::invalid_lifecycle("depthwise_forward", "not reshaped")
        })?;
        let (kernel_h, kernel_w) = self.geometry.kernel;
        let (pad_h, pad_w) = self.geometry.pad;
        let (stride_h, stride_w) = self.geometry.stride;
        let multiplier = self.geometry.multiplier;

        let x = input.view4()?;
        let (_, _, height, width) = x.dim();
        let w = self.weight.data.view4()?;
        let bias = self.bias.as_ref().map(|b| b.data.as_slice());

        let mut output = Tensor::zeros(output_shape.dims());
        let mut y = output.view4_mut()?;
        let (batch, num_output, height_out, width_out) = y.dim();

        for n in 0..batch {
            for o in 0..num_output {
                let c = o / multiplier;
                for oh in 0..height_out {
                    for ow in 0..width_out {
                        let mut sum = bias.map_or(T::zero(), |b| b[o]);
                        for kh in 0..kernel_h {
                            let Some(ih) = tap(oh, stride_h, kh, pad_h, height) else {
                                continue;
                            };
                            for kw in 0..kernel_w {
                                if let Some(iw) = tap(ow, stride_w, kw, pad_w, width) {
                                    sum = sum + x[[n, c, ih, iw]] * w[[o, 0, kh, kw]];
                                }
                            }
                        }
                        y[[n, o, oh, ow]] = sum;
                    }
                }
            }
        }
        Ok(output)
    }

    /// Accumulate weight and bias gradients for one input and return the
    /// input gradient when `propagate_down` is set
    pub fn backward_host(
        &mut self,
        input: &Tensor<T>,
        output_grad: &Tensor<T>,
        propagate_down: bool,
    ) -> Result<Option<Tensor<T>>> {
        self.check_input("depthwise_backward", input)?;
        if Some(output_grad.shape()) != self.output_shape.as_ref() {
            return Err(TensorError::shape_mismatch(
                "depthwise_backward",
                &format!("{:?}", self.output_shape.as_ref().map(Shape::to_vec)),
                &output_grad.shape().to_string(),
            ));
        }
        let (kernel_h, kernel_w) = self.geometry.kernel;
        let (pad_h, pad_w) = self.geometry.pad;
        let (stride_h, stride_w) = self.geometry.stride;
        let multiplier = self.geometry.multiplier;

        let x = input.view4()?;
        let (_, _, height, width) = x.dim();
        let dy = output_grad.view4()?;
        let (batch, num_output, height_out, width_out) = dy.dim();

        if let Some(bias) = self.bias.as_mut() {
            let db = bias.grad.as_slice_mut();
            for n in 0..batch {
                for o in 0..num_output {
                    for oh in 0..height_out {
                        for ow in 0..width_out {
                            db[o] = db[o] + dy[[n, o, oh, ow]];
                        }
                    }
                }
            }
        }

        let mut input_grad = propagate_down.then(|| Tensor::zeros(input.shape().dims()));
        let w = self.weight.data.view4()?;
        let mut dw = self.weight.grad.view4_mut()?;
        let mut dx = match input_grad.as_mut() {
            Some(t) => Some(t.view4_mut()?),
            None => None,
        };

        for n in 0..batch {
            for o in 0..num_output {
                let c = o / multiplier;
                for oh in 0..height_out {
                    for ow in 0..width_out {
                        let g = dy[[n, o, oh, ow]];
                        for kh in 0..kernel_h {
                            let Some(ih) = tap(oh, stride_h, kh, pad_h, height) else {
                                continue;
                            };
                            for kw in 0..kernel_w {
                                let Some(iw) = tap(ow, stride_w, kw, pad_w, width) else {
                                    continue;
                                };
                                dw[[o, 0, kh, kw]] = dw[[o, 0, kh, kw]] + g * x[[n, c, ih, iw]];
                                if let Some(dx) = dx.as_mut() {
                                    dx[[n, c, ih, iw]] = dx[[n, c, ih, iw]] + g * w[[o, 0, kh, kw]];
                                }
                            }
                        }
                    }
                }
            }
        }
        drop(dx);
        Ok(input_grad)
    }
}

/// Input coordinate read by output position `o` at kernel tap `k`, if not in the padding
#[inline]
fn tap(o: usize, stride: usize, k: usize, pad: usize, size: usize) -> Option<usize> {
    let pos = o * stride + k;
    (pos >= pad && pos - pad < size).then(|| pos - pad)
}

impl<T: ConvElement> Layer<T> for DepthwiseConv2D<T> {
    fn layer_type(&self) -> LayerType {
        LayerType::DepthwiseConv2D
    }

    fn reshape(&mut self, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        let output = self.compute_output_shape(input_shapes)?;
        Ok(vec![output; input_shapes.len()])
    }

    fn forward(&mut self, inputs: &[&Tensor<T>]) -> Result<Vec<Tensor<T>>> {
        inputs.iter().map(|x| self.forward_host(x)).collect()
    }

    fn backward(
        &mut self,
        inputs: &[&Tensor<T>],
        output_grads: &[&Tensor<T>],
        propagate_down: bool,
    ) -> Result<Vec<Option<Tensor<T>>>> {
        if inputs.len() != output_grads.len() {
            return Err(TensorError::invalid_argument_op(
                "depthwise_backward",
                "one output gradient is required per input",
            ));
        }
        inputs
            .iter()
            .zip(output_grads)
            .map(|(x, dy)| self.backward_host(x, dy, propagate_down))
            .collect()
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        let mut params = vec![&self.weight];
        if let Some(ref bias) = self.bias {
            params.push(bias);
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        let mut params = vec![&mut self.weight];
        if let Some(ref mut bias) = self.bias {
            params.push(bias);
        }
        params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
