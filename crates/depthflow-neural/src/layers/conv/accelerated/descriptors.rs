//! Backend descriptors of an accelerated convolution
//!
//! One input/output/convolution triple exists per bound input; the filter
//! descriptor and the optional bias descriptor are shared. All channel
//! counts are per group: the engine issues one backend call per group with
//! pointers offset into the full tensors.

use depthflow_core::gpu::{
    ConvBackend, ConvProblem, ConvolutionDescriptor, FilterDescriptor, TensorDescriptor,
};
use depthflow_core::{DataType, Result, TensorError};

/// Everything needed to (re)derive the descriptors of one shape configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorGeometry {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub num_output: usize,
    pub height_out: usize,
    pub width_out: usize,
    pub group: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub spatial_axes: usize,
}

impl DescriptorGeometry {
    /// Elements between consecutive groups of the input
    pub fn input_group_offset(&self) -> usize {
        self.channels / self.group * self.height * self.width
    }

    /// Elements between consecutive groups of the output
    pub fn output_group_offset(&self) -> usize {
        self.num_output / self.group * self.height_out * self.width_out
    }

    /// Elements between consecutive groups of the grouped weight
    pub fn weight_group_offset(&self) -> usize {
        self.num_output / self.group * (self.channels / self.group) * self.kernel_h * self.kernel_w
    }

    /// Elements between consecutive groups of the bias
    pub fn bias_group_offset(&self) -> usize {
        self.num_output / self.group
    }
}

/// Descriptors belonging to one bound input
#[derive(Debug, Clone)]
pub struct InputDescriptors {
    pub input: TensorDescriptor,
    pub output: TensorDescriptor,
    pub conv: ConvolutionDescriptor,
}

/// All descriptors owned by one accelerated layer
#[derive(Debug)]
pub struct DescriptorSet {
    data_type: DataType,
    inputs: Vec<InputDescriptors>,
    filter: FilterDescriptor,
    bias: Option<TensorDescriptor>,
    geometry: Option<DescriptorGeometry>,
    epoch: u64,
}

impl DescriptorSet {
    /// Create the shared filter descriptor and, if requested, the bias descriptor.
    /// Per-input descriptors are created by [`Self::rebuild`].
    pub fn create<B: ConvBackend>(backend: &B, data_type: DataType, bias_term: bool) -> Result<Self> {
        let filter = backend.create_filter_descriptor(data_type)?;
        let bias = if bias_term {
            match backend.create_tensor_descriptor(data_type) {
                Ok(desc) => Some(desc),
                Err(e) => {
                    backend.destroy_filter_descriptor(filter);
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok(Self {
            data_type,
            inputs: Vec::new(),
            filter,
            bias,
            geometry: None,
            epoch: 0,
        })
    }

    /// Re-derive every descriptor for `num_inputs` inputs of `geometry`.
    ///
    /// Any plan computed against an earlier epoch is stale afterwards.
    pub fn rebuild<B: ConvBackend>(
        &mut self,
        backend: &B,
        num_inputs: usize,
        geometry: &DescriptorGeometry,
    ) -> Result<u64> {
        const OP: &str = "rebuild_descriptors";
        if geometry.spatial_axes != 2 {
            return Err(TensorError::invalid_configuration(
                OP,
                &format!(
                    "only 2D convolution is supported, got {} spatial axes",
                    geometry.spatial_axes
                ),
            ));
        }
        if geometry.group == 0
            || geometry.channels % geometry.group != 0
            || geometry.num_output % geometry.group != 0
        {
            return Err(TensorError::invalid_configuration(
                OP,
                &format!(
                    "{} input and {} output channels cannot be split into {} groups",
                    geometry.channels, geometry.num_output, geometry.group
                ),
            ));
        }

        self.geometry = None;
        while self.inputs.len() > num_inputs {
            if let Some(desc) = self.inputs.pop() {
                Self::destroy_input(backend, desc);
            }
        }
        while self.inputs.len() < num_inputs {
            let desc = Self::create_input(backend, self.data_type)?;
            self.inputs.push(desc);
        }

        let g = geometry;
        let channels_per_group = g.channels / g.group;
        let outputs_per_group = g.num_output / g.group;
        self.filter
            .set_4d(outputs_per_group, channels_per_group, g.kernel_h, g.kernel_w);
        for desc in &mut self.inputs {
            desc.input.set_4d_ex(
                g.batch,
                channels_per_group,
                g.height,
                g.width,
                g.channels * g.height * g.width,
                g.height * g.width,
                g.width,
                1,
            );
            desc.output.set_4d_ex(
                g.batch,
                outputs_per_group,
                g.height_out,
                g.width_out,
                g.num_output * g.height_out * g.width_out,
                g.height_out * g.width_out,
                g.width_out,
                1,
            );
            desc.conv.set_2d(g.pad_h, g.pad_w, g.stride_h, g.stride_w);
        }
        if let Some(bias) = self.bias.as_mut() {
            bias.set_4d(1, outputs_per_group, 1, 1);
        }

        self.geometry = Some(*geometry);
        self.epoch += 1;
        log::trace!(
            "rebuilt descriptors for {num_inputs} input(s): input {:?}, output {:?}, filter {:?}, epoch {}",
            self.inputs.first().map(|d| d.input.dims()),
            self.inputs.first().map(|d| d.output.dims()),
            self.filter.dims(),
            self.epoch
        );
        Ok(self.epoch)
    }

    fn create_input<B: ConvBackend>(backend: &B, data_type: DataType) -> Result<InputDescriptors> {
        let input = backend.create_tensor_descriptor(data_type)?;
        let output = match backend.create_tensor_descriptor(data_type) {
            Ok(desc) => desc,
            Err(e) => {
                backend.destroy_tensor_descriptor(input);
                return Err(e);
            }
        };
        let conv = match backend.create_convolution_descriptor(data_type) {
            Ok(desc) => desc,
            Err(e) => {
                backend.destroy_tensor_descriptor(input);
                backend.destroy_tensor_descriptor(output);
                return Err(e);
            }
        };
        Ok(InputDescriptors {
            input,
            output,
            conv,
        })
    }

    fn destroy_input<B: ConvBackend>(backend: &B, desc: InputDescriptors) {
        backend.destroy_tensor_descriptor(desc.input);
        backend.destroy_tensor_descriptor(desc.output);
        backend.destroy_convolution_descriptor(desc.conv);
    }

    /// Hand every descriptor back to the backend
    pub fn release<B: ConvBackend>(self, backend: &B) {
        for desc in self.inputs {
            Self::destroy_input(backend, desc);
        }
        backend.destroy_filter_descriptor(self.filter);
        if let Some(bias) = self.bias {
            backend.destroy_tensor_descriptor(bias);
        }
    }

    /// Number of bound inputs with descriptors
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Geometry of the last successful rebuild
    pub fn geometry(&self) -> Option<&DescriptorGeometry> {
        self.geometry.as_ref()
    }

    pub fn input(&self, index: usize) -> Option<&InputDescriptors> {
        self.inputs.get(index)
    }

    pub fn filter(&self) -> &FilterDescriptor {
        &self.filter
    }

    pub fn bias(&self) -> Option<&TensorDescriptor> {
        self.bias.as_ref()
    }

    /// Convolution problem of input `index`
    pub fn problem(&self, index: usize) -> Result<ConvProblem<'_>> {
        let desc = self.inputs.get(index).ok_or_else(|| {
            TensorError::invalid_argument_op(
                "descriptor_problem",
                &format!("input {index} is not bound ({} bound)", self.inputs.len()),
            )
        })?;
        Ok(ConvProblem {
            input: &desc.input,
            filter: &self.filter,
            conv: &desc.conv,
            output: &desc.output,
        })
    }
}
