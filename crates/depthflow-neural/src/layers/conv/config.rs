//! Convolution layer configuration
//!
//! [`ConvolutionParam`] is what a network definition hands to a layer: every
//! field is optional so that a missing required value is reported as a
//! configuration error at setup time instead of being silently defaulted.
//! [`ConvolutionParam::resolve`] validates it against the input channel count
//! and produces the [`ConvGeometry`] the layers work with.

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};
use depthflow_core::gpu::DEFAULT_WORKSPACE_LIMIT;
use depthflow_core::{Result, TensorError};

/// Number of execution streams an accelerated layer creates: bias gradient,
/// filter gradient and input gradient each get their own.
pub const DEFAULT_STREAM_COUNT: usize = 3;

/// Convolution parameters as written in a network definition
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvolutionParam {
    pub num_output: Option<usize>,
    /// Square kernel shorthand, used when `kernel_h`/`kernel_w` are absent
    pub kernel_size: Option<usize>,
    pub kernel_h: Option<usize>,
    pub kernel_w: Option<usize>,
    pub pad: Option<usize>,
    pub pad_h: Option<usize>,
    pub pad_w: Option<usize>,
    pub stride: Option<usize>,
    pub stride_h: Option<usize>,
    pub stride_w: Option<usize>,
    pub group: Option<usize>,
    pub bias_term: Option<bool>,
    /// Filters per input channel; derived from `num_output / channels` when absent
    pub multiplier: Option<usize>,
}

impl ConvolutionParam {
    /// Depthwise parameters with one filter per channel times `multiplier`
    /// and one group per input channel
    pub fn depthwise(channels: usize, multiplier: usize, kernel: usize) -> Self {
        Self {
            num_output: Some(channels * multiplier),
            kernel_size: Some(kernel),
            group: Some(channels),
            multiplier: Some(multiplier),
            ..Self::default()
        }
    }

    pub fn with_pad(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad_h = Some(pad_h);
        self.pad_w = Some(pad_w);
        self
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = Some(stride_h);
        self.stride_w = Some(stride_w);
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_bias(mut self, bias_term: bool) -> Self {
        self.bias_term = Some(bias_term);
        self
    }

    /// Validate against `channels` input channels
    pub fn resolve(&self, channels: usize) -> Result<ConvGeometry> {
        const OP: &str = "resolve_convolution_param";
        let required = |value: Option<usize>, name: &str| {
            value.ok_or_else(|| {
                TensorError::invalid_configuration(OP, &format!("'{name}' is required"))
            })
        };

        let num_output = required(self.num_output, "num_output")?;
        let group = required(self.group, "group")?;
        let kernel_h = required(self.kernel_h.or(self.kernel_size), "kernel_h")?;
        let kernel_w = required(self.kernel_w.or(self.kernel_size), "kernel_w")?;
        let pad_h = self.pad_h.or(self.pad).unwrap_or(0);
        let pad_w = self.pad_w.or(self.pad).unwrap_or(0);
        let stride_h = self.stride_h.or(self.stride).unwrap_or(1);
        let stride_w = self.stride_w.or(self.stride).unwrap_or(1);

        for (name, value) in [
            ("num_output", num_output),
            ("group", group),
            ("kernel_h", kernel_h),
            ("kernel_w", kernel_w),
            ("stride_h", stride_h),
            ("stride_w", stride_w),
        ] {
            if value == 0 {
                return Err(TensorError::invalid_configuration(
                    OP,
                    &format!("'{name}' must be positive"),
                ));
            }
        }
        if channels == 0 {
            return Err(TensorError::invalid_configuration(
                OP,
                "input must have at least one channel",
            ));
        }
        if channels % group != 0 {
            return Err(TensorError::invalid_configuration(
                OP,
                &format!("input channels ({channels}) must be divisible by groups ({group})"),
            ));
        }
        if num_output % group != 0 {
            return Err(TensorError::invalid_configuration(
                OP,
                &format!("num_output ({num_output}) must be divisible by groups ({group})"),
            ));
        }
        if num_output % channels != 0 {
            return Err(TensorError::invalid_configuration(
                OP,
                &format!(
                    "num_output ({num_output}) must be a multiple of input channels ({channels})"
                ),
            ));
        }
        let multiplier = num_output / channels;
        if let Some(declared) = self.multiplier {
            if declared != multiplier {
                return Err(TensorError::invalid_configuration(
                    OP,
                    &format!(
                        "multiplier {declared} disagrees with num_output / channels = {multiplier}"
                    ),
                ));
            }
        }

        Ok(ConvGeometry {
            channels,
            num_output,
            multiplier,
            group,
            kernel: (kernel_h, kernel_w),
            pad: (pad_h, pad_w),
            stride: (stride_h, stride_w),
            bias_term: self.bias_term.unwrap_or(true),
        })
    }
}

/// Validated geometry of a depthwise convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub channels: usize,
    pub num_output: usize,
    pub multiplier: usize,
    pub group: usize,
    pub kernel: (usize, usize),
    pub pad: (usize, usize),
    pub stride: (usize, usize),
    pub bias_term: bool,
}

impl ConvGeometry {
    pub fn kernel_dim(&self) -> usize {
        self.kernel.0 * self.kernel.1
    }

    pub fn channels_per_group(&self) -> usize {
        self.channels / self.group
    }

    pub fn outputs_per_group(&self) -> usize {
        self.num_output / self.group
    }

    /// Output spatial extent for an `height x width` input
    pub fn output_hw(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let padded_h = height + 2 * self.pad.0;
        let padded_w = width + 2 * self.pad.1;
        if padded_h < self.kernel.0 || padded_w < self.kernel.1 {
            return Err(TensorError::invalid_shape(
                "output_hw",
                "kernel is larger than the padded input",
                &[height, width],
            ));
        }
        Ok((
            (padded_h - self.kernel.0) / self.stride.0 + 1,
            (padded_w - self.kernel.1) / self.stride.1 + 1,
        ))
    }
}

/// Backend tuning knobs of an accelerated convolution layer
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratedConvConfig {
    /// Ceiling handed to every algorithm query
    pub workspace_limit_bytes: usize,
    pub stream_count: usize,
}

impl Default for AcceleratedConvConfig {
    fn default() -> Self {
        Self {
            workspace_limit_bytes: DEFAULT_WORKSPACE_LIMIT,
            stream_count: DEFAULT_STREAM_COUNT,
        }
    }
}

impl AcceleratedConvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream_count == 0 {
            return Err(TensorError::invalid_configuration(
                "accelerated_conv_config",
                "stream_count must be at least 1",
            ));
        }
        Ok(())
    }
}
