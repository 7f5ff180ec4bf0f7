//! Tensor, filter and convolution descriptors
//!
//! Descriptors carry no data. They tell the backend how to interpret the raw
//! buffers handed to it: a four-dimensional NCHW view with explicit strides,
//! a dense `[K, C, H, W]` filter, and the padding/stride of a 2D
//! cross-correlation.

use crate::{DataType, Result, TensorError};

/// Tensor formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorFormat {
    NCHW,
}

/// 4D tensor descriptor with explicit strides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    data_type: DataType,
    format: TensorFormat,
    /// N, C, H, W
    dims: [usize; 4],
    strides: [usize; 4],
}

impl TensorDescriptor {
    /// Unset descriptor; dimensions are all zero until one of the setters runs
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            format: TensorFormat::NCHW,
            dims: [0; 4],
            strides: [0; 4],
        }
    }

    /// Describe a packed NCHW tensor
    pub fn set_4d(&mut self, n: usize, c: usize, h: usize, w: usize) {
        self.set_4d_ex(n, c, h, w, c * h * w, h * w, w, 1);
    }

    /// Describe a strided NCHW view, e.g. one channel group of a larger tensor
    #[allow(clippy::too_many_arguments)]
    pub fn set_4d_ex(
        &mut self,
        n: usize,
        c: usize,
        h: usize,
        w: usize,
        n_stride: usize,
        c_stride: usize,
        h_stride: usize,
        w_stride: usize,
    ) {
        self.dims = [n, c, h, w];
        self.strides = [n_stride, c_stride, h_stride, w_stride];
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn format(&self) -> TensorFormat {
        self.format
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn strides(&self) -> [usize; 4] {
        self.strides
    }

    pub fn is_set(&self) -> bool {
        self.dims.iter().all(|&d| d > 0)
    }

    /// Linear offset of element `(n, c, h, w)`
    #[inline]
    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        n * self.strides[0] + c * self.strides[1] + h * self.strides[2] + w * self.strides[3]
    }

    /// Minimum buffer length, in elements, that covers every addressed element
    pub fn span(&self) -> usize {
        if !self.is_set() {
            return 0;
        }
        let [n, c, h, w] = self.dims;
        self.offset(n - 1, c - 1, h - 1, w - 1) + 1
    }
}

/// Dense `[K, C, H, W]` filter descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDescriptor {
    data_type: DataType,
    dims: [usize; 4],
}

impl FilterDescriptor {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            dims: [0; 4],
        }
    }

    pub fn set_4d(&mut self, k: usize, c: usize, h: usize, w: usize) {
        self.dims = [k, c, h, w];
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn offset(&self, k: usize, c: usize, h: usize, w: usize) -> usize {
        let [_, cs, hs, ws] = self.dims;
        ((k * cs + c) * hs + h) * ws + w
    }
}

/// Convolution modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolutionMode {
    Convolution,
    CrossCorrelation,
}

/// 2D convolution descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionDescriptor {
    padding: [usize; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
    mode: ConvolutionMode,
    compute_type: DataType,
}

impl ConvolutionDescriptor {
    pub fn new(compute_type: DataType) -> Self {
        Self {
            padding: [0; 2],
            stride: [1; 2],
            dilation: [1; 2],
            mode: ConvolutionMode::CrossCorrelation,
            compute_type,
        }
    }

    /// Configure a 2D cross-correlation with unit dilation
    pub fn set_2d(&mut self, pad_h: usize, pad_w: usize, stride_h: usize, stride_w: usize) {
        self.padding = [pad_h, pad_w];
        self.stride = [stride_h, stride_w];
        self.dilation = [1, 1];
        self.mode = ConvolutionMode::CrossCorrelation;
    }

    pub fn padding(&self) -> [usize; 2] {
        self.padding
    }

    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    pub fn dilation(&self) -> [usize; 2] {
        self.dilation
    }

    pub fn mode(&self) -> ConvolutionMode {
        self.mode
    }

    pub fn compute_type(&self) -> DataType {
        self.compute_type
    }

    /// Output dimensions produced by convolving `input` with `filter`
    pub fn forward_output_dims(
        &self,
        input: &TensorDescriptor,
        filter: &FilterDescriptor,
    ) -> Result<[usize; 4]> {
        let [n, c, h, w] = input.dims();
        let [k, fc, kh, kw] = filter.dims();
        if c != fc {
            return Err(TensorError::shape_mismatch(
                "forward_output_dims",
                &format!("{fc} input channels per filter"),
                &format!("{c} channels in input descriptor"),
            ));
        }
        let extent_h = self.dilation[0] * (kh.max(1) - 1) + 1;
        let extent_w = self.dilation[1] * (kw.max(1) - 1) + 1;
        let padded_h = h + 2 * self.padding[0];
        let padded_w = w + 2 * self.padding[1];
        if padded_h < extent_h || padded_w < extent_w || self.stride.contains(&0) {
            return Err(TensorError::invalid_shape(
                "forward_output_dims",
                "kernel does not fit the padded input",
                &[n, c, h, w],
            ));
        }
        Ok([
            n,
            k,
            (padded_h - extent_h) / self.stride[0] + 1,
            (padded_w - extent_w) / self.stride[1] + 1,
        ])
    }
}
