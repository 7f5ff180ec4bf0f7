//! Compact <-> grouped weight layout
//!
//! A depthwise layer stores one `[KH, KW]` filter per output channel. The
//! backend only understands grouped convolution, where each output channel
//! owns a full `[channels_per_group, KH, KW]` filter. Output channel `i`
//! reads input channel `i / multiplier`, which sits in slot
//! `(i / multiplier) % channels_per_group` of its group; every other slot is
//! structurally zero and masked out.

use crate::layers::conv::config::ConvGeometry;
use depthflow_core::{ConvElement, Parameter, Result, Tensor, TensorError};

/// Index arithmetic between the two layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTranslator {
    num_output: usize,
    channels_per_group: usize,
    multiplier: usize,
    kernel: (usize, usize),
}

impl LayoutTranslator {
    pub fn new(geometry: &ConvGeometry) -> Self {
        Self {
            num_output: geometry.num_output,
            channels_per_group: geometry.channels_per_group(),
            multiplier: geometry.multiplier,
            kernel: geometry.kernel,
        }
    }

    pub fn kernel_dim(&self) -> usize {
        self.kernel.0 * self.kernel.1
    }

    pub fn channels_per_group(&self) -> usize {
        self.channels_per_group
    }

    /// Channel slot inside its group that output channel `i` reads
    #[inline]
    pub fn channel_slot(&self, i: usize) -> usize {
        (i / self.multiplier) % self.channels_per_group
    }

    /// Offset of tap `k` of output channel `i` in the grouped layout
    #[inline]
    pub fn backend_index(&self, i: usize, k: usize) -> usize {
        (i * self.channels_per_group + self.channel_slot(i)) * self.kernel_dim() + k
    }

    /// Offset of tap `k` of output channel `i` in the compact layout
    #[inline]
    pub fn compact_index(&self, i: usize, k: usize) -> usize {
        i * self.kernel_dim() + k
    }

    pub fn compact_shape(&self) -> [usize; 4] {
        [self.num_output, 1, self.kernel.0, self.kernel.1]
    }

    /// `[num_output, channels_per_group, KH, KW]`
    pub fn grouped_shape(&self) -> [usize; 4] {
        [
            self.num_output,
            self.channels_per_group,
            self.kernel.0,
            self.kernel.1,
        ]
    }

    fn check_compact<T: ConvElement>(&self, operation: &str, compact: &Parameter<T>) -> Result<()> {
        let expected = self.compact_shape();
        if compact.shape().dims() != expected {
            return Err(TensorError::shape_mismatch(
                operation,
                &format!("{expected:?}"),
                &compact.shape().to_string(),
            ));
        }
        Ok(())
    }

    /// Scatter compact data and gradient into `grouped` and rebuild its mask.
    ///
    /// Every grouped entry not owned by a compact tap ends up zero.
    pub fn to_backend_layout<T: ConvElement>(
        &self,
        compact: &Parameter<T>,
        grouped: &mut GroupedWeight<T>,
    ) -> Result<()> {
        self.check_compact("to_backend_layout", compact)?;
        grouped.ensure_shape(self.grouped_shape());

        let src_data = compact.data.as_slice();
        let src_grad = compact.grad.as_slice();
        let GroupedWeight { param, mask } = grouped;
        param.data.fill(T::zero());
        param.grad.fill(T::zero());
        mask.fill(T::zero());
        let data = param.data.as_slice_mut();
        let grad = param.grad.as_slice_mut();
        let mask = mask.as_slice_mut();

        for i in 0..self.num_output {
            for k in 0..self.kernel_dim() {
                let idx = self.backend_index(i, k);
                let src = self.compact_index(i, k);
                data[idx] = src_data[src];
                grad[idx] = src_grad[src];
                mask[idx] = T::one();
            }
        }
        Ok(())
    }

    /// Gather the owned taps of `grouped` back into `compact`.
    ///
    /// Exact inverse of [`Self::to_backend_layout`] on the positions it writes.
    pub fn to_compact_layout<T: ConvElement>(
        &self,
        grouped: &GroupedWeight<T>,
        compact: &mut Parameter<T>,
    ) -> Result<()> {
        self.check_compact("to_compact_layout", compact)?;
        if grouped.param.shape().dims() != self.grouped_shape() {
            return Err(TensorError::shape_mismatch(
                "to_compact_layout",
                &format!("{:?}", self.grouped_shape()),
                &grouped.param.shape().to_string(),
            ));
        }

        let src_data = grouped.param.data.as_slice();
        let src_grad = grouped.param.grad.as_slice();
        let Parameter { data, grad } = compact;
        let data = data.as_slice_mut();
        let grad = grad.as_slice_mut();

        for i in 0..self.num_output {
            for k in 0..self.kernel_dim() {
                let idx = self.backend_index(i, k);
                let dst = self.compact_index(i, k);
                data[dst] = src_data[idx];
                grad[dst] = src_grad[idx];
            }
        }
        Ok(())
    }
}

/// Weight in the backend's grouped layout together with its validity mask
#[derive(Debug, Clone)]
pub struct GroupedWeight<T> {
    param: Parameter<T>,
    mask: Tensor<T>,
}

impl<T: ConvElement> GroupedWeight<T> {
    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            param: Parameter::zeros(&shape),
            mask: Tensor::zeros(&shape),
        }
    }

    fn ensure_shape(&mut self, shape: [usize; 4]) {
        if self.param.shape().dims() != shape {
            self.param.reshape(&shape);
            self.mask.reshape(&shape);
        }
    }

    pub fn param(&self) -> &Parameter<T> {
        &self.param
    }

    pub fn param_mut(&mut self) -> &mut Parameter<T> {
        &mut self.param
    }

    /// 1 at every position a compact tap maps to, 0 elsewhere
    pub fn mask(&self) -> &Tensor<T> {
        &self.mask
    }

    /// Zero the gradient at every masked-out position
    pub fn mask_gradient(&mut self) {
        for (g, &m) in self
            .param
            .grad
            .as_slice_mut()
            .iter_mut()
            .zip(self.mask.as_slice())
        {
            *g = *g * m;
        }
    }

    pub fn zero_grad(&mut self) {
        self.param.zero_grad();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::config::ConvolutionParam;

    fn translator(channels: usize, multiplier: usize, group: usize, kernel: usize) -> LayoutTranslator {
        let geometry = ConvolutionParam::depthwise(channels, multiplier, kernel)
            .with_group(group)
            .resolve(channels)
            .unwrap();
        LayoutTranslator::new(&geometry)
    }

    fn compact(translator: &LayoutTranslator) -> Parameter<f32> {
        let shape = translator.compact_shape();
        let len: usize = shape.iter().product();
        let data = (0..len).map(|v| v as f32 * 0.5 - 3.0).collect();
        let grad = (0..len).map(|v| 1.0 / (v as f32 + 1.0)).collect();
        Parameter {
            data: Tensor::from_vec(data, &shape).unwrap(),
            grad: Tensor::from_vec(grad, &shape).unwrap(),
        }
    }

    #[test]
    fn test_pure_depthwise_indices_coincide() {
        let t = translator(4, 1, 4, 3);
        assert_eq!(t.channels_per_group(), 1);
        assert_eq!(t.grouped_shape(), [4, 1, 3, 3]);
        for i in 0..4 {
            assert_eq!(t.channel_slot(i), 0);
            for k in 0..9 {
                assert_eq!(t.backend_index(i, k), t.compact_index(i, k));
            }
        }
        assert_eq!(t.backend_index(2, 0), 18);
        assert_eq!(t.compact_index(2, 0), 18);
    }

    #[test]
    fn test_multiplier_slot_selection() {
        // 4 channels in one group, two filters per channel
        let t = translator(4, 2, 1, 3);
        assert_eq!(t.channels_per_group(), 4);
        assert_eq!(t.channel_slot(5), 2);
        assert_eq!(t.backend_index(5, 0), (5 * 4 + 2) * 9);
        assert_eq!(t.compact_index(5, 0), 5 * 9);
    }

    #[test]
    fn test_round_trip_is_exact() {
        for (channels, multiplier, group) in [(4, 1, 4), (4, 2, 1), (6, 3, 2), (3, 2, 3)] {
            let t = translator(channels, multiplier, group, 3);
            let source = compact(&t);
            let mut grouped = GroupedWeight::zeros(t.grouped_shape());
            t.to_backend_layout(&source, &mut grouped).unwrap();

            let mut restored = Parameter::zeros(&t.compact_shape());
            t.to_compact_layout(&grouped, &mut restored).unwrap();
            assert_eq!(restored.data.as_slice(), source.data.as_slice());
            assert_eq!(restored.grad.as_slice(), source.grad.as_slice());
        }
    }

    #[test]
    fn test_mask_marks_one_slot_per_output() {
        let t = translator(4, 2, 1, 2);
        let mut grouped = GroupedWeight::zeros(t.grouped_shape());
        // stale values must be cleared by the conversion
        grouped.param_mut().data.fill(7.0);
        t.to_backend_layout(&compact(&t), &mut grouped).unwrap();

        let mask = grouped.mask().as_slice();
        let data = grouped.param().data.as_slice();
        let kd = t.kernel_dim();
        let filter_len = t.channels_per_group() * kd;
        for i in 0..8 {
            let ones = mask[i * filter_len..(i + 1) * filter_len]
                .iter()
                .filter(|&&m| m == 1.0)
                .count();
            assert_eq!(ones, kd);
            for k in 0..kd {
                assert_eq!(mask[t.backend_index(i, k)], 1.0);
            }
        }
        for (m, d) in mask.iter().zip(data) {
            if *m == 0.0 {
                assert_eq!(*d, 0.0);
            }
        }
    }

    #[test]
    fn test_mask_gradient_clears_leakage() {
        let t = translator(2, 1, 1, 1);
        let mut grouped = GroupedWeight::zeros(t.grouped_shape());
        t.to_backend_layout(&compact(&t), &mut grouped).unwrap();
        grouped.param_mut().grad.fill(1.0);
        grouped.mask_gradient();
        assert_eq!(grouped.param().grad.as_slice(), &[1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let t = translator(2, 1, 2, 3);
        let wrong = Parameter::<f32>::zeros(&[2, 1, 2, 2]);
        let mut grouped = GroupedWeight::zeros(t.grouped_shape());
        assert!(t.to_backend_layout(&wrong, &mut grouped).is_err());
    }
}
