//! Stream-parallel execution of the grouped convolution
//!
//! Each backward quantity goes to its own stream so the three passes of one
//! backward step can overlap on a device. Forward work shares the bias
//! stream. Every pass loops over the groups, offsetting the tensor slices by
//! one group's worth of elements per iteration.

use super::descriptors::{DescriptorGeometry, DescriptorSet};
use super::planner::{AlgorithmChoice, ScratchPool};
use depthflow_core::gpu::ConvBackend;
use depthflow_core::{ConvElement, Result, TensorError};

/// Logical purpose of an execution stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// Bias gradient; forward work is issued here as well
    Bias,
    Filter,
    Data,
}

impl StreamRole {
    pub fn index(self, stream_count: usize) -> usize {
        let slot = match self {
            StreamRole::Bias => 0,
            StreamRole::Filter => 1,
            StreamRole::Data => 2,
        };
        slot % stream_count.max(1)
    }
}

/// Streams and the library handles bound to them
pub struct StreamSet<B: ConvBackend> {
    streams: Vec<B::Stream>,
    handles: Vec<B::Handle>,
}

impl<B: ConvBackend> StreamSet<B> {
    /// Create `count` streams with one handle each.
    /// Anything created before a failure is released again.
    pub fn create(backend: &B, count: usize) -> Result<Self> {
        let mut set = Self {
            streams: Vec::with_capacity(count),
            handles: Vec::with_capacity(count),
        };
        for _ in 0..count {
            let stream = match backend.create_stream() {
                Ok(stream) => stream,
                Err(e) => {
                    set.release(backend);
                    return Err(e);
                }
            };
            match backend.create_handle(&stream) {
                Ok(handle) => {
                    set.streams.push(stream);
                    set.handles.push(handle);
                }
                Err(e) => {
                    backend.destroy_stream(stream);
                    set.release(backend);
                    return Err(e);
                }
            }
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn handle(&self, role: StreamRole) -> Result<&B::Handle> {
        self.handles.get(role.index(self.len())).ok_or_else(|| {
            TensorError::invalid_lifecycle("stream_handle", "no execution streams")
        })
    }

    pub fn stream(&self, index: usize) -> Option<&B::Stream> {
        self.streams.get(index)
    }

    /// Block until every stream is idle
    pub fn synchronize(&self, backend: &B) -> Result<()> {
        self.streams
            .iter()
            .try_for_each(|stream| backend.synchronize(stream))
    }

    pub fn release(self, backend: &B) {
        for handle in self.handles {
            backend.destroy_handle(handle);
        }
        for stream in self.streams {
            backend.destroy_stream(stream);
        }
    }
}

/// Issues backend work for one configured layer
pub struct ExecutionEngine<'a, B: ConvBackend> {
    backend: &'a B,
    streams: &'a StreamSet<B>,
    descriptors: &'a DescriptorSet,
    geometry: DescriptorGeometry,
}

impl<'a, B: ConvBackend> ExecutionEngine<'a, B> {
    pub fn new(
        backend: &'a B,
        streams: &'a StreamSet<B>,
        descriptors: &'a DescriptorSet,
    ) -> Result<Self> {
        let geometry = *descriptors.geometry().ok_or_else(|| {
            TensorError::invalid_lifecycle("execution_engine", "descriptors have not been built")
        })?;
        Ok(Self {
            backend,
            streams,
            descriptors,
            geometry,
        })
    }

    fn check_len(operation: &str, what: &str, len: usize, expected: usize) -> Result<()> {
        if len != expected {
            return Err(TensorError::shape_mismatch(
                operation,
                &format!("{expected} {what} elements"),
                &format!("{len} {what} elements"),
            ));
        }
        Ok(())
    }

    fn input_len(&self) -> usize {
        let g = &self.geometry;
        g.batch * g.channels * g.height * g.width
    }

    fn output_len(&self) -> usize {
        let g = &self.geometry;
        g.batch * g.num_output * g.height_out * g.width_out
    }

    fn weight_len(&self) -> usize {
        self.geometry.weight_group_offset() * self.geometry.group
    }

    fn stream_index(&self, role: StreamRole) -> usize {
        role.index(self.streams.len())
    }

    /// `y = conv(x, w) + bias` for input `index`
    #[allow(clippy::too_many_arguments)]
    pub fn forward<T: ConvElement>(
        &self,
        index: usize,
        plan: &AlgorithmChoice,
        pool: &mut ScratchPool<B::Workspace>,
        x: &[T],
        w: &[T],
        bias: Option<&[T]>,
        y: &mut [T],
    ) -> Result<()> {
        const OP: &str = "accelerated_forward";
        Self::check_len(OP, "input", x.len(), self.input_len())?;
        Self::check_len(OP, "weight", w.len(), self.weight_len())?;
        Self::check_len(OP, "output", y.len(), self.output_len())?;
        let problem = self.descriptors.problem(index)?;
        let handle = self.streams.handle(StreamRole::Bias)?;
        let stream = self.stream_index(StreamRole::Bias);
        let g = &self.geometry;

        for group in 0..g.group {
            let x_g = &x[group * g.input_group_offset()..];
            let w_g = &w[group * g.weight_group_offset()..];
            let y_g = &mut y[group * g.output_group_offset()..];
            let workspace = pool.scratch(stream, plan.forward_workspace)?;
            self.backend.convolution_forward(
                handle,
                problem,
                plan.forward,
                workspace,
                x_g,
                w_g,
                y_g,
                false,
            )?;

            if let (Some(bias), Some(bias_desc)) = (bias, self.descriptors.bias()) {
                self.backend.add_bias(
                    handle,
                    bias_desc,
                    &bias[group * g.bias_group_offset()..],
                    problem.output,
                    y_g,
                )?;
            }
        }
        Ok(())
    }

    /// Accumulate the bias gradient of input `index` into `db`
    pub fn backward_bias<T: ConvElement>(&self, index: usize, dy: &[T], db: &mut [T]) -> Result<()> {
        const OP: &str = "accelerated_backward_bias";
        Self::check_len(OP, "output gradient", dy.len(), self.output_len())?;
        Self::check_len(OP, "bias", db.len(), self.geometry.num_output)?;
        let bias_desc = self.descriptors.bias().ok_or_else(|| {
            TensorError::invalid_argument_op(OP, "layer was configured without bias")
        })?;
        let problem = self.descriptors.problem(index)?;
        let handle = self.streams.handle(StreamRole::Bias)?;
        let g = &self.geometry;

        for group in 0..g.group {
            self.backend.convolution_backward_bias(
                handle,
                problem.output,
                &dy[group * g.output_group_offset()..],
                bias_desc,
                &mut db[group * g.bias_group_offset()..],
                true,
            )?;
        }
        Ok(())
    }

    /// Accumulate the grouped filter gradient of input `index` into `dw`
    #[allow(clippy::too_many_arguments)]
    pub fn backward_filter<T: ConvElement>(
        &self,
        index: usize,
        plan: &AlgorithmChoice,
        pool: &mut ScratchPool<B::Workspace>,
        x: &[T],
        dy: &[T],
        dw: &mut [T],
    ) -> Result<()> {
        const OP: &str = "accelerated_backward_filter";
        Self::check_len(OP, "input", x.len(), self.input_len())?;
        Self::check_len(OP, "output gradient", dy.len(), self.output_len())?;
        Self::check_len(OP, "weight gradient", dw.len(), self.weight_len())?;
        let problem = self.descriptors.problem(index)?;
        let handle = self.streams.handle(StreamRole::Filter)?;
        let stream = self.stream_index(StreamRole::Filter);
        let g = &self.geometry;

        for group in 0..g.group {
            let workspace = pool.scratch(stream, plan.backward_filter_workspace)?;
            self.backend.convolution_backward_filter(
                handle,
                problem,
                plan.backward_filter,
                workspace,
                &x[group * g.input_group_offset()..],
                &dy[group * g.output_group_offset()..],
                &mut dw[group * g.weight_group_offset()..],
                true,
            )?;
        }
        Ok(())
    }

    /// Write the input gradient of input `index` into `dx`
    #[allow(clippy::too_many_arguments)]
    pub fn backward_data<T: ConvElement>(
        &self,
        index: usize,
        plan: &AlgorithmChoice,
        pool: &mut ScratchPool<B::Workspace>,
        w: &[T],
        dy: &[T],
        dx: &mut [T],
    ) -> Result<()> {
        const OP: &str = "accelerated_backward_data";
        Self::check_len(OP, "weight", w.len(), self.weight_len())?;
        Self::check_len(OP, "output gradient", dy.len(), self.output_len())?;
        Self::check_len(OP, "input gradient", dx.len(), self.input_len())?;
        let problem = self.descriptors.problem(index)?;
        let handle = self.streams.handle(StreamRole::Data)?;
        let stream = self.stream_index(StreamRole::Data);
        let g = &self.geometry;

        for group in 0..g.group {
            let workspace = pool.scratch(stream, plan.backward_data_workspace)?;
            self.backend.convolution_backward_data(
                handle,
                problem,
                plan.backward_data,
                workspace,
                &w[group * g.weight_group_offset()..],
                &dy[group * g.output_group_offset()..],
                &mut dx[group * g.input_group_offset()..],
                false,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthflow_core::gpu::{HostBackend, StreamOp};

    #[test]
    fn test_role_index_wraps() {
        assert_eq!(StreamRole::Bias.index(3), 0);
        assert_eq!(StreamRole::Filter.index(3), 1);
        assert_eq!(StreamRole::Data.index(3), 2);
        assert_eq!(StreamRole::Data.index(2), 0);
        assert_eq!(StreamRole::Filter.index(1), 0);
    }

    #[test]
    fn test_stream_set_lifecycle() -> Result<()> {
        let backend = HostBackend::new();
        let set = StreamSet::create(&backend, 3)?;
        assert_eq!(set.len(), 3);
        assert_eq!(backend.stats().live_streams, 3);
        assert_eq!(backend.stats().live_handles, 3);
        set.synchronize(&backend)?;
        set.release(&backend);
        assert!(backend.stats().all_released());
        Ok(())
    }

    #[test]
    fn test_backward_passes_use_their_own_stream() -> Result<()> {
        use super::super::descriptors::DescriptorGeometry;
        use depthflow_core::DataType;

        let backend = HostBackend::new();
        let streams = StreamSet::create(&backend, 3)?;
        let ids: Vec<usize> = (0..3)
            .filter_map(|i| streams.stream(i).map(|s| s.id()))
            .collect();
        let mut descriptors = DescriptorSet::create(&backend, DataType::Float, true)?;
        let geometry = DescriptorGeometry {
            batch: 1,
            channels: 2,
            height: 3,
            width: 3,
            num_output: 2,
            height_out: 3,
            width_out: 3,
            group: 2,
            kernel_h: 3,
            kernel_w: 3,
            pad_h: 1,
            pad_w: 1,
            stride_h: 1,
            stride_w: 1,
            spatial_axes: 2,
        };
        descriptors.rebuild(&backend, 1, &geometry)?;
        let mut pool = ScratchPool::new(3);
        let plan = AlgorithmChoice::zero_workspace();
        let engine = ExecutionEngine::new(&backend, &streams, &descriptors)?;

        let x = vec![1.0f32; 18];
        let w = vec![0.5f32; 18];
        let dy = vec![1.0f32; 18];
        let mut db = vec![0.0f32; 2];
        let mut dw = vec![0.0f32; 18];
        let mut dx = vec![0.0f32; 18];
        engine.backward_bias(0, &dy, &mut db)?;
        engine.backward_filter(0, &plan, &mut pool, &x, &dy, &mut dw)?;
        engine.backward_data(0, &plan, &mut pool, &w, &dy, &mut dx)?;

        assert_eq!(db, vec![9.0, 9.0]);
        // centre tap sees every output position
        assert_eq!(dw[4], 9.0);
        assert_eq!(dw[9 + 4], 9.0);
        assert_eq!(backend.stream_ops(ids[0]), vec![StreamOp::BackwardBias; 2]);
        assert_eq!(backend.stream_ops(ids[1]), vec![StreamOp::BackwardFilter; 2]);
        assert_eq!(backend.stream_ops(ids[2]), vec![StreamOp::BackwardData; 2]);

        let mut y = vec![0.0f32; 17];
        assert!(engine
            .forward(0, &plan, &mut pool, &x, &w, None, &mut y)
            .is_err());

        descriptors.release(&backend);
        streams.release(&backend);
        Ok(())
    }
}
