//! Algorithm selection and scratch memory
//!
//! For every bound input the planner asks the backend for the best forward,
//! backward-filter and backward-data algorithm under the workspace limit and
//! for the scratch each one needs. One pool of `per_stream_max * streams`
//! bytes serves all streams; it only grows, and is sliced into equal
//! per-stream regions whenever it is reallocated.
//!
//! When the pool cannot be grown, or the backend finds no algorithm under
//! the limit, the layer degrades instead of failing: every plan falls back
//! to the zero-workspace algorithms and the pool is emptied.

use super::descriptors::DescriptorSet;
use depthflow_core::gpu::{
    BackwardDataAlgorithm, BackwardFilterAlgorithm, ConvBackend, ForwardAlgorithm,
    WorkspaceMemory,
};
use depthflow_core::{Result, TensorError};
use std::ops::Range;

/// Algorithms and scratch sizes chosen for one bound input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlgorithmChoice {
    pub forward: ForwardAlgorithm,
    pub forward_workspace: usize,
    pub backward_filter: BackwardFilterAlgorithm,
    pub backward_filter_workspace: usize,
    pub backward_data: BackwardDataAlgorithm,
    pub backward_data_workspace: usize,
}

impl AlgorithmChoice {
    /// The documented zero-workspace defaults
    pub fn zero_workspace() -> Self {
        Self {
            forward: ForwardAlgorithm::ZERO_WORKSPACE,
            forward_workspace: 0,
            backward_filter: BackwardFilterAlgorithm::ZERO_WORKSPACE,
            backward_filter_workspace: 0,
            backward_data: BackwardDataAlgorithm::ZERO_WORKSPACE,
            backward_data_workspace: 0,
        }
    }

    /// Largest scratch requirement of the three passes
    pub fn max_workspace(&self) -> usize {
        self.forward_workspace
            .max(self.backward_filter_workspace)
            .max(self.backward_data_workspace)
    }
}

/// Grow-only scratch buffer shared by the execution streams
#[derive(Debug)]
pub struct ScratchPool<W> {
    buffer: Option<W>,
    size: usize,
    regions: Vec<Option<Range<usize>>>,
}

impl<W: WorkspaceMemory> ScratchPool<W> {
    pub fn new(stream_count: usize) -> Self {
        Self {
            buffer: None,
            size: 0,
            regions: vec![None; stream_count],
        }
    }

    /// Pool size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stream_count(&self) -> usize {
        self.regions.len()
    }

    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    /// Byte range of the region bound to `stream`, `None` when unbound
    pub fn region(&self, stream: usize) -> Option<Range<usize>> {
        self.regions.get(stream).cloned().flatten()
    }

    pub fn regions(&self) -> &[Option<Range<usize>>] {
        &self.regions
    }

    /// Region of `stream` sized for `needed` bytes, or `None` when nothing is needed.
    ///
    /// Fails when a plan claims scratch the pool cannot provide.
    pub fn scratch(&mut self, stream: usize, needed: usize) -> Result<Option<&mut [u8]>> {
        if needed == 0 {
            return Ok(None);
        }
        let range = self.region(stream).ok_or_else(|| {
            TensorError::invalid_lifecycle(
                "scratch_region",
                format!("stream {stream} has no scratch region but the plan needs {needed} bytes"),
            )
        })?;
        if range.len() < needed {
            return Err(TensorError::invalid_lifecycle(
                "scratch_region",
                format!(
                    "stream {stream} region holds {} bytes, plan needs {needed}",
                    range.len()
                ),
            ));
        }
        let buffer = self.buffer.as_mut().ok_or_else(|| {
            TensorError::invalid_lifecycle("scratch_region", "scratch pool is not allocated")
        })?;
        Ok(Some(&mut buffer.as_mut_bytes()[range.start..range.start + needed]))
    }

    /// Grow to `required` bytes, slicing the new buffer into equal regions.
    /// The old buffer is released before the new one is requested.
    fn grow<B>(&mut self, backend: &B, required: usize) -> Result<()>
    where
        B: ConvBackend<Workspace = W>,
    {
        self.release();
        let buffer = backend.allocate_workspace(required)?;
        let per_stream = required / self.regions.len().max(1);
        for (g, region) in self.regions.iter_mut().enumerate() {
            *region = Some(g * per_stream..(g + 1) * per_stream);
        }
        self.buffer = Some(buffer);
        self.size = required;
        Ok(())
    }

    /// Free the buffer and unbind every region
    pub fn release(&mut self) {
        self.buffer = None;
        self.size = 0;
        self.regions.iter_mut().for_each(|r| *r = None);
    }
}

/// Outcome of one planning pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub plans: Vec<AlgorithmChoice>,
    /// Set when the zero-workspace fallback was applied
    pub degraded: bool,
}

/// Chooses algorithms for a descriptor set and provisions the scratch pool
#[derive(Debug, Clone, Copy)]
pub struct Planner {
    workspace_limit: usize,
}

impl Planner {
    pub fn new(workspace_limit: usize) -> Self {
        Self { workspace_limit }
    }

    pub fn workspace_limit(&self) -> usize {
        self.workspace_limit
    }

    /// Query every bound input and make sure the pool can serve the result.
    ///
    /// Allocation failures and missing algorithms are absorbed by the
    /// zero-workspace fallback; any other backend error is returned.
    pub fn plan<B: ConvBackend>(
        &self,
        backend: &B,
        handle: &B::Handle,
        descriptors: &DescriptorSet,
        pool: &mut ScratchPool<B::Workspace>,
    ) -> Result<PlanOutcome> {
        let plans = match self.query(backend, handle, descriptors) {
            Ok(plans) => plans,
            Err(e) if e.supports_fallback() => {
                return Ok(self.degrade(descriptors.len(), pool, &e));
            }
            Err(e) => return Err(e),
        };

        let per_stream_max = plans
            .iter()
            .map(AlgorithmChoice::max_workspace)
            .max()
            .unwrap_or(0);
        let required = match pool_bytes(per_stream_max, pool.stream_count()) {
            Ok(required) => required,
            Err(e) => return Ok(self.degrade(descriptors.len(), pool, &e)),
        };

        if required > pool.size() {
            log::debug!("Reallocating workspace storage: {required}");
            if let Err(e) = pool.grow(backend, required) {
                if e.supports_fallback() {
                    return Ok(self.degrade(descriptors.len(), pool, &e));
                }
                return Err(e);
            }
        }
        Ok(PlanOutcome {
            plans,
            degraded: false,
        })
    }

    fn query<B: ConvBackend>(
        &self,
        backend: &B,
        handle: &B::Handle,
        descriptors: &DescriptorSet,
    ) -> Result<Vec<AlgorithmChoice>> {
        let limit = self.workspace_limit;
        (0..descriptors.len())
            .map(|i| {
                let problem = descriptors.problem(i)?;
                let forward = backend.forward_algorithm(handle, problem, limit)?;
                let forward_workspace = backend.forward_workspace_size(handle, problem, forward)?;
                let backward_filter = backend.backward_filter_algorithm(handle, problem, limit)?;
                let backward_filter_workspace =
                    backend.backward_filter_workspace_size(handle, problem, backward_filter)?;
                let backward_data = backend.backward_data_algorithm(handle, problem, limit)?;
                let backward_data_workspace =
                    backend.backward_data_workspace_size(handle, problem, backward_data)?;
                let choice = AlgorithmChoice {
                    forward,
                    forward_workspace,
                    backward_filter,
                    backward_filter_workspace,
                    backward_data,
                    backward_data_workspace,
                };
                log::trace!("input {i}: {choice:?}");
                Ok(choice)
            })
            .collect()
    }

    fn degrade<W: WorkspaceMemory>(
        &self,
        num_inputs: usize,
        pool: &mut ScratchPool<W>,
        cause: &TensorError,
    ) -> PlanOutcome {
        log::warn!(
            "falling back to zero-workspace convolution algorithms for {num_inputs} input(s): {cause}"
        );
        pool.release();
        PlanOutcome {
            plans: vec![AlgorithmChoice::zero_workspace(); num_inputs],
            degraded: true,
        }
    }
}

fn pool_bytes(per_stream: usize, stream_count: usize) -> Result<usize> {
    per_stream.checked_mul(stream_count).ok_or_else(|| {
        TensorError::allocation_error(
            "plan_workspace",
            &format!("{per_stream} bytes x {stream_count} streams overflows"),
            None,
            None,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::super::descriptors::DescriptorGeometry;
    use super::*;
    use depthflow_core::gpu::HostBackend;
    use depthflow_core::DataType;

    fn geometry(side: usize) -> DescriptorGeometry {
        DescriptorGeometry {
            batch: 1,
            channels: 2,
            height: side,
            width: side,
            num_output: 2,
            height_out: side,
            width_out: side,
            group: 2,
            kernel_h: 3,
            kernel_w: 3,
            pad_h: 1,
            pad_w: 1,
            stride_h: 1,
            stride_w: 1,
            spatial_axes: 2,
        }
    }

    struct Fixture {
        backend: HostBackend,
        handle: <HostBackend as ConvBackend>::Handle,
        descriptors: DescriptorSet,
    }

    impl Fixture {
        fn new(backend: HostBackend) -> Self {
            let stream = backend.create_stream().unwrap();
            let handle = backend.create_handle(&stream).unwrap();
            let descriptors = DescriptorSet::create(&backend, DataType::Float, true).unwrap();
            Self {
                backend,
                handle,
                descriptors,
            }
        }
    }

    #[test]
    fn test_pool_sized_per_stream() {
        let mut f = Fixture::new(HostBackend::new());
        f.descriptors.rebuild(&f.backend, 2, &geometry(8)).unwrap();
        let mut pool = ScratchPool::new(3);
        let outcome = Planner::new(8 << 20)
            .plan(&f.backend, &f.handle, &f.descriptors, &mut pool)
            .unwrap();
        assert!(!outcome.degraded);
        assert_eq!(outcome.plans.len(), 2);
        assert_eq!(outcome.plans[0].forward, ForwardAlgorithm::Gemm);

        let per_stream = outcome.plans[0].max_workspace();
        assert!(per_stream > 0);
        assert_eq!(pool.size(), per_stream * 3);
        assert_eq!(pool.region(1), Some(per_stream..2 * per_stream));
        assert!(pool.scratch(2, per_stream).unwrap().is_some());
    }

    #[test]
    fn test_pool_never_shrinks() {
        let mut f = Fixture::new(HostBackend::new());
        let planner = Planner::new(8 << 20);
        let mut pool = ScratchPool::new(3);

        f.descriptors.rebuild(&f.backend, 1, &geometry(16)).unwrap();
        planner
            .plan(&f.backend, &f.handle, &f.descriptors, &mut pool)
            .unwrap();
        let large = pool.size();

        f.descriptors.rebuild(&f.backend, 1, &geometry(4)).unwrap();
        let outcome = planner
            .plan(&f.backend, &f.handle, &f.descriptors, &mut pool)
            .unwrap();
        assert_eq!(pool.size(), large);
        assert!(outcome.plans[0].max_workspace() * 3 < large);
        assert_eq!(f.backend.stats().allocations, 1);

        pool.release();
        assert_eq!(pool.size(), 0);
        assert!(pool.regions().iter().all(Option::is_none));
    }

    #[test]
    fn test_allocation_failure_degrades() {
        let mut f = Fixture::new(HostBackend::with_memory_budget(16));
        f.descriptors.rebuild(&f.backend, 2, &geometry(8)).unwrap();
        let mut pool = ScratchPool::new(3);
        let outcome = Planner::new(8 << 20)
            .plan(&f.backend, &f.handle, &f.descriptors, &mut pool)
            .unwrap();
        assert!(outcome.degraded);
        assert!(outcome
            .plans
            .iter()
            .all(|p| *p == AlgorithmChoice::zero_workspace()));
        assert_eq!(pool.size(), 0);
        assert!(!pool.is_allocated());
        assert!(pool.regions().iter().all(Option::is_none));
        assert!(pool.scratch(0, 0).unwrap().is_none());
        assert!(pool.scratch(0, 1).is_err());
    }

    #[test]
    fn test_missing_algorithm_degrades() {
        let mut f = Fixture::new(HostBackend::new());
        f.descriptors.rebuild(&f.backend, 1, &geometry(8)).unwrap();
        f.backend.set_algorithm_search_disabled(true);
        let mut pool = ScratchPool::new(3);
        let outcome = Planner::new(8 << 20)
            .plan(&f.backend, &f.handle, &f.descriptors, &mut pool)
            .unwrap();
        assert!(outcome.degraded);
        assert_eq!(outcome.plans, vec![AlgorithmChoice::zero_workspace()]);
    }

    #[test]
    fn test_zero_limit_needs_no_pool() {
        let mut f = Fixture::new(HostBackend::new());
        f.descriptors.rebuild(&f.backend, 1, &geometry(8)).unwrap();
        let mut pool = ScratchPool::new(3);
        let outcome = Planner::new(0)
            .plan(&f.backend, &f.handle, &f.descriptors, &mut pool)
            .unwrap();
        assert!(!outcome.degraded);
        assert_eq!(outcome.plans[0].max_workspace(), 0);
        assert_eq!(pool.size(), 0);
        assert_eq!(f.backend.stats().allocations, 0);
    }

    #[test]
    fn test_oversized_pool_falls_back() {
        assert_eq!(pool_bytes(1024, 3).unwrap(), 3072);
        let err = pool_bytes(usize::MAX / 2, 3).unwrap_err();
        assert!(matches!(err, TensorError::AllocationError { .. }));
        assert!(err.supports_fallback());
    }
}
