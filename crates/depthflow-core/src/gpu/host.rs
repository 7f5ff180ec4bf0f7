//! Host-memory implementation of [`ConvBackend`]
//!
//! Runs the same convolution kernels a device library would, on ordinary host
//! slices. Streams execute work eagerly, so `synchronize` only has to report
//! success. The backend keeps live-object counters and a per-stream operation
//! log, and can be told to run out of memory or to find no algorithm, which
//! makes it the reference device for the layer tests.

use super::backend::{
    BackwardDataAlgorithm, BackwardFilterAlgorithm, ConvBackend, ConvProblem, ForwardAlgorithm,
    WorkspaceMemory,
};
use super::descriptor::{ConvolutionDescriptor, FilterDescriptor, TensorDescriptor};
use crate::{ConvElement, DataType, Result, TensorError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Kind of work recorded on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamOp {
    Forward,
    AddBias,
    BackwardData,
    BackwardFilter,
    BackwardBias,
}

#[derive(Debug, Default)]
struct HostCounters {
    live_streams: AtomicUsize,
    live_handles: AtomicUsize,
    live_descriptors: AtomicUsize,
    live_workspaces: AtomicUsize,
    workspace_bytes: AtomicUsize,
    allocations: AtomicUsize,
    failed_allocations: AtomicUsize,
}

/// Point-in-time copy of the backend counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostStats {
    pub live_streams: usize,
    pub live_handles: usize,
    pub live_descriptors: usize,
    pub live_workspaces: usize,
    pub workspace_bytes: usize,
    pub allocations: usize,
    pub failed_allocations: usize,
}

impl HostStats {
    /// True when every stream, handle, descriptor and workspace has been released
    pub fn all_released(&self) -> bool {
        self.live_streams == 0
            && self.live_handles == 0
            && self.live_descriptors == 0
            && self.live_workspaces == 0
            && self.workspace_bytes == 0
    }
}

#[derive(Debug)]
pub struct HostStream {
    id: usize,
}

impl HostStream {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[derive(Debug)]
pub struct HostHandle {
    stream_id: usize,
}

impl HostHandle {
    pub fn stream_id(&self) -> usize {
        self.stream_id
    }
}

/// Scratch buffer in host memory
#[derive(Debug)]
pub struct HostWorkspace {
    bytes: Vec<u8>,
    counters: Arc<HostCounters>,
}

impl WorkspaceMemory for HostWorkspace {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for HostWorkspace {
    fn drop(&mut self) {
        self.counters.live_workspaces.fetch_sub(1, Ordering::SeqCst);
        self.counters
            .workspace_bytes
            .fetch_sub(self.bytes.len(), Ordering::SeqCst);
    }
}

/// Reference convolution backend running on host memory
#[derive(Debug)]
pub struct HostBackend {
    /// Scratch memory budget in bytes; `usize::MAX` means unlimited
    memory_budget: AtomicUsize,
    algorithm_search_disabled: AtomicBool,
    next_stream_id: AtomicUsize,
    counters: Arc<HostCounters>,
    stream_log: Mutex<HashMap<usize, Vec<StreamOp>>>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            memory_budget: AtomicUsize::new(usize::MAX),
            algorithm_search_disabled: AtomicBool::new(false),
            next_stream_id: AtomicUsize::new(0),
            counters: Arc::new(HostCounters::default()),
            stream_log: Mutex::new(HashMap::new()),
        }
    }

    /// Backend whose scratch allocations fail beyond `bytes` in total
    pub fn with_memory_budget(bytes: usize) -> Self {
        let backend = Self::new();
        backend.set_memory_budget(Some(bytes));
        backend
    }

    pub fn set_memory_budget(&self, bytes: Option<usize>) {
        self.memory_budget
            .store(bytes.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    /// Make every algorithm query report that nothing fits the budget
    pub fn set_algorithm_search_disabled(&self, disabled: bool) {
        self.algorithm_search_disabled
            .store(disabled, Ordering::SeqCst);
    }

    pub fn stats(&self) -> HostStats {
        let c = &self.counters;
        HostStats {
            live_streams: c.live_streams.load(Ordering::SeqCst),
            live_handles: c.live_handles.load(Ordering::SeqCst),
            live_descriptors: c.live_descriptors.load(Ordering::SeqCst),
            live_workspaces: c.live_workspaces.load(Ordering::SeqCst),
            workspace_bytes: c.workspace_bytes.load(Ordering::SeqCst),
            allocations: c.allocations.load(Ordering::SeqCst),
            failed_allocations: c.failed_allocations.load(Ordering::SeqCst),
        }
    }

    /// Operations issued on the stream with the given id, in issue order
    pub fn stream_ops(&self, stream_id: usize) -> Vec<StreamOp> {
        self.stream_log
            .lock()
            .map(|log| log.get(&stream_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn clear_stream_log(&self) {
        if let Ok(mut log) = self.stream_log.lock() {
            log.clear();
        }
    }

    fn record(&self, handle: &HostHandle, op: StreamOp) {
        if let Ok(mut log) = self.stream_log.lock() {
            log.entry(handle.stream_id).or_default().push(op);
        }
    }

    fn search_enabled(&self, operation: &str, workspace_limit: usize) -> Result<()> {
        if self.algorithm_search_disabled.load(Ordering::SeqCst) {
            return Err(TensorError::algorithm_unavailable(operation, workspace_limit));
        }
        Ok(())
    }
}

/// Bytes of an im2col buffer for `problem`, with slack to align the element type
fn column_workspace_bytes(problem: &ConvProblem<'_>) -> usize {
    let element = problem.filter.data_type().size_in_bytes();
    column_len(problem) * element + element
}

fn column_len(problem: &ConvProblem<'_>) -> usize {
    let [_, c, kh, kw] = problem.filter.dims();
    let [_, _, oh, ow] = problem.output.dims();
    c * kh * kw * oh * ow
}

fn validate_problem(operation: &str, problem: &ConvProblem<'_>) -> Result<()> {
    if !problem.input.is_set() || !problem.output.is_set() {
        return Err(TensorError::backend_error(operation, "descriptor not set"));
    }
    let expected = problem.conv.forward_output_dims(problem.input, problem.filter)?;
    if expected != problem.output.dims() {
        return Err(TensorError::backend_error(
            operation,
            &format!(
                "output descriptor {:?} does not match convolution output {:?}",
                problem.output.dims(),
                expected
            ),
        ));
    }
    Ok(())
}

fn check_len(operation: &str, what: &str, len: usize, required: usize) -> Result<()> {
    if len < required {
        return Err(TensorError::backend_error(
            operation,
            &format!("{what} buffer holds {len} elements, descriptor addresses {required}"),
        ));
    }
    Ok(())
}

fn check_buffers<T>(
    operation: &str,
    problem: &ConvProblem<'_>,
    input: &[T],
    filter: &[T],
    output: &[T],
) -> Result<()> {
    check_len(operation, "input", input.len(), problem.input.span())?;
    check_len(operation, "filter", filter.len(), problem.filter.element_count())?;
    check_len(operation, "output", output.len(), problem.output.span())
}

/// Carve the column buffer out of `workspace`, respecting the alignment of `T`
fn column_buffer<'w, T: ConvElement>(
    operation: &str,
    problem: &ConvProblem<'_>,
    workspace: Option<&'w mut [u8]>,
) -> Result<&'w mut [T]> {
    let needed = column_len(problem);
    let bytes = workspace.ok_or_else(|| {
        TensorError::backend_error(operation, "algorithm requires workspace but none was given")
    })?;
    let (_, aligned, _) = bytemuck::pod_align_to_mut::<u8, T>(bytes);
    if aligned.len() < needed {
        return Err(TensorError::backend_error(
            operation,
            &format!(
                "workspace holds {} elements, algorithm needs {needed}",
                aligned.len()
            ),
        ));
    }
    Ok(&mut aligned[..needed])
}

/// Input coordinate read by output position `o` at kernel tap `k`, if inside the image
#[inline]
fn input_coord(o: usize, stride: usize, k: usize, pad: usize, size: usize) -> Option<usize> {
    let pos = o * stride + k;
    if pos < pad || pos - pad >= size {
        None
    } else {
        Some(pos - pad)
    }
}

/// Unfold sample `n` of `x` into `cols`, laid out `[C * KH * KW, OH * OW]`
fn im2col<T: ConvElement>(problem: &ConvProblem<'_>, x: &[T], n: usize, cols: &mut [T]) {
    let [_, c_in, h, w] = problem.input.dims();
    let [_, _, kh, kw] = problem.filter.dims();
    let [_, _, oh, ow] = problem.output.dims();
    let [ph, pw] = problem.conv.padding();
    let [sh, sw] = problem.conv.stride();
    let plane = oh * ow;
    for c in 0..c_in {
        for r in 0..kh {
            for s in 0..kw {
                let row = (c * kh + r) * kw + s;
                for y in 0..oh {
                    for xo in 0..ow {
                        let value = match (
                            input_coord(y, sh, r, ph, h),
                            input_coord(xo, sw, s, pw, w),
                        ) {
                            (Some(ih), Some(iw)) => x[problem.input.offset(n, c, ih, iw)],
                            _ => T::zero(),
                        };
                        cols[row * plane + y * ow + xo] = value;
                    }
                }
            }
        }
    }
}

/// Fold `cols` back into sample `n` of `dx`, adding overlapping taps
fn col2im<T: ConvElement>(problem: &ConvProblem<'_>, cols: &[T], n: usize, dx: &mut [T]) {
    let [_, c_in, h, w] = problem.input.dims();
    let [_, _, kh, kw] = problem.filter.dims();
    let [_, _, oh, ow] = problem.output.dims();
    let [ph, pw] = problem.conv.padding();
    let [sh, sw] = problem.conv.stride();
    let plane = oh * ow;
    for c in 0..c_in {
        for r in 0..kh {
            for s in 0..kw {
                let row = (c * kh + r) * kw + s;
                for y in 0..oh {
                    let Some(ih) = input_coord(y, sh, r, ph, h) else {
                        continue;
                    };
                    for xo in 0..ow {
                        if let Some(iw) = input_coord(xo, sw, s, pw, w) {
                            let idx = problem.input.offset(n, c, ih, iw);
                            dx[idx] = dx[idx] + cols[row * plane + y * ow + xo];
                        }
                    }
                }
            }
        }
    }
}

/// Zero every element addressed by `desc`
fn clear_view<T: ConvElement>(desc: &TensorDescriptor, data: &mut [T]) {
    let [n, c, h, w] = desc.dims();
    for ni in 0..n {
        for ci in 0..c {
            for hi in 0..h {
                for wi in 0..w {
                    data[desc.offset(ni, ci, hi, wi)] = T::zero();
                }
            }
        }
    }
}

impl ConvBackend for HostBackend {
    type Stream = HostStream;
    type Handle = HostHandle;
    type Workspace = HostWorkspace;

    fn name(&self) -> &str {
        "host"
    }

    fn create_stream(&self) -> Result<HostStream> {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        self.counters.live_streams.fetch_add(1, Ordering::SeqCst);
        Ok(HostStream { id })
    }

    fn destroy_stream(&self, _stream: HostStream) {
        self.counters.live_streams.fetch_sub(1, Ordering::SeqCst);
    }

    fn create_handle(&self, stream: &HostStream) -> Result<HostHandle> {
        self.counters.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(HostHandle {
            stream_id: stream.id,
        })
    }

    fn destroy_handle(&self, _handle: HostHandle) {
        self.counters.live_handles.fetch_sub(1, Ordering::SeqCst);
    }

    fn synchronize(&self, _stream: &HostStream) -> Result<()> {
        Ok(())
    }

    fn create_tensor_descriptor(&self, data_type: DataType) -> Result<TensorDescriptor> {
        self.counters.live_descriptors.fetch_add(1, Ordering::SeqCst);
        Ok(TensorDescriptor::new(data_type))
    }

    fn destroy_tensor_descriptor(&self, _desc: TensorDescriptor) {
        self.counters.live_descriptors.fetch_sub(1, Ordering::SeqCst);
    }

    fn create_filter_descriptor(&self, data_type: DataType) -> Result<FilterDescriptor> {
        self.counters.live_descriptors.fetch_add(1, Ordering::SeqCst);
        Ok(FilterDescriptor::new(data_type))
    }

    fn destroy_filter_descriptor(&self, _desc: FilterDescriptor) {
        self.counters.live_descriptors.fetch_sub(1, Ordering::SeqCst);
    }

    fn create_convolution_descriptor(
        &self,
        data_type: DataType,
    ) -> Result<ConvolutionDescriptor> {
        self.counters.live_descriptors.fetch_add(1, Ordering::SeqCst);
        Ok(ConvolutionDescriptor::new(data_type))
    }

    fn destroy_convolution_descriptor(&self, _desc: ConvolutionDescriptor) {
        self.counters.live_descriptors.fetch_sub(1, Ordering::SeqCst);
    }

    fn forward_algorithm(
        &self,
        _handle: &HostHandle,
        problem: ConvProblem<'_>,
        workspace_limit: usize,
    ) -> Result<ForwardAlgorithm> {
        validate_problem("forward_algorithm", &problem)?;
        self.search_enabled("forward_algorithm", workspace_limit)?;
        if column_workspace_bytes(&problem) <= workspace_limit {
            Ok(ForwardAlgorithm::Gemm)
        } else {
            Ok(ForwardAlgorithm::ImplicitGemm)
        }
    }

    fn forward_workspace_size(
        &self,
        _handle: &HostHandle,
        problem: ConvProblem<'_>,
        algo: ForwardAlgorithm,
    ) -> Result<usize> {
        validate_problem("forward_workspace_size", &problem)?;
        Ok(match algo {
            ForwardAlgorithm::ImplicitGemm => 0,
            ForwardAlgorithm::Gemm => column_workspace_bytes(&problem),
        })
    }

    fn backward_filter_algorithm(
        &self,
        _handle: &HostHandle,
        problem: ConvProblem<'_>,
        workspace_limit: usize,
    ) -> Result<BackwardFilterAlgorithm> {
        validate_problem("backward_filter_algorithm", &problem)?;
        self.search_enabled("backward_filter_algorithm", workspace_limit)?;
        if column_workspace_bytes(&problem) <= workspace_limit {
            Ok(BackwardFilterAlgorithm::Algo1)
        } else {
            Ok(BackwardFilterAlgorithm::Algo0)
        }
    }

    fn backward_filter_workspace_size(
        &self,
        _handle: &HostHandle,
        problem: ConvProblem<'_>,
        algo: BackwardFilterAlgorithm,
    ) -> Result<usize> {
        validate_problem("backward_filter_workspace_size", &problem)?;
        Ok(match algo {
            BackwardFilterAlgorithm::Algo0 => 0,
            BackwardFilterAlgorithm::Algo1 => column_workspace_bytes(&problem),
        })
    }

    fn backward_data_algorithm(
        &self,
        _handle: &HostHandle,
        problem: ConvProblem<'_>,
        workspace_limit: usize,
    ) -> Result<BackwardDataAlgorithm> {
        validate_problem("backward_data_algorithm", &problem)?;
        self.search_enabled("backward_data_algorithm", workspace_limit)?;
        if column_workspace_bytes(&problem) <= workspace_limit {
            Ok(BackwardDataAlgorithm::Algo1)
        } else {
            Ok(BackwardDataAlgorithm::Algo0)
        }
    }

    fn backward_data_workspace_size(
        &self,
        _handle: &HostHandle,
        problem: ConvProblem<'_>,
        algo: BackwardDataAlgorithm,
    ) -> Result<usize> {
        validate_problem("backward_data_workspace_size", &problem)?;
        Ok(match algo {
            BackwardDataAlgorithm::Algo0 => 0,
            BackwardDataAlgorithm::Algo1 => column_workspace_bytes(&problem),
        })
    }

    fn allocate_workspace(&self, bytes: usize) -> Result<HostWorkspace> {
        let budget = self.memory_budget.load(Ordering::SeqCst);
        let in_use = self.counters.workspace_bytes.load(Ordering::SeqCst);
        let available = budget.saturating_sub(in_use);
        if bytes > available {
            self.counters
                .failed_allocations
                .fetch_add(1, Ordering::SeqCst);
            log::debug!("host workspace allocation of {bytes} bytes refused, {available} available");
            return Err(TensorError::allocation_error(
                "allocate_workspace",
                "device memory budget exhausted",
                Some(bytes),
                Some(available),
            ));
        }
        log::trace!("host workspace allocation: {bytes} bytes");
        self.counters.allocations.fetch_add(1, Ordering::SeqCst);
        self.counters.live_workspaces.fetch_add(1, Ordering::SeqCst);
        self.counters
            .workspace_bytes
            .fetch_add(bytes, Ordering::SeqCst);
        Ok(HostWorkspace {
            bytes: vec![0; bytes],
            counters: Arc::clone(&self.counters),
        })
    }

    fn convolution_forward<T: ConvElement>(
        &self,
        handle: &HostHandle,
        problem: ConvProblem<'_>,
        algo: ForwardAlgorithm,
        workspace: Option<&mut [u8]>,
        x: &[T],
        w: &[T],
        y: &mut [T],
        accumulate: bool,
    ) -> Result<()> {
        let op = "convolution_forward";
        validate_problem(op, &problem)?;
        check_buffers(op, &problem, x, w, y)?;
        self.record(handle, StreamOp::Forward);

        let [n_batch, c_in, h, wd] = problem.input.dims();
        let [k_out, _, kh, kw] = problem.filter.dims();
        let [_, _, oh, ow] = problem.output.dims();
        let [ph, pw] = problem.conv.padding();
        let [sh, sw] = problem.conv.stride();
        let out = problem.output;

        match algo {
            ForwardAlgorithm::ImplicitGemm => {
                for n in 0..n_batch {
                    for k in 0..k_out {
                        for yo in 0..oh {
                            for xo in 0..ow {
                                let mut sum = T::zero();
                                for c in 0..c_in {
                                    for r in 0..kh {
                                        let Some(ih) = input_coord(yo, sh, r, ph, h) else {
                                            continue;
                                        };
                                        for s in 0..kw {
                                            if let Some(iw) = input_coord(xo, sw, s, pw, wd) {
                                                sum = sum
                                                    + x[problem.input.offset(n, c, ih, iw)]
                                                        * w[problem.filter.offset(k, c, r, s)];
                                            }
                                        }
                                    }
                                }
                                let idx = out.offset(n, k, yo, xo);
                                y[idx] = if accumulate { y[idx] + sum } else { sum };
                            }
                        }
                    }
                }
            }
            ForwardAlgorithm::Gemm => {
                let cols = column_buffer::<T>(op, &problem, workspace)?;
                let rows = c_in * kh * kw;
                let plane = oh * ow;
                for n in 0..n_batch {
                    im2col(&problem, x, n, cols);
                    for k in 0..k_out {
                        let filter_row = &w[k * rows..(k + 1) * rows];
                        for p in 0..plane {
                            let mut sum = T::zero();
                            for (row, &wv) in filter_row.iter().enumerate() {
                                sum = sum + wv * cols[row * plane + p];
                            }
                            let idx = out.offset(n, k, p / ow, p % ow);
                            y[idx] = if accumulate { y[idx] + sum } else { sum };
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn add_bias<T: ConvElement>(
        &self,
        handle: &HostHandle,
        bias_desc: &TensorDescriptor,
        bias: &[T],
        y_desc: &TensorDescriptor,
        y: &mut [T],
    ) -> Result<()> {
        let op = "add_bias";
        let [n_batch, channels, h, w] = y_desc.dims();
        if bias_desc.dims() != [1, channels, 1, 1] {
            return Err(TensorError::backend_error(
                op,
                &format!(
                    "bias descriptor {:?} does not broadcast over {:?}",
                    bias_desc.dims(),
                    y_desc.dims()
                ),
            ));
        }
        check_len(op, "bias", bias.len(), bias_desc.span())?;
        check_len(op, "output", y.len(), y_desc.span())?;
        self.record(handle, StreamOp::AddBias);
        for n in 0..n_batch {
            for c in 0..channels {
                let b = bias[bias_desc.offset(0, c, 0, 0)];
                for hi in 0..h {
                    for wi in 0..w {
                        let idx = y_desc.offset(n, c, hi, wi);
                        y[idx] = y[idx] + b;
                    }
                }
            }
        }
        Ok(())
    }

    fn convolution_backward_data<T: ConvElement>(
        &self,
        handle: &HostHandle,
        problem: ConvProblem<'_>,
        algo: BackwardDataAlgorithm,
        workspace: Option<&mut [u8]>,
        w: &[T],
        dy: &[T],
        dx: &mut [T],
        accumulate: bool,
    ) -> Result<()> {
        let op = "convolution_backward_data";
        validate_problem(op, &problem)?;
        check_buffers(op, &problem, dx, w, dy)?;
        self.record(handle, StreamOp::BackwardData);
        if !accumulate {
            clear_view(problem.input, dx);
        }

        let [n_batch, c_in, h, wd] = problem.input.dims();
        let [k_out, _, kh, kw] = problem.filter.dims();
        let [_, _, oh, ow] = problem.output.dims();
        let [ph, pw] = problem.conv.padding();
        let [sh, sw] = problem.conv.stride();

        match algo {
            BackwardDataAlgorithm::Algo0 => {
                for n in 0..n_batch {
                    for k in 0..k_out {
                        for yo in 0..oh {
                            for xo in 0..ow {
                                let g = dy[problem.output.offset(n, k, yo, xo)];
                                for c in 0..c_in {
                                    for r in 0..kh {
                                        let Some(ih) = input_coord(yo, sh, r, ph, h) else {
                                            continue;
                                        };
                                        for s in 0..kw {
                                            if let Some(iw) = input_coord(xo, sw, s, pw, wd) {
                                                let idx = problem.input.offset(n, c, ih, iw);
                                                dx[idx] = dx[idx]
                                                    + g * w[problem.filter.offset(k, c, r, s)];
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            BackwardDataAlgorithm::Algo1 => {
                let cols = column_buffer::<T>(op, &problem, workspace)?;
                let rows = c_in * kh * kw;
                let plane = oh * ow;
                for n in 0..n_batch {
                    for row in 0..rows {
                        for p in 0..plane {
                            let mut sum = T::zero();
                            for k in 0..k_out {
                                sum = sum
                                    + w[k * rows + row]
                                        * dy[problem.output.offset(n, k, p / ow, p % ow)];
                            }
                            cols[row * plane + p] = sum;
                        }
                    }
                    col2im(&problem, cols, n, dx);
                }
            }
        }
        Ok(())
    }

    fn convolution_backward_filter<T: ConvElement>(
        &self,
        handle: &HostHandle,
        problem: ConvProblem<'_>,
        algo: BackwardFilterAlgorithm,
        workspace: Option<&mut [u8]>,
        x: &[T],
        dy: &[T],
        dw: &mut [T],
        accumulate: bool,
    ) -> Result<()> {
        let op = "convolution_backward_filter";
        validate_problem(op, &problem)?;
        check_buffers(op, &problem, x, dw, dy)?;
        self.record(handle, StreamOp::BackwardFilter);
        let filter_len = problem.filter.element_count();
        if !accumulate {
            dw[..filter_len].iter_mut().for_each(|v| *v = T::zero());
        }

        let [n_batch, c_in, h, wd] = problem.input.dims();
        let [k_out, _, kh, kw] = problem.filter.dims();
        let [_, _, oh, ow] = problem.output.dims();
        let [ph, pw] = problem.conv.padding();
        let [sh, sw] = problem.conv.stride();

        match algo {
            BackwardFilterAlgorithm::Algo0 => {
                for k in 0..k_out {
                    for c in 0..c_in {
                        for r in 0..kh {
                            for s in 0..kw {
                                let mut sum = T::zero();
                                for n in 0..n_batch {
                                    for yo in 0..oh {
                                        let Some(ih) = input_coord(yo, sh, r, ph, h) else {
                                            continue;
                                        };
                                        for xo in 0..ow {
                                            if let Some(iw) = input_coord(xo, sw, s, pw, wd) {
                                                sum = sum
                                                    + dy[problem.output.offset(n, k, yo, xo)]
                                                        * x[problem.input.offset(n, c, ih, iw)];
                                            }
                                        }
                                    }
                                }
                                let idx = problem.filter.offset(k, c, r, s);
                                dw[idx] = dw[idx] + sum;
                            }
                        }
                    }
                }
            }
            BackwardFilterAlgorithm::Algo1 => {
                let cols = column_buffer::<T>(op, &problem, workspace)?;
                let rows = c_in * kh * kw;
                let plane = oh * ow;
                for n in 0..n_batch {
                    im2col(&problem, x, n, cols);
                    for k in 0..k_out {
                        for row in 0..rows {
                            let mut sum = T::zero();
                            for p in 0..plane {
                                sum = sum
                                    + dy[problem.output.offset(n, k, p / ow, p % ow)]
                                        * cols[row * plane + p];
                            }
                            let idx = k * rows + row;
                            dw[idx] = dw[idx] + sum;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn convolution_backward_bias<T: ConvElement>(
        &self,
        handle: &HostHandle,
        dy_desc: &TensorDescriptor,
        dy: &[T],
        bias_desc: &TensorDescriptor,
        db: &mut [T],
        accumulate: bool,
    ) -> Result<()> {
        let op = "convolution_backward_bias";
        let [n_batch, channels, h, w] = dy_desc.dims();
        if bias_desc.dims() != [1, channels, 1, 1] {
            return Err(TensorError::backend_error(
                op,
                "bias descriptor does not match gradient channels",
            ));
        }
        check_len(op, "output gradient", dy.len(), dy_desc.span())?;
        check_len(op, "bias gradient", db.len(), bias_desc.span())?;
        self.record(handle, StreamOp::BackwardBias);
        for c in 0..channels {
            let mut sum = T::zero();
            for n in 0..n_batch {
                for hi in 0..h {
                    for wi in 0..w {
                        sum = sum + dy[dy_desc.offset(n, c, hi, wi)];
                    }
                }
            }
            let idx = bias_desc.offset(0, c, 0, 0);
            db[idx] = if accumulate { db[idx] + sum } else { sum };
        }
        Ok(())
    }
}
