use approx::assert_relative_eq;
use depthflow_core::gpu::{ForwardAlgorithm, HostBackend, StreamOp};
use depthflow_core::{Result, Shape, Tensor, TensorError};
use depthflow_neural::layers::conv::accelerated::AlgorithmChoice;
use depthflow_neural::layers::{
    AcceleratedConvConfig, AcceleratedDepthwiseConv2D, ConvolutionParam, DepthwiseConv2D, Layer,
    LifecycleState,
};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ramp(len: usize, scale: f32, offset: usize) -> Vec<f32> {
    (0..len)
        .map(|i| (((i + offset) % 11) as f32 - 5.0) * scale)
        .collect()
}

fn tensor(shape: &[usize], scale: f32, offset: usize) -> Tensor<f32> {
    let len = shape.iter().product();
    Tensor::from_vec(ramp(len, scale, offset), shape).unwrap()
}

/// Accelerated layer and generic reference sharing weights and bias
fn pair(
    param: &ConvolutionParam,
    shape: &Shape,
    backend: Arc<HostBackend>,
    config: AcceleratedConvConfig,
) -> Result<(
    AcceleratedDepthwiseConv2D<f32, HostBackend>,
    DepthwiseConv2D<f32>,
)> {
    let mut reference = DepthwiseConv2D::new(param, shape)?;
    let weight_shape = reference.weight().shape().to_vec();
    reference.set_weight(tensor(&weight_shape, 0.125, 3))?;
    if let Some(bias) = reference.bias() {
        let len = bias.shape().size();
        reference.set_bias(tensor(&[len], 0.5, 1))?;
    }

    let mut layer = AcceleratedDepthwiseConv2D::new(param, shape, config, backend)?;
    layer.weight_mut().data = reference.weight().data.clone();
    if let (Some(dst), Some(src)) = (layer.bias_mut(), reference.bias()) {
        dst.data = src.data.clone();
    }
    layer.setup()?;
    Ok((layer, reference))
}

fn assert_close(actual: &Tensor<f32>, expected: &Tensor<f32>) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.as_slice().iter().zip(expected.as_slice()) {
        assert_relative_eq!(*a, *e, epsilon = 1e-4);
    }
}

fn check_parity(
    param: ConvolutionParam,
    shape: Shape,
    backend: Arc<HostBackend>,
    config: AcceleratedConvConfig,
) -> Result<()> {
    let (mut layer, mut reference) = pair(&param, &shape, backend, config)?;
    let out_shapes = layer.reshape(&[shape.clone()])?;
    let ref_shapes = reference.reshape(&[shape.clone()])?;
    assert_eq!(out_shapes, ref_shapes);

    let x = tensor(shape.dims(), 0.25, 0);
    let y = layer.forward(&[&x])?.remove(0);
    let y_ref = reference.forward(&[&x])?.remove(0);
    assert_close(&y, &y_ref);

    let dy = tensor(y.shape().dims(), 0.5, 7);
    let dx = layer.backward(&[&x], &[&dy], true)?.remove(0);
    let dx_ref = reference.backward(&[&x], &[&dy], true)?.remove(0);
    match (dx, dx_ref) {
        (Some(dx), Some(dx_ref)) => assert_close(&dx, &dx_ref),
        _ => panic!("input gradient missing"),
    }
    assert_close(&layer.weight().grad, &reference.weight().grad);
    if let (Some(b), Some(b_ref)) = (layer.bias(), reference.bias()) {
        assert_close(&b.grad, &b_ref.grad);
    }
    Ok(())
}

#[test]
fn test_parity_pure_depthwise() -> Result<()> {
    init_logging();
    check_parity(
        ConvolutionParam::depthwise(4, 1, 3).with_pad(1, 1),
        Shape::from([2, 4, 6, 5]),
        Arc::new(HostBackend::new()),
        AcceleratedConvConfig::default(),
    )
}

#[test]
fn test_parity_with_multiplier_and_stride() -> Result<()> {
    check_parity(
        ConvolutionParam::depthwise(3, 2, 3)
            .with_pad(1, 0)
            .with_stride(2, 1),
        Shape::from([2, 3, 7, 6]),
        Arc::new(HostBackend::new()),
        AcceleratedConvConfig::default(),
    )
}

#[test]
fn test_parity_single_group_with_multiplier() -> Result<()> {
    // every output channel sees all four input channels, three of them masked
    check_parity(
        ConvolutionParam::depthwise(4, 2, 3)
            .with_group(1)
            .with_pad(1, 1)
            .with_bias(false),
        Shape::from([1, 4, 5, 5]),
        Arc::new(HostBackend::new()),
        AcceleratedConvConfig::default(),
    )
}

#[test]
fn test_parity_partial_groups() -> Result<()> {
    check_parity(
        ConvolutionParam::depthwise(6, 1, 2).with_group(3),
        Shape::from([2, 6, 4, 4]),
        Arc::new(HostBackend::new()),
        AcceleratedConvConfig::default(),
    )
}

#[test]
fn test_parity_when_allocation_fails() -> Result<()> {
    init_logging();
    let backend = Arc::new(HostBackend::with_memory_budget(0));
    check_parity(
        ConvolutionParam::depthwise(4, 2, 3).with_pad(1, 1),
        Shape::from([2, 4, 6, 6]),
        Arc::clone(&backend),
        AcceleratedConvConfig::default(),
    )?;
    assert!(backend.stats().failed_allocations > 0);
    Ok(())
}

#[test]
fn test_degrade_keeps_sizes_and_regions_consistent() -> Result<()> {
    let backend = Arc::new(HostBackend::with_memory_budget(0));
    let param = ConvolutionParam::depthwise(2, 1, 3).with_pad(1, 1);
    let shape = Shape::from([1, 2, 8, 8]);
    let (mut layer, _) = pair(&param, &shape, backend, AcceleratedConvConfig::default())?;
    layer.reshape(&[shape.clone(), shape.clone()])?;

    assert!(layer.is_degraded());
    assert_eq!(layer.state(), LifecycleState::Configured);
    assert_eq!(layer.workspace_size(), 0);
    assert!(layer.workspace_regions().iter().all(Option::is_none));
    assert_eq!(
        layer.plans(),
        &[AlgorithmChoice::zero_workspace(), AlgorithmChoice::zero_workspace()]
    );
    assert_eq!(layer.plans()[0].forward, ForwardAlgorithm::ImplicitGemm);
    Ok(())
}

#[test]
fn test_algorithm_search_failure_degrades() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    backend.set_algorithm_search_disabled(true);
    check_parity(
        ConvolutionParam::depthwise(2, 1, 3),
        Shape::from([1, 2, 5, 5]),
        Arc::clone(&backend),
        AcceleratedConvConfig::default(),
    )?;
    assert_eq!(backend.stats().allocations, 0);
    Ok(())
}

#[test]
fn test_recovers_after_memory_returns() -> Result<()> {
    let backend = Arc::new(HostBackend::with_memory_budget(0));
    let param = ConvolutionParam::depthwise(2, 1, 3).with_pad(1, 1);
    let shape = Shape::from([1, 2, 8, 8]);
    let (mut layer, _) = pair(&param, &shape, Arc::clone(&backend), Default::default())?;
    layer.reshape(&[shape.clone()])?;
    assert!(layer.is_degraded());

    backend.set_memory_budget(None);
    layer.reshape(&[shape.clone()])?;
    assert!(!layer.is_degraded());
    assert!(layer.workspace_size() > 0);
    assert!(layer.workspace_regions().iter().all(Option::is_some));
    Ok(())
}

#[test]
fn test_scratch_pool_only_grows() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    let param = ConvolutionParam::depthwise(2, 1, 3).with_pad(1, 1);
    let large = Shape::from([2, 2, 16, 16]);
    let small = Shape::from([1, 2, 4, 4]);
    let (mut layer, _) = pair(&param, &large, Arc::clone(&backend), Default::default())?;

    layer.reshape(&[large.clone()])?;
    let size = layer.workspace_size();
    assert!(size > 0);
    assert_eq!(size % 3, 0);

    layer.reshape(&[small.clone()])?;
    assert_eq!(layer.workspace_size(), size);
    layer.reshape(&[large.clone()])?;
    assert_eq!(layer.workspace_size(), size);
    assert_eq!(backend.stats().allocations, 1);

    // small input still runs against the larger pool
    layer.reshape(&[small.clone()])?;
    let x = tensor(small.dims(), 1.0, 0);
    let y = layer.forward(&[&x])?;
    assert_eq!(y[0].shape().dims(), &[1, 2, 4, 4]);

    layer.reset_workspace()?;
    assert!(layer.workspace_size() < size);
    Ok(())
}

#[test]
fn test_reshape_is_repeatable() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    let param = ConvolutionParam::depthwise(3, 1, 3);
    let shape = Shape::from([2, 3, 9, 9]);
    let (mut layer, _) = pair(&param, &shape, backend, Default::default())?;
    let first = layer.reshape(&[shape.clone()])?;
    let plans = layer.plans().to_vec();
    let size = layer.workspace_size();
    let second = layer.reshape(&[shape.clone()])?;
    assert_eq!(first, second);
    assert_eq!(layer.plans(), plans.as_slice());
    assert_eq!(layer.workspace_size(), size);
    Ok(())
}

#[test]
fn test_multiple_inputs_share_filter() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    let param = ConvolutionParam::depthwise(2, 2, 3).with_pad(1, 1);
    let shape = Shape::from([1, 2, 5, 5]);
    let (mut layer, mut reference) = pair(&param, &shape, Arc::clone(&backend), Default::default())?;
    layer.reshape(&[shape.clone(), shape.clone()])?;
    reference.reshape(&[shape.clone(), shape.clone()])?;

    let descriptors = layer
        .descriptors()
        .ok_or_else(|| TensorError::invalid_shape_simple("descriptors missing".into()))?;
    assert_eq!(descriptors.len(), 2);
    assert_eq!(layer.plans().len(), 2);

    let a = tensor(shape.dims(), 0.5, 0);
    let b = tensor(shape.dims(), -0.25, 4);
    let ys = layer.forward(&[&a, &b])?;
    let ys_ref = reference.forward(&[&a, &b])?;
    assert_eq!(ys.len(), 2);
    for (y, y_ref) in ys.iter().zip(&ys_ref) {
        assert_close(y, y_ref);
    }

    let dys: Vec<Tensor<f32>> = ys.iter().map(|y| tensor(y.shape().dims(), 1.0, 2)).collect();
    let dy_refs: Vec<&Tensor<f32>> = dys.iter().collect();
    let dxs = layer.backward(&[&a, &b], &dy_refs, false)?;
    reference.backward(&[&a, &b], &dy_refs, false)?;
    assert!(dxs.iter().all(Option::is_none));
    assert_close(&layer.weight().grad, &reference.weight().grad);

    // dropping back to one input releases the second descriptor triple
    let before = backend.stats().live_descriptors;
    layer.reshape(&[shape.clone()])?;
    assert_eq!(backend.stats().live_descriptors, before - 3);
    Ok(())
}

#[test]
fn test_backward_passes_run_on_separate_streams() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    let param = ConvolutionParam::depthwise(2, 1, 3).with_pad(1, 1);
    let shape = Shape::from([1, 2, 4, 4]);
    let (mut layer, _) = pair(&param, &shape, Arc::clone(&backend), Default::default())?;
    layer.reshape(&[shape.clone()])?;
    backend.clear_stream_log();

    let x = tensor(shape.dims(), 1.0, 0);
    let dy = tensor(&[1, 2, 4, 4], 1.0, 3);
    layer.backward_bias(0, &dy)?;
    layer.backward_filter(0, &x, &dy)?;
    layer.backward_data(0, &dy)?;
    layer.synchronize()?;

    // streams were created first, so they carry ids 0, 1 and 2
    assert_eq!(backend.stream_ops(0), vec![StreamOp::BackwardBias; 2]);
    assert_eq!(backend.stream_ops(1), vec![StreamOp::BackwardFilter; 2]);
    assert_eq!(backend.stream_ops(2), vec![StreamOp::BackwardData; 2]);
    Ok(())
}

#[test]
fn test_single_stream_configuration() -> Result<()> {
    let config = AcceleratedConvConfig {
        stream_count: 1,
        ..Default::default()
    };
    check_parity(
        ConvolutionParam::depthwise(3, 1, 3).with_pad(1, 1),
        Shape::from([1, 3, 6, 6]),
        Arc::new(HostBackend::new()),
        config,
    )
}

#[test]
fn test_zero_stream_configuration_rejected() {
    let config = AcceleratedConvConfig {
        stream_count: 0,
        ..Default::default()
    };
    let err = AcceleratedDepthwiseConv2D::<f32, _>::new(
        &ConvolutionParam::depthwise(2, 1, 3),
        &Shape::from([1, 2, 4, 4]),
        config,
        Arc::new(HostBackend::new()),
    )
    .unwrap_err();
    assert!(matches!(err, TensorError::InvalidConfiguration { .. }));
}

#[test]
fn test_channels_not_divisible_by_group() {
    let err = AcceleratedDepthwiseConv2D::<f32, _>::new(
        &ConvolutionParam::depthwise(4, 1, 3).with_group(3),
        &Shape::from([1, 4, 4, 4]),
        AcceleratedConvConfig::default(),
        Arc::new(HostBackend::new()),
    )
    .unwrap_err();
    assert!(matches!(err, TensorError::InvalidConfiguration { .. }));
}

#[test]
fn test_reshape_rejects_non_2d_input() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    let param = ConvolutionParam::depthwise(2, 1, 1);
    let shape = Shape::from([1, 2, 4, 4]);
    let (mut layer, _) = pair(&param, &shape, backend, Default::default())?;
    let err = layer.reshape(&[Shape::from([1, 2, 4])]).unwrap_err();
    assert!(matches!(err, TensorError::InvalidConfiguration { .. }));
    assert_eq!(layer.state(), LifecycleState::Ready);
    Ok(())
}

#[test]
fn test_teardown_is_idempotent() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    let param = ConvolutionParam::depthwise(2, 1, 3).with_pad(1, 1);
    let shape = Shape::from([1, 2, 6, 6]);
    let (mut layer, _) = pair(&param, &shape, Arc::clone(&backend), Default::default())?;
    layer.reshape(&[shape.clone()])?;
    assert!(!backend.stats().all_released());

    layer.teardown();
    let after_first = backend.stats();
    assert!(after_first.all_released());
    assert_eq!(layer.state(), LifecycleState::Destroyed);

    layer.teardown();
    assert_eq!(backend.stats(), after_first);
    assert_eq!(layer.state(), LifecycleState::Destroyed);

    let x = tensor(shape.dims(), 1.0, 0);
    assert!(matches!(
        layer.forward_at(0, &x),
        Err(TensorError::InvalidLifecycle { .. })
    ));
    Ok(())
}

#[test]
fn test_weight_update_reaches_backend_layout() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    let param = ConvolutionParam::depthwise(1, 1, 1).with_bias(false);
    let shape = Shape::from([1, 1, 2, 2]);
    let (mut layer, _) = pair(&param, &shape, backend, Default::default())?;
    layer.reshape(&[shape.clone()])?;

    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2])?;
    for p in layer.parameters_mut() {
        p.data.fill(3.0);
    }
    let y = layer.forward(&[&x])?.remove(0);
    assert_eq!(y.as_slice(), &[3.0, 6.0, 9.0, 12.0]);
    Ok(())
}

#[test]
fn test_single_pass_calls_see_weight_updates() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    let param = ConvolutionParam::depthwise(1, 1, 1).with_bias(false);
    let shape = Shape::from([1, 1, 2, 2]);
    let (mut layer, _) = pair(&param, &shape, backend, Default::default())?;
    layer.reshape(&[shape.clone()])?;
    layer.zero_grad();

    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2])?;
    layer.weight_mut().data.fill(3.0);
    let y = layer.forward_at(0, &x)?;
    assert_eq!(y.as_slice(), &[3.0, 6.0, 9.0, 12.0]);

    layer.weight_mut().data.fill(2.0);
    let dy = Tensor::from_vec(vec![1.0; 4], &[1, 1, 2, 2])?;
    let dx = layer.backward_data(0, &dy)?;
    assert_eq!(dx.as_slice(), &[2.0; 4]);

    // the accumulated filter gradient must survive the trip back to compact layout
    layer.weight_mut().data.fill(1.0);
    layer.backward_filter(0, &x, &dy)?;
    let state = layer.to_state(true)?;
    assert_eq!(state.blobs[0].data, vec![1.0]);
    assert_eq!(state.blobs[0].grad, Some(vec![10.0]));
    Ok(())
}
