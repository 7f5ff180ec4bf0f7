use depthflow::prelude::*;
use std::sync::Arc;

#[test]
fn test_prelude_layer_round_trip() {
    let shape = Shape::from([2, 3, 6, 6]);
    let param = ConvolutionParam::depthwise(3, 2, 3).with_pad(1, 1);
    let backend = Arc::new(HostBackend::new());

    let mut layer = AcceleratedDepthwiseConv2D::<f32, _>::new(
        &param,
        &shape,
        AcceleratedConvConfig::default(),
        Arc::clone(&backend),
    )
    .unwrap();
    layer.setup().unwrap();
    let out_shapes = layer.reshape(&[shape.clone()]).unwrap();
    assert_eq!(out_shapes[0].dims(), &[2, 6, 6, 6]);

    let x = Tensor::<f32>::zeros(shape.dims());
    let y = layer.forward(&[&x]).unwrap();
    assert_eq!(y[0].shape().dims(), &[2, 6, 6, 6]);

    let grads = layer.backward(&[&x], &[&y[0]], true).unwrap();
    assert_eq!(
        grads[0].as_ref().map(|dx| dx.shape().dims().to_vec()),
        Some(vec![2, 3, 6, 6])
    );

    layer.teardown();
    assert_eq!(layer.state(), LifecycleState::Destroyed);
    assert!(backend.stats().all_released());
}

#[test]
fn test_generic_layer_from_prelude() {
    let shape = Shape::from([1, 2, 4, 4]);
    let param = ConvolutionParam::depthwise(2, 1, 3);
    let mut layer = DepthwiseConv2D::<f32>::new(&param, &shape).unwrap();
    let out = layer.reshape(&[shape.clone()]).unwrap();
    assert_eq!(out[0].dims(), &[1, 2, 2, 2]);
    assert_eq!(layer.parameters().len(), 2);
}

#[test]
fn test_version() {
    assert!(!depthflow::version().is_empty());
}
