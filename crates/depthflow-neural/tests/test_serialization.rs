#![cfg(feature = "serialize")]

use depthflow_core::gpu::HostBackend;
use depthflow_core::{Result, Shape, Tensor, TensorError};
use depthflow_neural::layers::{
    AcceleratedConvConfig, AcceleratedDepthwiseConv2D, ConvolutionParam, Layer,
};
use depthflow_neural::LayerState;
use std::sync::Arc;
use tempfile::tempdir;

fn layer(multiplier: usize) -> Result<AcceleratedDepthwiseConv2D<f32, HostBackend>> {
    let param = ConvolutionParam::depthwise(2, multiplier, 3)
        .with_group(1)
        .with_pad(1, 1);
    let mut layer = AcceleratedDepthwiseConv2D::new(
        &param,
        &Shape::from([1, 2, 4, 4]),
        AcceleratedConvConfig::default(),
        Arc::new(HostBackend::new()),
    )?;
    layer.setup()?;
    layer.reshape(&[Shape::from([1, 2, 4, 4])])?;
    Ok(layer)
}

#[test]
fn test_state_holds_compact_parameters_only() -> Result<()> {
    let mut layer = layer(2)?;
    let state = layer.to_state(true)?;
    assert_eq!(state.blobs.len(), 2);
    assert_eq!(state.blobs[0].shape, vec![4, 1, 3, 3]);
    assert_eq!(state.blobs[1].shape, vec![4]);
    assert!(state.blobs[0].grad.is_some());
    Ok(())
}

#[test]
fn test_gradients_survive_save_and_load() -> Result<()> {
    let mut source = layer(1)?;
    let x = Tensor::from_vec((0..32).map(|v| v as f32 * 0.1).collect(), &[1, 2, 4, 4])?;
    for p in source.parameters_mut() {
        p.data.fill(0.5);
    }
    let y = source.forward(&[&x])?.remove(0);
    source.backward(&[&x], &[&y], false)?;
    assert!(source.weight().grad.as_slice().iter().any(|&g| g != 0.0));

    let dir = tempdir().map_err(|e| TensorError::serialization_error_simple(e.to_string()))?;
    let path = dir.path().join("depthwise.json");
    source.save_json(&path, true)?;

    let mut target = layer(1)?;
    target.load_json(&path)?;
    assert_eq!(target.weight(), source.weight());
    assert_eq!(
        target.bias().map(|b| b.grad.clone()),
        source.bias().map(|b| b.grad.clone())
    );

    // the loaded weight is live in backend layout without an explicit conversion
    let y_target = target.forward(&[&x])?.remove(0);
    assert_eq!(y_target.as_slice(), y.as_slice());
    Ok(())
}

#[test]
fn test_load_refreshes_grouped_weight() -> Result<()> {
    let mut layer = layer(2)?;
    let mut state = layer.to_state(false)?;
    state.blobs[0].data = (0..36).map(|v| v as f32).collect();
    layer.load_state(&state)?;

    let grouped = layer
        .grouped_weight()
        .ok_or_else(|| TensorError::invalid_shape_simple("grouped weight missing".into()))?;
    let translator = *layer.translator();
    for i in 0..4 {
        for k in 0..9 {
            assert_eq!(
                grouped.param().data.as_slice()[translator.backend_index(i, k)],
                (i * 9 + k) as f32
            );
        }
    }
    let nonzero = grouped
        .param()
        .data
        .as_slice()
        .iter()
        .filter(|&&v| v != 0.0)
        .count();
    // tap 0 of output 0 holds the value 0
    assert_eq!(nonzero, 35);
    Ok(())
}

#[test]
fn test_load_rejects_mismatched_state() -> Result<()> {
    let mut small = layer(1)?;
    let mut large = layer(2)?;
    let state = large.to_state(false)?;
    assert!(matches!(
        small.load_state(&state),
        Err(TensorError::SerializationError { .. })
    ));

    let dir = tempdir().map_err(|e| TensorError::serialization_error_simple(e.to_string()))?;
    let missing = dir.path().join("missing.json");
    assert!(matches!(
        LayerState::<f32>::load_json(&missing),
        Err(TensorError::IoError { .. })
    ));
    Ok(())
}
