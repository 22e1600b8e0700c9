use candle_core::{DType, Device, Result, Tensor};
use embedding::positional::rope::{sin_cos_tables, Rope, RopeConfig};
use static_assertions::assert_impl_all;

assert_impl_all!(Rope: Send, Sync);

fn rope(head_dim: usize, max_seq_len: usize) -> Result<Rope> {
    Rope::new(
        RopeConfig {
            head_dim,
            rope_theta: 10_000.0,
        },
        max_seq_len,
        &Device::Cpu,
    )
}

fn naive_rotation(x: &[f32], pos: usize, head_dim: usize, theta: f64) -> Vec<f32> {
    let mut out = vec![0f32; head_dim];
    for i in 0..head_dim / 2 {
        let angle = pos as f64 * theta.powf(-((2 * i) as f64) / head_dim as f64);
        let (s, c) = (angle.sin() as f32, angle.cos() as f32);
        out[2 * i] = x[2 * i] * c - x[2 * i + 1] * s;
        out[2 * i + 1] = x[2 * i + 1] * c + x[2 * i] * s;
    }
    out
}

#[test]
fn tables_have_expected_geometry() -> Result<()> {
    let cfg = RopeConfig {
        head_dim: 8,
        rope_theta: 10_000.0,
    };
    let (sin, cos) = sin_cos_tables(5, &cfg, &Device::Cpu)?;
    assert_eq!(sin.dims(), &[5, 4]);
    assert_eq!(cos.dtype(), DType::F32);
    // Position zero is the identity rotation.
    assert_eq!(cos.get(0)?.to_vec1::<f32>()?, vec![1.0; 4]);
    assert_eq!(sin.get(0)?.to_vec1::<f32>()?, vec![0.0; 4]);
    Ok(())
}

#[test]
fn rotation_matches_scalar_reference() -> Result<()> {
    let head_dim = 8;
    let rope = rope(head_dim, 16)?;
    let data: Vec<f32> = (0..2 * head_dim).map(|i| (i as f32 * 0.3).sin()).collect();
    let x = Tensor::from_vec(data.clone(), (1, 1, 2, head_dim), &Device::Cpu)?;
    let positions = Tensor::from_slice(&[3i64, 11], (1, 2), &Device::Cpu)?;

    let out = rope.apply(&x, &positions)?.flatten_all()?.to_vec1::<f32>()?;
    let mut expected = naive_rotation(&data[..head_dim], 3, head_dim, 10_000.0);
    expected.extend(naive_rotation(&data[head_dim..], 11, head_dim, 10_000.0));
    for (a, b) in out.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
    Ok(())
}

#[test]
fn rotation_depends_only_on_absolute_position() -> Result<()> {
    let rope = rope(4, 8)?;
    let x = Tensor::randn(0f32, 1.0, (1, 2, 4, 4), &Device::Cpu)?;
    let full_pos = Tensor::from_slice(&[0u32, 1, 2, 3], (1, 4), &Device::Cpu)?;
    let full = rope.apply(&x, &full_pos)?;

    let step_pos = Tensor::from_slice(&[3u32], (1, 1), &Device::Cpu)?;
    let step = rope.apply(&x.narrow(2, 3, 1)?, &step_pos)?;
    let diff = full
        .narrow(2, 3, 1)?
        .sub(&step)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn rotation_preserves_dtype() -> Result<()> {
    let rope = rope(4, 8)?;
    let positions = Tensor::from_slice(&[0i64, 1], (1, 2), &Device::Cpu)?;
    for dtype in [DType::F32, DType::F16, DType::BF16] {
        let x = Tensor::ones((1, 3, 2, 4), dtype, &Device::Cpu)?;
        assert_eq!(rope.apply(&x, &positions)?.dtype(), dtype);
    }
    Ok(())
}

#[test]
fn invalid_inputs_are_rejected() -> Result<()> {
    assert!(rope(3, 8).is_err());
    assert!(rope(4, 0).is_err());

    let rope = rope(4, 8)?;
    let x = Tensor::ones((1, 1, 2, 4), DType::F32, &Device::Cpu)?;
    let out_of_range = Tensor::from_slice(&[7i64, 8], (1, 2), &Device::Cpu)?;
    assert!(rope.apply(&x, &out_of_range).is_err());
    let wrong_shape = Tensor::from_slice(&[0i64, 1, 2], (1, 3), &Device::Cpu)?;
    assert!(rope.apply(&x, &wrong_shape).is_err());
    Ok(())
}
