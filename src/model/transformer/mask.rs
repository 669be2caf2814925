//! Additive attention masks.
//!
//! Masks hold 0.0 for visible positions and the dtype's most negative finite
//! value for hidden ones, and are added to attention scores before softmax.

use candle_core::{DType, Device, Result, Tensor};

/// Most negative finite value representable in `dtype`.
fn min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Key-padding mask [B, 1, 1, S] from a 0/1 attention mask [B, S].
pub fn padding_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    let keep = attention_mask.to_dtype(DType::F32)?;
    // (1 - keep) * min
    let mask = keep.affine(-min_value(dtype), min_value(dtype))?;
    mask.reshape((batch, 1, 1, seq_len))?.to_dtype(dtype)
}

/// Causal mask [1, 1, T, T]: position i sees positions j <= i.
pub fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let min_val = min_value(dtype);
    let mask_data: Vec<f64> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { min_val } else { 0.0 }))
        .collect();
    Tensor::new(mask_data.as_slice(), device)?
        .reshape((1, 1, seq_len, seq_len))?
        .to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_mask() {
        let attention_mask = Tensor::new(&[[1u32, 1, 0], [1, 0, 0]], &Device::Cpu).unwrap();
        let mask = padding_mask(&attention_mask, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[2, 1, 1, 3]);
        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals[0], 0.0);
        assert_eq!(vals[1], 0.0);
        assert!(vals[2] < -1e30);
        assert_eq!(vals[3], 0.0);
        assert!(vals[4] < -1e30);
    }

    #[test]
    fn test_causal_mask() {
        let mask = causal_mask(3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        // Row 0 sees only itself
        assert_eq!(vals[0], 0.0);
        assert!(vals[1] < -1e30);
        assert!(vals[2] < -1e30);
        // Row 2 sees everything
        assert!(vals[6..].iter().all(|v| *v == 0.0));
    }
}
