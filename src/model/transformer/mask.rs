//! Additive attention masks.
//!
//! Masks are 4-D tensors added to the attention scores before softmax:
//! 0.0 where attention is allowed, the dtype minimum where it is not. All
//! self-attention in the DiT is bidirectional; the only restriction is the
//! optional sliding window.

use candle_core::{DType, Device, Result, Tensor};

/// Most negative finite value representable in `dtype`.
fn dtype_min(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Build a `[1, 1, seq_len, seq_len]` self-attention mask.
///
/// With `sliding_window = Some(w)`, position pairs with `|i − j| > w` are
/// masked; with `None` the mask is all zeros (full bidirectional
/// attention).
pub fn sliding_window_mask(
    seq_len: usize,
    sliding_window: Option<usize>,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let min_val = dtype_min(dtype);
    let mut data = vec![0.0f32; seq_len * seq_len];
    if let Some(w) = sliding_window {
        for i in 0..seq_len {
            for j in 0..seq_len {
                if i.abs_diff(j) > w {
                    data[i * seq_len + j] = min_val as f32;
                }
            }
        }
    }
    Tensor::from_vec(data, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)
}

/// Expand an encoder padding mask `[B, encL]` (1 = valid, 0 = pad) to an
/// additive `[B, 1, 1, encL]` bias for cross-attention keys.
pub fn encoder_padding_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let min_val = dtype_min(dtype);
    // (mask - 1) * (-min): 0 for valid positions, dtype-min for padding.
    ((mask.to_dtype(DType::F32)? - 1.0)? * (-min_val))?
        .to_dtype(dtype)?
        .unsqueeze(1)?
        .unsqueeze(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_mask_is_all_zeros() {
        let mask = sliding_window_mask(4, None, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
        let sum: f32 = mask.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn sliding_mask_is_symmetric_band() {
        let mask = sliding_window_mask(6, Some(1), DType::F32, &Device::Cpu).unwrap();
        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        let at = |i: usize, j: usize| vals[i * 6 + j];

        assert_eq!(at(0, 0), 0.0);
        assert_eq!(at(0, 1), 0.0);
        assert!(at(0, 2) < -1e30, "distance 2 > window 1 must be masked");
        // Bidirectional: mask[i][j] == mask[j][i].
        assert_eq!(at(2, 0), at(0, 2));
        assert_eq!(at(5, 4), 0.0);
    }

    #[test]
    fn encoder_padding_mask_bias() {
        let dev = Device::Cpu;
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &dev).unwrap();
        let bias = encoder_padding_mask(&mask, DType::F32).unwrap();
        assert_eq!(bias.dims(), &[1, 1, 1, 3]);
        let vals: Vec<f32> = bias.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals[0], 0.0);
        assert_eq!(vals[1], 0.0);
        assert!(vals[2] < -1e30);
    }
}
