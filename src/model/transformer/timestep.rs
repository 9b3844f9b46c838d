//! Sinusoidal timestep embedding.
//!
//! Scalar timesteps become high-dimensional conditioning:
//! sinusoid (256-dim) → Linear → SiLU → Linear → `temb [B, D]`, then
//! SiLU → Linear → `proj [B, 6, D]`, the six AdaLN modulation vectors
//! shared by every DiT layer.
//!
//! The DiT carries two of these heads: one fed `timestep`, one fed
//! `timestep − timestep_r`. Callers pass `timestep_r = timestep`, so the
//! second head always embeds zero; that symmetry is part of the checkpoint
//! contract and must not be "optimized" away.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{self as nn, VarBuilder};

/// Frequency count of the sinusoidal embedding.
const FREQ_DIM: usize = 256;

/// Timesteps in (0, 1] are scaled up before the sinusoid so neighbouring
/// schedule entries land on distinguishable frequencies.
const TIMESTEP_SCALE: f64 = 1000.0;

const MAX_PERIOD: f64 = 10_000.0;

/// One timestep embedding head.
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    time_proj: nn::Linear,
}

impl TimestepEmbedding {
    pub fn new(time_embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear_1 = nn::linear(FREQ_DIM, time_embed_dim, vb.pp("linear_1"))?;
        let linear_2 = nn::linear(time_embed_dim, time_embed_dim, vb.pp("linear_2"))?;
        let time_proj = nn::linear(time_embed_dim, time_embed_dim * 6, vb.pp("time_proj"))?;
        Ok(Self {
            linear_1,
            linear_2,
            time_proj,
        })
    }

    /// Sinusoidal features: `t [B]` → `[B, FREQ_DIM]`.
    fn sinusoid(&self, t: &Tensor, dev: &Device) -> Result<Tensor> {
        let t = (t.to_dtype(DType::F32)? * TIMESTEP_SCALE)?;
        let half = FREQ_DIM / 2;

        let freqs: Vec<f32> = (0..half)
            .map(|i| (-(MAX_PERIOD.ln()) * i as f64 / half as f64).exp() as f32)
            .collect();
        let freqs = Tensor::from_slice(&freqs, (1, half), dev)?;

        let args = t.unsqueeze(1)?.broadcast_mul(&freqs)?;
        Tensor::cat(&[&args.cos()?, &args.sin()?], 1)
    }

    /// `t [B]` → `(temb [B, D], proj [B, 6, D])`.
    pub fn forward(&self, t: &Tensor) -> Result<(Tensor, Tensor)> {
        let dtype = t.dtype();
        let t_freq = self.sinusoid(t, t.device())?.to_dtype(dtype)?;

        let temb = t_freq
            .apply(&self.linear_1)?
            .silu()?
            .apply(&self.linear_2)?;
        let proj = temb.silu()?.apply(&self.time_proj)?;

        let (b, d) = temb.dims2()?;
        let proj = proj.reshape((b, 6, d))?;
        Ok((temb, proj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_shapes() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let te = TimestepEmbedding::new(32, vb.pp("time_embed")).unwrap();
        let t = Tensor::new(&[0.5f32, 0.8], &dev).unwrap();
        let (temb, proj) = te.forward(&t).unwrap();
        assert_eq!(temb.dims(), &[2, 32]);
        assert_eq!(proj.dims(), &[2, 6, 32]);
    }

    #[test]
    fn sinusoid_distinguishes_timesteps() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let te = TimestepEmbedding::new(32, vb.pp("time_embed")).unwrap();

        let a = te.sinusoid(&Tensor::new(&[0.1f32], &dev).unwrap(), &dev).unwrap();
        let b = te.sinusoid(&Tensor::new(&[0.9f32], &dev).unwrap(), &dev).unwrap();
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.1);
    }

    #[test]
    fn sinusoid_at_zero_is_cosine_one() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let te = TimestepEmbedding::new(32, vb.pp("time_embed")).unwrap();

        // t = 0: all cos terms are 1, all sin terms are 0.
        let emb = te.sinusoid(&Tensor::new(&[0f32], &dev).unwrap(), &dev).unwrap();
        let vals: Vec<f32> = emb.flatten_all().unwrap().to_vec1().unwrap();
        for &c in &vals[..FREQ_DIM / 2] {
            assert!((c - 1.0).abs() < 1e-6);
        }
        for &s in &vals[FREQ_DIM / 2..] {
            assert!(s.abs() < 1e-6);
        }
    }
}
