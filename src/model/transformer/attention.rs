//! Attention and MLP blocks for the DiT.
//!
//! One attention type covers both uses:
//! - **self-attention**: RoPE on Q/K, optional additive mask (sliding
//!   window or full)
//! - **cross-attention**: K/V from encoder hidden states, no RoPE, optional
//!   padding mask, K/V reusable across diffusion steps via a caller-owned
//!   cache slot
//!
//! Grouped-query attention: K/V heads are repeated `H / H_kv` times before
//! the scaled dot product. QK-RMSNorm is applied per head before attention.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{linear_b, linear_no_bias, Linear, RmsNorm, VarBuilder};

use crate::config::ModelConfig;

/// Repeat K/V heads `n_rep` times along the head axis for GQA.
pub(crate) fn repeat_kv(kv: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(kv.clone());
    }
    let (b, h_kv, l, d) = kv.dims4()?;
    kv.unsqueeze(2)?
        .expand((b, h_kv, n_rep, l, d))?
        .reshape((b, h_kv * n_rep, l, d))
}

/// Pre-computed rotary embedding frequencies.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(cfg: &ModelConfig) -> Self {
        let head_dim = cfg.head_dim;
        let inv_freq = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / cfg.rope_theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        Self { inv_freq }
    }

    /// Cos/sin tables for positions `0..seq_len`, each `[seq_len, head_dim]`.
    pub fn tables(
        &self,
        seq_len: usize,
        dtype: DType,
        device: &candle_core::Device,
    ) -> Result<(Tensor, Tensor)> {
        let half = self.inv_freq.len();
        let inv_freq = Tensor::from_slice(&self.inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        // [freqs, freqs] → [seq_len, head_dim]
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }

    /// Apply the rotation to `x` of shape `[B, H, L, head_dim]`.
    ///
    /// Runs in f32 regardless of the input dtype.
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let cos = cos.to_dtype(DType::F32)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.to_dtype(DType::F32)?.unsqueeze(0)?.unsqueeze(0)?;

        // rotate_half: [-x[..., d/2:], x[..., :d/2]]
        let half = x.dim(D::Minus1)? / 2;
        let x_lo = x.narrow(D::Minus1, 0, half)?;
        let x_hi = x.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x_hi.neg()?, &x_lo], D::Minus1)?;

        let out = (x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?;
        out.to_dtype(x_dtype)
    }
}

/// Grouped-query attention shared by the self- and cross-attention slots of
/// a DiT layer.
#[derive(Debug, Clone)]
pub struct DitAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    num_kv_groups: usize,
    head_dim: usize,
    is_cross: bool,
}

impl DitAttention {
    pub fn new(cfg: &ModelConfig, is_cross: bool, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = cfg.head_dim;
        let q_out = cfg.num_attention_heads * head_dim;
        let kv_out = cfg.num_key_value_heads * head_dim;
        let bias = cfg.attention_bias;

        let q_proj = linear_b(hidden, q_out, bias, vb.pp("q_proj"))?;
        let k_proj = linear_b(hidden, kv_out, bias, vb.pp("k_proj"))?;
        let v_proj = linear_b(hidden, kv_out, bias, vb.pp("v_proj"))?;
        let o_proj = linear_b(q_out, hidden, bias, vb.pp("o_proj"))?;
        let q_norm = candle_nn::rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("q_norm"))?;
        let k_norm = candle_nn::rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("k_norm"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            num_kv_groups: cfg.num_key_value_groups(),
            head_dim,
            is_cross,
        })
    }

    /// Project and split into heads: `[B, L, H*d] → [B, H, L, d]` with a
    /// per-head RMSNorm.
    fn heads(&self, x: &Tensor, proj: &Linear, norm: &RmsNorm, n_heads: usize) -> Result<Tensor> {
        let (b, l, _) = x.dims3()?;
        let x = proj.forward(x)?;
        let x = x.reshape((b, l, n_heads, self.head_dim))?;
        let x = norm.forward(&x)?;
        x.transpose(1, 2)?.contiguous()
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, L, D]` query source
    /// - `attention_mask`: additive mask broadcastable to `[B, H, L, S]`
    /// - `encoder_hidden_states`: K/V source for cross-attention
    /// - `position_embeddings`: RoPE `(cos, sin)`, self-attention only
    /// - `kv_cache`: caller-owned slot; filled on first use, reused after
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        position_embeddings: Option<&(Tensor, Tensor)>,
        kv_cache: Option<&mut Option<(Tensor, Tensor)>>,
    ) -> Result<Tensor> {
        debug_assert_eq!(self.is_cross, encoder_hidden_states.is_some());
        let (b, l, _) = hidden_states.dims3()?;

        let q = self.heads(hidden_states, &self.q_proj, &self.q_norm, self.num_heads)?;

        let (k, v) = match kv_cache {
            Some(slot) => match slot {
                Some((k, v)) => (k.clone(), v.clone()),
                None => {
                    let kv_src = encoder_hidden_states.unwrap_or(hidden_states);
                    let k = self.heads(kv_src, &self.k_proj, &self.k_norm, self.num_kv_heads)?;
                    let v = self.value_heads(kv_src)?;
                    *slot = Some((k.clone(), v.clone()));
                    (k, v)
                }
            },
            None => {
                let kv_src = encoder_hidden_states.unwrap_or(hidden_states);
                let k = self.heads(kv_src, &self.k_proj, &self.k_norm, self.num_kv_heads)?;
                let v = self.value_heads(kv_src)?;
                (k, v)
            }
        };

        let (q, k) = match position_embeddings {
            Some((cos, sin)) => (
                RotaryEmbedding::apply(&q, cos, sin)?,
                RotaryEmbedding::apply(&k, cos, sin)?,
            ),
            None => (q, k),
        };

        let k = repeat_kv(&k, self.num_kv_groups)?;
        let v = repeat_kv(&v, self.num_kv_groups)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        let attn = match attention_mask {
            Some(mask) => attn.broadcast_add(mask)?,
            None => attn,
        };
        // Softmax in f32 for numerical stability under half precision.
        let attn = candle_nn::ops::softmax_last_dim(&attn.to_dtype(DType::F32)?)?
            .to_dtype(v.dtype())?;
        let out = attn.matmul(&v)?; // [B, H, L, d]

        let out = out
            .transpose(1, 2)?
            .reshape((b, l, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }

    fn value_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, l, _) = x.dims3()?;
        self.v_proj
            .forward(x)?
            .reshape((b, l, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

/// SwiGLU MLP: `down(silu(gate(x)) ⊙ up(x))`, no biases.
#[derive(Debug, Clone)]
pub struct SwiGluMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl SwiGluMlp {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let inter = cfg.intermediate_size;
        Ok(Self {
            gate_proj: linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
        })
    }
}

impl Module for SwiGluMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = xs.apply(&self.gate_proj)?.silu()?;
        let up = xs.apply(&self.up_proj)?;
        (gate * up)?.apply(&self.down_proj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn small_cfg() -> ModelConfig {
        ModelConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            head_dim: 8,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn repeat_kv_expands_heads() {
        let dev = Device::Cpu;
        let kv = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &dev).unwrap();
        let out = repeat_kv(&kv, 3).unwrap();
        assert_eq!(out.dims(), &[1, 6, 5, 8]);

        // Groups are repeats of the original heads.
        let orig = kv.narrow(1, 1, 1).unwrap();
        let rep = out.narrow(1, 4, 1).unwrap();
        let diff: f32 = (&orig - &rep)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn rope_tables_shape_and_bounds() {
        let cfg = small_cfg();
        let rope = RotaryEmbedding::new(&cfg);
        let (cos, sin) = rope.tables(16, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(cos.dims(), &[16, 8]);
        assert_eq!(sin.dims(), &[16, 8]);

        let max: f32 = cos
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(max <= 1.0 + 1e-6);
    }

    #[test]
    fn rope_preserves_norm() {
        let cfg = small_cfg();
        let rope = RotaryEmbedding::new(&cfg);
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 16, 8), &dev).unwrap();
        let (cos, sin) = rope.tables(16, DType::F32, &dev).unwrap();
        let rotated = RotaryEmbedding::apply(&x, &cos, &sin).unwrap();

        let before: f32 = x.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        let after: f32 = rotated
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(
            (before - after).abs() / before < 1e-4,
            "rotation must preserve norm: {before} vs {after}"
        );
    }

    #[test]
    fn rope_commutes_with_gqa_expansion() {
        let cfg = small_cfg();
        let rope = RotaryEmbedding::new(&cfg);
        let dev = Device::Cpu;
        let kv = Tensor::randn(0f32, 1.0, (1, 2, 6, 8), &dev).unwrap();
        let (cos, sin) = rope.tables(6, DType::F32, &dev).unwrap();

        let rotate_then_expand =
            repeat_kv(&RotaryEmbedding::apply(&kv, &cos, &sin).unwrap(), 2).unwrap();
        let expand_then_rotate =
            RotaryEmbedding::apply(&repeat_kv(&kv, 2).unwrap(), &cos, &sin).unwrap();

        let diff: f32 = (&rotate_then_expand - &expand_then_rotate)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn self_attention_output_shape() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let attn = DitAttention::new(&cfg, false, vb.pp("self_attn")).unwrap();
        let rope = RotaryEmbedding::new(&cfg);
        let (cos, sin) = rope.tables(10, DType::F32, &dev).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 10, 32), &dev).unwrap();
        let out = attn
            .forward(&x, None, None, Some(&(cos, sin)), None)
            .unwrap();
        assert_eq!(out.dims(), &[2, 10, 32]);
    }

    #[test]
    fn cross_attention_cache_round_trip() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let attn = DitAttention::new(&cfg, true, vb.pp("cross_attn")).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 10, 32), &dev).unwrap();
        let enc = Tensor::randn(0f32, 1.0, (1, 6, 32), &dev).unwrap();

        let mut slot = None;
        let cached = attn
            .forward(&x, None, Some(&enc), None, Some(&mut slot))
            .unwrap();
        assert!(slot.is_some(), "first forward must populate the cache");

        // Second forward reuses the slot; result must match a cacheless run.
        let reused = attn
            .forward(&x, None, Some(&enc), None, Some(&mut slot))
            .unwrap();
        let fresh = attn.forward(&x, None, Some(&enc), None, None).unwrap();

        for other in [&reused, &fresh] {
            let diff: f32 = (&cached - other)
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(diff < 1e-6);
        }
    }

    #[test]
    fn swiglu_shape() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let mlp = SwiGluMlp::new(&cfg, vb.pp("mlp")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 32), &dev).unwrap();
        let y = mlp.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 5, 32]);
    }
}
