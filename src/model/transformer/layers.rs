//! One DiT transformer block.
//!
//! Three sub-layers with adaptive layer normalization from the timestep
//! projection:
//! 1. AdaLN self-attention — scale/shift before, gate after
//! 2. cross-attention — plain pre-norm residual, no modulation, no gate
//! 3. AdaLN SwiGLU MLP — scale/shift before, gate after

use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{Module, RmsNorm, VarBuilder};

use super::attention::{DitAttention, SwiGluMlp};
use crate::config::{LayerType, ModelConfig};

#[derive(Debug, Clone)]
pub struct DitLayer {
    self_attn_norm: RmsNorm,
    self_attn: DitAttention,
    cross_attn_norm: RmsNorm,
    cross_attn: DitAttention,
    mlp_norm: RmsNorm,
    mlp: SwiGluMlp,
    // Learned AdaLN offsets, added to the per-step timestep projection.
    scale_shift_table: Tensor, // [1, 6, D]
    layer_type: LayerType,
}

impl DitLayer {
    pub fn new(cfg: &ModelConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn_norm: candle_nn::rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("self_attn_norm"),
            )?,
            self_attn: DitAttention::new(cfg, false, vb.pp("self_attn"))?,
            cross_attn_norm: candle_nn::rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("cross_attn_norm"),
            )?,
            cross_attn: DitAttention::new(cfg, true, vb.pp("cross_attn"))?,
            mlp_norm: candle_nn::rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("mlp_norm"))?,
            mlp: SwiGluMlp::new(cfg, vb.pp("mlp"))?,
            scale_shift_table: vb.get((1, 6, cfg.hidden_size), "scale_shift_table")?,
            layer_type: cfg.layer_types[layer_idx],
        })
    }

    /// Whether self-attention in this layer uses the sliding-window mask.
    pub fn uses_sliding_window(&self) -> bool {
        self.layer_type == LayerType::SlidingAttention
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, S, D]`
    /// - `timestep_proj`: `[B, 6, D]` — shared by all layers
    /// - `self_attn_mask`: additive `[1, 1, S, S]`
    /// - `encoder_hidden_states`: `[B, E, D]` (already width-projected)
    /// - `encoder_attn_mask`: additive `[B, 1, 1, E]`
    /// - `position_embeddings`: RoPE `(cos, sin)` for self-attention
    /// - `cross_kv_cache`: per-layer slot owned by the stepper's cache
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        timestep_proj: &Tensor,
        self_attn_mask: Option<&Tensor>,
        encoder_hidden_states: &Tensor,
        encoder_attn_mask: Option<&Tensor>,
        position_embeddings: &(Tensor, Tensor),
        cross_kv_cache: Option<&mut Option<(Tensor, Tensor)>>,
    ) -> Result<Tensor> {
        // [1, 6, D] + [B, 6, D] → six [B, 1, D] modulation vectors.
        let modulation = self.scale_shift_table.broadcast_add(timestep_proj)?;
        let shift_self = modulation.i((.., 0..1, ..))?;
        let scale_self = modulation.i((.., 1..2, ..))?;
        let gate_self = modulation.i((.., 2..3, ..))?;
        let shift_mlp = modulation.i((.., 3..4, ..))?;
        let scale_mlp = modulation.i((.., 4..5, ..))?;
        let gate_mlp = modulation.i((.., 5..6, ..))?;

        // 1. AdaLN self-attention: norm(h)·(1+scale) + shift, gated residual.
        let norm_h = self.self_attn_norm.forward(hidden_states)?;
        let norm_h = norm_h
            .broadcast_mul(&(scale_self + 1.0)?)?
            .broadcast_add(&shift_self)?;
        let attn_out = self.self_attn.forward(
            &norm_h,
            self_attn_mask,
            None,
            Some(position_embeddings),
            None,
        )?;
        let h = (hidden_states + attn_out.broadcast_mul(&gate_self)?)?;

        // 2. Cross-attention: pre-norm residual, unmodulated.
        let norm_h = self.cross_attn_norm.forward(&h)?;
        let cross_out = self.cross_attn.forward(
            &norm_h,
            encoder_attn_mask,
            Some(encoder_hidden_states),
            None,
            cross_kv_cache,
        )?;
        let h = (&h + cross_out)?;

        // 3. AdaLN MLP.
        let norm_h = self.mlp_norm.forward(&h)?;
        let norm_h = norm_h
            .broadcast_mul(&(scale_mlp + 1.0)?)?
            .broadcast_add(&shift_mlp)?;
        let mlp_out = self.mlp.forward(&norm_h)?;
        &h + mlp_out.broadcast_mul(&gate_mlp)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    use crate::model::transformer::attention::RotaryEmbedding;

    fn small_cfg() -> ModelConfig {
        ModelConfig {
            hidden_size: 16,
            intermediate_size: 32,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            head_dim: 8,
            num_hidden_layers: 2,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn dit_layer_preserves_shape() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let layer = DitLayer::new(&cfg, 0, vb.pp("layer")).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 8, 16), &dev).unwrap();
        let proj = Tensor::randn(0f32, 1.0, (2, 6, 16), &dev).unwrap();
        let enc = Tensor::randn(0f32, 1.0, (2, 12, 16), &dev).unwrap();
        let rope = RotaryEmbedding::new(&cfg);
        let pos = rope.tables(8, DType::F32, &dev).unwrap();

        let y = layer
            .forward(&x, &proj, None, &enc, None, &pos, None)
            .unwrap();
        assert_eq!(y.dims(), &[2, 8, 16]);
    }

    #[test]
    fn layer_type_follows_config() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let sliding = DitLayer::new(&cfg, 0, vb.pp("l0")).unwrap();
        let full = DitLayer::new(&cfg, 1, vb.pp("l1")).unwrap();
        assert!(sliding.uses_sliding_window());
        assert!(!full.uses_sliding_window());
    }
}
