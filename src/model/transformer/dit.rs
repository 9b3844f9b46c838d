//! The full DiT decoder.
//!
//! Patchifies the latent stream, runs the layer stack under timestep and
//! encoder conditioning, and unpatchifies back to a velocity prediction:
//!
//! `[B, T, 64]` latents + `[B, T, 128]` context → `[B, T, 64]` velocity.

use std::collections::HashMap;
use std::sync::Mutex;

use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{self as nn, Conv1d, Conv1dConfig, Module, RmsNorm, VarBuilder};

use super::attention::RotaryEmbedding;
use super::layers::DitLayer;
use super::mask::{encoder_padding_mask, sliding_window_mask};
use super::timestep::TimestepEmbedding;
use crate::config::ModelConfig;

/// Per-run cross-attention K/V cache, one slot per layer.
///
/// Owned by the caller (the stepper) rather than by any layer, so its
/// lifetime is visibly tied to one generation run. Populated on the first
/// forward for a given encoder input; callers must reset or bypass it when
/// the encoder input changes (in particular when CFG doubles the batch).
#[derive(Debug, Default)]
pub struct CrossAttentionCache {
    slots: Vec<Option<(Tensor, Tensor)>>,
}

impl CrossAttentionCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            slots: vec![None; num_layers],
        }
    }

    /// Drop all cached K/V.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// The DiT decoder.
#[derive(Debug)]
pub struct DitModel {
    rotary_emb: RotaryEmbedding,
    layers: Vec<DitLayer>,
    proj_in: Conv1d,
    proj_out: nn::ConvTranspose1d,
    time_embed: TimestepEmbedding,
    time_embed_r: TimestepEmbedding,
    condition_embedder: nn::Linear,
    norm_out: RmsNorm,
    scale_shift_table: Tensor, // [1, 2, D]
    patch_size: usize,
    sliding_window: Option<usize>,
    // Write-once memo of sliding masks keyed by padded sequence length.
    // Concurrent runs at the same length race benignly: every writer
    // produces the same tensor.
    sliding_mask_memo: Mutex<HashMap<usize, Tensor>>,
}

impl DitModel {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let inner_dim = cfg.hidden_size;
        let patch_size = cfg.patch_size;

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(DitLayer::new(cfg, i, vb.pp(format!("layers.{i}")))?);
        }

        // Patch in: Conv1d(in_channels, D, kernel = stride = patch_size).
        let proj_in_cfg = Conv1dConfig {
            stride: patch_size,
            ..Default::default()
        };
        let proj_in = nn::conv1d(
            cfg.in_channels(),
            inner_dim,
            patch_size,
            proj_in_cfg,
            vb.pp("proj_in"),
        )?;

        // Patch out: ConvTranspose1d(D, acoustic_dim, kernel = stride = patch_size).
        let proj_out_cfg = nn::ConvTranspose1dConfig {
            stride: patch_size,
            ..Default::default()
        };
        let proj_out = nn::conv_transpose1d(
            inner_dim,
            cfg.acoustic_dim,
            patch_size,
            proj_out_cfg,
            vb.pp("proj_out"),
        )?;

        let time_embed = TimestepEmbedding::new(inner_dim, vb.pp("time_embed"))?;
        let time_embed_r = TimestepEmbedding::new(inner_dim, vb.pp("time_embed_r"))?;
        let condition_embedder = nn::linear(
            cfg.encoder_hidden_dim,
            inner_dim,
            vb.pp("condition_embedder"),
        )?;
        let norm_out = candle_nn::rms_norm(inner_dim, cfg.rms_norm_eps, vb.pp("norm_out"))?;
        let scale_shift_table = vb.get((1, 2, inner_dim), "scale_shift_table")?;

        Ok(Self {
            rotary_emb: RotaryEmbedding::new(cfg),
            layers,
            proj_in,
            proj_out,
            time_embed,
            time_embed_r,
            condition_embedder,
            norm_out,
            scale_shift_table,
            patch_size,
            sliding_window: cfg.use_sliding_window.then_some(cfg.sliding_window),
            sliding_mask_memo: Mutex::new(HashMap::new()),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Sliding mask for `seq_len`, built lazily and memoized.
    fn sliding_mask(
        &self,
        seq_len: usize,
        dtype: candle_core::DType,
        device: &candle_core::Device,
    ) -> Result<Option<Tensor>> {
        let Some(window) = self.sliding_window else {
            return Ok(None);
        };
        let mut memo = self
            .sliding_mask_memo
            .lock()
            .expect("sliding mask memo poisoned");
        if let Some(mask) = memo.get(&seq_len) {
            return Ok(Some(mask.clone()));
        }
        let mask = sliding_window_mask(seq_len, Some(window), dtype, device)?;
        memo.insert(seq_len, mask.clone());
        Ok(Some(mask))
    }

    /// Forward pass producing the velocity prediction.
    ///
    /// - `hidden_states`: `[B, T, acoustic_dim]` noisy latents
    /// - `timestep`, `timestep_r`: `[B]` — the stepper passes the current
    ///   timestep for both
    /// - `encoder_hidden_states`: `[B, E, encoder_hidden_dim]`
    /// - `encoder_attention_mask`: `[B, E]`, 1 = valid, 0 = pad
    /// - `context_latents`: `[B, T, context_dim]`
    /// - `cross_kv_cache`: reused across diffusion steps of one run
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        timestep: &Tensor,
        timestep_r: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_attention_mask: Option<&Tensor>,
        context_latents: &Tensor,
        mut cross_kv_cache: Option<&mut CrossAttentionCache>,
    ) -> Result<Tensor> {
        // 1. Timestep embeddings from both heads. The second head sees
        //    timestep − timestep_r, identically zero in ODE inference.
        let (temb_t, proj_t) = self.time_embed.forward(timestep)?;
        let t_minus_r = (timestep - timestep_r)?;
        let (temb_r, proj_r) = self.time_embed_r.forward(&t_minus_r)?;
        let temb = (&temb_t + &temb_r)?;
        let timestep_proj = (&proj_t + &proj_r)?; // [B, 6, D]

        // 2. Channel-concat context with latents, pad time to a patch multiple.
        let h = Tensor::cat(&[context_latents, hidden_states], 2)?;
        let original_len = h.dim(1)?;
        let h = if original_len % self.patch_size != 0 {
            let pad = self.patch_size - original_len % self.patch_size;
            h.pad_with_zeros(1, 0, pad)?
        } else {
            h
        };

        // 3. Patchify: [B, T, C] → [B, C, T] → conv → [B, T/P, D].
        let h = h.transpose(1, 2)?.contiguous()?;
        let h = h.apply(&self.proj_in)?;
        let mut h = h.transpose(1, 2)?.contiguous()?;

        // 4. Project encoder states into the model width.
        let enc = encoder_hidden_states.apply(&self.condition_embedder)?;

        let seq_len = h.dim(1)?;
        let dtype = h.dtype();
        let device = h.device().clone();

        // 5. Shared tables: RoPE for the patched length, masks per layer type.
        let pos_emb = self.rotary_emb.tables(seq_len, dtype, &device)?;
        let sliding_mask = self.sliding_mask(seq_len, dtype, &device)?;
        let enc_mask = encoder_attention_mask
            .map(|m| encoder_padding_mask(m, dtype))
            .transpose()?;

        // 6. Layer stack.
        for (i, layer) in self.layers.iter().enumerate() {
            let self_mask = if layer.uses_sliding_window() {
                sliding_mask.as_ref()
            } else {
                None
            };
            let layer_cache = cross_kv_cache.as_deref_mut().map(|c| &mut c.slots[i]);
            h = layer.forward(
                &h,
                &timestep_proj,
                self_mask,
                &enc,
                enc_mask.as_ref(),
                &pos_emb,
                layer_cache,
            )?;
        }

        // 7. Output AdaLN: [1, 2, D] table + temb → (shift, scale).
        let modulation = self.scale_shift_table.broadcast_add(&temb.unsqueeze(1)?)?;
        let shift = modulation.i((.., 0..1, ..))?;
        let scale = modulation.i((.., 1..2, ..))?;
        let h = self.norm_out.forward(&h)?;
        let h = h.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(&shift)?;

        // 8. Unpatchify and crop back to the pre-pad length.
        let h = h.transpose(1, 2)?.contiguous()?;
        let h = h.apply(&self.proj_out)?;
        let h = h.transpose(1, 2)?.contiguous()?;
        if h.dim(1)? > original_len {
            h.narrow(1, 0, original_len)
        } else {
            Ok(h)
        }
    }
}
