//! Model configuration.
//!
//! Defaults match the reference checkpoint: a 24-layer DiT at hidden size
//! 2048 over 64-channel acoustic latents, and an Oobleck VAE decoding one
//! latent frame to 2048 stereo samples.

use serde::{Deserialize, Serialize};

/// Audio samples produced per latent frame.
pub const LATENT_HOP: usize = 2048;

/// Attention layer type — alternating sliding window and full attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerType {
    SlidingAttention,
    FullAttention,
}

/// DiT decoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    // --- Core transformer ---
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub attention_bias: bool,

    // --- Sliding window ---
    pub use_sliding_window: bool,
    pub sliding_window: usize,
    pub layer_types: Vec<LayerType>,

    // --- Conditioning ---
    /// Width of the encoder hidden states fed to cross-attention.
    pub encoder_hidden_dim: usize,

    // --- Latents ---
    /// Channels of the acoustic latent the DiT denoises.
    pub acoustic_dim: usize,
    /// Channels of the context latents (source latents + chunk mask).
    pub context_dim: usize,
    pub patch_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let num_hidden_layers = 24;
        // Odd layers (1-based) slide, even layers attend fully.
        let layer_types = (0..num_hidden_layers)
            .map(|i| {
                if (i + 1) % 2 == 1 {
                    LayerType::SlidingAttention
                } else {
                    LayerType::FullAttention
                }
            })
            .collect();

        Self {
            hidden_size: 2048,
            intermediate_size: 6144,
            num_hidden_layers,
            num_attention_heads: 16,
            num_key_value_heads: 8,
            head_dim: 128,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            attention_bias: false,
            use_sliding_window: true,
            sliding_window: 128,
            layer_types,
            encoder_hidden_dim: 2048,
            acoustic_dim: 64,
            context_dim: 128,
            patch_size: 2,
        }
    }
}

impl ModelConfig {
    /// Number of GQA groups (num_attention_heads / num_key_value_heads).
    pub fn num_key_value_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Channels entering the patch-in convolution (context + acoustic).
    pub fn in_channels(&self) -> usize {
        self.context_dim + self.acoustic_dim
    }
}

/// Oobleck VAE configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeConfig {
    /// Per-block upsampling ratios, coarse to fine. Product must equal the
    /// latent hop so that a decoded frame spans exactly [`LATENT_HOP`]
    /// samples.
    pub upsampling_ratios: Vec<usize>,
    pub channel_multiples: Vec<usize>,
    pub decoder_channels: usize,
    pub latent_channels: usize,
    pub audio_channels: usize,
    pub sampling_rate: u32,
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            upsampling_ratios: vec![8, 8, 4, 4, 2],
            channel_multiples: vec![1, 2, 4, 8, 16],
            decoder_channels: 128,
            latent_channels: 64,
            audio_channels: 2,
            sampling_rate: 48000,
        }
    }
}

impl VaeConfig {
    /// Total upsampling factor = product of all ratios.
    pub fn hop_length(&self) -> usize {
        self.upsampling_ratios.iter().product()
    }

    /// Latent frames per second of audio.
    pub fn latent_fps(&self) -> f64 {
        self.sampling_rate as f64 / self.hop_length() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_config() {
        let cfg = ModelConfig::default();
        assert_eq!(cfg.hidden_size, 2048);
        assert_eq!(cfg.num_attention_heads, 16);
        assert_eq!(cfg.num_key_value_heads, 8);
        assert_eq!(cfg.num_key_value_groups(), 2);
        assert_eq!(cfg.in_channels(), 192);
        assert_eq!(cfg.layer_types.len(), 24);
        // Layer 0: sliding; layer 1: full.
        assert_eq!(cfg.layer_types[0], LayerType::SlidingAttention);
        assert_eq!(cfg.layer_types[1], LayerType::FullAttention);
    }

    #[test]
    fn vae_hop_matches_latent_hop() {
        let vae = VaeConfig::default();
        assert_eq!(vae.hop_length(), LATENT_HOP);
    }
}
