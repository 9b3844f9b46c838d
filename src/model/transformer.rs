//! The diffusion transformer.
//!
//! A single-stream DiT over 64-channel acoustic latents:
//! - grouped-query self-attention with QK-RMSNorm and RoPE, alternating
//!   sliding-window (odd layers) and full (even layers) bidirectional masks
//! - cross-attention to encoder hidden states with a per-run K/V cache
//! - SwiGLU MLP
//! - AdaLN modulation of self-attention and MLP from the timestep projection
//!
//! ## Reference geometry
//!
//! ```text
//! num_hidden_layers:    24
//! hidden_size:          2048
//! num_attention_heads:  16
//! num_key_value_heads:  8
//! head_dim:             128
//! intermediate_size:    6144
//! sliding_window:       128
//! patch_size:           2
//! rope_theta:           1_000_000.0
//! ```

pub mod attention;
pub mod dit;
pub mod layers;
pub mod mask;
pub mod timestep;

pub use dit::DitModel;
