//! Text-conditioned music generation in pure Rust.
//!
//! A candle-based inference engine pairing a flow-matching Diffusion
//! Transformer (DiT) with an Oobleck variational decoder. One end-to-end
//! operation: caption + lyrics → stereo audio samples. Conditioning tensors
//! come from a pluggable [`conditioning::ConditioningProvider`]; the engine
//! itself never tokenizes or encodes text.
//!
//! ## Architecture
//!
//! ```text
//! caption/lyrics → ConditioningProvider ──┐
//!                                          ├→ cross-attention context
//! source / silence latents ───────────────┘
//!                                          ↓
//!                DiT decoder (24 blocks, flow matching, APG guidance)
//!                                          ↓
//!                Oobleck decoder (latent → stereo waveform)
//! ```
//!
//! ## Modules
//!
//! - [`model`] — the DiT decoder (attention, layers, timestep embedding)
//! - [`vae`] — Oobleck encoder/decoder (Snake activation, residual units)
//! - [`scheduler`] — diffusion timestep schedule construction
//! - [`guidance`] — Adaptive Projected Guidance for classifier-free guidance
//! - [`stepper`] — one ODE step per schedule entry, CFG batch doubling
//! - [`weights`] — checkpoint ingestion and key/layout normalization
//! - [`pipeline`] — end-to-end run orchestration

pub mod conditioning;
pub mod config;
pub mod guidance;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod stepper;
pub mod vae;
pub mod weights;

mod error;

pub use error::{Error, Result};
