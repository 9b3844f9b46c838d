//! Model components.
//!
//! - [`transformer`] — the diffusion transformer (GQA self-attention with
//!   sliding-window masks, cross-attention to encoder states, AdaLN
//!   timestep modulation)

pub mod transformer;
