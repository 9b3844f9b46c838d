//! Adaptive Projected Guidance (APG).
//!
//! A classifier-free-guidance variant that keeps only the component of the
//! conditional/unconditional delta orthogonal to the conditional prediction.
//! Dropping the parallel component stops the guidance term from inflating
//! the prediction's own magnitude; the optional momentum buffer stabilizes
//! the guidance direction across steps and the norm threshold caps per-step
//! step-size inflation.
//!
//! All norms and projections run along the time axis (axis 1) of
//! `[B, T, C]` predictions.

use candle_core::{DType, Tensor};

use crate::Result;

const EPS: f64 = 1e-8;

/// Default momentum factor for the running guidance delta.
pub const DEFAULT_MOMENTUM: f64 = -0.75;

/// Default cap on the L2 norm of the guidance delta.
pub const DEFAULT_NORM_THRESHOLD: f64 = 2.5;

/// Exponential running buffer for the guidance delta.
///
/// One buffer per run; the pipeline owns it alongside the latent state.
#[derive(Debug, Clone)]
pub struct MomentumBuffer {
    momentum: f64,
    running: Option<Tensor>,
}

impl MomentumBuffer {
    pub fn new(momentum: f64) -> Self {
        Self {
            momentum,
            running: None,
        }
    }

    /// `running ← momentum·running + delta`, returning the updated value.
    fn update(&mut self, delta: &Tensor) -> Result<Tensor> {
        let updated = match &self.running {
            Some(running) => ((running * self.momentum)? + delta)?,
            None => delta.clone(),
        };
        self.running = Some(updated.clone());
        Ok(updated)
    }
}

impl Default for MomentumBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MOMENTUM)
    }
}

/// L2 norm along axis 1 with keepdim, computed in f32.
fn norm_axis1(x: &Tensor) -> Result<Tensor> {
    let norm = x
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_keepdim(1)?
        .sqrt()?
        .to_dtype(x.dtype())?;
    Ok(norm)
}

/// Combine conditional and unconditional predictions.
///
/// - `pred_cond`, `pred_uncond`: `[B, T, C]` velocity predictions
/// - `guidance_scale`: CFG scale `s`; at `s = 1` the conditional prediction
///   is returned untouched
/// - `momentum`: optional running buffer, updated in place
/// - `norm_threshold`: cap on the delta's axis-1 norm; `<= 0` disables
pub fn apg(
    pred_cond: &Tensor,
    pred_uncond: &Tensor,
    guidance_scale: f64,
    momentum: Option<&mut MomentumBuffer>,
    norm_threshold: f64,
) -> Result<Tensor> {
    if guidance_scale == 1.0 {
        return Ok(pred_cond.clone());
    }

    let mut diff = (pred_cond - pred_uncond)?;
    if let Some(buffer) = momentum {
        diff = buffer.update(&diff)?;
    }

    if norm_threshold > 0.0 {
        let norm = norm_axis1(&diff)?;
        let scale = ((norm + EPS)?.recip()? * norm_threshold)?.minimum(1.0)?;
        diff = diff.broadcast_mul(&scale)?;
    }

    // Unit direction of the conditional prediction along the time axis.
    let v1 = pred_cond.broadcast_div(&(norm_axis1(pred_cond)? + EPS)?)?;

    // diff = parallel + orthogonal; keep only the orthogonal part.
    let parallel_mag = diff.mul(&v1)?.sum_keepdim(1)?;
    let parallel = v1.broadcast_mul(&parallel_mag)?;
    let orthogonal = (diff - parallel)?;

    let guided = (pred_cond + (orthogonal * (guidance_scale - 1.0))?)?;
    Ok(guided)
}
