//! One diffusion step per schedule entry.
//!
//! The stepper wraps a single decoder call plus the per-step math:
//! classifier-free guidance (doubled batch + APG) and the ODE update
//! `x_next = x − v·(t − next_t)`, integrating to `t = 0` on the final step
//! (`x − v·t`).
//!
//! Two implementations share the [`DiffusionStepper`] trait: the real
//! [`DitStepper`] backed by trained weights, and [`FakeStepper`] for shape
//! and control-flow tests.

use candle_core::Tensor;

use crate::conditioning::DitConditions;
use crate::guidance::{apg, MomentumBuffer, DEFAULT_NORM_THRESHOLD};
use crate::model::transformer::dit::{CrossAttentionCache, DitModel};
use crate::{Error, Result};

/// Guidance settings for one run, derived from the generation parameters.
#[derive(Debug, Clone, Copy)]
pub struct GuidanceParams {
    pub guidance_scale: f64,
    /// CFG applies only when `cfg_interval_start ≤ t ≤ cfg_interval_end`.
    pub cfg_interval_start: f64,
    pub cfg_interval_end: f64,
}

impl Default for GuidanceParams {
    fn default() -> Self {
        Self {
            guidance_scale: 1.0,
            cfg_interval_start: 0.0,
            cfg_interval_end: 1.0,
        }
    }
}

impl GuidanceParams {
    /// Whether the guided (doubled-batch) path applies at timestep `t`.
    pub fn active_at(&self, t: f64) -> bool {
        self.guidance_scale > 1.0 && self.cfg_interval_start <= t && t <= self.cfg_interval_end
    }
}

/// Advances the latent by one schedule entry.
pub trait DiffusionStepper {
    /// Reset per-run state (cross-attention cache, guidance momentum).
    /// Called once before the first step of every run.
    fn begin_run(&mut self);

    /// One step: predict velocity at `t`, integrate to `next_t`
    /// (or to 0 when `next_t` is `None`, i.e. the last step).
    fn step(
        &mut self,
        latent: &Tensor,
        t: f64,
        next_t: Option<f64>,
        conditions: &DitConditions,
        guidance: &GuidanceParams,
    ) -> Result<Tensor>;

    /// Whether this stepper needs real conditioning tensors. The pipeline
    /// fails a run with [`Error::MissingConditioning`] when this is true
    /// and the provider supplied neither encoder states nor context.
    fn requires_conditioning(&self) -> bool;
}

/// Apply the ODE update for one step.
fn ode_update(latent: &Tensor, velocity: &Tensor, t: f64, next_t: Option<f64>) -> Result<Tensor> {
    let dt = match next_t {
        Some(next) => t - next,
        // Final step integrates all the way to t = 0.
        None => t,
    };
    let next = (latent - (velocity * dt)?)?;
    Ok(next)
}

/// The real stepper: DiT forward (+ optional CFG/APG) then the ODE update.
pub struct DitStepper {
    decoder: DitModel,
    cache: CrossAttentionCache,
    momentum: MomentumBuffer,
    norm_threshold: f64,
}

impl DitStepper {
    pub fn new(decoder: DitModel) -> Self {
        let num_layers = decoder.num_layers();
        Self {
            decoder,
            cache: CrossAttentionCache::new(num_layers),
            momentum: MomentumBuffer::default(),
            norm_threshold: DEFAULT_NORM_THRESHOLD,
        }
    }

    pub fn decoder(&self) -> &DitModel {
        &self.decoder
    }

    /// Unguided forward at timestep `t`, reusing the cross-attention cache.
    fn forward_cond(
        &mut self,
        latent: &Tensor,
        t: f64,
        conditions: &DitConditions,
    ) -> Result<Tensor> {
        let encoder = conditions
            .encoder_hidden_states
            .as_ref()
            .ok_or(Error::MissingConditioning)?;
        let context = conditions
            .context_latents
            .as_ref()
            .ok_or(Error::MissingConditioning)?;

        let batch = latent.dim(0)?;
        let timestep = Tensor::full(t as f32, (batch,), latent.device())?.to_dtype(latent.dtype())?;

        Ok(self.decoder.forward(
            latent,
            &timestep,
            &timestep, // timestep_r = t: the second embedding head sees 0
            encoder,
            conditions.encoder_attention_mask.as_ref(),
            context,
            Some(&mut self.cache),
        )?)
    }

    /// Guided forward: one doubled-batch pass, conditional half on the real
    /// encoder states, unconditional half on the broadcast null embedding.
    ///
    /// The cross-attention cache is bypassed here: its entries correspond to
    /// the single-batch encoder input and would be wrong for the doubled
    /// batch.
    fn forward_cfg(
        &mut self,
        latent: &Tensor,
        t: f64,
        conditions: &DitConditions,
        guidance: &GuidanceParams,
    ) -> Result<Tensor> {
        let encoder = conditions
            .encoder_hidden_states
            .as_ref()
            .ok_or(Error::MissingConditioning)?;
        let context = conditions
            .context_latents
            .as_ref()
            .ok_or(Error::MissingConditioning)?;
        let null_emb = conditions
            .null_condition_embedding
            .as_ref()
            .ok_or(Error::MissingConditioning)?;

        let batch = latent.dim(0)?;
        let null_states = null_emb
            .broadcast_as(encoder.dims())?
            .to_dtype(encoder.dtype())?
            .contiguous()?;

        let latent_2 = Tensor::cat(&[latent, latent], 0)?;
        let encoder_2 = Tensor::cat(&[encoder, &null_states], 0)?;
        let context_2 = Tensor::cat(&[context, context], 0)?;
        let enc_mask_2 = conditions
            .encoder_attention_mask
            .as_ref()
            .map(|m| Tensor::cat(&[m, m], 0))
            .transpose()?;

        let timestep = Tensor::full(t as f32, (2 * batch,), latent.device())?
            .to_dtype(latent.dtype())?;

        let both = self.decoder.forward(
            &latent_2,
            &timestep,
            &timestep,
            &encoder_2,
            enc_mask_2.as_ref(),
            &context_2,
            None, // cache disabled under the doubled batch
        )?;

        let pred_cond = both.narrow(0, 0, batch)?;
        let pred_uncond = both.narrow(0, batch, batch)?;
        apg(
            &pred_cond,
            &pred_uncond,
            guidance.guidance_scale,
            Some(&mut self.momentum),
            self.norm_threshold,
        )
    }
}

impl DiffusionStepper for DitStepper {
    fn begin_run(&mut self) {
        self.cache.reset();
        self.momentum = MomentumBuffer::default();
    }

    fn step(
        &mut self,
        latent: &Tensor,
        t: f64,
        next_t: Option<f64>,
        conditions: &DitConditions,
        guidance: &GuidanceParams,
    ) -> Result<Tensor> {
        let use_cfg = guidance.active_at(t) && conditions.null_condition_embedding.is_some();
        let velocity = if use_cfg {
            self.forward_cfg(latent, t, conditions, guidance)?
        } else {
            self.forward_cond(latent, t, conditions)?
        };
        ode_update(latent, &velocity, t, next_t)
    }

    fn requires_conditioning(&self) -> bool {
        true
    }
}

/// Zero-velocity stepper for shape and control-flow tests: the latent
/// passes through every step unchanged.
#[derive(Debug, Default)]
pub struct FakeStepper {
    steps_taken: usize,
}

impl FakeStepper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }
}

impl DiffusionStepper for FakeStepper {
    fn begin_run(&mut self) {
        self.steps_taken = 0;
    }

    fn step(
        &mut self,
        latent: &Tensor,
        t: f64,
        next_t: Option<f64>,
        _conditions: &DitConditions,
        _guidance: &GuidanceParams,
    ) -> Result<Tensor> {
        self.steps_taken += 1;
        let velocity = latent.zeros_like()?;
        ode_update(latent, &velocity, t, next_t)
    }

    fn requires_conditioning(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    use crate::config::{LayerType, ModelConfig};

    fn tiny_cfg() -> ModelConfig {
        ModelConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            head_dim: 16,
            num_hidden_layers: 2,
            acoustic_dim: 64,
            context_dim: 128,
            encoder_hidden_dim: 48,
            patch_size: 2,
            layer_types: vec![LayerType::SlidingAttention, LayerType::FullAttention],
            ..ModelConfig::default()
        }
    }

    fn tiny_conditions(dev: &Device, batch: usize, t: usize, with_null: bool) -> DitConditions {
        DitConditions {
            encoder_hidden_states: Some(
                Tensor::randn(0f32, 1.0, (batch, 6, 48), dev).unwrap(),
            ),
            context_latents: Some(Tensor::randn(0f32, 1.0, (batch, t, 128), dev).unwrap()),
            null_condition_embedding: with_null
                .then(|| Tensor::zeros((1, 1, 48), DType::F32, dev).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn ode_update_euler_and_final_forms() {
        let dev = Device::Cpu;
        let x = Tensor::ones((1, 4, 2), DType::F32, &dev).unwrap();
        let v = Tensor::ones((1, 4, 2), DType::F32, &dev).unwrap();

        // x - v·(t - next_t) = 1 - 0.25
        let mid = ode_update(&x, &v, 0.75, Some(0.5)).unwrap();
        let mid_val: f32 = mid.mean_all().unwrap().to_scalar().unwrap();
        assert!((mid_val - 0.75).abs() < 1e-6);

        // Final step: x - v·t = 1 - 0.75
        let last = ode_update(&x, &v, 0.75, None).unwrap();
        let last_val: f32 = last.mean_all().unwrap().to_scalar().unwrap();
        assert!((last_val - 0.25).abs() < 1e-6);
    }

    #[test]
    fn guidance_interval_gating() {
        let g = GuidanceParams {
            guidance_scale: 3.0,
            cfg_interval_start: 0.3,
            cfg_interval_end: 0.9,
        };
        assert!(g.active_at(0.5));
        assert!(g.active_at(0.3));
        assert!(g.active_at(0.9));
        assert!(!g.active_at(0.95));
        assert!(!g.active_at(0.1));

        let off = GuidanceParams::default();
        assert!(!off.active_at(0.5), "scale 1 never activates CFG");
    }

    #[test]
    fn fake_stepper_is_identity_on_latent() {
        let dev = Device::Cpu;
        let mut stepper = FakeStepper::new();
        stepper.begin_run();
        let x = Tensor::randn(0f32, 1.0, (2, 8, 64), &dev).unwrap();
        let out = stepper
            .step(
                &x,
                1.0,
                Some(0.5),
                &DitConditions::default(),
                &GuidanceParams::default(),
            )
            .unwrap();
        assert_eq!(out.dims(), &[2, 8, 64]);
        let diff: f32 = (&out - &x)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
        assert_eq!(stepper.steps_taken(), 1);
    }

    #[test]
    fn dit_stepper_latent_shape_stability() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let decoder = crate::model::transformer::DitModel::new(&tiny_cfg(), vb.pp("decoder")).unwrap();
        let mut stepper = DitStepper::new(decoder);
        stepper.begin_run();

        let conds = tiny_conditions(&dev, 1, 8, false);
        let mut x = Tensor::randn(0f32, 1.0, (1, 8, 64), &dev).unwrap();
        let schedule = [1.0, 0.75, 0.5];
        for (i, &t) in schedule.iter().enumerate() {
            let next_t = schedule.get(i + 1).copied();
            x = stepper
                .step(&x, t, next_t, &conds, &GuidanceParams::default())
                .unwrap();
            assert_eq!(x.dims(), &[1, 8, 64]);
        }
        assert!(
            !stepper.cache.is_empty(),
            "unguided run must populate the cross-attention cache"
        );

        stepper.begin_run();
        assert!(stepper.cache.is_empty(), "begin_run must drop the cache");
    }

    #[test]
    fn cfg_path_keeps_batch_and_skips_cache() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let decoder = crate::model::transformer::DitModel::new(&tiny_cfg(), vb.pp("decoder")).unwrap();
        let mut stepper = DitStepper::new(decoder);
        stepper.begin_run();

        let conds = tiny_conditions(&dev, 2, 8, true);
        let x = Tensor::randn(0f32, 1.0, (2, 8, 64), &dev).unwrap();
        let guidance = GuidanceParams {
            guidance_scale: 3.0,
            ..Default::default()
        };
        let out = stepper.step(&x, 1.0, Some(0.5), &conds, &guidance).unwrap();
        assert_eq!(out.dims(), &[2, 8, 64]);
        assert!(
            stepper.cache.is_empty(),
            "guided steps must not populate the cache"
        );
    }

    #[test]
    fn missing_conditioning_is_fatal_for_real_stepper() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let decoder = crate::model::transformer::DitModel::new(&tiny_cfg(), vb.pp("decoder")).unwrap();
        let mut stepper = DitStepper::new(decoder);
        assert!(stepper.requires_conditioning());

        let x = Tensor::randn(0f32, 1.0, (1, 8, 64), &dev).unwrap();
        let err = stepper
            .step(
                &x,
                1.0,
                None,
                &DitConditions::default(),
                &GuidanceParams::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::MissingConditioning));
    }
}
