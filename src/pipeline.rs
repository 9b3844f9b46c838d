//! End-to-end inference pipeline.
//!
//! One operation: caption + lyrics → audio samples.
//!
//! 1. Compute the latent length from the requested duration
//! 2. Build the timestep schedule
//! 3. Ask the [`ConditioningProvider`] for this run's tensors (once)
//! 4. Initialize the latent (seeded noise, or provider-supplied)
//! 5. Walk the schedule through the [`DiffusionStepper`]
//! 6. Decode with the [`LatentDecoder`], trim, peak-normalize, emit
//!
//! Failures are surfaced as a failed [`GenerationStatus`] with no audio;
//! length overshoot and over-unit peaks are corrected silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::conditioning::{ConditioningProvider, DitConditions};
use crate::config::LATENT_HOP;
use crate::scheduler::build_schedule;
use crate::stepper::{DiffusionStepper, GuidanceParams};
use crate::vae::LatentDecoder;
use crate::{Error, Result};

/// Latent length used when the requested duration is not positive.
const FALLBACK_LATENT_LENGTH: usize = 100;

/// Minimum latent length, matching the conditioning padding used by the
/// exporter.
const MIN_LATENT_LENGTH: usize = 128;

/// Container format requested for the emitted audio. The pipeline itself
/// only produces raw samples; the tag travels with the result for the
/// caller's writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Wav,
    Flac,
    Mp3,
}

/// Parameters for one generation run. Immutable once handed to
/// [`Pipeline::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Text caption describing the music style/genre.
    pub caption: String,
    /// Lyrics text.
    pub lyrics: String,
    /// Tempo hint in beats per minute, when the caller has one.
    pub bpm: Option<f64>,
    /// Duration in seconds. Non-positive values fall back to a fixed
    /// diagnostic length.
    pub duration: f64,
    /// Number of uniform inference steps; 0 selects the preset schedule.
    pub inference_steps: usize,
    /// Explicit timestep schedule, snapped to the admissible grid.
    pub timesteps: Option<Vec<f64>>,
    /// Random seed; negative means unseeded.
    pub seed: i64,
    /// Schedule shift factor.
    pub shift: f64,
    /// Classifier-free guidance scale; 1.0 disables guidance.
    pub guidance_scale: f64,
    /// Guidance applies only inside [start, end] (timestep units).
    pub cfg_interval_start: f64,
    pub cfg_interval_end: f64,
    /// Affine correction applied to the final latent before decode.
    pub latent_shift: f64,
    pub latent_rescale: f64,
    /// Task instruction string ("text2music", "cover", "repaint", ...).
    /// The core carries it to the provider; no task-specific masking
    /// happens here.
    pub task_type: String,
    /// Reference to source audio (path or URI) for source-conditioned
    /// tasks. Consumed by the provider.
    pub src_audio: Option<String>,
    /// Repaint window in seconds, interpreted by the provider.
    pub repaint_start: f64,
    pub repaint_end: f64,
    /// Knobs for the out-of-scope formatting LLM; carried opaquely.
    pub lm_temperature: f64,
    pub lm_top_k: usize,
    pub lm_top_p: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            caption: String::new(),
            lyrics: String::new(),
            bpm: None,
            duration: 30.0,
            inference_steps: 0,
            timesteps: None,
            seed: -1,
            shift: 3.0,
            guidance_scale: 1.0,
            cfg_interval_start: 0.0,
            cfg_interval_end: 1.0,
            latent_shift: 0.0,
            latent_rescale: 1.0,
            task_type: "text2music".to_string(),
            src_audio: None,
            repaint_start: 0.0,
            repaint_end: 0.0,
            lm_temperature: 0.85,
            lm_top_k: 50,
            lm_top_p: 0.95,
        }
    }
}

impl GenerationParams {
    /// Check the documented invariants.
    pub fn validate(&self) -> Result<()> {
        if let Some(bpm) = self.bpm {
            if !(30.0..=300.0).contains(&bpm) {
                return Err(Error::Config(format!("bpm {bpm} outside [30, 300]")));
            }
        }
        if self.duration > 0.0 && !(10.0..=600.0).contains(&self.duration) {
            return Err(Error::Config(format!(
                "duration {}s outside [10, 600]",
                self.duration
            )));
        }
        if self.guidance_scale < 1.0 {
            return Err(Error::Config(format!(
                "guidance_scale {} must be >= 1",
                self.guidance_scale
            )));
        }
        if !(0.0..=1.0).contains(&self.cfg_interval_start)
            || !(0.0..=1.0).contains(&self.cfg_interval_end)
            || self.cfg_interval_start > self.cfg_interval_end
        {
            return Err(Error::Config(format!(
                "cfg interval [{}, {}] must satisfy 0 <= start <= end <= 1",
                self.cfg_interval_start, self.cfg_interval_end
            )));
        }
        Ok(())
    }

    fn guidance(&self) -> GuidanceParams {
        GuidanceParams {
            guidance_scale: self.guidance_scale,
            cfg_interval_start: self.cfg_interval_start,
            cfg_interval_end: self.cfg_interval_end,
        }
    }
}

/// Caller-owned run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub batch_size: usize,
    /// Per-batch-element seeds; overrides `params.seed` when non-empty.
    pub seeds: Vec<u64>,
    pub audio_format: AudioFormat,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            seeds: Vec::new(),
            audio_format: AudioFormat::default(),
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// One generated clip.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    /// Interleaved float samples, `sample_count · channels` long.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct GenerationStatus {
    pub message: String,
    pub success: bool,
    pub error: Option<String>,
}

impl GenerationStatus {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
            error: None,
        }
    }

    fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            message: "generation failed".to_string(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Progress callback: `(completed_steps, total_steps)`, invoked between
/// diffusion steps.
pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Latent length for a requested duration at `sample_rate`.
pub fn latent_length(duration: f64, sample_rate: u32) -> usize {
    if duration <= 0.0 {
        return FALLBACK_LATENT_LENGTH;
    }
    let frames = (duration * sample_rate as f64 / LATENT_HOP as f64).ceil() as usize;
    frames.max(MIN_LATENT_LENGTH)
}

/// Standard-normal noise, optionally seeded.
///
/// Seeded draws happen on the CPU under `Device::set_seed` and move to the
/// target device afterwards, so a given seed produces the same latent on
/// every backend.
pub(crate) fn noise_latent(
    seed: Option<u64>,
    shape: (usize, usize, usize),
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let noise = match seed {
        Some(seed) => {
            let cpu = Device::Cpu;
            cpu.set_seed(seed)?;
            Tensor::randn(0f32, 1.0, shape, &cpu)?
                .to_dtype(dtype)?
                .to_device(device)?
        }
        None => Tensor::randn(0f32, 1.0, shape, device)?.to_dtype(dtype)?,
    };
    Ok(noise)
}

/// The inference pipeline.
///
/// Owns the latent state and the schedule of each run; the stepper,
/// decoder, and provider are injected collaborators, interchangeable
/// between real and fake implementations.
pub struct Pipeline {
    stepper: Box<dyn DiffusionStepper>,
    decoder: Box<dyn LatentDecoder>,
    provider: Box<dyn ConditioningProvider>,
    sample_rate: u32,
    acoustic_dim: usize,
    progress: Option<ProgressFn>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Pipeline {
    pub fn new(
        stepper: Box<dyn DiffusionStepper>,
        decoder: Box<dyn LatentDecoder>,
        provider: Box<dyn ConditioningProvider>,
    ) -> Self {
        Self {
            stepper,
            decoder,
            provider,
            sample_rate: 48000,
            acoustic_dim: 64,
            progress: None,
            cancel: None,
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Install a progress callback invoked after every diffusion step.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Install a cancellation flag checked between diffusion steps.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Run one generation. Never panics on bad input: failures come back as
    /// a failed status with an empty audio list.
    pub fn run(
        &mut self,
        params: &GenerationParams,
        config: &GenerationConfig,
    ) -> (Vec<GeneratedAudio>, GenerationStatus) {
        match self.run_inner(params, config) {
            Ok(audios) => {
                let message = format!("generated {} clip(s)", audios.len());
                (audios, GenerationStatus::ok(message))
            }
            Err(err) => {
                tracing::warn!("generation failed: {err}");
                (Vec::new(), GenerationStatus::failed(err))
            }
        }
    }

    fn run_inner(
        &mut self,
        params: &GenerationParams,
        config: &GenerationConfig,
    ) -> Result<Vec<GeneratedAudio>> {
        let start = std::time::Instant::now();
        params.validate()?;
        config.validate()?;

        let batch = config.batch_size;
        let t_frames = latent_length(params.duration, self.sample_rate);
        let schedule = build_schedule(params.shift, params.inference_steps, params.timesteps.as_deref());
        tracing::info!(
            "run: {} frames, {} steps, batch {batch}",
            t_frames,
            schedule.len()
        );

        // The provider is called exactly once per run.
        let conditions = self
            .provider
            .provide(params, t_frames, self.sample_rate)?
            .unwrap_or_default();
        if self.stepper.requires_conditioning()
            && conditions.encoder_hidden_states.is_none()
            && conditions.context_latents.is_none()
        {
            return Err(Error::MissingConditioning);
        }
        let conditions = conditions.align_to_batch(batch)?;

        let mut latent = self.initial_latent(&conditions, params, config, batch, t_frames)?;

        self.stepper.begin_run();
        let guidance = params.guidance();
        let total = schedule.len();
        for (i, &t) in schedule.iter().enumerate() {
            if let Some(cancel) = &self.cancel {
                if cancel.load(Ordering::Relaxed) {
                    return Err(Error::Cancelled);
                }
            }
            let next_t = schedule.get(i + 1).copied();
            latent = self
                .stepper
                .step(&latent, t, next_t, &conditions, &guidance)?;
            tracing::debug!("step {}/{total} at t={t:.4}", i + 1);
            if let Some(progress) = &self.progress {
                progress(i + 1, total);
            }
        }

        if params.latent_rescale != 1.0 || params.latent_shift != 0.0 {
            latent = ((latent * params.latent_rescale)? + params.latent_shift)?;
        }

        // Pre-decode shape contract.
        if latent.rank() != 3 || latent.dim(2)? != self.acoustic_dim {
            return Err(Error::InvalidLatentShape {
                dims: latent.dims().to_vec(),
                expected_channels: self.acoustic_dim,
            });
        }

        let audio = self.decoder.decode(&latent)?;
        let audio = match audio.rank() {
            3 => audio,
            2 => audio.unsqueeze(2)?,
            _ => {
                return Err(Error::InvalidDecodedAudioShape {
                    dims: audio.dims().to_vec(),
                })
            }
        };

        // Trim the decoder's overshoot to the exact expected sample count.
        let expected = t_frames * LATENT_HOP;
        let got = audio.dim(1)?;
        if got < expected {
            return Err(Error::InvalidDecodedAudioShape {
                dims: audio.dims().to_vec(),
            });
        }
        let audio = audio.narrow(1, 0, expected)?;

        let audio = peak_normalize(&audio)?;
        let entries = self.emit(&audio)?;
        tracing::info!("run finished in {:.2}s", start.elapsed().as_secs_f64());
        Ok(entries)
    }

    /// Provider-supplied initial latents when their shape matches, seeded
    /// noise otherwise.
    fn initial_latent(
        &self,
        conditions: &DitConditions,
        params: &GenerationParams,
        config: &GenerationConfig,
        batch: usize,
        t_frames: usize,
    ) -> Result<Tensor> {
        if let Some(init) = &conditions.initial_latents {
            if init.rank() == 3 && init.dim(0)? == batch && init.dim(1)? == t_frames {
                return Ok(init.clone());
            }
        }

        // Draw on the device the conditioning lives on, falling back to CPU.
        let (dtype, device) = conditions
            .encoder_hidden_states
            .as_ref()
            .or(conditions.context_latents.as_ref())
            .map(|t| (t.dtype(), t.device().clone()))
            .unwrap_or((DType::F32, Device::Cpu));

        if !config.seeds.is_empty() {
            let mut rows = Vec::with_capacity(batch);
            for i in 0..batch {
                let seed = config.seeds[i % config.seeds.len()];
                rows.push(noise_latent(
                    Some(seed),
                    (1, t_frames, self.acoustic_dim),
                    dtype,
                    &device,
                )?);
            }
            return Ok(Tensor::cat(&rows, 0)?);
        }

        let seed = (params.seed >= 0).then_some(params.seed as u64);
        noise_latent(seed, (batch, t_frames, self.acoustic_dim), dtype, &device)
    }

    /// Split `[B, samples, C]` into per-batch interleaved sample vectors.
    fn emit(&self, audio: &Tensor) -> Result<Vec<GeneratedAudio>> {
        let (batch, _samples, channels) = audio.dims3()?;
        let mut entries = Vec::with_capacity(batch);
        for b in 0..batch {
            // [samples, C] flattens to interleaved frames.
            let samples: Vec<f32> = audio
                .get(b)?
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1()?;
            entries.push(GeneratedAudio {
                samples,
                sample_rate: self.sample_rate,
                channels: channels as u16,
            });
        }
        Ok(entries)
    }
}

/// Scale each batch element down by its peak when any sample exceeds 1.0;
/// elements already within [-1, 1] are untouched.
fn peak_normalize(audio: &Tensor) -> Result<Tensor> {
    let audio = audio.to_dtype(DType::F32)?;
    let peak = audio
        .abs()?
        .max(2)?
        .max(1)?
        .clamp(1.0f64, f64::MAX)?
        .unsqueeze(1)?
        .unsqueeze(2)?;
    Ok(audio.broadcast_div(&peak)?)
}
