//! Conditioning contract between the pipeline and an external encoder.
//!
//! The text/lyric/timbre encoder is a pluggable collaborator: the pipeline
//! hands it the generation parameters and the latent length, and receives
//! back the tensors the DiT consumes. The provider is called exactly once
//! per run.

use candle_core::Tensor;

use crate::pipeline::GenerationParams;
use crate::{Error, Result};

/// Conditioning tensors for one generation run.
///
/// Shapes (B is the provider's batch, broadcastable from 1; T is the
/// pipeline's latent length):
///
/// | field | shape |
/// |---|---|
/// | `encoder_hidden_states` | `[B, encL, 2048]` |
/// | `encoder_attention_mask` | `[B, encL]`, 1 = valid, 0 = pad |
/// | `context_latents` | `[B, T, 128]` |
/// | `null_condition_embedding` | `[1, 1, 2048]` |
/// | `initial_latents` | `[B, T, 64]` |
#[derive(Debug, Clone, Default)]
pub struct DitConditions {
    /// Projected text + lyric + timbre hidden states for cross-attention.
    pub encoder_hidden_states: Option<Tensor>,
    /// Padding mask over the encoder sequence.
    pub encoder_attention_mask: Option<Tensor>,
    /// Source latents concatenated with the chunk mask.
    pub context_latents: Option<Tensor>,
    /// Learned embedding substituted for the encoder states on the
    /// unconditional CFG branch.
    pub null_condition_embedding: Option<Tensor>,
    /// Bypasses the random initial latent when present.
    pub initial_latents: Option<Tensor>,
}

/// Produces [`DitConditions`] for a run.
///
/// Returning `Ok(None)` means "no conditioning": the pipeline proceeds with
/// zeros against a fake stepper (shape tests) and fails against the real
/// DiT.
pub trait ConditioningProvider {
    fn provide(
        &self,
        params: &GenerationParams,
        latent_length: usize,
        sample_rate: u32,
    ) -> Result<Option<DitConditions>>;
}

/// Provider returning pre-built tensors.
///
/// For callers that run an external encoder ahead of time, and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticConditioning {
    pub conditions: Option<DitConditions>,
}

impl StaticConditioning {
    pub fn new(conditions: DitConditions) -> Self {
        Self {
            conditions: Some(conditions),
        }
    }

    /// A provider that always reports "no conditioning".
    pub fn none() -> Self {
        Self { conditions: None }
    }
}

impl ConditioningProvider for StaticConditioning {
    fn provide(
        &self,
        _params: &GenerationParams,
        _latent_length: usize,
        _sample_rate: u32,
    ) -> Result<Option<DitConditions>> {
        Ok(self.conditions.clone())
    }
}

/// Provider for pure text-to-music runs against a pre-encoded prompt.
///
/// Holds the encoder outputs computed ahead of time by an external
/// text/lyric/timbre encoder, plus the model's silence latent. Per run it
/// assembles the context as `concat(silence_latents, chunk_mask)` along the
/// channel axis, with an all-ones chunk mask ("generate everywhere") —
/// source-conditioned tasks supply their own latents and mask through
/// [`DitConditions`] directly.
pub struct SilenceContextProvider {
    /// Pre-encoded prompt `[B, encL, H_enc]`.
    pub encoder_hidden_states: Tensor,
    /// Padding mask over the prompt, if the encoder produced one.
    pub encoder_attention_mask: Option<Tensor>,
    /// Learned null embedding `[1, 1, H_enc]` for CFG.
    pub null_condition_embedding: Option<Tensor>,
    /// VAE-encoded silence `[1, T_max, C_lat]`.
    pub silence_latent: Tensor,
}

impl ConditioningProvider for SilenceContextProvider {
    fn provide(
        &self,
        _params: &GenerationParams,
        latent_length: usize,
        _sample_rate: u32,
    ) -> Result<Option<DitConditions>> {
        let available = self.silence_latent.dim(1)?;
        if latent_length > available {
            return Err(Error::Config(format!(
                "requested {latent_length} latent frames but the silence latent holds {available}"
            )));
        }
        let src = self
            .silence_latent
            .narrow(1, 0, latent_length)?
            .contiguous()?;
        let (b, t, c) = src.dims3()?;
        let chunk_mask = Tensor::ones((b, t, c), src.dtype(), src.device())?;
        let context = Tensor::cat(&[&src, &chunk_mask], 2)?;

        Ok(Some(DitConditions {
            encoder_hidden_states: Some(self.encoder_hidden_states.clone()),
            encoder_attention_mask: self.encoder_attention_mask.clone(),
            context_latents: Some(context),
            null_condition_embedding: self.null_condition_embedding.clone(),
            initial_latents: None,
        }))
    }
}

/// Align a conditioning tensor's leading dimension to the target batch.
///
/// Exact match passes through; a leading dimension of 1 is repeated; any
/// other size is a fatal [`Error::ConditionBatchMismatch`].
pub fn align_batch(tensor: &Tensor, batch_size: usize, field: &'static str) -> Result<Tensor> {
    let got = tensor.dim(0)?;
    if got == batch_size {
        Ok(tensor.clone())
    } else if got == 1 {
        let mut dims = tensor.dims().to_vec();
        dims[0] = batch_size;
        Ok(tensor.broadcast_as(dims)?.contiguous()?)
    } else {
        Err(Error::ConditionBatchMismatch {
            field,
            got,
            expected: batch_size,
        })
    }
}

impl DitConditions {
    /// Align every batched field to `batch_size`.
    ///
    /// `null_condition_embedding` is exempt: it is defined as `[1, 1, H]`
    /// and broadcast at CFG time.
    pub fn align_to_batch(&self, batch_size: usize) -> Result<Self> {
        let aligned = |t: &Option<Tensor>, field: &'static str| -> Result<Option<Tensor>> {
            t.as_ref()
                .map(|t| align_batch(t, batch_size, field))
                .transpose()
        };
        Ok(Self {
            encoder_hidden_states: aligned(&self.encoder_hidden_states, "encoder_hidden_states")?,
            encoder_attention_mask: aligned(
                &self.encoder_attention_mask,
                "encoder_attention_mask",
            )?,
            context_latents: aligned(&self.context_latents, "context_latents")?,
            null_condition_embedding: self.null_condition_embedding.clone(),
            initial_latents: aligned(&self.initial_latents, "initial_latents")?,
        })
    }
}
