//! Error types for songflow.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Every kind is fatal to the current run: the pipeline surfaces it as a
/// failed status with no audio. Nothing is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Real DiT stepper selected but the provider supplied neither encoder
    /// hidden states nor context latents.
    #[error("missing conditioning: the DiT stepper needs encoder hidden states and context latents")]
    MissingConditioning,

    /// A conditioning tensor's leading dimension is neither the target batch
    /// size nor 1.
    #[error("condition batch mismatch: {field} has batch {got}, expected {expected} or 1")]
    ConditionBatchMismatch {
        field: &'static str,
        got: usize,
        expected: usize,
    },

    /// Latent handed to the VAE is not rank-3 `[B, T, C]` or has the wrong
    /// channel count.
    #[error("invalid latent shape {dims:?}, expected [B, T, {expected_channels}]")]
    InvalidLatentShape {
        dims: Vec<usize>,
        expected_channels: usize,
    },

    /// VAE output is neither rank-2 `[B, samples]` nor rank-3 `[B, samples, C]`.
    #[error("invalid decoded audio shape {dims:?}, expected rank 2 or 3")]
    InvalidDecodedAudioShape { dims: Vec<usize> },

    /// Unreadable checkpoint, unexpected tensor rank, or unknown key after
    /// normalization.
    #[error("weight format: {0}")]
    WeightFormat(String),

    /// Invalid generation parameters or configuration.
    #[error("config: {0}")]
    Config(String),

    /// The run was cancelled between diffusion steps.
    #[error("generation cancelled")]
    Cancelled,

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
