//! Oobleck variational autoencoder.
//!
//! The decoder turns acoustic latents into a stereo waveform through a
//! stack of transposed-conv upsampling blocks with Snake activations and
//! dilated residual units. The encoder mirrors it and is used to latent-ize
//! source audio for cover/repaint style runs.
//!
//! Internals run channels-first (`[B, C, T]`, candle's conv layout); the
//! [`LatentDecoder`] trait boundary is channels-last to match the rest of
//! the engine.
//!
//! Weights use weight-norm parametrization (`weight_g`/`weight_v`), loaded
//! via `candle_transformers::models::encodec`.

use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, VarBuilder};
use candle_transformers::models::encodec;

use crate::config::VaeConfig;

const SNAKE_EPS: f64 = 1e-9;

/// Weight-norm conv without a bias term, for the decoder's final layer.
/// Same `weight_g`/`weight_v` recomposition as
/// `encodec::conv1d_weight_norm`, which has no bias-free variant.
fn conv1d_weight_norm_no_bias(
    in_c: usize,
    out_c: usize,
    kernel_size: usize,
    config: Conv1dConfig,
    vb: VarBuilder,
) -> Result<Conv1d> {
    let weight_g = vb.get((out_c, 1, 1), "weight_g")?;
    let weight_v = vb.get((out_c, in_c, kernel_size), "weight_v")?;
    let norm_v = weight_v.sqr()?.sum_keepdim((1, 2))?.sqrt()?;
    let weight = weight_v.broadcast_mul(&weight_g)?.broadcast_div(&norm_v)?;
    Ok(Conv1d::new(weight, None, config))
}

// ---------------------------------------------------------------------------
// Snake activation
// ---------------------------------------------------------------------------

/// Snake activation: `x + (1/(β+ε)) · sin(α·x)²` with per-channel learned
/// `α` and `β` of shape `[1, C, 1]`.
///
/// With `logscale` (the checkpoint default) the learned parameters are
/// log-domain and exponentiated on the fly. 16-bit inputs are upcast to f32
/// for the duration of the activation; `exp` overflows half-precision for
/// moderate parameter values.
#[derive(Debug, Clone)]
pub struct Snake1d {
    alpha: Tensor,
    beta: Tensor,
    logscale: bool,
}

impl Snake1d {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Self::with_logscale(channels, true, vb)
    }

    pub fn with_logscale(channels: usize, logscale: bool, vb: VarBuilder) -> Result<Self> {
        let alpha = vb.get((1, channels, 1), "alpha")?;
        let beta = vb.get((1, channels, 1), "beta")?;
        Ok(Self {
            alpha,
            beta,
            logscale,
        })
    }
}

impl Module for Snake1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let in_dtype = xs.dtype();
        let compute_dtype = match in_dtype {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let xs_c = xs.to_dtype(compute_dtype)?;

        let (alpha, beta) = if self.logscale {
            (
                self.alpha.to_dtype(compute_dtype)?.exp()?,
                self.beta.to_dtype(compute_dtype)?.exp()?,
            )
        } else {
            (
                self.alpha.to_dtype(compute_dtype)?,
                self.beta.to_dtype(compute_dtype)?,
            )
        };

        let sin_term = xs_c.broadcast_mul(&alpha)?.sin()?;
        let sin_sq = sin_term.sqr()?;
        let inv_beta = (beta + SNAKE_EPS)?.recip()?;
        let out = (xs_c + sin_sq.broadcast_mul(&inv_beta)?)?;
        out.to_dtype(in_dtype)
    }
}

// ---------------------------------------------------------------------------
// Residual unit
// ---------------------------------------------------------------------------

/// Dilated residual unit: snake → conv(k7, dilation d, pad 3d) → snake →
/// conv(k1), with the input center-cropped to the branch length before the
/// residual add.
#[derive(Debug, Clone)]
pub struct ResidualUnit {
    snake1: Snake1d,
    conv1: Conv1d,
    snake2: Snake1d,
    conv2: Conv1d,
}

impl ResidualUnit {
    pub fn new(dim: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        let cfg1 = Conv1dConfig {
            dilation,
            padding: 3 * dilation,
            ..Default::default()
        };
        Ok(Self {
            snake1: Snake1d::new(dim, vb.pp("snake1"))?,
            conv1: encodec::conv1d_weight_norm(dim, dim, 7, cfg1, vb.pp("conv1"))?,
            snake2: Snake1d::new(dim, vb.pp("snake2"))?,
            conv2: encodec::conv1d_weight_norm(dim, dim, 1, Default::default(), vb.pp("conv2"))?,
        })
    }
}

impl Module for ResidualUnit {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs
            .apply(&self.snake1)?
            .apply(&self.conv1)?
            .apply(&self.snake2)?
            .apply(&self.conv2)?;
        let pad = (xs.dim(D::Minus1)? - ys.dim(D::Minus1)?) / 2;
        if pad > 0 {
            &ys + xs.narrow(D::Minus1, pad, ys.dim(D::Minus1)?)?
        } else {
            ys + xs
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// One upsampling block: snake → transposed conv (kernel 2r, stride r,
/// padding ⌈r/2⌉) → residual units at dilations 1, 3, 9.
#[derive(Debug, Clone)]
pub struct DecoderBlock {
    snake1: Snake1d,
    conv_t1: ConvTranspose1d,
    res_units: Vec<ResidualUnit>,
}

impl DecoderBlock {
    pub fn new(in_dim: usize, out_dim: usize, ratio: usize, vb: VarBuilder) -> Result<Self> {
        let snake1 = Snake1d::new(in_dim, vb.pp("snake1"))?;
        let cfg = ConvTranspose1dConfig {
            stride: ratio,
            padding: ratio.div_ceil(2),
            ..Default::default()
        };
        let conv_t1 = encodec::conv_transpose1d_weight_norm(
            in_dim,
            out_dim,
            2 * ratio,
            true,
            cfg,
            vb.pp("conv_t1"),
        )?;
        let res_units = (0..3)
            .map(|i| {
                ResidualUnit::new(out_dim, 3usize.pow(i as u32), vb.pp(format!("res_unit{}", i + 1)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            snake1,
            conv_t1,
            res_units,
        })
    }
}

impl Module for DecoderBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.apply(&self.snake1)?.apply(&self.conv_t1)?;
        for unit in &self.res_units {
            h = h.apply(unit)?;
        }
        Ok(h)
    }
}

/// Oobleck decoder: `[B, C_lat, T]` → `[B, C_audio, T·hop]`.
#[derive(Debug, Clone)]
pub struct OobleckDecoder {
    conv1: Conv1d,
    blocks: Vec<DecoderBlock>,
    snake1: Snake1d,
    conv2: Conv1d,
    audio_channels: usize,
    hop_length: usize,
}

impl OobleckDecoder {
    pub fn new(cfg: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let channels = cfg.decoder_channels;

        // Channel multiples with an implicit leading 1: the final block
        // lands on `channels`.
        let mut cm = vec![1usize];
        cm.extend_from_slice(&cfg.channel_multiples);
        let n_blocks = cfg.upsampling_ratios.len();

        let first_dim = channels * cm[n_blocks];
        let conv_cfg = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };
        let conv1 = encodec::conv1d_weight_norm(
            cfg.latent_channels,
            first_dim,
            7,
            conv_cfg,
            vb.pp("conv1"),
        )?;

        let mut blocks = Vec::with_capacity(n_blocks);
        for (i, &ratio) in cfg.upsampling_ratios.iter().enumerate() {
            let in_d = channels * cm[n_blocks - i];
            let out_d = channels * cm[n_blocks - i - 1];
            blocks.push(DecoderBlock::new(
                in_d,
                out_d,
                ratio,
                vb.pp(format!("block.{i}")),
            )?);
        }

        let final_dim = channels * cm[0];
        let snake1 = Snake1d::new(final_dim, vb.pp("snake1"))?;
        // Final conv carries no bias.
        let conv2 = conv1d_weight_norm_no_bias(
            final_dim,
            cfg.audio_channels,
            7,
            conv_cfg,
            vb.pp("conv2"),
        )?;

        Ok(Self {
            conv1,
            blocks,
            snake1,
            conv2,
            audio_channels: cfg.audio_channels,
            hop_length: cfg.hop_length(),
        })
    }

    /// Decode latents `[B, C_lat, T]` to a waveform `[B, C_audio, ≈T·hop]`.
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let mut h = latents.apply(&self.conv1)?;
        for block in &self.blocks {
            h = h.apply(block)?;
        }
        h.apply(&self.snake1)?.apply(&self.conv2)
    }

    /// Chunked decode for long sequences.
    ///
    /// Adjacent windows overlap by `overlap` latent frames on each side;
    /// the overlap regions are discarded after decoding so chunk seams fall
    /// outside the convolutions' edge effects.
    pub fn tiled_decode(
        &self,
        latents: &Tensor,
        chunk_size: usize,
        overlap: usize,
    ) -> Result<Tensor> {
        let (_b, _c, frames) = latents.dims3()?;
        if frames <= chunk_size {
            return self.decode(latents);
        }

        let mut overlap = overlap;
        while chunk_size <= 2 * overlap && overlap > 0 {
            overlap /= 2;
        }
        let stride = chunk_size - 2 * overlap;

        let num_chunks = frames.div_ceil(stride);
        let mut pieces = Vec::with_capacity(num_chunks);
        for i in 0..num_chunks {
            let core_start = i * stride;
            let core_end = (core_start + stride).min(frames);
            let win_start = core_start.saturating_sub(overlap);
            let win_end = (core_end + overlap).min(frames);

            let chunk = latents.i((.., .., win_start..win_end))?.contiguous()?;
            let audio = self.decode(&chunk)?;

            let trim_start = (core_start - win_start) * self.hop_length;
            let trim_end = (win_end - core_end) * self.hop_length;
            let end = audio.dim(2)?.saturating_sub(trim_end);
            pieces.push(audio.i((.., .., trim_start..end))?.contiguous()?);
        }
        Tensor::cat(&pieces, 2)
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// One downsampling block: residual units at dilations 1, 3, 9 → snake →
/// strided conv (kernel 2r, stride r).
#[derive(Debug, Clone)]
pub struct EncoderBlock {
    res_units: Vec<ResidualUnit>,
    snake1: Snake1d,
    conv1: Conv1d,
}

impl EncoderBlock {
    pub fn new(in_dim: usize, out_dim: usize, ratio: usize, vb: VarBuilder) -> Result<Self> {
        let res_units = (0..3)
            .map(|i| {
                ResidualUnit::new(in_dim, 3usize.pow(i as u32), vb.pp(format!("res_unit{}", i + 1)))
            })
            .collect::<Result<Vec<_>>>()?;
        let snake1 = Snake1d::new(in_dim, vb.pp("snake1"))?;
        let cfg = Conv1dConfig {
            stride: ratio,
            padding: ratio.div_ceil(2),
            ..Default::default()
        };
        let conv1 = encodec::conv1d_weight_norm(in_dim, out_dim, 2 * ratio, cfg, vb.pp("conv1"))?;
        Ok(Self {
            res_units,
            snake1,
            conv1,
        })
    }
}

impl Module for EncoderBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for unit in &self.res_units {
            h = h.apply(unit)?;
        }
        h.apply(&self.snake1)?.apply(&self.conv1)
    }
}

/// Oobleck encoder: `[B, C_audio, samples]` → latent mean `[B, C_lat, T]`.
///
/// The final conv emits mean and log-scale halves; inference uses the mean
/// deterministically.
#[derive(Debug, Clone)]
pub struct OobleckEncoder {
    conv1: Conv1d,
    blocks: Vec<EncoderBlock>,
    snake1: Snake1d,
    conv2: Conv1d,
    latent_channels: usize,
}

impl OobleckEncoder {
    pub fn new(cfg: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let channels = cfg.decoder_channels;
        let mut cm = vec![1usize];
        cm.extend_from_slice(&cfg.channel_multiples);
        let n_blocks = cfg.upsampling_ratios.len();

        let conv_cfg = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };
        let conv1 = encodec::conv1d_weight_norm(
            cfg.audio_channels,
            channels,
            7,
            conv_cfg,
            vb.pp("conv1"),
        )?;

        // Downsampling runs the decoder's ratio list in reverse.
        let mut blocks = Vec::with_capacity(n_blocks);
        for (i, &ratio) in cfg.upsampling_ratios.iter().rev().enumerate() {
            let in_d = channels * cm[i];
            let out_d = channels * cm[i + 1];
            blocks.push(EncoderBlock::new(
                in_d,
                out_d,
                ratio,
                vb.pp(format!("block.{i}")),
            )?);
        }

        let top_dim = channels * cm[n_blocks];
        let snake1 = Snake1d::new(top_dim, vb.pp("snake1"))?;
        let conv2 = encodec::conv1d_weight_norm(
            top_dim,
            2 * cfg.latent_channels,
            3,
            Conv1dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;

        Ok(Self {
            conv1,
            blocks,
            snake1,
            conv2,
            latent_channels: cfg.latent_channels,
        })
    }

    /// Deterministic encode: returns the posterior mean `[B, C_lat, T]`.
    pub fn encode(&self, audio: &Tensor) -> Result<Tensor> {
        let mut h = audio.apply(&self.conv1)?;
        for block in &self.blocks {
            h = h.apply(block)?;
        }
        let h = h.apply(&self.snake1)?.apply(&self.conv2)?;
        h.narrow(1, 0, self.latent_channels)
    }
}

// ---------------------------------------------------------------------------
// Trait boundary
// ---------------------------------------------------------------------------

/// Frames above this length go through tiled decoding.
const TILED_DECODE_THRESHOLD: usize = 256;
const TILED_DECODE_OVERLAP: usize = 16;

/// Latent-to-audio decoder at the pipeline boundary.
///
/// Channels-last on both sides: `[B, T, C_lat]` in, `[B, samples, C_audio]`
/// out.
pub trait LatentDecoder {
    fn decode(&self, latents: &Tensor) -> crate::Result<Tensor>;
    fn audio_channels(&self) -> usize;
}

impl LatentDecoder for OobleckDecoder {
    fn decode(&self, latents: &Tensor) -> crate::Result<Tensor> {
        let latents = latents.transpose(1, 2)?.contiguous()?;
        let frames = latents.dim(2)?;
        let audio = if frames > TILED_DECODE_THRESHOLD {
            self.tiled_decode(&latents, TILED_DECODE_THRESHOLD, TILED_DECODE_OVERLAP)?
        } else {
            OobleckDecoder::decode(self, &latents)?
        };
        Ok(audio.transpose(1, 2)?.contiguous()?)
    }

    fn audio_channels(&self) -> usize {
        self.audio_channels
    }
}

/// Zero-output mono decoder for shape and control-flow tests.
#[derive(Debug, Clone)]
pub struct FakeLatentDecoder {
    samples_per_frame: usize,
}

impl FakeLatentDecoder {
    pub fn new(samples_per_frame: usize) -> Self {
        Self { samples_per_frame }
    }
}

impl Default for FakeLatentDecoder {
    fn default() -> Self {
        Self::new(crate::config::LATENT_HOP)
    }
}

impl LatentDecoder for FakeLatentDecoder {
    fn decode(&self, latents: &Tensor) -> crate::Result<Tensor> {
        let (b, t, _c) = latents.dims3()?;
        let audio = Tensor::zeros(
            (b, t * self.samples_per_frame, 1),
            latents.dtype(),
            latents.device(),
        )?;
        Ok(audio)
    }

    fn audio_channels(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tiny_vae_cfg() -> VaeConfig {
        VaeConfig {
            upsampling_ratios: vec![4, 2],
            channel_multiples: vec![1, 2],
            decoder_channels: 8,
            latent_channels: 4,
            audio_channels: 2,
            sampling_rate: 48000,
        }
    }

    #[test]
    fn snake_zero_params_fixed_point_at_zero() {
        // alpha = beta = 0 (logscale → both exp to 1): sin(0)² = 0, so
        // snake(0) = 0.
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let snake = Snake1d::new(2, vb.pp("snake")).unwrap();
        let x = Tensor::zeros((1, 2, 5), DType::F32, &dev).unwrap();
        let y = snake.forward(&x).unwrap();
        let sum: f32 = y.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(sum < 1e-6);
    }

    #[test]
    fn snake_negation_symmetry() {
        // snake(-x) = -x + (1/(β+ε))·sin(α·x)² — the sin² term is even.
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let snake = Snake1d::new(3, vb.pp("snake")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 3, 16), &dev).unwrap();

        let pos = snake.forward(&x).unwrap();
        let neg = snake.forward(&x.neg().unwrap()).unwrap();

        // snake(x) + snake(-x) = 2·sin²-term = 2·(snake(x) − x)
        let lhs = (&pos + &neg).unwrap();
        let rhs = ((&pos - &x).unwrap() * 2.0).unwrap();
        let diff: f32 = (lhs - rhs)
            .unwrap()
            .abs()
            .unwrap()
            .max(2)
            .unwrap()
            .max(1)
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "snake symmetry violated: {diff}");
    }

    #[test]
    fn snake_upcasts_half_precision() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let snake = Snake1d::new(2, vb.pp("snake")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 2, 8), &dev)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let y = snake.forward(&x).unwrap();
        assert_eq!(y.dtype(), DType::F16);
        assert_eq!(y.dims(), &[1, 2, 8]);
    }

    #[test]
    fn residual_unit_preserves_length() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let unit = ResidualUnit::new(4, 3, vb.pp("unit")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 32), &dev).unwrap();
        let y = unit.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 4, 32]);
    }

    #[test]
    fn decoder_upsamples_by_hop() {
        let dev = Device::Cpu;
        let cfg = tiny_vae_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let dec = OobleckDecoder::new(&cfg, vb.pp("decoder")).unwrap();

        let t = 10;
        let latents = Tensor::randn(0f32, 1.0, (1, 4, t), &dev).unwrap();
        let audio = dec.decode(&latents).unwrap();
        assert_eq!(audio.dim(0).unwrap(), 1);
        assert_eq!(audio.dim(1).unwrap(), 2);
        assert!(
            audio.dim(2).unwrap() >= t * cfg.hop_length(),
            "decoded audio must cover T·hop samples"
        );
    }

    #[test]
    fn trait_boundary_is_channels_last() {
        let dev = Device::Cpu;
        let cfg = tiny_vae_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let dec = OobleckDecoder::new(&cfg, vb.pp("decoder")).unwrap();

        let latents = Tensor::randn(0f32, 1.0, (2, 6, 4), &dev).unwrap();
        let audio = LatentDecoder::decode(&dec, &latents).unwrap();
        assert_eq!(audio.dims3().unwrap().0, 2);
        assert_eq!(audio.dims3().unwrap().2, 2);
    }

    #[test]
    fn tiled_decode_matches_direct() {
        let dev = Device::Cpu;
        let cfg = tiny_vae_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let dec = OobleckDecoder::new(&cfg, vb.pp("decoder")).unwrap();

        let latents = Tensor::randn(0f32, 1.0, (1, 4, 24), &dev).unwrap();
        let direct = dec.decode(&latents).unwrap();
        let tiled = dec.tiled_decode(&latents, 8, 2).unwrap();
        assert_eq!(direct.dims(), tiled.dims());
    }

    #[test]
    fn encoder_inverts_decoder_geometry() {
        let dev = Device::Cpu;
        let cfg = tiny_vae_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let enc = OobleckEncoder::new(&cfg, vb.pp("encoder")).unwrap();

        let t = 6;
        let audio = Tensor::randn(0f32, 1.0, (1, 2, t * cfg.hop_length()), &dev).unwrap();
        let latents = enc.encode(&audio).unwrap();
        assert_eq!(latents.dim(1).unwrap(), cfg.latent_channels);
        // Strided convs may add an edge frame; the frame count tracks T.
        let frames = latents.dim(2).unwrap();
        assert!(frames >= t && frames <= t + 2, "got {frames} frames");
    }

    #[test]
    fn fake_decoder_emits_mono_zeros() {
        let dev = Device::Cpu;
        let fake = FakeLatentDecoder::new(16);
        let latents = Tensor::randn(0f32, 1.0, (3, 5, 64), &dev).unwrap();
        let audio = fake.decode(&latents).unwrap();
        assert_eq!(audio.dims(), &[3, 80, 1]);
        assert_eq!(fake.audio_channels(), 1);
        let sum: f32 = audio.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
