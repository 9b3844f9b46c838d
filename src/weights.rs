//! Checkpoint ingestion.
//!
//! Checkpoints are flat safetensors maps from dotted paths to tensors.
//! Ingestion is three independent pure transforms composed in a fixed
//! order, then a [`VarBuilder`] over the normalized map:
//!
//! 1. [`flatten_wrapper_key`] — drop Sequential wrapper indices
//!    (`proj_in.1.weight` → `proj_in.weight`)
//! 2. [`normalize_key_style`] — fold lowerCamelCase segments back to the
//!    snake_case module tree
//! 3. [`convert_conv_layout`] — permute rank-3 conv weights from the
//!    channels-last exporter convention to candle's
//!
//! A checkpoint that nests the generation model alongside other components
//! is reduced to the `decoder.` subtree by [`decoder_subtree`].

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::{Error, Result};

/// Physical layout of rank-3 conv weights in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointLayout {
    /// Conv `[out, in, kernel]`, transposed conv `[in, out, kernel]` —
    /// candle's own convention; weights pass through untouched.
    #[default]
    Torch,
    /// Conv and transposed conv both `[out, kernel, in]`, as written by the
    /// channels-last export tooling.
    ChannelsLast,
}

/// Modules whose checkpoint paths carry a Sequential wrapper index that the
/// runtime tree does not have.
const WRAPPER_MODULES: &[&str] = &["proj_in", "proj_out", "to_out"];

/// Drop Sequential wrapper indices: a purely numeric segment directly after
/// a known wrapper module is removed (`proj_in.1.weight` → `proj_in.weight`).
///
/// Real layer indices (`layers.3.…`) are untouched: only the modules in the
/// wrapper list are affected.
pub fn flatten_wrapper_key(key: &str) -> String {
    let segments: Vec<&str> = key.split('.').collect();
    let mut out: Vec<&str> = Vec::with_capacity(segments.len());
    for (i, seg) in segments.iter().enumerate() {
        // Wrapper names are matched through the style fold so that a
        // camelCase checkpoint (`projIn.1.weight`) flattens the same way.
        let is_wrapper_index = i > 0
            && seg.chars().all(|c| c.is_ascii_digit())
            && WRAPPER_MODULES.contains(&normalize_key_style(segments[i - 1]).as_str());
        if !is_wrapper_index {
            out.push(seg);
        }
    }
    out.join(".")
}

/// Fold lowerCamelCase path segments to snake_case
/// (`timeEmbed.linear_1.weight` → `time_embed.linear_1.weight`).
///
/// Digits are left alone: `conv1` is a module name, not camelCase.
pub fn normalize_key_style(key: &str) -> String {
    key.split('.')
        .map(|segment| {
            let mut out = String::with_capacity(segment.len() + 4);
            for c in segment.chars() {
                if c.is_ascii_uppercase() {
                    out.push('_');
                    out.push(c.to_ascii_lowercase());
                } else {
                    out.push(c);
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Whether a key names a transposed-conv weight.
fn is_transposed_conv_key(key: &str) -> bool {
    key.contains("conv_t") || key.contains("proj_out")
}

/// Permute a rank-3 conv weight from the checkpoint layout to candle's.
///
/// Only keys ending in `.weight` with rank-3 tensors are touched; biases,
/// norm scales and weight-norm factors pass through.
pub fn convert_conv_layout(key: &str, tensor: Tensor, layout: CheckpointLayout) -> Result<Tensor> {
    if layout == CheckpointLayout::Torch || !key.ends_with(".weight") || tensor.rank() != 3 {
        return Ok(tensor);
    }
    let converted = if is_transposed_conv_key(key) {
        // [out, kernel, in] → [in, out, kernel]
        tensor.permute((2, 0, 1))?
    } else {
        // [out, kernel, in] → [out, in, kernel]
        tensor.permute((0, 2, 1))?
    };
    Ok(converted.contiguous()?)
}

/// Apply all three normalizations to a flat checkpoint map.
pub fn normalize_checkpoint(
    raw: HashMap<String, Tensor>,
    layout: CheckpointLayout,
) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::with_capacity(raw.len());
    for (key, tensor) in raw {
        let key = normalize_key_style(&flatten_wrapper_key(&key));
        let tensor = convert_conv_layout(&key, tensor, layout)?;
        if out.insert(key.clone(), tensor).is_some() {
            return Err(Error::WeightFormat(format!(
                "key '{key}' collides after normalization"
            )));
        }
    }
    Ok(out)
}

/// Reduce a full-model checkpoint to the `decoder.` subtree (prefix
/// stripped) when one exists; otherwise return the map unchanged.
pub fn decoder_subtree(map: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    if !map.keys().any(|k| k.starts_with("decoder.")) {
        return map;
    }
    map.into_iter()
        .filter_map(|(k, v)| {
            k.strip_prefix("decoder.")
                .map(|stripped| (stripped.to_string(), v))
        })
        .collect()
}

/// Look up the learned null condition embedding used by CFG, if present.
pub fn find_null_condition_embedding(map: &HashMap<String, Tensor>) -> Option<Tensor> {
    map.iter()
        .find(|(k, _)| k.contains("null_condition_emb"))
        .map(|(_, v)| v.clone())
}

/// Read a safetensors checkpoint into a flat key → tensor map on the CPU.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| Error::WeightFormat(format!("failed to read {}: {e}", path.display())))
}

/// Load, normalize, and wrap a checkpoint in a [`VarBuilder`] for the model
/// constructors.
pub fn var_builder_from_checkpoint(
    path: impl AsRef<Path>,
    layout: CheckpointLayout,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let raw = load_checkpoint(path)?;
    let map = normalize_checkpoint(raw, layout)?;
    let map = map
        .into_iter()
        .map(|(k, t)| Ok((k, t.to_device(device)?.to_dtype(dtype)?)))
        .collect::<Result<HashMap<_, _>>>()?;
    tracing::info!("loaded checkpoint with {} tensors", map.len());
    Ok(VarBuilder::from_tensors(map, dtype, device))
}

/// Load the DiT from a checkpoint, together with the learned null condition
/// embedding when the checkpoint carries one.
///
/// Accepts either a decoder-only checkpoint or a full generation-model
/// checkpoint; in the latter case only the `decoder.` subtree feeds the
/// model. The null embedding lives outside that subtree and is looked up
/// before it is stripped.
pub fn load_generation_model(
    path: impl AsRef<Path>,
    cfg: &crate::config::ModelConfig,
    layout: CheckpointLayout,
    dtype: DType,
    device: &Device,
) -> Result<(crate::model::transformer::DitModel, Option<Tensor>)> {
    let raw = load_checkpoint(path)?;
    let map = normalize_checkpoint(raw, layout)?;
    let null_emb = find_null_condition_embedding(&map)
        .map(|t| -> Result<Tensor> { Ok(t.to_device(device)?.to_dtype(dtype)?) })
        .transpose()?;
    let map = decoder_subtree(map)
        .into_iter()
        .map(|(k, t)| Ok((k, t.to_device(device)?.to_dtype(dtype)?)))
        .collect::<Result<HashMap<_, _>>>()?;
    tracing::info!("loading DiT from {} tensors", map.len());
    let vb = VarBuilder::from_tensors(map, dtype, device);
    let model = crate::model::transformer::DitModel::new(cfg, vb)?;
    Ok((model, null_emb))
}

/// Load the precomputed silence latent `[1, T_max, 64]` from its auxiliary
/// safetensors file (key `latent`).
///
/// Used as the context source for pure text-to-music runs when no source
/// audio is provided.
pub fn load_silence_latent(
    path: impl AsRef<Path>,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let path = path.as_ref();
    let map = load_checkpoint(path)?;
    let latent = map.get("latent").ok_or_else(|| {
        Error::WeightFormat(format!("{}: missing 'latent' entry", path.display()))
    })?;
    if latent.rank() != 3 || latent.dim(0)? != 1 {
        return Err(Error::WeightFormat(format!(
            "{}: silence latent has shape {:?}, expected [1, T_max, C]",
            path.display(),
            latent.dims()
        )));
    }
    let latent = latent.to_dtype(dtype)?.to_device(device)?;
    tracing::info!("loaded silence latent: {:?}", latent.dims());
    Ok(latent)
}
