//! ONNX-backed attention-encoder-decoder adapter.
//!
//! Wraps an exported encoder/decoder ONNX pair (sherpa-style layout: an
//! encoder taking `input`/`input_lengths` and a decoder taking the token
//! histories, encoder output, source mask and one cache tensor per layer)
//! behind [`InferenceEngine`], so the generic batch scheduler can drive it
//! without knowing anything about ONNX Runtime.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, ArrayView3, Axis};
use ort::execution_providers::CPUExecutionProvider;
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::TensorRef;

use crate::cache::{uniform_layer_view, BatchCache, BatchedLayer};
use crate::engine::{CacheLayout, DecodeStepOutput, EncoderOutput, InferenceEngine};
use crate::error::{Error, Result};

/// Model-geometry and sentinel configuration for an AED export.
///
/// The defaults match the 16-layer, 1280-wide decoder cache and the
/// blank/unk/pad/sos/eos numbering used by the exports this adapter was
/// written against.
#[derive(Debug, Clone)]
pub struct OnnxAedParams {
    /// Prefer `*.int8.onnx` files over `*.fp32.onnx`.
    pub quantized: bool,
    pub feature_dim: usize,
    pub cache_layers: usize,
    pub cache_width: usize,
    pub blank_id: i64,
    pub unk_id: i64,
    pub pad_id: i64,
    pub sos_id: i64,
    pub eos_id: i64,
    pub frame_shift_ms: u32,
}

impl Default for OnnxAedParams {
    fn default() -> Self {
        Self {
            quantized: false,
            feature_dim: 80,
            cache_layers: 16,
            cache_width: 1280,
            blank_id: 0,
            unk_id: 1,
            pad_id: 2,
            sos_id: 3,
            eos_id: 4,
            frame_shift_ms: 80,
        }
    }
}

pub struct OnnxAedEngine {
    encoder_session: Session,
    decoder_session: Session,
    params: OnnxAedParams,
    trailing: Vec<i64>,
    // Encoder I/O names
    enc_input_name: String,
    enc_lens_name: String,
    enc_out_name: String,
    enc_out_lens_name: String,
    enc_mask_name: String,
    // Decoder I/O names
    dec_ys_name: String,
    dec_enc_name: String,
    dec_mask_name: String,
    dec_cache_names: Vec<String>,
    dec_logits_name: String,
    dec_cache_out_names: Vec<String>,
}

impl Drop for OnnxAedEngine {
    fn drop(&mut self) {
        log::debug!("Dropping OnnxAedEngine");
    }
}

impl OnnxAedEngine {
    /// Load `encoder*.onnx` and `decoder*.onnx` from `model_dir`.
    pub fn new(model_dir: &Path, params: OnnxAedParams) -> Result<Self> {
        let suffix = if params.quantized { "int8" } else { "fp32" };
        let encoder_path = find_model_file(model_dir, "encoder", suffix)?;
        let decoder_path = find_model_file(model_dir, "decoder", suffix)?;

        log::info!("Loading AED encoder from {:?}", encoder_path);
        let encoder_session = init_session(&encoder_path)?;
        log::info!("Loading AED decoder from {:?}", decoder_path);
        let decoder_session = init_session(&decoder_path)?;

        let enc_inputs: Vec<String> =
            encoder_session.inputs.iter().map(|i| i.name.clone()).collect();
        let enc_outputs: Vec<String> =
            encoder_session.outputs.iter().map(|o| o.name.clone()).collect();
        if enc_outputs.len() < 3 {
            return Err(Error::Initialization(format!(
                "AED encoder must expose output, lengths and mask; found {:?}",
                enc_outputs
            )));
        }

        let enc_input_name = find_name(&enc_inputs, &["input", "x", "speech"])
            .unwrap_or_else(|| enc_inputs[0].clone());
        let enc_lens_name =
            find_name(&enc_inputs, &["input_lengths", "x_lens", "speech_lengths"])
                .unwrap_or_else(|| enc_inputs.get(1).cloned().unwrap_or_else(|| enc_inputs[0].clone()));
        let enc_out_name = find_name(&enc_outputs, &["encoder_outputs", "encoder_out"])
            .unwrap_or_else(|| enc_outputs[0].clone());
        let enc_out_lens_name =
            find_name(&enc_outputs, &["output_lengths", "encoder_out_lens"])
                .unwrap_or_else(|| enc_outputs[1].clone());
        let enc_mask_name = find_name(&enc_outputs, &["src_mask", "mask"])
            .unwrap_or_else(|| enc_outputs[2].clone());

        let dec_inputs: Vec<String> =
            decoder_session.inputs.iter().map(|i| i.name.clone()).collect();
        let dec_outputs: Vec<String> =
            decoder_session.outputs.iter().map(|o| o.name.clone()).collect();
        if dec_outputs.is_empty() {
            return Err(Error::Initialization(
                "AED decoder exposes no outputs".to_string(),
            ));
        }

        let dec_ys_name =
            find_name(&dec_inputs, &["ys", "tokens"]).unwrap_or_else(|| dec_inputs[0].clone());
        let dec_enc_name = find_name(&dec_inputs, &["encoder_outputs", "encoder_out"])
            .unwrap_or_else(|| dec_inputs.get(1).cloned().unwrap_or_else(|| dec_inputs[0].clone()));
        let dec_mask_name = find_name(&dec_inputs, &["src_mask", "mask"])
            .unwrap_or_else(|| dec_inputs.get(2).cloned().unwrap_or_else(|| dec_inputs[0].clone()));

        let dec_cache_names: Vec<String> = (0..params.cache_layers)
            .map(|i| format!("cache_{i}"))
            .collect();
        for name in &dec_cache_names {
            if !dec_inputs.iter().any(|n| n == name) {
                return Err(Error::Initialization(format!(
                    "AED decoder is missing cache input '{name}' \
                     (expected {} cache layers)",
                    params.cache_layers
                )));
            }
        }

        let dec_logits_name =
            find_name(&dec_outputs, &["logits"]).unwrap_or_else(|| dec_outputs[0].clone());
        let dec_cache_out_names: Vec<String> = dec_outputs
            .iter()
            .filter(|n| *n != &dec_logits_name)
            .cloned()
            .collect();
        if dec_cache_out_names.len() != params.cache_layers {
            return Err(Error::Initialization(format!(
                "AED decoder returns {} cache outputs, expected {}",
                dec_cache_out_names.len(),
                params.cache_layers
            )));
        }

        log::info!(
            "Encoder I/O: {enc_input_name}/{enc_lens_name} -> \
             {enc_out_name}/{enc_out_lens_name}/{enc_mask_name}"
        );
        log::info!(
            "Decoder I/O: {dec_ys_name}+{} caches -> {dec_logits_name}",
            dec_cache_names.len()
        );

        let trailing = vec![params.pad_id, params.blank_id, params.unk_id];
        Ok(Self {
            encoder_session,
            decoder_session,
            params,
            trailing,
            enc_input_name,
            enc_lens_name,
            enc_out_name,
            enc_out_lens_name,
            enc_mask_name,
            dec_ys_name,
            dec_enc_name,
            dec_mask_name,
            dec_cache_names,
            dec_logits_name,
            dec_cache_out_names,
        })
    }

    /// Dense `[N, T, W]` view of a batched cache layer, zero-padding rows
    /// past a stream's own length (cold streams next to warm ones).
    fn dense_layer(&self, layer: &BatchedLayer, batch_size: usize) -> Array3<f32> {
        if layer.width() > 0 {
            if let Some(dense) = uniform_layer_view(layer) {
                return dense;
            }
        }
        let lens = layer.lens();
        let max_len = lens.iter().copied().max().unwrap_or(0);
        let width = if layer.width() > 0 {
            layer.width()
        } else {
            self.params.cache_width
        };

        let mut dense = Array3::zeros((batch_size, max_len, width));
        let mut row = 0;
        for t in 0..max_len {
            for (n, &len) in lens.iter().enumerate() {
                if t < len {
                    dense
                        .index_axis_mut(Axis(0), n)
                        .row_mut(t)
                        .assign(&layer.rows().row(row));
                    row += 1;
                }
            }
        }
        dense
    }
}

impl InferenceEngine for OnnxAedEngine {
    fn encode(
        &mut self,
        features: ArrayView3<'_, f32>,
        lengths: &[usize],
    ) -> Result<EncoderOutput> {
        let features = features.to_owned().into_dyn();
        let lens: Vec<i64> = lengths.iter().map(|&l| l as i64).collect();
        let lens = ndarray::arr1(&lens).into_dyn();

        let inputs = inputs![
            self.enc_input_name.as_str() => TensorRef::from_array_view(features.view())?,
            self.enc_lens_name.as_str() => TensorRef::from_array_view(lens.view())?,
        ];
        let outputs = self.encoder_session.run(inputs)?;

        let output = outputs
            .get(self.enc_out_name.as_str())
            .ok_or_else(|| Error::Engine(format!("missing output {}", self.enc_out_name)))?
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<ndarray::Ix3>()?;

        let out_lengths: Vec<usize> = match outputs.get(self.enc_out_lens_name.as_str()) {
            Some(v) => v
                .try_extract_array::<i64>()?
                .iter()
                .map(|&l| l as usize)
                .collect(),
            None => vec![output.shape()[1]; output.shape()[0]],
        };

        let mask = match outputs.get(self.enc_mask_name.as_str()) {
            Some(v) => v
                .try_extract_array::<bool>()?
                .to_owned()
                .into_dimensionality::<ndarray::Ix3>()?,
            None => {
                let (n, t) = (output.shape()[0], output.shape()[1]);
                Array3::from_shape_fn((n, 1, t), |(ni, _, ti)| ti < out_lengths[ni])
            }
        };

        log::debug!(
            "Encoder output: shape={:?}, lengths={:?}",
            output.shape(),
            out_lengths
        );

        Ok(EncoderOutput {
            output,
            lengths: out_lengths,
            mask,
        })
    }

    fn decode_step(
        &mut self,
        tokens: &[Vec<i64>],
        encoder: &EncoderOutput,
        cache: &BatchCache,
    ) -> Result<DecodeStepOutput> {
        let n = tokens.len();
        let max_hist = tokens.iter().map(|t| t.len()).max().unwrap_or(0);

        // Histories grow in lockstep (one token per stream per step), but
        // pad defensively so a ragged call is still well-formed.
        let mut ys = Array2::from_elem((n, max_hist), self.params.pad_id);
        for (i, history) in tokens.iter().enumerate() {
            for (j, &t) in history.iter().enumerate() {
                ys[[i, j]] = t;
            }
        }
        let ys = ys.into_dyn();
        let enc = encoder.output.clone().into_dyn();
        let mask = encoder.mask.clone().into_dyn();

        let dense_caches: Vec<Array3<f32>> = (0..cache.num_layers())
            .map(|li| self.dense_layer(cache.layer(li), n))
            .collect();
        let dense_caches: Vec<ndarray::ArrayD<f32>> =
            dense_caches.into_iter().map(|c| c.into_dyn()).collect();

        let mut inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = vec![
            (
                self.dec_ys_name.as_str().into(),
                TensorRef::from_array_view(ys.view())?.into(),
            ),
            (
                self.dec_enc_name.as_str().into(),
                TensorRef::from_array_view(enc.view())?.into(),
            ),
            (
                self.dec_mask_name.as_str().into(),
                TensorRef::from_array_view(mask.view())?.into(),
            ),
        ];
        for (name, dense) in self.dec_cache_names.iter().zip(&dense_caches) {
            inputs.push((
                name.as_str().into(),
                TensorRef::from_array_view(dense.view())?.into(),
            ));
        }

        let outputs = self.decoder_session.run(inputs)?;

        let logits = outputs
            .get(self.dec_logits_name.as_str())
            .ok_or_else(|| Error::Engine(format!("missing output {}", self.dec_logits_name)))?
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<ndarray::Ix2>()?;

        // Greedy pick; scaling and log-softmax do not change the argmax.
        let next_tokens: Vec<i64> = logits
            .axis_iter(Axis(0))
            .map(|row| {
                let mut max_id = 0usize;
                let mut max_val = f32::NEG_INFINITY;
                for (i, &v) in row.iter().enumerate() {
                    if v > max_val {
                        max_val = v;
                        max_id = i;
                    }
                }
                max_id as i64
            })
            .collect();

        let mut new_layers: Vec<Array2<f32>> = Vec::with_capacity(self.dec_cache_out_names.len());
        for name in &self.dec_cache_out_names {
            let layer = outputs
                .get(name.as_str())
                .ok_or_else(|| Error::Engine(format!("missing cache output {name}")))?
                .try_extract_array::<f32>()?
                .to_owned()
                .into_dimensionality::<ndarray::Ix3>()?;
            new_layers.push(interleave_batched(&layer));
        }

        Ok(DecodeStepOutput {
            next_tokens,
            cache: BatchCache::from_uniform_layers(new_layers, n)?,
        })
    }

    fn sos_id(&self) -> i64 {
        self.params.sos_id
    }

    fn eos_id(&self) -> i64 {
        self.params.eos_id
    }

    fn trailing_sentinels(&self) -> &[i64] {
        &self.trailing
    }

    fn feature_dim(&self) -> usize {
        self.params.feature_dim
    }

    fn cache_layout(&self) -> CacheLayout {
        CacheLayout {
            num_layers: self.params.cache_layers,
            width: self.params.cache_width,
        }
    }

    fn frame_shift_ms(&self) -> u32 {
        self.params.frame_shift_ms
    }
}

/// Flatten a `[N, T, W]` cache tensor into the time-major interleaved
/// `[N*T, W]` row order the cache codec uses.
fn interleave_batched(layer: &Array3<f32>) -> Array2<f32> {
    let (n, t, w) = (layer.shape()[0], layer.shape()[1], layer.shape()[2]);
    let mut rows = Array2::zeros((n * t, w));
    let mut out = 0;
    for ti in 0..t {
        for ni in 0..n {
            rows.row_mut(out).assign(&layer.slice(ndarray::s![ni, ti, ..]));
            out += 1;
        }
    }
    rows
}

/// Find an ONNX model file by component name, trying the suffixed variant
/// first, e.g. `encoder.int8.onnx`, then `encoder.onnx`, then any
/// `encoder*.onnx`.
fn find_model_file(model_dir: &Path, component: &str, suffix: &str) -> Result<PathBuf> {
    let exact_suffixed = model_dir.join(format!("{component}.{suffix}.onnx"));
    if exact_suffixed.exists() {
        return Ok(exact_suffixed);
    }
    let exact = model_dir.join(format!("{component}.onnx"));
    if exact.exists() {
        return Ok(exact);
    }

    if let Ok(entries) = std::fs::read_dir(model_dir) {
        let files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();

        if let Some(f) = files
            .iter()
            .find(|f| f.starts_with(component) && f.ends_with(&format!(".{suffix}.onnx")))
        {
            return Ok(model_dir.join(f));
        }
        if let Some(f) = files
            .iter()
            .find(|f| f.starts_with(component) && f.ends_with(".onnx"))
        {
            return Ok(model_dir.join(f));
        }
    }

    Err(Error::Initialization(format!(
        "No {component}*.onnx found in {}",
        model_dir.display()
    )))
}

fn find_name(names: &[String], candidates: &[&str]) -> Option<String> {
    for &candidate in candidates {
        if let Some(n) = names.iter().find(|n| n.as_str() == candidate) {
            return Some(n.clone());
        }
    }
    None
}

fn init_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers([CPUExecutionProvider::default().build()])?
        .commit_from_file(path)?;

    for input in &session.inputs {
        log::info!("  input: name={}, type={:?}", input.name, input.input_type);
    }
    for output in &session.outputs {
        log::info!("  output: name={}, type={:?}", output.name, output.output_type);
    }
    Ok(session)
}
