//! Deterministic stub engine for scheduler tests.
//!
//! Encoding is the identity over the feature tensor; decoding emits, for
//! batch row `i`, the token `100 * features[i,0,0] + steps_emitted` until as
//! many tokens as that row's frame count have been produced, then
//! end-of-sequence. Every decode step also appends one row per stream to
//! every cache layer, so the stack/unstack plumbing is exercised on each
//! tick exactly as a stateful model would.

#![allow(dead_code)]

use asrmux::{
    BatchCache, CacheLayout, DecodeStepOutput, EncoderOutput, Error, InferenceEngine,
    Result, StreamCache,
};
use ndarray::{Array2, Array3, ArrayView3};

pub const SOS: i64 = 1;
pub const EOS: i64 = 2;
pub const FEATURE_DIM: usize = 4;
pub const CACHE_LAYERS: usize = 2;
pub const CACHE_WIDTH: usize = 3;

#[derive(Default)]
pub struct StubEngine {
    /// Adversarial mode: never emit end-of-sequence.
    pub refuse_eos: bool,
    /// Fail every decode step.
    pub fail_decode: bool,
    /// Fail only the first decode step, then recover.
    pub fail_first_decode: bool,
    /// Return one token row too few, violating the batch contract.
    pub short_token_rows: bool,
    /// Number of decode_step calls served so far.
    pub decode_calls: usize,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InferenceEngine for StubEngine {
    fn encode(
        &mut self,
        features: ArrayView3<'_, f32>,
        lengths: &[usize],
    ) -> Result<EncoderOutput> {
        let n = features.shape()[0];
        let t = features.shape()[1];
        let mask = Array3::from_shape_fn((n, 1, t), |(i, _, ti)| ti < lengths[i]);
        Ok(EncoderOutput {
            output: features.to_owned(),
            lengths: lengths.to_vec(),
            mask,
        })
    }

    fn decode_step(
        &mut self,
        tokens: &[Vec<i64>],
        encoder: &EncoderOutput,
        cache: &BatchCache,
    ) -> Result<DecodeStepOutput> {
        self.decode_calls += 1;
        if self.fail_decode || (self.fail_first_decode && self.decode_calls == 1) {
            return Err(Error::Engine("injected decoder failure".into()));
        }

        let n = tokens.len();
        let mut next_tokens = Vec::with_capacity(n);
        for (i, history) in tokens.iter().enumerate() {
            let emitted = history.len() - 1;
            let fingerprint = encoder.output[[i, 0, 0]] as i64;
            let token = if !self.refuse_eos && emitted >= encoder.lengths[i] {
                EOS
            } else {
                100 * fingerprint + emitted as i64
            };
            next_tokens.push(token);
        }
        if self.short_token_rows {
            next_tokens.pop();
        }

        // Append one row per stream to every layer, like a model growing its
        // attention history.
        let grown: Vec<StreamCache> = cache
            .unstack()
            .into_iter()
            .zip(tokens)
            .map(|(old, history)| {
                let layers = (0..CACHE_LAYERS)
                    .map(|li| {
                        let prev = old.layer(li);
                        let mut layer = Array2::zeros((prev.nrows() + 1, CACHE_WIDTH));
                        if prev.nrows() > 0 {
                            layer
                                .slice_mut(ndarray::s![..prev.nrows(), ..])
                                .assign(prev);
                        }
                        layer
                            .row_mut(prev.nrows())
                            .fill((history.len() - 1) as f32);
                        layer
                    })
                    .collect();
                StreamCache::from_layers(layers)
            })
            .collect();

        Ok(DecodeStepOutput {
            next_tokens,
            cache: BatchCache::stack(&grown)?,
        })
    }

    fn sos_id(&self) -> i64 {
        SOS
    }

    fn eos_id(&self) -> i64 {
        EOS
    }

    fn feature_dim(&self) -> usize {
        FEATURE_DIM
    }

    fn cache_layout(&self) -> CacheLayout {
        CacheLayout {
            num_layers: CACHE_LAYERS,
            width: CACHE_WIDTH,
        }
    }
}

/// `[frames, FEATURE_DIM]` block filled with a per-stream fingerprint value.
pub fn frames(count: usize, fingerprint: f32) -> Array2<f32> {
    Array2::from_elem((count, FEATURE_DIM), fingerprint)
}
