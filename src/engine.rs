//! The capability contract between the batch scheduler and a neural
//! inference engine.
//!
//! The scheduler treats the model as a black box: it hands over a batched,
//! length-padded feature tensor plus the stacked decode cache, and gets back
//! encoder output and one next token per stream. Everything model-specific
//! (attention-encoder-decoder, transducer, CTC-hybrid, chunked attention)
//! lives behind this trait, so the batching and termination logic exists
//! exactly once.

use ndarray::{Array3, ArrayView3};

use crate::cache::BatchCache;
use crate::error::Result;

/// Fixed per-recognizer cache geometry: how many layer buffers a stream
/// carries and how wide each row is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub num_layers: usize,
    pub width: usize,
}

/// Output of one batched encoder call.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[N, T', H]` encoder states.
    pub output: Array3<f32>,
    /// Valid length per batch row, `<= T'`.
    pub lengths: Vec<usize>,
    /// `[N, 1, T']` source attention mask.
    pub mask: Array3<bool>,
}

impl EncoderOutput {
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }
}

/// Output of one batched decode step: one token per batch row plus the
/// replacement cache.
#[derive(Debug)]
pub struct DecodeStepOutput {
    pub next_tokens: Vec<i64>,
    pub cache: BatchCache,
}

/// Tensor-in/tensor-out contract for one model family.
///
/// Implementations must keep batch row `i` of every output aligned with
/// batch row `i` of the inputs of the same call; the scheduler verifies the
/// row counts and surfaces a violation as [`crate::Error::ShapeMismatch`].
pub trait InferenceEngine {
    /// Run the encoder over a zero-padded `[N, T, F]` feature tensor with
    /// the true per-row frame counts in `lengths`.
    fn encode(&mut self, features: ArrayView3<'_, f32>, lengths: &[usize])
        -> Result<EncoderOutput>;

    /// Run one incremental decode step for every batch row. `tokens[i]` is
    /// row i's full token history including the start sentinel.
    fn decode_step(
        &mut self,
        tokens: &[Vec<i64>],
        encoder: &EncoderOutput,
        cache: &BatchCache,
    ) -> Result<DecodeStepOutput>;

    /// Start-of-sequence sentinel; every stream's token history begins with
    /// this id.
    fn sos_id(&self) -> i64;

    /// End-of-sequence sentinel; the decode loop stops early once every
    /// stream in the batch has emitted it.
    fn eos_id(&self) -> i64;

    /// Ids stripped from the tail of a final token sequence in addition to
    /// `eos_id` (pad, blank, unk). Empty by default.
    fn trailing_sentinels(&self) -> &[i64] {
        &[]
    }

    /// Expected feature dimension `F` of incoming frames.
    fn feature_dim(&self) -> usize;

    /// Cache geometry shared by every stream of this recognizer.
    fn cache_layout(&self) -> CacheLayout;

    /// Frames of left context a causal/lookahead model needs; seeds each
    /// stream's consumed-frame offset.
    fn required_context(&self) -> usize {
        0
    }

    /// Encoder frame shift in milliseconds, used for coarse token
    /// timestamps.
    fn frame_shift_ms(&self) -> u32 {
        80
    }

    /// Whether a stream that has stopped receiving input has also drained
    /// its internal lookahead. The default rule suits non-streaming models:
    /// drained as soon as no pending frames remain.
    fn stream_drained(&self, pending_frames: usize) -> bool {
        pending_frames == 0
    }
}
