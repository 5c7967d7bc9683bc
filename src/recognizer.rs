//! Offline batched recognizer.
//!
//! [`Recognizer`] owns an [`InferenceEngine`] and drives the batched decode
//! loop for any number of independent streams: it selects the streams with
//! pending features, stacks their caches, runs one encoder call followed by
//! incremental decode steps until every stream has emitted end-of-sequence
//! (or the configured cap is reached), then demultiplexes tokens and caches
//! back onto the originating streams in input order.

use std::time::Instant;

use ndarray::Array3;

use crate::cache::{BatchCache, StreamCache};
use crate::engine::InferenceEngine;
use crate::error::{Error, Result};
use crate::result::{assemble, RecognitionResult};
use crate::stream::{Stream, StreamId};

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct RecognizerConfig {
    /// Hard cap on decode iterations per tick. `None` falls back to the
    /// encoder output length of the batch being decoded.
    pub max_decode_len: Option<usize>,
}

/// Batched offline recognizer over one inference engine.
///
/// A recognizer instance is single-threaded with respect to decoding: no
/// two inference calls run concurrently, and callers must serialize
/// [`Recognizer::get_results`] ticks. Producers may feed any stream's
/// [`crate::StreamInput`] concurrently with a tick.
pub struct Recognizer<E: InferenceEngine> {
    engine: E,
    config: RecognizerConfig,
    next_stream_id: u64,
}

/// Tokens and caches produced by one successful tick, pending write-back.
struct TickOutput {
    emitted: Vec<Vec<(i64, u32)>>,
    caches: Vec<StreamCache>,
}

impl<E: InferenceEngine> Recognizer<E> {
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, RecognizerConfig::default())
    }

    pub fn with_config(engine: E, config: RecognizerConfig) -> Self {
        Self {
            engine,
            config,
            next_stream_id: 0,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    /// Create a stream bound to this recognizer's model geometry.
    pub fn create_stream(&mut self) -> Stream {
        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;
        Stream::new(
            id,
            self.engine.feature_dim(),
            self.engine.sos_id(),
            self.engine.cache_layout().num_layers,
            self.engine.required_context(),
        )
    }

    /// Decode a single stream; equivalent to a one-element
    /// [`Recognizer::get_results`] call.
    pub fn get_result(&mut self, stream: &mut Stream) -> Result<RecognitionResult> {
        self.get_results(std::slice::from_mut(stream))
            .pop()
            .expect("one result per input stream")
    }

    /// Decode a batch of streams, order-preserving: entry `i` of the output
    /// belongs to `streams[i]`. Streams with no pending features are idle
    /// this tick and report their current (possibly empty) token history;
    /// they are never zero-padded into the inference call. An engine
    /// failure mid-tick fails exactly the streams that were in the batch,
    /// one [`Error::Decode`] each.
    pub fn get_results(&mut self, streams: &mut [Stream]) -> Vec<Result<RecognitionResult>> {
        let mut refs: Vec<&mut Stream> = streams.iter_mut().collect();
        self.run_batch(&mut refs, None)
    }

    /// Shared tick body for offline and streaming modes. `step_cap`
    /// overrides the decode-iteration bound (streaming uses one step per
    /// tick).
    pub(crate) fn run_batch(
        &mut self,
        streams: &mut [&mut Stream],
        step_cap: Option<usize>,
    ) -> Vec<Result<RecognitionResult>> {
        // Partition into working and idle; never mutate a list while
        // iterating it.
        let mut working: Vec<usize> = Vec::new();
        let mut pending: Vec<ndarray::Array2<f32>> = Vec::new();
        for (i, stream) in streams.iter_mut().enumerate() {
            if stream.is_finished() {
                continue;
            }
            if let Some(frames) = stream.take_pending() {
                working.push(i);
                pending.push(frames);
            }
        }

        if working.is_empty() {
            return streams
                .iter()
                .enumerate()
                .map(|(i, s)| Ok(self.assemble_for(i, s)))
                .collect();
        }

        log::debug!(
            "decode tick: {} working / {} total streams",
            working.len(),
            streams.len()
        );

        let started = Instant::now();
        let tick = self.run_tick(&working, &pending, streams, step_cap);
        let elapsed = started.elapsed();

        match tick {
            Ok(output) => {
                for (slot, &i) in working.iter().enumerate() {
                    let stream = &mut streams[i];
                    for &(token, ts) in &output.emitted[slot] {
                        stream.push_token(token, ts);
                    }
                    stream.set_cache(output.caches[slot].clone());
                    stream.consume_frames(pending[slot].nrows());
                    stream.add_processing_time(elapsed);
                }
                streams
                    .iter()
                    .enumerate()
                    .map(|(i, s)| Ok(self.assemble_for(i, s)))
                    .collect()
            }
            Err(err) => {
                log::warn!("decode tick failed: {err}");
                // Put the drained frames back so a retry decodes them
                // instead of seeing the stream as idle.
                for (slot, &i) in working.iter().enumerate() {
                    streams[i].restore_pending(&pending[slot]);
                }
                streams
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        if working.contains(&i) {
                            Err(err.for_stream(s.id()))
                        } else {
                            Ok(self.assemble_for(i, s))
                        }
                    })
                    .collect()
            }
        }
    }

    /// One full offline tick over the working set: encode, decode loop,
    /// unstack. Mutates nothing; the caller applies the output on success.
    fn run_tick(
        &mut self,
        working: &[usize],
        pending: &[ndarray::Array2<f32>],
        streams: &[&mut Stream],
        step_cap: Option<usize>,
    ) -> Result<TickOutput> {
        let n = working.len();
        let feature_dim = self.engine.feature_dim();
        let lengths: Vec<usize> = pending.iter().map(|p| p.nrows()).collect();
        let max_frames = lengths.iter().copied().max().unwrap_or(0);

        // Zero-pad to [N, T, F]; true lengths travel alongside.
        let mut features = Array3::zeros((n, max_frames, feature_dim));
        for (slot, frames) in pending.iter().enumerate() {
            features
                .slice_mut(ndarray::s![slot, ..frames.nrows(), ..])
                .assign(frames);
        }

        let cache = BatchCache::stack(
            &working
                .iter()
                .map(|&i| streams[i].cache().clone())
                .collect::<Vec<_>>(),
        )?;

        let encoder = self.engine.encode(features.view(), &lengths)?;
        check_batch_rows("encoder output", encoder.output.shape()[0], n)?;
        check_batch_rows("encoder lengths", encoder.lengths.len(), n)?;
        check_batch_rows("encoder mask", encoder.mask.shape()[0], n)?;

        let mut histories: Vec<Vec<i64>> =
            working.iter().map(|&i| streams[i].tokens().to_vec()).collect();
        let mut emitted: Vec<Vec<(i64, u32)>> = vec![Vec::new(); n];
        let mut cache = cache;

        let maxlen = step_cap
            .or(self.config.max_decode_len)
            .unwrap_or_else(|| encoder.output.shape()[1]);
        let eos = self.engine.eos_id();
        let shift = self.engine.frame_shift_ms();

        for step in 0..maxlen {
            let out = self.engine.decode_step(&histories, &encoder, &cache)?;
            check_batch_rows("decode tokens", out.next_tokens.len(), n)?;
            check_batch_rows("decode cache", out.cache.batch_size(), n)?;

            for (slot, &token) in out.next_tokens.iter().enumerate() {
                // Timestamp from the stream's cumulative emitted count, not
                // the step index, so it keeps advancing across ticks.
                let ts = (histories[slot].len() - 1) as u32 * shift;
                histories[slot].push(token);
                emitted[slot].push((token, ts));
            }
            cache = out.cache;

            if histories.iter().all(|h| h.last() == Some(&eos)) {
                log::debug!("all streams reached eos after {} steps", step + 1);
                break;
            }
        }

        Ok(TickOutput {
            emitted,
            caches: cache.unstack(),
        })
    }

    pub(crate) fn assemble_for(&self, index: usize, stream: &Stream) -> RecognitionResult {
        assemble(
            index,
            stream,
            self.engine.eos_id(),
            self.engine.trailing_sentinels(),
        )
    }

    /// Whether a stream that has stopped receiving input has drained the
    /// engine's internal lookahead; callers must not retire a stream until
    /// this returns true.
    pub fn is_drained(&self, stream: &Stream) -> bool {
        self.engine.stream_drained(stream.pending_len())
    }
}

fn check_batch_rows(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::ShapeMismatch {
            expected: format!("{what} with {expected} batch rows"),
            got: format!("{got} batch rows"),
        });
    }
    Ok(())
}
