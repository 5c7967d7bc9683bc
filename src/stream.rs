//! Per-utterance stream state.
//!
//! A [`Stream`] is the unit of work the scheduler multiplexes: pending
//! feature frames, the growing token history, the per-layer decode cache and
//! the lifecycle flags. The producer side (audio capture, file reader) feeds
//! frames through a cloneable [`StreamInput`] handle whose buffer is guarded
//! by a stream-local lock, so appends may run concurrently with an in-flight
//! decode tick; the lock is only ever held for the copy, never across an
//! inference call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndarray::Array2;

use crate::cache::StreamCache;
use crate::error::{Error, Result};
use crate::features::FeatureBuffer;

/// Opaque stream handle, stable for the stream's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

struct PendingInput {
    buffer: FeatureBuffer,
    closed: bool,
}

/// Producer-side handle for feeding frames into a stream from another
/// thread. Cheap to clone; all clones share the stream's input lock.
#[derive(Clone)]
pub struct StreamInput {
    id: StreamId,
    pending: Arc<Mutex<PendingInput>>,
}

impl StreamInput {
    /// Append externally-extracted `[T, F]` feature frames, in call order.
    pub fn add_frames(&self, frames: &Array2<f32>) -> Result<()> {
        add_frames(self.id, &self.pending, frames)
    }

    /// Signal that no more input will arrive for this stream.
    pub fn finish(&self) {
        self.pending.lock().unwrap().closed = true;
    }

    pub fn id(&self) -> StreamId {
        self.id
    }
}

/// A single utterance's accumulated feature and decode state.
pub struct Stream {
    id: StreamId,
    pending: Arc<Mutex<PendingInput>>,
    tokens: Vec<i64>,
    timestamps: Vec<u32>,
    cache: StreamCache,
    offset: usize,
    endpointed: bool,
    finished: bool,
    processing_time: Duration,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        feature_dim: usize,
        sos_id: i64,
        num_cache_layers: usize,
        required_context: usize,
    ) -> Self {
        Self {
            id,
            pending: Arc::new(Mutex::new(PendingInput {
                buffer: FeatureBuffer::new(feature_dim),
                closed: false,
            })),
            tokens: vec![sos_id],
            timestamps: Vec::new(),
            cache: StreamCache::cold(num_cache_layers),
            offset: required_context,
            endpointed: false,
            finished: false,
            processing_time: Duration::ZERO,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Producer handle usable from another thread while this stream is
    /// being decoded.
    pub fn input(&self) -> StreamInput {
        StreamInput {
            id: self.id,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Append feature frames directly (producer side, same thread).
    pub fn add_frames(&self, frames: &Array2<f32>) -> Result<()> {
        add_frames(self.id, &self.pending, frames)
    }

    /// Mark that no more producer input will arrive.
    pub fn finish_input(&self) {
        self.pending.lock().unwrap().closed = true;
    }

    /// Full token history, starting with the start-of-sequence sentinel and
    /// strictly append-only.
    pub fn tokens(&self) -> &[i64] {
        &self.tokens
    }

    /// Coarse per-emitted-token timestamps in milliseconds, aligned with
    /// `tokens()[1..]`.
    pub fn timestamps(&self) -> &[u32] {
        &self.timestamps
    }

    pub fn cache(&self) -> &StreamCache {
        &self.cache
    }

    /// Count of frames already consumed by decode calls.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// No more external input will arrive.
    pub fn is_endpointed(&self) -> bool {
        self.endpointed
    }

    /// Terminal: once true the stream never re-enters a batch.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    /// Return and clear the pending frames, or `None` if the buffer is
    /// empty. One brief lock acquisition; never held across inference.
    pub(crate) fn take_pending(&mut self) -> Option<Array2<f32>> {
        self.pending.lock().unwrap().buffer.take()
    }

    /// Undo a [`Stream::take_pending`] after a failed tick so the frames
    /// are decoded on the next attempt instead of being lost.
    pub(crate) fn restore_pending(&mut self, frames: &Array2<f32>) {
        self.pending.lock().unwrap().buffer.restore(frames);
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().buffer.len()
    }

    pub(crate) fn input_closed(&self) -> bool {
        self.pending.lock().unwrap().closed
    }

    pub(crate) fn push_token(&mut self, token: i64, timestamp_ms: u32) {
        self.tokens.push(token);
        self.timestamps.push(timestamp_ms);
    }

    pub(crate) fn set_cache(&mut self, cache: StreamCache) {
        self.cache = cache;
    }

    pub(crate) fn consume_frames(&mut self, num_frames: usize) {
        self.offset += num_frames;
    }

    pub(crate) fn add_processing_time(&mut self, elapsed: Duration) {
        self.processing_time += elapsed;
    }

    pub(crate) fn mark_endpointed(&mut self) {
        self.endpointed = true;
    }

    pub(crate) fn mark_finished(&mut self) {
        debug_assert!(self.endpointed, "finish before endpoint");
        self.finished = true;
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("tokens", &self.tokens.len())
            .field("offset", &self.offset)
            .field("endpointed", &self.endpointed)
            .field("finished", &self.finished)
            .finish()
    }
}

fn add_frames(
    id: StreamId,
    pending: &Arc<Mutex<PendingInput>>,
    frames: &Array2<f32>,
) -> Result<()> {
    let mut guard = pending.lock().unwrap();
    if guard.closed {
        return Err(Error::InvalidState(format!(
            "{id}: input already finished"
        )));
    }
    guard.buffer.push(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn test_stream() -> Stream {
        Stream::new(StreamId(7), 2, 3, 4, 0)
    }

    #[test]
    fn tokens_start_with_sos_and_grow_monotonically() {
        let mut stream = test_stream();
        assert_eq!(stream.tokens(), &[3]);

        stream.push_token(41, 0);
        stream.push_token(42, 80);
        assert_eq!(stream.tokens(), &[3, 41, 42]);
        assert_eq!(stream.tokens()[0], 3);
        assert_eq!(stream.timestamps(), &[0, 80]);
    }

    #[test]
    fn add_frames_after_finish_is_invalid_state() {
        let stream = test_stream();
        stream.add_frames(&arr2(&[[1.0, 2.0]])).unwrap();
        stream.finish_input();

        let err = stream.add_frames(&arr2(&[[3.0, 4.0]])).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn input_handle_feeds_the_same_buffer() {
        let mut stream = test_stream();
        let input = stream.input();

        let producer = std::thread::spawn(move || {
            input.add_frames(&arr2(&[[1.0, 2.0], [3.0, 4.0]])).unwrap();
            input.finish();
        });
        producer.join().unwrap();

        let pending = stream.take_pending().unwrap();
        assert_eq!(pending.nrows(), 2);
        assert!(stream.input_closed());
        assert!(stream.take_pending().is_none());
    }

    #[test]
    fn fresh_stream_cache_is_cold() {
        let stream = test_stream();
        assert!(stream.cache().is_cold());
        assert_eq!(stream.cache().num_layers(), 4);
    }
}
