//! Final-result assembly.
//!
//! Turns a finished token history into a caller-owned record: the leading
//! start sentinel and any trailing end/pad sentinels are trimmed, raw token
//! ids and coarse timestamps are kept. Rendering ids into text is the job of
//! an external detokenizer.

use crate::stream::{Stream, StreamId};

/// Result of recognizing one stream. Owned by the caller; carries no
/// back-reference to the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    /// Position of the originating stream in the caller's input list.
    pub index: usize,
    pub stream_id: StreamId,
    /// Raw token ids with sentinels trimmed. Vocabulary rendering is
    /// delegated to a [`Detokenizer`].
    pub tokens: Vec<i64>,
    /// Coarse per-token timestamps in milliseconds, one per entry of
    /// `tokens`.
    pub timestamps: Vec<u32>,
    pub processing_time_ms: u64,
}

/// Output-side collaborator that renders token ids into text.
pub trait Detokenizer {
    fn detokenize(&self, tokens: &[i64]) -> String;
}

/// Build the result record for `stream`, trimming the leading start
/// sentinel and any trailing ids in `eos_id`/`trailing_sentinels`.
pub(crate) fn assemble(
    index: usize,
    stream: &Stream,
    eos_id: i64,
    trailing_sentinels: &[i64],
) -> RecognitionResult {
    // tokens[0] is always the start sentinel; timestamps align with
    // tokens[1..].
    let mut tokens: Vec<i64> = stream.tokens()[1..].to_vec();
    let mut timestamps: Vec<u32> = stream.timestamps().to_vec();

    while let Some(&last) = tokens.last() {
        if last == eos_id || trailing_sentinels.contains(&last) {
            tokens.pop();
            timestamps.pop();
        } else {
            break;
        }
    }

    RecognitionResult {
        index,
        stream_id: stream.id(),
        tokens,
        timestamps,
        processing_time_ms: stream.processing_time().as_millis() as u64,
    }
}
