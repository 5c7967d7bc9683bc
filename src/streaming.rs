//! Streaming multiplexer.
//!
//! Drives many online streams through the shared batch scheduler one decode
//! step per tick. Each stream walks the state machine
//! `ACTIVE -> ENDPOINTED -> FINISHED`; a finished stream is moved out of the
//! active set by ownership transfer, so it can structurally never re-enter a
//! batch.
//!
//! The endpoint signal is explicit: a stream becomes ENDPOINTED once its
//! producer has called `finish()` on the input handle and its pending buffer
//! is empty. A stream that is merely between chunks (input still open) sits
//! out the tick and stays ACTIVE.

use crate::engine::InferenceEngine;
use crate::error::{Error, Result};
use crate::recognizer::Recognizer;
use crate::result::RecognitionResult;
use crate::stream::{Stream, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Active,
    Endpointed,
}

struct Slot {
    /// Position in the caller's submission order; results are reported
    /// under this index.
    index: usize,
    stream: Stream,
    state: StreamState,
    failure: Option<Error>,
}

/// What one tick did: which streams were in the batch and which retired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub batch: Vec<StreamId>,
    pub finished: Vec<StreamId>,
}

/// A multiplexed streaming decode over a fixed set of streams.
///
/// Streams are handed over by value; the session owns them until they
/// finish and returns one result per stream, in submission order, from
/// [`StreamingSession::run_to_completion`]. For live use, call
/// [`StreamingSession::tick`] whenever new chunks have been fed.
pub struct StreamingSession<'r, E: InferenceEngine> {
    recognizer: &'r mut Recognizer<E>,
    active: Vec<Slot>,
    retired: Vec<Slot>,
}

impl<'r, E: InferenceEngine> StreamingSession<'r, E> {
    pub fn new(recognizer: &'r mut Recognizer<E>, streams: Vec<Stream>) -> Self {
        let active = streams
            .into_iter()
            .enumerate()
            .map(|(index, stream)| Slot {
                index,
                stream,
                state: StreamState::Active,
                failure: None,
            })
            .collect();
        Self {
            recognizer,
            active,
            retired: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.active.is_empty()
    }

    /// Latest partial result for every still-active stream, in submission
    /// order.
    pub fn partial_results(&self) -> Vec<RecognitionResult> {
        let mut results: Vec<RecognitionResult> = self
            .active
            .iter()
            .map(|slot| self.recognizer.assemble_for(slot.index, &slot.stream))
            .collect();
        results.sort_by_key(|r| r.index);
        results
    }

    /// Run one scheduler tick: partition, endpoint, drain-test, one batched
    /// decode step, demultiplex.
    pub fn tick(&mut self) -> TickSummary {
        // Partition into this tick's survivors and the newly retired: a
        // fresh list every tick, never mutation of the list being iterated.
        let mut survivors: Vec<Slot> = Vec::with_capacity(self.active.len());
        let mut finished: Vec<StreamId> = Vec::new();

        for mut slot in self.active.drain(..) {
            let has_pending = slot.stream.pending_len() > 0;
            if slot.state == StreamState::Active && !has_pending && slot.stream.input_closed() {
                slot.state = StreamState::Endpointed;
                slot.stream.mark_endpointed();
            }

            if slot.state == StreamState::Endpointed
                && !has_pending
                && self.recognizer.is_drained(&slot.stream)
            {
                slot.stream.mark_finished();
                finished.push(slot.stream.id());
                self.retired.push(slot);
            } else {
                survivors.push(slot);
            }
        }
        self.active = survivors;

        // Batch = every surviving stream with work this tick (ENDPOINTED
        // ones are flushing their buffered tail).
        let mut members: Vec<&mut Slot> = self
            .active
            .iter_mut()
            .filter(|slot| slot.stream.pending_len() > 0)
            .collect();
        let batch: Vec<StreamId> = members.iter().map(|s| s.stream.id()).collect();

        if !members.is_empty() {
            let mut streams: Vec<&mut Stream> =
                members.iter_mut().map(|slot| &mut slot.stream).collect();
            let outcomes = self.recognizer.run_batch(&mut streams, Some(1));

            for (slot, outcome) in members.iter_mut().zip(outcomes) {
                if let Err(err) = outcome {
                    log::warn!("{}: {err}", slot.stream.id());
                    slot.failure = Some(err);
                }
            }
        }

        // A stream whose tick failed is retired with its error rather than
        // re-batched against a broken engine state.
        let mut survivors: Vec<Slot> = Vec::with_capacity(self.active.len());
        for mut slot in self.active.drain(..) {
            if slot.failure.is_some() {
                slot.stream.mark_endpointed();
                slot.stream.mark_finished();
                finished.push(slot.stream.id());
                self.retired.push(slot);
            } else {
                survivors.push(slot);
            }
        }
        self.active = survivors;

        TickSummary { batch, finished }
    }

    /// Close every input, then tick until all streams are FINISHED. Results
    /// come back in submission order, one per stream; a stream whose tick
    /// failed reports its own error.
    pub fn run_to_completion(mut self) -> Vec<Result<RecognitionResult>> {
        for slot in &self.active {
            slot.stream.finish_input();
        }
        while !self.is_done() {
            let summary = self.tick();
            if summary.batch.is_empty() && summary.finished.is_empty() {
                // All inputs are closed, so an idle tick means the engine
                // keeps reporting the leftovers as undrained; retire them
                // instead of spinning.
                for slot in &mut self.active {
                    slot.failure = Some(Error::InvalidState(format!(
                        "{}: engine never reported the stream drained",
                        slot.stream.id()
                    )));
                }
                let mut stalled = std::mem::take(&mut self.active);
                for slot in &mut stalled {
                    slot.stream.mark_endpointed();
                    slot.stream.mark_finished();
                }
                self.retired.append(&mut stalled);
            }
        }

        let mut retired = std::mem::take(&mut self.retired);
        retired.sort_by_key(|slot| slot.index);
        retired
            .into_iter()
            .map(|slot| match slot.failure {
                Some(err) => Err(err),
                None => Ok(self.recognizer.assemble_for(slot.index, &slot.stream)),
            })
            .collect()
    }
}
