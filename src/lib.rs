//! # asrmux
//!
//! A multiplexed batched-decode runtime for speech recognition. asrmux turns
//! an opaque tensor-in/tensor-out inference engine into a robust streaming or
//! offline transcription service: many independent utterance streams are
//! decoded together in one batch per inference call, with per-stream decode
//! state stacked and unstacked around every call.
//!
//! ## What it does
//!
//! - **Stream lifecycle**: each utterance is a [`Stream`] accumulating
//!   feature frames and decode state; producers feed it from their own
//!   thread through a [`StreamInput`] handle.
//! - **Batch scheduling**: a [`Recognizer`] selects the streams with pending
//!   work each tick, stacks their caches, runs the encoder and an
//!   incremental decode loop, and demultiplexes tokens back in input order.
//! - **Streaming multiplexing**: a [`StreamingSession`] drives streams
//!   through `ACTIVE -> ENDPOINTED -> FINISHED` one decode step per tick;
//!   finished streams are moved out of the active set and can never re-enter
//!   a batch.
//! - **Model adapters**: the scheduler is generic over the
//!   [`InferenceEngine`] trait; the `onnx` feature ships an
//!   attention-encoder-decoder adapter backed by ONNX Runtime.
//!
//! ## What it leaves to collaborators
//!
//! Feature extraction (the frontend hands `[T, F]` frame blocks to
//! [`Stream::add_frames`]), vocabulary rendering (a [`Detokenizer`] turns
//! result token ids into text), audio capture and model download.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use asrmux::{OnnxAedEngine, OnnxAedParams, Recognizer};
//!
//! # fn main() -> Result<(), asrmux::Error> {
//! let engine = OnnxAedEngine::new(Path::new("models/aed"), OnnxAedParams::default())?;
//! let mut recognizer = Recognizer::new(engine);
//!
//! let mut stream = recognizer.create_stream();
//! // frames come from an external feature frontend
//! stream.add_frames(&ndarray::Array2::zeros((120, 80)))?;
//! stream.finish_input();
//!
//! let result = recognizer.get_result(&mut stream)?;
//! println!("{} tokens in {}ms", result.tokens.len(), result.processing_time_ms);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod features;
pub mod recognizer;
pub mod result;
pub mod stream;
pub mod streaming;

#[cfg(feature = "onnx")]
pub mod onnx;
#[cfg(feature = "onnx")]
pub use onnx::{OnnxAedEngine, OnnxAedParams};

pub use cache::{BatchCache, StreamCache};
pub use engine::{CacheLayout, DecodeStepOutput, EncoderOutput, InferenceEngine};
pub use error::{Error, Result};
pub use recognizer::{Recognizer, RecognizerConfig};
pub use result::{Detokenizer, RecognitionResult};
pub use stream::{Stream, StreamId, StreamInput};
pub use streaming::{StreamingSession, TickSummary};
