use crate::stream::StreamId;

/// Errors raised by the recognizer runtime.
///
/// `Decode` is deliberately per-stream: a failed inference call during a
/// batch tick is reported once per affected stream so that sibling streams
/// decoded in the same tick keep their results.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Initialization failed: {0}")]
    Initialization(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },
    #[error("Decode failed for stream {stream_id}: {message}")]
    Decode {
        stream_id: StreamId,
        message: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[cfg(feature = "onnx")]
    #[error("ORT error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Inference engine error: {0}")]
    Engine(String),
}

impl Error {
    /// Re-tag an engine failure with the stream it affected.
    pub(crate) fn for_stream(&self, stream_id: StreamId) -> Error {
        Error::Decode {
            stream_id,
            message: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
