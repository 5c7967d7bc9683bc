use ndarray::Array2;

use crate::error::{Error, Result};

/// Per-stream accumulator of extracted feature frames awaiting decode.
///
/// Frames arrive from an external feature frontend as `[T, F]` blocks and
/// are appended in call order. The scheduler drains the whole buffer at the
/// start of a tick via [`FeatureBuffer::take`].
#[derive(Debug)]
pub struct FeatureBuffer {
    frames: Vec<f32>,
    num_frames: usize,
    feature_dim: usize,
}

impl FeatureBuffer {
    pub fn new(feature_dim: usize) -> Self {
        Self {
            frames: Vec::new(),
            num_frames: 0,
            feature_dim,
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn len(&self) -> usize {
        self.num_frames
    }

    pub fn is_empty(&self) -> bool {
        self.num_frames == 0
    }

    /// Append a `[T, F]` block of frames. The feature dimension must match
    /// the one the buffer was created with.
    pub fn push(&mut self, frames: &Array2<f32>) -> Result<()> {
        if frames.ncols() != self.feature_dim {
            return Err(Error::ShapeMismatch {
                expected: format!("[*, {}]", self.feature_dim),
                got: format!("[{}, {}]", frames.nrows(), frames.ncols()),
            });
        }
        if frames.nrows() == 0 {
            return Ok(());
        }
        self.frames.extend(frames.iter().copied());
        self.num_frames += frames.nrows();
        Ok(())
    }

    /// Put frames back at the front of the buffer, undoing a [`take`]
    /// whose consumer failed. Blocks a producer appended in the meantime
    /// stay behind the restored rows, preserving arrival order.
    ///
    /// [`take`]: FeatureBuffer::take
    pub fn restore(&mut self, frames: &Array2<f32>) {
        if frames.nrows() == 0 {
            return;
        }
        self.frames.splice(0..0, frames.iter().copied());
        self.num_frames += frames.nrows();
    }

    /// Return and clear all pending frames, or `None` if the buffer is
    /// empty. This is how the scheduler decides whether a stream joins the
    /// next tick.
    pub fn take(&mut self) -> Option<Array2<f32>> {
        if self.num_frames == 0 {
            return None;
        }
        let rows = self.num_frames;
        let data = std::mem::take(&mut self.frames);
        self.num_frames = 0;
        // Shape is consistent with push(), which only admits [*, F] blocks.
        Some(Array2::from_shape_vec((rows, self.feature_dim), data).unwrap())
    }
}
