//! Decode-cache types and the stack/unstack codec.
//!
//! A stream carries one opaque numeric buffer per model layer between decode
//! calls (attention history, convolution context, and so on). The scheduler
//! never interprets these buffers; it only has to combine the per-stream
//! lists into one batched buffer per layer before an inference call and
//! split the returned batched buffers back afterwards.
//!
//! Batch membership changes between ticks, so the mapping from batch slot to
//! stream identity is recomputed on every `stack` call and never persisted.

use ndarray::{Array2, Axis};

use crate::error::{Error, Result};

/// Per-stream decode state: one `[T, W]` buffer per model layer.
///
/// A buffer with zero rows is "cold" (no prior state); the width of warm
/// buffers in the same layer must agree across every stream handled by one
/// recognizer instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCache {
    layers: Vec<Array2<f32>>,
}

impl StreamCache {
    /// A cold cache: every layer empty.
    pub fn cold(num_layers: usize) -> Self {
        Self {
            layers: vec![Array2::zeros((0, 0)); num_layers],
        }
    }

    pub fn from_layers(layers: Vec<Array2<f32>>) -> Self {
        // All empty buffers are equivalent; normalize them to (0, 0) so
        // round-trips through the codec compare equal under PartialEq.
        let layers = layers
            .into_iter()
            .map(|l| if l.nrows() == 0 { Array2::zeros((0, 0)) } else { l })
            .collect();
        Self { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, i: usize) -> &Array2<f32> {
        &self.layers[i]
    }

    pub fn is_cold(&self) -> bool {
        self.layers.iter().all(|l| l.nrows() == 0)
    }
}

/// One layer of a batched cache: the per-stream buffers interleaved
/// time-major, plus the per-stream row counts needed to invert the
/// interleave exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedLayer {
    rows: Array2<f32>,
    lens: Vec<usize>,
}

impl BatchedLayer {
    /// Build a layer from equal-length per-stream buffers, e.g. fresh state
    /// returned by an inference engine as an `[N*T, W]` block.
    pub fn from_uniform(rows: Array2<f32>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 || rows.nrows() % batch_size != 0 {
            return Err(Error::ShapeMismatch {
                expected: format!("row count divisible by batch size {batch_size}"),
                got: format!("{} rows", rows.nrows()),
            });
        }
        let per_stream = rows.nrows() / batch_size;
        Ok(Self {
            rows,
            lens: vec![per_stream; batch_size],
        })
    }

    pub fn rows(&self) -> &Array2<f32> {
        &self.rows
    }

    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    pub fn width(&self) -> usize {
        self.rows.ncols()
    }
}

/// A batched cache for one scheduler tick: every layer interleaved across
/// the streams selected for that tick, in the order they were passed to
/// [`BatchCache::stack`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCache {
    layers: Vec<BatchedLayer>,
    batch_size: usize,
}

impl BatchCache {
    /// Stack per-stream caches into batched per-layer buffers.
    ///
    /// Row order within a layer is time-major: step 0 of stream 0, step 0 of
    /// stream 1, ..., step 1 of stream 0, and so on; streams whose buffer is
    /// shorter than the current step are skipped at that step. Cold buffers
    /// contribute no rows at all (they are not zero-filled).
    pub fn stack(caches: &[StreamCache]) -> Result<BatchCache> {
        let batch_size = caches.len();
        if batch_size == 0 {
            return Ok(BatchCache {
                layers: Vec::new(),
                batch_size: 0,
            });
        }
        let num_layers = caches[0].num_layers();
        for cache in caches {
            if cache.num_layers() != num_layers {
                return Err(Error::ShapeMismatch {
                    expected: format!("{num_layers} cache layers"),
                    got: format!("{} cache layers", cache.num_layers()),
                });
            }
        }

        let mut layers = Vec::with_capacity(num_layers);
        for li in 0..num_layers {
            let width = layer_width(caches, li)?;
            let lens: Vec<usize> = caches.iter().map(|c| c.layer(li).nrows()).collect();
            let total: usize = lens.iter().sum();
            let max_len = lens.iter().copied().max().unwrap_or(0);

            let mut rows = Array2::zeros((total, width));
            let mut out = 0;
            for t in 0..max_len {
                for (n, cache) in caches.iter().enumerate() {
                    if t < lens[n] {
                        rows.row_mut(out).assign(&cache.layer(li).row(t));
                        out += 1;
                    }
                }
            }
            layers.push(BatchedLayer { rows, lens });
        }

        Ok(BatchCache { layers, batch_size })
    }

    /// Exact inverse of [`BatchCache::stack`]: split every layer back into
    /// per-stream buffers in the original input order.
    pub fn unstack(&self) -> Vec<StreamCache> {
        let mut per_stream: Vec<Vec<Array2<f32>>> = (0..self.batch_size)
            .map(|_| Vec::with_capacity(self.layers.len()))
            .collect();

        for layer in &self.layers {
            let width = layer.width();
            let max_len = layer.lens.iter().copied().max().unwrap_or(0);
            let mut outputs: Vec<Array2<f32>> = layer
                .lens
                .iter()
                .map(|&t| Array2::zeros(if t == 0 { (0, 0) } else { (t, width) }))
                .collect();

            let mut row = 0;
            for t in 0..max_len {
                for (n, out) in outputs.iter_mut().enumerate() {
                    if t < layer.lens[n] {
                        out.row_mut(t).assign(&layer.rows.row(row));
                        row += 1;
                    }
                }
            }
            for (n, out) in outputs.into_iter().enumerate() {
                per_stream[n].push(out);
            }
        }

        per_stream.into_iter().map(StreamCache::from_layers).collect()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, i: usize) -> &BatchedLayer {
        &self.layers[i]
    }

    /// Build a batched cache directly from per-layer `[N*T, W]` blocks with
    /// uniform per-stream lengths, as engines typically return them.
    pub fn from_uniform_layers(layers: Vec<Array2<f32>>, batch_size: usize) -> Result<BatchCache> {
        let layers = layers
            .into_iter()
            .map(|rows| BatchedLayer::from_uniform(rows, batch_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(BatchCache { layers, batch_size })
    }
}

/// Width of layer `li` across all streams: warm buffers must agree; a batch
/// of only cold buffers has width zero.
fn layer_width(caches: &[StreamCache], li: usize) -> Result<usize> {
    let mut width = None;
    for cache in caches {
        let layer = cache.layer(li);
        if layer.nrows() == 0 {
            continue;
        }
        match width {
            None => width = Some(layer.ncols()),
            Some(w) if w != layer.ncols() => {
                return Err(Error::ShapeMismatch {
                    expected: format!("cache width {w} in layer {li}"),
                    got: format!("cache width {}", layer.ncols()),
                });
            }
            Some(_) => {}
        }
    }
    Ok(width.unwrap_or(0))
}

/// Concatenate the rows of a batched layer belonging to one uniform
/// time-step range, used by adapters that need a dense `[N, T, W]` view.
pub fn uniform_layer_view(layer: &BatchedLayer) -> Option<ndarray::Array3<f32>> {
    let t = *layer.lens.first()?;
    if layer.lens.iter().any(|&l| l != t) {
        return None;
    }
    let n = layer.lens.len();
    let w = layer.width();
    let mut out = ndarray::Array3::zeros((n, t, w));
    let mut row = 0;
    for ti in 0..t {
        for ni in 0..n {
            out.index_axis_mut(Axis(0), ni)
                .row_mut(ti)
                .assign(&layer.rows.row(row));
            row += 1;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn warm(rows: usize, width: usize, fill: f32) -> Array2<f32> {
        Array2::from_shape_fn((rows, width), |(r, c)| fill + r as f32 * 10.0 + c as f32)
    }

    #[test]
    fn stack_unstack_round_trips() {
        let caches = vec![
            StreamCache::from_layers(vec![warm(3, 4, 1.0), warm(2, 2, 5.0)]),
            StreamCache::from_layers(vec![warm(3, 4, 100.0), warm(2, 2, 50.0)]),
            StreamCache::from_layers(vec![warm(3, 4, 1000.0), warm(2, 2, 500.0)]),
        ];

        let batched = BatchCache::stack(&caches).unwrap();
        assert_eq!(batched.batch_size(), 3);
        assert_eq!(batched.num_layers(), 2);
        assert_eq!(batched.unstack(), caches);
    }

    #[test]
    fn stack_interleaves_time_major() {
        let caches = vec![
            StreamCache::from_layers(vec![arr2(&[[1.0], [2.0]])]),
            StreamCache::from_layers(vec![arr2(&[[10.0], [20.0]])]),
        ];

        let batched = BatchCache::stack(&caches).unwrap();
        // step 0 of both streams, then step 1 of both streams
        assert_eq!(
            batched.layer(0).rows(),
            &arr2(&[[1.0], [10.0], [2.0], [20.0]])
        );
    }

    #[test]
    fn cold_next_to_warm_is_not_a_shape_error() {
        let caches = vec![
            StreamCache::cold(2),
            StreamCache::from_layers(vec![warm(4, 3, 1.0), warm(1, 3, 9.0)]),
        ];

        let batched = BatchCache::stack(&caches).unwrap();
        let restored = batched.unstack();

        assert!(restored[0].is_cold());
        assert_eq!(restored[1], caches[1]);
    }

    #[test]
    fn ragged_lengths_round_trip() {
        let caches = vec![
            StreamCache::from_layers(vec![warm(5, 2, 1.0)]),
            StreamCache::from_layers(vec![warm(1, 2, 7.0)]),
            StreamCache::from_layers(vec![warm(3, 2, 40.0)]),
        ];

        let batched = BatchCache::stack(&caches).unwrap();
        assert_eq!(batched.unstack(), caches);
    }

    #[test]
    fn empty_layers_round_trip_regardless_of_declared_width() {
        let caches = vec![
            StreamCache::from_layers(vec![Array2::zeros((0, 4))]),
            StreamCache::from_layers(vec![warm(2, 4, 1.0)]),
        ];
        assert!(caches[0].is_cold());
        assert_eq!(caches[0].layer(0).ncols(), 0);

        let batched = BatchCache::stack(&caches).unwrap();
        assert_eq!(batched.unstack(), caches);
    }

    #[test]
    fn mismatched_widths_are_rejected() {
        let caches = vec![
            StreamCache::from_layers(vec![warm(2, 4, 0.0)]),
            StreamCache::from_layers(vec![warm(2, 5, 0.0)]),
        ];
        let err = BatchCache::stack(&caches).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn mismatched_layer_counts_are_rejected() {
        let caches = vec![StreamCache::cold(2), StreamCache::cold(3)];
        let err = BatchCache::stack(&caches).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn uniform_view_requires_equal_lengths() {
        let caches = vec![
            StreamCache::from_layers(vec![warm(2, 3, 1.0)]),
            StreamCache::from_layers(vec![warm(2, 3, 9.0)]),
        ];
        let batched = BatchCache::stack(&caches).unwrap();
        let view = uniform_layer_view(batched.layer(0)).unwrap();
        assert_eq!(view.shape(), &[2, 2, 3]);
        assert_eq!(view[[0, 0, 0]], 1.0);
        assert_eq!(view[[1, 0, 0]], 9.0);

        let ragged = vec![
            StreamCache::from_layers(vec![warm(2, 3, 1.0)]),
            StreamCache::from_layers(vec![warm(1, 3, 9.0)]),
        ];
        let batched = BatchCache::stack(&ragged).unwrap();
        assert!(uniform_layer_view(batched.layer(0)).is_none());
    }
}
