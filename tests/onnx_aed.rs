#![cfg(feature = "onnx")]

use std::path::PathBuf;

use asrmux::{OnnxAedEngine, OnnxAedParams, Recognizer};

/// End-to-end smoke test against a real AED export. Needs a model directory
/// with `encoder*.onnx`/`decoder*.onnx`; skipped when absent.
#[test]
fn test_onnx_aed_batch_decode() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let model_dir = PathBuf::from("models/aed");
    if !model_dir.exists() {
        eprintln!("Skipping test: model not found at {:?}", model_dir);
        return Ok(());
    }

    let engine = OnnxAedEngine::new(&model_dir, OnnxAedParams::default())?;
    let feature_dim = {
        use asrmux::InferenceEngine;
        engine.feature_dim()
    };
    let mut recognizer = Recognizer::new(engine);

    let mut streams = vec![recognizer.create_stream(), recognizer.create_stream()];
    // Synthetic low-energy frames; we only assert the plumbing, not the
    // transcription.
    streams[0].add_frames(&ndarray::Array2::from_elem((60, feature_dim), 0.1))?;
    streams[1].add_frames(&ndarray::Array2::from_elem((90, feature_dim), 0.1))?;

    let results = recognizer.get_results(&mut streams);
    assert_eq!(results.len(), 2);
    for (i, result) in results.into_iter().enumerate() {
        let result = result?;
        assert_eq!(result.index, i);
    }

    Ok(())
}
