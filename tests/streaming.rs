mod common;

use std::collections::HashSet;

use asrmux::{Error, Recognizer, StreamId, StreamingSession};
use common::{frames, StubEngine};

#[test]
fn finished_streams_never_reenter_a_batch() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut recognizer = Recognizer::new(StubEngine::new());
    let streams: Vec<_> = (0..3).map(|_| recognizer.create_stream()).collect();
    let inputs: Vec<_> = streams.iter().map(|s| s.input()).collect();

    // Chunk schedules of different lengths: stream 0 finishes first,
    // stream 1 last.
    let chunks_per_stream = [2usize, 5, 3];
    let mut session = StreamingSession::new(&mut recognizer, streams);

    let mut membership_log: Vec<Vec<StreamId>> = Vec::new();
    let mut finished: HashSet<StreamId> = HashSet::new();

    for tick_no in 0..8 {
        for (i, input) in inputs.iter().enumerate() {
            if tick_no < chunks_per_stream[i] {
                input.add_frames(&frames(2, (i + 1) as f32)).unwrap();
                if tick_no + 1 == chunks_per_stream[i] {
                    input.finish();
                }
            }
        }

        let summary = session.tick();
        for id in &summary.batch {
            assert!(
                !finished.contains(id),
                "{id} re-entered a batch after finishing (tick {tick_no})"
            );
        }
        finished.extend(summary.finished.iter().copied());
        membership_log.push(summary.batch);

        if session.is_done() {
            break;
        }
    }

    assert!(session.is_done(), "streams left unfinished: {membership_log:?}");
    assert_eq!(finished.len(), 3);
    // Every stream was actually batched at least once.
    let batched: HashSet<StreamId> = membership_log.iter().flatten().copied().collect();
    assert_eq!(batched.len(), 3);
}

#[test]
fn results_come_back_in_submission_order() {
    let mut recognizer = Recognizer::new(StubEngine::new());
    let mut streams: Vec<_> = (0..3).map(|_| recognizer.create_stream()).collect();
    let ids: Vec<_> = streams.iter().map(|s| s.id()).collect();

    for (i, stream) in streams.iter_mut().enumerate() {
        stream.add_frames(&frames(3 + i, (i + 1) as f32)).unwrap();
    }

    let session = StreamingSession::new(&mut recognizer, streams);
    let results = session.run_to_completion();

    assert_eq!(results.len(), 3);
    for (i, result) in results.iter().enumerate() {
        let result = result.as_ref().unwrap();
        assert_eq!(result.index, i);
        assert_eq!(result.stream_id, ids[i]);
        assert!(!result.tokens.is_empty());
    }
}

#[test]
fn stream_between_chunks_stays_active_until_input_closes() {
    let mut recognizer = Recognizer::new(StubEngine::new());
    let stream = recognizer.create_stream();
    let input = stream.input();

    let mut session = StreamingSession::new(&mut recognizer, vec![stream]);

    // Empty buffer with the input still open: idle tick, stream survives.
    let summary = session.tick();
    assert!(summary.batch.is_empty());
    assert!(summary.finished.is_empty());
    assert!(!session.is_done());

    input.add_frames(&frames(2, 1.0)).unwrap();
    let summary = session.tick();
    assert_eq!(summary.batch.len(), 1);
    assert!(!session.is_done());

    // Endpoint signal: close the input, drain, finish.
    input.finish();
    let summary = session.tick();
    assert!(summary.batch.is_empty());
    assert_eq!(summary.finished.len(), 1);
    assert!(session.is_done());
}

#[test]
fn partial_results_track_progress() {
    let mut recognizer = Recognizer::new(StubEngine::new());
    let stream = recognizer.create_stream();
    let input = stream.input();

    let mut session = StreamingSession::new(&mut recognizer, vec![stream]);

    input.add_frames(&frames(3, 2.0)).unwrap();
    session.tick();

    let partial = session.partial_results();
    assert_eq!(partial.len(), 1);
    // One decode step per streaming tick.
    assert_eq!(partial[0].tokens.len(), 1);
    assert_eq!(partial[0].tokens[0], 200);
}

#[test]
fn timestamps_advance_across_streaming_ticks() {
    let mut recognizer = Recognizer::new(StubEngine::new());
    let stream = recognizer.create_stream();
    let input = stream.input();

    let mut session = StreamingSession::new(&mut recognizer, vec![stream]);

    for _ in 0..4 {
        input.add_frames(&frames(2, 1.0)).unwrap();
        session.tick();
    }

    let partial = session.partial_results();
    assert_eq!(partial[0].tokens, vec![100, 101]);
    // One decode step per tick still advances the clock: the timestamp
    // comes from the stream's cumulative emitted count.
    assert_eq!(partial[0].timestamps, vec![0, 80]);
}

#[test]
fn failing_tick_retires_streams_with_their_error() {
    let engine = StubEngine {
        fail_decode: true,
        ..StubEngine::new()
    };
    let mut recognizer = Recognizer::new(engine);

    let mut streams = vec![recognizer.create_stream(), recognizer.create_stream()];
    streams[0].add_frames(&frames(2, 1.0)).unwrap();
    streams[1].add_frames(&frames(2, 2.0)).unwrap();
    let ids: Vec<_> = streams.iter().map(|s| s.id()).collect();

    let session = StreamingSession::new(&mut recognizer, streams);
    let results = session.run_to_completion();

    assert_eq!(results.len(), 2);
    for (i, result) in results.iter().enumerate() {
        match result {
            Err(Error::Decode { stream_id, .. }) => assert_eq!(*stream_id, ids[i]),
            other => panic!("expected Decode error, got {other:?}"),
        }
    }
}
