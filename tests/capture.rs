use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tannoy::{AudioError, AudioSink, CaptureSink, DecodeEvent, SampleFormat, SinkConfig};

fn config() -> SinkConfig {
    SinkConfig::new(44_100, 2, SampleFormat::Pcm16)
}

#[test]
fn completed_capture_returns_contents() {
    let sink = CaptureSink::new();
    sink.open(config(), None).unwrap();
    assert!(!sink.realtime());

    sink.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    sink.notify(DecodeEvent::BufferingUpdate, 50, 0);
    sink.notify(DecodeEvent::Complete, 0, 0);
    sink.wait().unwrap();

    assert!(sink.ready());
    assert_eq!(sink.size(), 8);
    assert_eq!(sink.contents(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(sink.frames_written().unwrap(), 2);
    assert_eq!(sink.position().unwrap(), 2);
    assert_eq!(sink.sample_rate(), Some(44_100));
    assert_eq!(sink.channels(), Some(2));
}

#[test]
fn wait_blocks_until_notify() {
    let sink = Arc::new(CaptureSink::new());
    sink.open(config(), None).unwrap();

    let flagged = Arc::new(AtomicBool::new(false));
    let worker = {
        let sink = sink.clone();
        let flagged = flagged.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            sink.write(&[0u8; 64]).unwrap();
            flagged.store(true, Ordering::SeqCst);
            sink.notify(DecodeEvent::Complete, 0, 0);
        })
    };

    sink.wait().unwrap();
    assert!(flagged.load(Ordering::SeqCst));
    worker.join().unwrap();
    assert_eq!(sink.size(), 64);
}

#[test]
fn decode_error_propagates_code() {
    let sink = CaptureSink::new();
    sink.open(config(), None).unwrap();
    sink.notify(DecodeEvent::Error, -1007, 0);
    assert!(matches!(
        sink.wait(),
        Err(AudioError::DecodeFailed { code: -1007 })
    ));
    assert!(!sink.ready());
}

#[test]
fn region_growth_respects_ceiling() {
    let sink = CaptureSink::with_limit(64);
    sink.open(config(), None).unwrap();
    assert_eq!(sink.write(&[0u8; 60]).unwrap(), 60);
    assert!(matches!(
        sink.write(&[0u8; 8]),
        Err(AudioError::ResourceExhausted { limit: 64 })
    ));
    // what was captured before the rejection stays intact
    assert_eq!(sink.size(), 60);
    assert_eq!(sink.write(&[0u8; 4]).unwrap(), 4);
}

#[test]
fn playback_controls_are_inert_or_unsupported() {
    let sink = CaptureSink::new();
    sink.open(config(), None).unwrap();
    sink.start().unwrap();
    sink.pause().unwrap();
    sink.flush().unwrap();
    sink.stop().unwrap();
    sink.set_volume(0.1, 0.1).unwrap();
    assert_eq!(sink.latency_ms().unwrap(), 0);
    assert!(matches!(
        sink.set_playback_rate_permille(500),
        Err(AudioError::Unsupported)
    ));
    assert!(matches!(
        sink.attach_aux_effect(3),
        Err(AudioError::Unsupported)
    ));
    assert!(matches!(
        sink.set_aux_effect_send_level(0.5),
        Err(AudioError::Unsupported)
    ));
}

#[test]
fn write_before_open_fails() {
    let sink = CaptureSink::new();
    assert!(matches!(
        sink.write(&[0u8; 4]),
        Err(AudioError::State { .. })
    ));
    assert!(!sink.ready());
}

#[test]
fn reopen_is_rejected() {
    let sink = CaptureSink::new();
    sink.open(config(), None).unwrap();
    assert!(matches!(
        sink.open(config(), None),
        Err(AudioError::State { .. })
    ));
}
