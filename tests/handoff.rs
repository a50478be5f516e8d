use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tannoy::{AudioError, AudioSink, LiveSink, ManualDevice, SampleFormat, SinkConfig};

fn stereo_config() -> SinkConfig {
    SinkConfig::new(48_000, 2, SampleFormat::Pcm16)
}

/// Interleaved stereo frames where both channels carry the frame index.
fn ramp_bytes(start: usize, frames: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames * 4);
    for f in 0..frames {
        let bytes = ((start + f) as i16).to_le_bytes();
        out.extend_from_slice(&bytes);
        out.extend_from_slice(&bytes);
    }
    out
}

fn const_bytes(value: i16, frames: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames * 4);
    for _ in 0..frames {
        let bytes = value.to_le_bytes();
        out.extend_from_slice(&bytes);
        out.extend_from_slice(&bytes);
    }
    out
}

fn write_all(sink: &LiveSink, device: &ManualDevice, data: &[u8]) {
    let mut offset = 0;
    while offset < data.len() {
        let accepted = sink.write(&data[offset..]).unwrap();
        if accepted == 0 {
            device.render(2048);
        }
        offset += accepted;
    }
}

#[test]
fn handoff_preserves_sample_continuity() {
    let device = Arc::new(ManualDevice::new());
    let a = Arc::new(LiveSink::new(device.clone(), 1));
    a.open(stereo_config(), None).unwrap();
    a.start().unwrap();
    write_all(&a, &device, &ramp_bytes(0, 4096));

    let b = Arc::new(LiveSink::new(device.clone(), 2));
    a.set_next_output(&b).unwrap();
    b.open(stereo_config(), None).unwrap();
    assert!(!a.needs_trailing_padding());

    // half the queue plays out before the switch
    device.render(4096);
    a.switch_to_next_output().unwrap();
    write_all(&b, &device, &ramp_bytes(4096, 4096));

    while b.position().unwrap() < 8192 {
        device.render(2048);
    }

    let captured = device.captured();
    for frame in 0..8192usize {
        assert_eq!(captured[frame * 2], frame as i16, "left, frame {}", frame);
        assert_eq!(captured[frame * 2 + 1], frame as i16, "right, frame {}", frame);
    }
    assert_eq!(b.frames_written().unwrap(), 8192);
    assert_eq!(b.position().unwrap(), 8192);

    // the predecessor has given everything up
    assert!(matches!(a.write(&ramp_bytes(0, 4)), Err(AudioError::State { .. })));
    assert!(matches!(a.position(), Err(AudioError::State { .. })));
}

#[test]
fn switch_without_successor_fails() {
    let device = Arc::new(ManualDevice::new());
    let a = Arc::new(LiveSink::new(device, 1));
    a.open(stereo_config(), None).unwrap();
    a.start().unwrap();
    assert!(matches!(
        a.switch_to_next_output(),
        Err(AudioError::State { .. })
    ));
    assert!(a.needs_trailing_padding());
}

#[test]
fn incompatible_successor_leaves_current_intact() {
    let device = Arc::new(ManualDevice::new());
    let a = Arc::new(LiveSink::new(device.clone(), 1));
    a.open(stereo_config(), None).unwrap();
    a.start().unwrap();

    let b = Arc::new(LiveSink::new(device.clone(), 2));
    a.set_next_output(&b).unwrap();
    b.open(SinkConfig::new(44_100, 2, SampleFormat::Pcm16), None)
        .unwrap();

    assert!(matches!(
        a.switch_to_next_output(),
        Err(AudioError::Config(_))
    ));
    // still playing, still writable, successor link kept for a retry
    assert_eq!(a.write(&ramp_bytes(0, 16)).unwrap(), 64);
    assert!(!a.needs_trailing_padding());
    assert!(a.position().is_ok());
}

#[test]
fn stop_pads_tail_with_silence_without_successor() {
    let device = Arc::new(ManualDevice::new());
    let a = Arc::new(LiveSink::new(device.clone(), 1));
    a.open(stereo_config(), None).unwrap();
    a.start().unwrap();
    write_all(&a, &device, &const_bytes(1000, 512));
    a.stop().unwrap();

    // the queued data plus one whole period of silence drain out
    let sourced = device.render((512 + 1024) * 2);
    assert_eq!(sourced, (512 + 1024) * 2);
    let captured = device.captured();
    assert!(captured[..512 * 2].iter().all(|&s| s == 1000));
    assert!(captured[512 * 2..(512 + 1024) * 2].iter().all(|&s| s == 0));
}

#[test]
fn stop_skips_padding_with_successor() {
    let device = Arc::new(ManualDevice::new());
    let a = Arc::new(LiveSink::new(device.clone(), 1));
    a.open(stereo_config(), None).unwrap();
    a.start().unwrap();
    write_all(&a, &device, &const_bytes(1000, 512));

    let b = Arc::new(LiveSink::new(device.clone(), 2));
    a.set_next_output(&b).unwrap();
    a.stop().unwrap();

    // only the queued data comes out; the successor owns the tail
    let sourced = device.render((512 + 1024) * 2);
    assert_eq!(sourced, 512 * 2);
}

#[test]
fn deferred_successor_can_start_standalone() {
    let dev_a = Arc::new(ManualDevice::new());
    let dev_b = Arc::new(ManualDevice::new());
    let a = Arc::new(LiveSink::new(dev_a, 1));
    a.open(stereo_config(), None).unwrap();

    let b = Arc::new(LiveSink::new(dev_b.clone(), 2));
    a.set_next_output(&b).unwrap();
    b.open(stereo_config(), None).unwrap();
    // no track until the switch that never comes
    assert!(!b.ready());

    b.start().unwrap();
    assert!(b.ready());
    assert!(dev_b.is_playing());
}

#[test]
fn delivery_callback_reports_frames() {
    let device = Arc::new(ManualDevice::new());
    let a = Arc::new(LiveSink::new(device.clone(), 1));
    let delivered = Arc::new(AtomicU64::new(0));
    let counter = delivered.clone();
    a.open(
        stereo_config(),
        Some(Box::new(move |frames| {
            counter.fetch_add(frames, Ordering::SeqCst);
        })),
    )
    .unwrap();
    a.start().unwrap();
    write_all(&a, &device, &ramp_bytes(0, 256));
    device.render(256 * 2);
    assert_eq!(delivered.load(Ordering::SeqCst), 256);
}

#[test]
fn volume_scales_channels_independently() {
    let device = Arc::new(ManualDevice::new());
    let a = Arc::new(LiveSink::new(device.clone(), 1));
    a.open(stereo_config(), None).unwrap();
    a.set_volume(0.5, 1.0).unwrap();
    a.start().unwrap();
    write_all(&a, &device, &const_bytes(10_000, 64));
    device.render(64 * 2);

    let captured = device.captured();
    for frame in 0..64 {
        assert_eq!(captured[frame * 2], 5_000);
        assert_eq!(captured[frame * 2 + 1], 10_000);
    }
}
