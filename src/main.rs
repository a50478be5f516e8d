use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::clap_app;

use tannoy::{
    AudioSink, ClientEndpoint, ClientEvent, ClientHandle, CpalDevice, DecodeEvent, Registry,
    SampleFormat, SinkConfig,
};

struct LogClient;

impl ClientEndpoint for LogClient {
    fn notify(&self, event: ClientEvent) {
        tracing::info!(?event, "client event");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let matches = clap_app!(
        tannoy =>
            (@subcommand tone =>
             (@arg RATE: -r --rate +takes_value "sample rate in Hz (default 48000)")
             (@arg SECONDS: -s --seconds +takes_value "playback length (default 2)")
             (@arg FREQ: "tone frequency in Hz (default 440)")
            )
            (@subcommand capture =>
             (@arg SECONDS: -s --seconds +takes_value "length of synthetic decode (default 1)")
            )
    )
    .get_matches();

    if let Some(matches) = matches.subcommand_matches("tone") {
        let rate: u32 = matches.value_of("RATE").unwrap_or("48000").parse()?;
        let seconds: f32 = matches.value_of("SECONDS").unwrap_or("2").parse()?;
        let freq: f32 = matches.value_of("FREQ").unwrap_or("440").parse()?;
        play_tone(rate, freq, seconds)?;
    }

    if let Some(matches) = matches.subcommand_matches("capture") {
        let seconds: f32 = matches.value_of("SECONDS").unwrap_or("1").parse()?;
        capture_demo(seconds)?;
    }

    Ok(())
}

fn play_tone(rate: u32, freq: f32, seconds: f32) -> anyhow::Result<()> {
    let registry = Registry::new(Arc::new(CpalDevice));
    let client = Arc::new(LogClient);
    let session = registry.create_session(ClientHandle::new(&client), 0, std::process::id(), 0);

    session.set_data_source(format!("tone:{}", freq))?;
    session.prepare()?;
    let sink = session.ensure_live_sink()?;
    sink.open(SinkConfig::new(rate, 2, SampleFormat::Pcm16), None)?;
    session.start()?;
    println!("playing {} Hz for {} seconds", freq, seconds);

    let total_frames = (seconds * rate as f32) as u64;
    let step = 2.0 * std::f32::consts::PI * freq / rate as f32;
    let mut phase = 0.0f32;
    let mut buf = vec![0u8; 1024 * 4];
    let mut generated = 0u64;
    while generated < total_frames {
        let frames = ((total_frames - generated) as usize).min(1024);
        for i in 0..frames {
            let sample = (phase.sin() * 0.25 * f32::from(i16::MAX)) as i16;
            phase += step;
            let bytes = sample.to_le_bytes();
            buf[i * 4..i * 4 + 2].copy_from_slice(&bytes);
            buf[i * 4 + 2..i * 4 + 4].copy_from_slice(&bytes);
        }
        let mut offset = 0;
        while offset < frames * 4 {
            let accepted = session.write(&buf[offset..frames * 4])?;
            if accepted == 0 {
                thread::sleep(Duration::from_millis(5));
            }
            offset += accepted;
        }
        generated += frames as u64;
    }

    // let the queue drain before stopping
    thread::sleep(Duration::from_millis(250));
    session.stop()?;
    println!("played {} frames", sink.position()?);
    Ok(())
}

fn capture_demo(seconds: f32) -> anyhow::Result<()> {
    let registry = Registry::new(Arc::new(CpalDevice));
    let sink = registry.create_capture_sink();

    let rate = 44_100u32;
    sink.open(SinkConfig::new(rate, 2, SampleFormat::Pcm16), None)?;

    let decoder = sink.clone();
    let total_frames = (seconds * rate as f32) as usize;
    let worker = thread::spawn(move || {
        let mut buf = vec![0u8; 1024 * 4];
        let mut written = 0usize;
        while written < total_frames {
            let frames = (total_frames - written).min(1024);
            for i in 0..frames {
                let sample = (((written + i) % 256) as i16 - 128) << 8;
                let bytes = sample.to_le_bytes();
                buf[i * 4..i * 4 + 2].copy_from_slice(&bytes);
                buf[i * 4 + 2..i * 4 + 4].copy_from_slice(&bytes);
            }
            if decoder.write(&buf[..frames * 4]).is_err() {
                decoder.notify(DecodeEvent::Error, -1, 0);
                return;
            }
            written += frames;
        }
        decoder.notify(DecodeEvent::Complete, 0, 0);
    });

    sink.wait()?;
    worker.join().ok();
    println!(
        "captured {} bytes ({} frames)",
        sink.size(),
        sink.frames_written()?
    );
    Ok(())
}
