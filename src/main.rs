use anyhow::Context;
use clap::{Arg, Command, value_parser};
use log::{info, warn};
use std::sync::Arc;
use std::{panic, process};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voice_bridge::ai::EchoSession;
use voice_bridge::audio::pcm::{PcmFormat, samples_to_bytes};
use voice_bridge::config::{app_name, version};
use voice_bridge::dump::MemoryDump;
use voice_bridge::encoder::OpusEncoder;
use voice_bridge::pipeline::{EventBus, EventKind, FrameClock};
use voice_bridge::transport::{memory_sink, memory_source};
use voice_bridge::{BridgeConfig, CallBridge, CallDumps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON bridge configuration; defaults are used when omitted.")
                .required(false),
        )
        .arg(
            Arg::new("seconds")
                .short('s')
                .long("seconds")
                .value_name("SECONDS")
                .help("Length of the caller tone.")
                .value_parser(value_parser!(u64))
                .default_value("5"),
        )
        .arg(
            Arg::new("frequency")
                .short('f')
                .long("frequency")
                .value_name("HZ")
                .help("Pitch of the caller tone.")
                .value_parser(value_parser!(f32))
                .default_value("440"),
        )
        .arg(
            Arg::new("interrupt-every")
                .short('i')
                .long("interrupt-every")
                .value_name("CHUNKS")
                .help("Let the echo backend interrupt itself every n chunks (0 = never).")
                .value_parser(value_parser!(u64))
                .default_value("50"),
        )
        .get_matches();

    // kill the main thread as soon as a worker panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let config = match matches.get_one::<String>("config") {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config {}", path))?;
            BridgeConfig::from_json(&raw)?
        }
        None => BridgeConfig::default(),
    };
    let seconds = matches.get_one::<u64>("seconds").copied().unwrap_or(5);
    let frequency = matches.get_one::<f32>("frequency").copied().unwrap_or(440.0);
    let interrupt_every = matches
        .get_one::<u64>("interrupt-every")
        .copied()
        .unwrap_or_default();

    let transport = config.transport_format()?;
    let session = EchoSession::new(
        config.ai_input_format()?,
        config.ai_output_format()?,
        config.queue_capacity,
    )?
    .with_interrupt_every(interrupt_every);

    let (feed, source) = memory_source(config.queue_capacity);
    let (sink, mut written) = memory_sink(config.queue_capacity);

    let inbound_dump = config.dump.inbound.then(MemoryDump::new);
    let outbound_dump = config.dump.outbound.then(MemoryDump::new);
    let dumps = CallDumps {
        inbound: inbound_dump
            .clone()
            .map(|d| Box::new(d) as Box<dyn voice_bridge::dump::DumpSink>),
        outbound: outbound_dump
            .clone()
            .map(|d| Box::new(d) as Box<dyn voice_bridge::dump::DumpSink>),
    };

    let bus = EventBus::new();
    let events = log_events(&bus);

    let mut bridge = CallBridge::new(
        &config,
        Box::new(source),
        Box::new(sink),
        Arc::new(session),
        bus,
        dumps,
    )?;

    let lifetime = CancellationToken::new();
    bridge.start(lifetime.clone()).await?;

    let caller = tokio::spawn(play_tone(
        feed,
        transport,
        config.encoder.bitrate,
        config.encoder.complexity,
        seconds * 50,
        frequency,
        lifetime.clone(),
    ));

    let mut packets = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, hanging up");
                break;
            }
            unit = written.recv() => match unit {
                Some(_) => packets += 1,
                None => {
                    info!("Call finished");
                    break;
                }
            },
        }
    }

    lifetime.cancel();
    if let Err(e) = caller.await {
        warn!("Caller task failed: {}", e);
    }
    bridge.stop().await?;
    events.abort();

    for (name, summary) in bridge.health_report() {
        info!("{}: {}", name, summary);
    }
    info!("{} packets sent back to the caller", packets);
    if let Some(dump) = inbound_dump {
        info!("Inbound dump: {} bytes", dump.bytes().len());
    }
    if let Some(dump) = outbound_dump {
        info!("Outbound dump: {} bytes", dump.bytes().len());
    }
    Ok(())
}

/// Plays the caller's side: a sine tone, Opus-encoded, one packet per tick
async fn play_tone(
    feed: mpsc::Sender<bytes::Bytes>,
    format: PcmFormat,
    bitrate: u64,
    complexity: u32,
    frames: u64,
    frequency: f32,
    cancel: CancellationToken,
) {
    let mut encoder = match OpusEncoder::new(format, bitrate, complexity) {
        Ok(encoder) => encoder,
        Err(e) => {
            warn!("Caller: cannot create encoder: {}", e);
            return;
        }
    };

    let samples = format.frame_samples();
    let channels = format.channels() as usize;
    let mut clock = FrameClock::new();

    for frame in 0..frames {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = clock.tick() => {}
        }

        let pcm: Vec<i16> = (0..samples)
            .flat_map(|i| {
                let t = (frame as usize * samples + i) as f32 / format.sample_rate as f32;
                let value = ((t * frequency * std::f32::consts::TAU).sin() * 8_000.0) as i16;
                std::iter::repeat_n(value, channels)
            })
            .collect();

        match encoder.encode(&samples_to_bytes(&pcm)) {
            Ok(packets) => {
                for packet in packets {
                    if feed.send(packet).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("Caller: {}", e),
        }
    }
    info!("Caller: hung up after {} frames", frames);
}

fn log_events(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut barge_in = bus.subscribe_channel(EventKind::BargeIn, 16);
    let mut text = bus.subscribe_channel(EventKind::PartialResult, 16);
    let mut errors = bus.subscribe_channel(EventKind::Error, 16);
    let mut warnings = bus.subscribe_channel(EventKind::Warning, 16);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(event) = errors.recv() => event,
                Some(event) = warnings.recv() => event,
                Some(event) = barge_in.recv() => event,
                Some(event) = text.recv() => event,
                else => break,
            };
            match serde_json::to_string(&event) {
                Ok(json) => info!("Event: {}", json),
                Err(e) => warn!("Event: {:?} ({})", event.kind, e),
            }
        }
    })
}
