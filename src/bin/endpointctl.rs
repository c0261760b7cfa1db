use std::env;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use endpoint_kit::control::{api, ui};
use endpoint_kit::hardware::NullHardwareFactory;
use endpoint_kit::tone::ToneSource;
use endpoint_kit::{ClientChannel, EndpointOptions, EndpointRegistry, StreamConfig};

const DEMO_TONES_HZ: [f64; 3] = [220.0, 330.0, 440.0];
const DEMO_AMPLITUDE: f32 = 0.2;
const FRAMES_PER_BURST: usize = 192;

fn spawn_producer(
    channel: Arc<ClientChannel>,
    sample_rate: u32,
    frequency_hz: f64,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tone-{}", channel.id()))
        .spawn(move || {
            let mut tone = ToneSource::new(
                sample_rate,
                frequency_hz,
                DEMO_AMPLITUDE,
                channel.channel_count(),
            );
            let mut block = vec![0.0f32; FRAMES_PER_BURST * channel.channel_count()];
            while !stop.load(Ordering::Acquire) && !channel.state().is_terminal() {
                while channel.ring().available_write() >= FRAMES_PER_BURST {
                    tone.fill(&mut block);
                    channel.write(&block);
                }
                thread::sleep(Duration::from_millis(2));
            }
        })
}

fn print_status(registry: &EndpointRegistry) {
    let endpoints = api::get_status(registry);
    if endpoints.is_empty() {
        eprintln!("endpointctl: no open endpoints");
        process::exit(1);
    }
    for status in endpoints {
        println!("Device      : {}", status.device_id);
        println!("Sample Rate : {} Hz", status.sample_rate);
        println!("Channels    : {}", status.channel_count);
        println!("Burst       : {} frames", status.frames_per_burst);
        println!("Buffer Size : {} frames", status.buffer_size_frames);
        println!("References  : {}", status.reference_count);
        println!("Health      : {:?}", status.health);
        println!("Streaming   : {}", if status.streaming { "yes" } else { "no" });
        println!("Bursts      : {}", status.bursts_written);
        println!("Output RMS  : {:.3}", status.output_rms);
        if let Some(exit) = &status.last_exit {
            println!("Last Exit   : {exit}");
        }
        println!("Streams:");
        for channel in status.channels {
            println!(
                "  [{}] {:?} | gain={:.1} dB | fill={:.1}% | underflows={} | frames={}",
                channel.id,
                channel.state,
                api::linear_to_db(channel.volume).max(-120.0),
                channel.buffer_fill * 100.0,
                channel.underflows,
                channel.frames_mixed,
            );
        }
    }
}

fn main() {
    let mut status_only = false;
    if let Some(arg) = env::args().nth(1) {
        match arg.as_str() {
            "--status" | "-s" => status_only = true,
            "--help" | "-h" => {
                println!(
                    "Usage: endpointctl [--status]\n\nStarts a demo endpoint fed by {} tone streams on a null device.\nWithout arguments the interactive console launches.",
                    DEMO_TONES_HZ.len()
                );
                return;
            }
            other => {
                eprintln!("endpointctl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    if !status_only {
        endpoint_kit::init_tracing();
    }

    let registry = EndpointRegistry::new(
        Arc::new(NullHardwareFactory::new()),
        EndpointOptions::from_env(),
    );
    let config = StreamConfig {
        frames_per_burst: Some(FRAMES_PER_BURST),
        ..StreamConfig::default()
    };
    let handle = match registry.acquire(&config) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("endpointctl: failed to open endpoint: {err}");
            process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut producers = Vec::new();
    for frequency in DEMO_TONES_HZ {
        let started = handle.create_channel().and_then(|channel| {
            handle.register_stream(channel.clone())?;
            Ok(channel)
        });
        let channel = match started {
            Ok(channel) => channel,
            Err(err) => {
                eprintln!("endpointctl: failed to create stream: {err}");
                process::exit(1);
            }
        };
        match spawn_producer(channel.clone(), config.sample_rate, frequency, stop.clone()) {
            Ok(producer) => producers.push(producer),
            Err(err) => {
                eprintln!("endpointctl: failed to spawn producer: {err}");
                process::exit(1);
            }
        }
        if let Err(err) = handle.start_stream(channel.id()) {
            eprintln!("endpointctl: failed to start {}: {err}", channel.id());
        }
    }

    let result = if status_only {
        thread::sleep(Duration::from_millis(250));
        print_status(&registry);
        Ok(())
    } else {
        ui::run(registry.clone())
    };

    stop.store(true, Ordering::Release);
    for producer in producers {
        let _ = producer.join();
    }
    handle.release();

    if let Err(err) = result {
        eprintln!("endpointctl: {err}");
        process::exit(1);
    }
}
