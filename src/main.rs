mod channel;
mod config;
mod control;
mod device;
mod device_scanner;
mod error;
mod events;
mod keep_alive;
mod orchestrator;
mod polar_device;
mod recorder;
mod sample;
#[cfg(test)]
mod testing;

use config::Config;
use control::{Ack, ControlService, ScanSettings};
use events::UiEvent;
use keep_alive::{Indicator, KeepAliveController, LogHost};
use orchestrator::StreamOrchestrator;
use polar_device::PolarDevice;
use recorder::{FsStorage, SessionRecorder};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

const COMMAND_BUFFER: usize = 64;

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::warn!("{}; using defaults", e);
            Config::default()
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.recordings_dir) {
        log::warn!(
            "Could not create recordings directory {}: {}",
            config.recordings_dir.display(),
            e
        );
    }

    let rt = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to create async runtime: {}", e);
            std::process::exit(1);
        }
    };

    // Events and acks share stdout; one thread owns it so lines never interleave
    let (event_sender, event_receiver) = crossbeam_channel::unbounded::<UiEvent>();
    let (ack_sender, ack_receiver) = crossbeam_channel::unbounded::<Ack>();
    let printer = std::thread::spawn(move || print_output(event_receiver, ack_receiver));

    let (command_sender, command_receiver) = mpsc::channel::<String>(COMMAND_BUFFER);
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if command_sender.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Failed to read command: {}", e);
                    break;
                }
            }
        }
    });

    let recorder = match SessionRecorder::new(
        Arc::new(FsStorage::new(config.recordings_dir.clone())),
        config.write_queue_capacity,
    ) {
        Ok(recorder) => Arc::new(recorder),
        Err(e) => {
            log::error!("Failed to start session writer: {}", e);
            std::process::exit(1);
        }
    };

    let sink = Arc::new(event_sender);
    let device = Arc::new(PolarDevice::new(sink.clone()));
    let orchestrator = StreamOrchestrator::new(device.clone(), recorder.clone(), sink.clone());
    let keep_alive = KeepAliveController::new(
        Box::new(LogHost),
        Indicator::persistent(config.keep_alive.title.clone(), config.keep_alive.text.clone()),
    );
    let service = ControlService::new(
        orchestrator,
        recorder.clone(),
        keep_alive,
        device,
        sink,
        ScanSettings {
            name_filter: config.scan_name_filter.clone(),
            duration: Duration::from_secs(config.scan_seconds),
        },
    );

    log::info!("Recording to {}", config.recordings_dir.display());
    rt.block_on(service.run(command_receiver, ack_sender));

    let dropped = recorder.dropped_lines();
    if dropped > 0 {
        log::warn!("{} lines were dropped because the writer fell behind", dropped);
    }

    // Dropping the service and runtime closes the event channel, ending the printer
    drop(service);
    drop(rt);
    if printer.join().is_err() {
        log::error!("Output thread panicked");
    }
}

/// Write events and acks to stdout, one JSON object per line
fn print_output(
    events: crossbeam_channel::Receiver<UiEvent>,
    acks: crossbeam_channel::Receiver<Ack>,
) {
    let stdout = io::stdout();
    let closed_events = crossbeam_channel::never();
    let closed_acks = crossbeam_channel::never();
    let mut events_open = true;
    let mut acks_open = true;

    while events_open || acks_open {
        let line = crossbeam_channel::select! {
            recv(if events_open { &events } else { &closed_events }) -> event => match event {
                Ok(event) => serde_json::to_string(&event.to_envelope()),
                Err(_) => {
                    events_open = false;
                    Ok(String::new())
                }
            },
            recv(if acks_open { &acks } else { &closed_acks }) -> ack => match ack {
                Ok(ack) => serde_json::to_string(&ack),
                Err(_) => {
                    acks_open = false;
                    Ok(String::new())
                }
            },
        };

        match line {
            Ok(line) if line.is_empty() => {}
            Ok(line) => {
                let mut out = stdout.lock();
                if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
                    log::debug!("stdout closed");
                    return;
                }
            }
            Err(e) => log::error!("Failed to encode output: {}", e),
        }
    }
}
