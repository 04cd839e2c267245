//! # Control Service
//!
//! Front-end command surface. Commands arrive as JSON lines of the form
//! `{"method": ..., "args": ...}` and are carried out one at a time, in the
//! order received. Every command is answered with an `Ack`; everything else
//! the front-end learns arrives as `UiEvent`s.
//!
//! ## Commands
//! - `startScan`: discover nearby devices
//! - `connectToDevice` / `disconnectFromDevice`: device link lifecycle
//! - `toggleRecord`: start a new recording session
//! - `toggleSDKMode`: switch the device's operating mode
//! - `startListeningToChannels` / `stopListeningToChannels`: streaming lifecycle
//! - `shareSession`: export the live session without closing it

use crate::channel::Channel;
use crate::device::DeviceLink;
use crate::device_scanner;
use crate::error::{CommandError, RecordError};
use crate::events::{EventSink, UiEvent};
use crate::keep_alive::KeepAliveController;
use crate::orchestrator::StreamOrchestrator;
use crate::recorder::{SessionRecorder, SessionSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum Command {
    StartScan,
    #[serde(rename_all = "camelCase")]
    ConnectToDevice {
        device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    DisconnectFromDevice {
        device_id: String,
    },
    ToggleRecord {
        enable: bool,
        #[serde(default)]
        channels: Vec<Channel>,
    },
    #[serde(rename = "toggleSDKMode")]
    ToggleSdkMode {
        enable: bool,
    },
    StartListeningToChannels {
        channels: Vec<Channel>,
    },
    StopListeningToChannels,
    ShareSession,
}

impl Command {
    /// Parse one command line
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        serde_json::from_str(line).map_err(|e| CommandError::Malformed(e.to_string()))
    }

    pub fn method(&self) -> &'static str {
        match self {
            Command::StartScan => "startScan",
            Command::ConnectToDevice { .. } => "connectToDevice",
            Command::DisconnectFromDevice { .. } => "disconnectFromDevice",
            Command::ToggleRecord { .. } => "toggleRecord",
            Command::ToggleSdkMode { .. } => "toggleSDKMode",
            Command::StartListeningToChannels { .. } => "startListeningToChannels",
            Command::StopListeningToChannels => "stopListeningToChannels",
            Command::ShareSession => "shareSession",
        }
    }
}

/// Reply to a single command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub ack: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn new(method: impl Into<String>, result: &Result<(), CommandError>) -> Self {
        Self {
            ack: method.into(),
            ok: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        }
    }

    /// Ack for a line that did not parse, naming its method when it has one
    fn rejected(line: &str, error: CommandError) -> Self {
        let method = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|value| value.get("method")?.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(method, &Err(error))
    }
}

/// Where and for how long `startScan` looks for devices
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub name_filter: String,
    pub duration: Duration,
}

pub struct ControlService {
    orchestrator: StreamOrchestrator,
    recorder: Arc<SessionRecorder>,
    keep_alive: KeepAliveController,
    link: Arc<dyn DeviceLink>,
    sink: Arc<dyn EventSink>,
    scan: ScanSettings,
}

impl ControlService {
    pub fn new(
        orchestrator: StreamOrchestrator,
        recorder: Arc<SessionRecorder>,
        keep_alive: KeepAliveController,
        link: Arc<dyn DeviceLink>,
        sink: Arc<dyn EventSink>,
        scan: ScanSettings,
    ) -> Self {
        Self {
            orchestrator,
            recorder,
            keep_alive,
            link,
            sink,
            scan,
        }
    }

    /// Process command lines until the channel closes, then stop streaming
    pub async fn run(
        &self,
        mut lines: mpsc::Receiver<String>,
        acks: crossbeam_channel::Sender<Ack>,
    ) {
        while let Some(line) = lines.recv().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let ack = match Command::parse(line) {
                Ok(command) => {
                    let method = command.method();
                    log::debug!("Command: {:?}", command);
                    let result = self.handle(command).await;
                    if let Err(e) = &result {
                        log::error!("{} failed: {}", method, e);
                    }
                    Ack::new(method, &result)
                }
                Err(e) => {
                    log::warn!("{}", e);
                    Ack::rejected(line, e)
                }
            };

            if acks.send(ack).is_err() {
                log::debug!("Ack dropped, front-end gone");
            }
        }

        log::info!("Command channel closed, shutting down");
        self.shutdown().await;
    }

    pub async fn handle(&self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::StartScan => {
                let devices =
                    device_scanner::scan_devices(&self.scan.name_filter, self.scan.duration)
                        .await?;
                for device in devices {
                    self.sink.emit(UiEvent::DeviceFound {
                        device_id: device.id,
                        name: device.name,
                    });
                }
            }
            Command::ConnectToDevice { device_id } => self.link.connect(device_id).await,
            Command::DisconnectFromDevice { device_id } => self.link.disconnect(&device_id).await,
            Command::ToggleRecord { enable, channels } => self.toggle_record(enable, channels).await?,
            Command::ToggleSdkMode { enable } => {
                // Outcome is reported through `onError`, not the ack
                drop(self.orchestrator.toggle_device_mode(enable));
            }
            Command::StartListeningToChannels { channels } => {
                let report = self.orchestrator.start_channels(&channels).await;
                log::info!(
                    "Listening to {} channels ({} failed)",
                    report.started.len(),
                    report.failed.len()
                );
                if report.started.is_empty() {
                    // Nothing streams, so there is nothing to keep alive
                    if let Some((_, e)) = report.failed.into_iter().next() {
                        return Err(e.into());
                    }
                    return Ok(());
                }
                self.keep_alive.start()?;
            }
            Command::StopListeningToChannels => {
                self.orchestrator.stop_all_channels().await;
                self.keep_alive.stop();
            }
            Command::ShareSession => {
                let summary = self
                    .blocking(|recorder| recorder.share_session())
                    .await
                    .ok_or(RecordError::NoSession)?;
                self.sink.emit(UiEvent::SessionShared {
                    id: summary.id,
                    directory: summary.directory,
                    files: summary.files,
                });
            }
        }
        Ok(())
    }

    /// Start a fresh session for `channels`
    ///
    /// A live session is finalized first. Disabling is a no-op: the session
    /// ends when listening stops.
    async fn toggle_record(&self, enable: bool, channels: Vec<Channel>) -> Result<(), RecordError> {
        if !enable {
            log::debug!("Recording stays active until listening stops");
            return Ok(());
        }

        if let Some(previous) = self.blocking(|recorder| recorder.finalize_session()).await {
            self.sink.emit(UiEvent::SessionFinalized {
                id: previous.id,
                directory: previous.directory,
                files: previous.files,
            });
        }

        let summary = self
            .blocking(move |recorder| recorder.start_session(&channels))
            .await?;
        self.sink.emit(UiEvent::SessionStarted {
            id: summary.id,
            directory: summary.directory,
        });
        Ok(())
    }

    /// Run a recorder call off the async workers; it may wait on file I/O
    async fn blocking<T, F>(&self, call: F) -> T
    where
        F: FnOnce(&SessionRecorder) -> T + Send + 'static,
        T: Send + 'static,
    {
        let recorder = self.recorder.clone();
        match tokio::task::spawn_blocking(move || call(&recorder)).await {
            Ok(value) => value,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    async fn shutdown(&self) -> Option<SessionSummary> {
        let finalized = self.orchestrator.stop_all_channels().await;
        self.keep_alive.stop();
        finalized
    }
}
