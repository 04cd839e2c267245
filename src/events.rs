//! # UI Events
//!
//! Everything the front-end is told about: discovered devices, connection
//! status, per-channel samples and session lifecycle. Events are pushed into
//! an `EventSink`, which must be callable concurrently from every channel's
//! delivery task.
//!
//! On the wire an event is a method call `{"method": ..., "args": ...}`, the
//! same shape the front-end uses for commands.

use crate::channel::Channel;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

impl ConnectionStatus {
    fn label(&self) -> String {
        match self {
            ConnectionStatus::Connecting => "Connecting".to_string(),
            ConnectionStatus::Connected => "Connected".to_string(),
            ConnectionStatus::Disconnected => "Disconnected".to_string(),
            ConnectionStatus::Error(reason) => format!("Error: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    DeviceFound {
        device_id: String,
        name: String,
    },
    ConnectionStatus {
        status: ConnectionStatus,
        device_id: String,
    },
    ChannelData {
        channel: Channel,
        line: String,
    },
    ResetChannels,
    ChannelFailed {
        channel: Channel,
        reason: String,
    },
    SessionStarted {
        id: String,
        directory: PathBuf,
    },
    SessionFinalized {
        id: String,
        directory: PathBuf,
        files: Vec<PathBuf>,
    },
    /// Live session exported without closing it
    SessionShared {
        id: String,
        directory: PathBuf,
        files: Vec<PathBuf>,
    },
    Error {
        context: String,
        message: String,
    },
}

/// Wire form of an event
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub method: String,
    pub args: Value,
}

impl UiEvent {
    pub fn method(&self) -> String {
        match self {
            UiEvent::DeviceFound { .. } => "onDeviceFound".to_string(),
            UiEvent::ConnectionStatus { .. } => "updateConnectionStatus".to_string(),
            UiEvent::ChannelData { channel, .. } => channel.data_event(),
            UiEvent::ResetChannels => "resetChannels".to_string(),
            UiEvent::ChannelFailed { .. } => "onChannelFailed".to_string(),
            UiEvent::SessionStarted { .. } => "onSessionStarted".to_string(),
            UiEvent::SessionFinalized { .. } => "onSessionFinalized".to_string(),
            UiEvent::SessionShared { .. } => "onSessionShared".to_string(),
            UiEvent::Error { .. } => "onError".to_string(),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let args = match self {
            UiEvent::DeviceFound { device_id, name } => {
                json!({ "deviceId": device_id, "name": name })
            }
            UiEvent::ConnectionStatus { status, device_id } => {
                json!({ "status": status.label(), "deviceId": device_id })
            }
            UiEvent::ChannelData { line, .. } => Value::String(line.clone()),
            UiEvent::ResetChannels => Value::Null,
            UiEvent::ChannelFailed { channel, reason } => {
                json!({ "channel": channel, "reason": reason })
            }
            UiEvent::SessionStarted { id, directory } => {
                json!({ "id": id, "directory": directory })
            }
            UiEvent::SessionFinalized {
                id,
                directory,
                files,
            }
            | UiEvent::SessionShared {
                id,
                directory,
                files,
            } => json!({ "id": id, "directory": directory, "files": files }),
            UiEvent::Error { context, message } => {
                json!({ "context": context, "message": message })
            }
        };

        Envelope {
            method: self.method(),
            args,
        }
    }
}

/// Receiver of UI events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: UiEvent);
}

impl EventSink for crossbeam_channel::Sender<UiEvent> {
    fn emit(&self, event: UiEvent) {
        if let Err(why) = self.send(event) {
            log::debug!("UI event dropped, front-end gone: {:?}", why.0.method());
        }
    }
}
