//! # Error Types Module
//!
//! Centralized error handling for ura-stream.
//! Each subsystem has its own error type so callers can match on the failure
//! and degrade only the feature that failed.
//!
//! ## Error Types
//! - `DeviceError`: settings negotiation, subscription and device-mode failures
//! - `RecordError`: session directory/file creation and write failures
//! - `ConfigError`: configuration file I/O and parsing errors
//! - `ScanError`: Bluetooth device scanning errors
//! - `KeepAliveError`: the host refused to keep the process alive
//! - `ChannelParseError`: unknown channel name at the UI boundary
//! - `CommandError`: a front-end command could not be carried out
//!
//! None of these are fatal to the process: a failing channel stays inactive,
//! a failing session stays disabled.

use crate::channel::Channel;
use std::fmt;
use std::path::PathBuf;

/// Errors reported by a device capability
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No device is connected
    NotConnected,
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// Failed to connect to a specific device
    Connection { device_id: String, reason: String },
    /// The connected device cannot stream this channel
    Unsupported(Channel),
    /// Stream settings could not be negotiated
    Negotiation { channel: Channel, reason: String },
    /// The stream could not be started
    Subscribe { channel: Channel, reason: String },
    /// The device rejected the operating mode change
    ModeChange(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotConnected => write!(f, "No device connected"),
            DeviceError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            DeviceError::Connection { device_id, reason } => {
                write!(f, "Failed to connect to device {}: {}", device_id, reason)
            }
            DeviceError::Unsupported(channel) => {
                write!(f, "Device does not support the {} channel", channel)
            }
            DeviceError::Negotiation { channel, reason } => {
                write!(f, "Failed to negotiate {} stream settings: {}", channel, reason)
            }
            DeviceError::Subscribe { channel, reason } => {
                write!(f, "Failed to start {} stream: {}", channel, reason)
            }
            DeviceError::ModeChange(reason) => {
                write!(f, "Failed to change device mode: {}", reason)
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Errors that can occur while managing a recording session
#[derive(Debug)]
pub enum RecordError {
    /// Base location is missing or not a directory
    StorageUnavailable(PathBuf),
    /// A session is already live
    SessionActive,
    /// No session is live
    NoSession,
    /// Failed to create the session directory
    CreateDir { name: String, source: std::io::Error },
    /// Failed to create or initialise a channel file
    CreateFile { channel: Channel, source: std::io::Error },
    /// Failed to append to a channel file
    Write { channel: Channel, source: std::io::Error },
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::StorageUnavailable(path) => {
                write!(f, "Recording location is not accessible: {}", path.display())
            }
            RecordError::SessionActive => write!(f, "A recording session is already active"),
            RecordError::NoSession => write!(f, "No recording session is active"),
            RecordError::CreateDir { name, source } => {
                write!(f, "Failed to create session directory {}: {}", name, source)
            }
            RecordError::CreateFile { channel, source } => {
                write!(f, "Failed to create {} file: {}", channel, source)
            }
            RecordError::Write { channel, source } => {
                write!(f, "Failed to write {} data: {}", channel, source)
            }
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::CreateDir { source, .. }
            | RecordError::CreateFile { source, .. }
            | RecordError::Write { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}

/// Errors that can occur during device scanning
#[derive(Debug, Clone)]
pub enum ScanError {
    /// Bluetooth manager initialization failed
    ManagerInit(String),
    /// No Bluetooth adapters available
    NoAdapters,
    /// Scan operation failed
    ScanFailed(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::ManagerInit(msg) => {
                write!(f, "Failed to initialize Bluetooth manager: {}", msg)
            }
            ScanError::NoAdapters => {
                write!(f, "No Bluetooth adapters found")
            }
            ScanError::ScanFailed(msg) => {
                write!(f, "Scan operation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// The host refused to grant background execution
#[derive(Debug, Clone)]
pub struct KeepAliveError(pub String);

impl fmt::Display for KeepAliveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to keep streaming alive in background: {}", self.0)
    }
}

impl std::error::Error for KeepAliveError {}

/// Unknown channel name received from the front-end
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelParseError {
    Unknown(String),
}

impl fmt::Display for ChannelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelParseError::Unknown(name) => write!(f, "Unknown channel name {:?}", name),
        }
    }
}

impl std::error::Error for ChannelParseError {}

/// Errors returned to the front-end when acknowledging a command
#[derive(Debug)]
pub enum CommandError {
    /// The command line was not a valid command
    Malformed(String),
    Record(RecordError),
    KeepAlive(KeepAliveError),
    Scan(ScanError),
    Device(DeviceError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Malformed(msg) => write!(f, "Malformed command: {}", msg),
            CommandError::Record(e) => write!(f, "{}", e),
            CommandError::KeepAlive(e) => write!(f, "{}", e),
            CommandError::Scan(e) => write!(f, "{}", e),
            CommandError::Device(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Malformed(_) => None,
            CommandError::Record(e) => Some(e),
            CommandError::KeepAlive(e) => Some(e),
            CommandError::Scan(e) => Some(e),
            CommandError::Device(e) => Some(e),
        }
    }
}

impl From<RecordError> for CommandError {
    fn from(e: RecordError) -> Self {
        CommandError::Record(e)
    }
}

impl From<KeepAliveError> for CommandError {
    fn from(e: KeepAliveError) -> Self {
        CommandError::KeepAlive(e)
    }
}

impl From<ScanError> for CommandError {
    fn from(e: ScanError) -> Self {
        CommandError::Scan(e)
    }
}

impl From<DeviceError> for CommandError {
    fn from(e: DeviceError) -> Self {
        CommandError::Device(e)
    }
}
