//! # Channel Catalog
//!
//! The closed set of sensor channels a wearable can stream, and the static
//! per-channel facts everything else keys off: display name, recording file
//! name, header schema, UI event name and whether the channel needs stream
//! settings negotiated before it can be subscribed.
//!
//! ## Recording Format
//! Every line of a channel file is a `;`-separated record that also ends with
//! `;` before the newline. The header is always the first line.
//!
//! ```text
//! Session_14-03-59_2024-05-01/
//! ├── HeartRate.txt       Phone timestamp;HR [bpm];
//! ├── Accelerometer.txt   Phone timestamp;sensor timestamp [ns];X [mg];Y [mg];Z [mg];
//! └── ...
//! ```
//!
//! ## Names at the UI Boundary
//! Channel names arriving from the front-end are matched exactly, either the
//! canonical name or the short name the front-end historically sent. There is
//! no trimming or case folding: `"HR "` is rejected rather than silently ignored.

use crate::error::ChannelParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Field separator used in every recording line.
pub const FIELD_SEPARATOR: char = ';';

/// Line terminator used in every recording file.
pub const LINE_TERMINATOR: &str = "\n";

/// Extension of per-channel recording files.
pub const FILE_EXTENSION: &str = "txt";

/// One physical sensor modality streamed from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    HeartRate,
    Ecg,
    Accelerometer,
    Ppg,
    PulseInterval,
    Gyroscope,
    Magnetometer,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::HeartRate,
        Channel::Ecg,
        Channel::Accelerometer,
        Channel::Ppg,
        Channel::PulseInterval,
        Channel::Gyroscope,
        Channel::Magnetometer,
    ];

    /// Canonical name, also the stem of the recording file
    pub fn name(&self) -> &'static str {
        match self {
            Channel::HeartRate => "HeartRate",
            Channel::Ecg => "ECG",
            Channel::Accelerometer => "Accelerometer",
            Channel::Ppg => "PPG",
            Channel::PulseInterval => "PulseInterval",
            Channel::Gyroscope => "Gyroscope",
            Channel::Magnetometer => "Magnetometer",
        }
    }

    /// Short name the front-end used before canonical names existed
    pub fn legacy_name(&self) -> &'static str {
        match self {
            Channel::HeartRate => "HR",
            Channel::Ecg => "ECG",
            Channel::Accelerometer => "ACC",
            Channel::Ppg => "PPG",
            Channel::PulseInterval => "PPI",
            Channel::Gyroscope => "Gyro",
            Channel::Magnetometer => "Magnetometer",
        }
    }

    /// Name of this channel's file inside a session directory
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name(), FILE_EXTENSION)
    }

    /// Header line written once at file creation.
    ///
    /// ECG has no recording schema and is never written to disk.
    pub fn header(&self) -> Option<&'static str> {
        match self {
            Channel::HeartRate => Some("Phone timestamp;HR [bpm];"),
            Channel::Ecg => None,
            Channel::Accelerometer => {
                Some("Phone timestamp;sensor timestamp [ns];X [mg];Y [mg];Z [mg];")
            }
            Channel::Ppg => Some(
                "Phone timestamp;sensor timestamp [ns];channel 0;channel 1;channel 2;ambient;",
            ),
            Channel::PulseInterval => Some(
                "Phone timestamp;PP-interval [ms];error estimate [ms];blocker;contact;contact;hr [bpm];",
            ),
            Channel::Gyroscope => {
                Some("Phone timestamp;sensor timestamp [ns];X [dps];Y [dps];Z [dps];")
            }
            Channel::Magnetometer => {
                Some("Phone timestamp;sensor timestamp [ns];X [G];Y [G];Z [G];")
            }
        }
    }

    pub fn is_recordable(&self) -> bool {
        self.header().is_some()
    }

    /// Whether the device must be asked for its stream settings before subscribing
    pub fn requires_settings(&self) -> bool {
        !matches!(self, Channel::HeartRate | Channel::PulseInterval)
    }

    /// Name of the UI event carrying this channel's samples
    pub fn data_event(&self) -> String {
        format!("on{}DataReceived", self.name())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.name() == s || channel.legacy_name() == s)
            .ok_or_else(|| ChannelParseError::Unknown(s.to_string()))
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.name().to_string()
    }
}

/// Deduplicate a requested channel list, keeping first-seen order
pub fn unique(channels: &[Channel]) -> Vec<Channel> {
    let mut seen = Vec::with_capacity(channels.len());
    for channel in channels {
        if !seen.contains(channel) {
            seen.push(*channel);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_and_legacy_names() {
        for channel in Channel::ALL {
            assert_eq!(channel.name().parse::<Channel>().unwrap(), channel);
            assert_eq!(channel.legacy_name().parse::<Channel>().unwrap(), channel);
        }
    }

    #[test]
    fn test_parse_rejects_near_misses() {
        assert!("HR ".parse::<Channel>().is_err());
        assert!("hr".parse::<Channel>().is_err());
        assert!(" ACC".parse::<Channel>().is_err());
        assert!("Temperature".parse::<Channel>().is_err());
    }

    #[test]
    fn test_headers_use_trailing_separator() {
        for channel in Channel::ALL {
            if let Some(header) = channel.header() {
                assert!(header.starts_with("Phone timestamp;"));
                assert!(header.ends_with(FIELD_SEPARATOR));
            }
        }
    }

    #[test]
    fn test_ecg_is_not_recordable() {
        assert!(!Channel::Ecg.is_recordable());
        assert!(Channel::HeartRate.is_recordable());
    }

    #[test]
    fn test_file_and_event_names() {
        assert_eq!(Channel::HeartRate.file_name(), "HeartRate.txt");
        assert_eq!(Channel::Accelerometer.data_event(), "onAccelerometerDataReceived");
    }

    #[test]
    fn test_settings_negotiation_channels() {
        assert!(!Channel::HeartRate.requires_settings());
        assert!(!Channel::PulseInterval.requires_settings());
        assert!(Channel::Accelerometer.requires_settings());
        assert!(Channel::Magnetometer.requires_settings());
    }

    #[test]
    fn test_serde_validates_names() {
        let parsed: Vec<Channel> = serde_json::from_str(r#"["HR", "Gyroscope"]"#).unwrap();
        assert_eq!(parsed, vec![Channel::HeartRate, Channel::Gyroscope]);
        assert!(serde_json::from_str::<Vec<Channel>>(r#"["HR "]"#).is_err());
        assert_eq!(serde_json::to_string(&Channel::Ppg).unwrap(), "\"PPG\"");
    }

    #[test]
    fn test_unique_keeps_order() {
        let channels = unique(&[Channel::Ppg, Channel::HeartRate, Channel::Ppg]);
        assert_eq!(channels, vec![Channel::Ppg, Channel::HeartRate]);
    }
}
