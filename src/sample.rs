//! # Sample Shapes and Decode Rules
//!
//! Each channel produces its own sample shape. This module owns the
//! per-channel rules for turning a sample into:
//! - a recording data line (fields only; the recorder prefixes the capture time)
//! - a human-readable line for the UI
//!
//! Field order in data lines follows the channel headers in `channel.rs`.

use crate::channel::{Channel, FIELD_SEPARATOR};
use chrono::{DateTime, Local};
use std::fmt::Write as _;

/// One decoded sample from a sensor channel
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    HeartRate {
        bpm: u16,
        rrs_ms: Vec<u32>,
        contact_status: bool,
        contact_supported: bool,
    },
    Ecg {
        sensor_timestamp: u64,
        microvolts: i32,
    },
    Accelerometer {
        sensor_timestamp: u64,
        x: i32,
        y: i32,
        z: i32,
    },
    Ppg {
        sensor_timestamp: u64,
        ch0: i32,
        ch1: i32,
        ch2: i32,
        ambient: i32,
    },
    PulseInterval {
        pp_interval_ms: u32,
        error_estimate_ms: u32,
        blocker: bool,
        contact_status: bool,
        contact_supported: bool,
        bpm: u16,
    },
    Gyroscope {
        sensor_timestamp: u64,
        x: f32,
        y: f32,
        z: f32,
    },
    Magnetometer {
        sensor_timestamp: u64,
        x: f32,
        y: f32,
        z: f32,
    },
}

/// A group of samples delivered together by one channel's producer
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub channel: Channel,
    pub samples: Vec<Sample>,
    /// Host time the batch was captured, if the producer stamped it
    pub captured_at: Option<DateTime<Local>>,
}

impl SampleBatch {
    pub fn new(channel: Channel, samples: Vec<Sample>) -> Self {
        Self {
            channel,
            samples,
            captured_at: None,
        }
    }

    pub fn captured_at(mut self, time: DateTime<Local>) -> Self {
        self.captured_at = Some(time);
        self
    }
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

impl Sample {
    /// Channel this sample shape belongs to
    pub fn channel(&self) -> Channel {
        match self {
            Sample::HeartRate { .. } => Channel::HeartRate,
            Sample::Ecg { .. } => Channel::Ecg,
            Sample::Accelerometer { .. } => Channel::Accelerometer,
            Sample::Ppg { .. } => Channel::Ppg,
            Sample::PulseInterval { .. } => Channel::PulseInterval,
            Sample::Gyroscope { .. } => Channel::Gyroscope,
            Sample::Magnetometer { .. } => Channel::Magnetometer,
        }
    }

    /// Recording fields after the capture timestamp, each followed by the separator
    pub fn data_fields(&self) -> String {
        let fields: Vec<String> = match self {
            Sample::HeartRate { bpm, .. } => vec![bpm.to_string()],
            Sample::Ecg {
                sensor_timestamp,
                microvolts,
            } => vec![sensor_timestamp.to_string(), microvolts.to_string()],
            Sample::Accelerometer {
                sensor_timestamp,
                x,
                y,
                z,
            } => vec![
                sensor_timestamp.to_string(),
                x.to_string(),
                y.to_string(),
                z.to_string(),
            ],
            Sample::Ppg {
                sensor_timestamp,
                ch0,
                ch1,
                ch2,
                ambient,
            } => vec![
                sensor_timestamp.to_string(),
                ch0.to_string(),
                ch1.to_string(),
                ch2.to_string(),
                ambient.to_string(),
            ],
            Sample::PulseInterval {
                pp_interval_ms,
                error_estimate_ms,
                blocker,
                contact_status,
                contact_supported,
                bpm,
            } => vec![
                pp_interval_ms.to_string(),
                error_estimate_ms.to_string(),
                flag(*blocker).to_string(),
                flag(*contact_status).to_string(),
                flag(*contact_supported).to_string(),
                bpm.to_string(),
            ],
            Sample::Gyroscope {
                sensor_timestamp,
                x,
                y,
                z,
            }
            | Sample::Magnetometer {
                sensor_timestamp,
                x,
                y,
                z,
            } => vec![
                sensor_timestamp.to_string(),
                x.to_string(),
                y.to_string(),
                z.to_string(),
            ],
        };

        let mut line = String::new();
        for field in fields {
            line.push_str(&field);
            line.push(FIELD_SEPARATOR);
        }
        line
    }

    /// Line shown by the front-end for this sample
    pub fn display_line(&self) -> String {
        let mut line = String::new();
        // Writing into a String cannot fail
        let _ = match self {
            Sample::HeartRate {
                bpm,
                rrs_ms,
                contact_status,
                contact_supported,
            } => write!(
                line,
                "HR     bpm: {} rrs: {:?} rrAvailable: {} contactStatus: {} contactStatusSupported: {}",
                bpm,
                rrs_ms,
                !rrs_ms.is_empty(),
                contact_status,
                contact_supported
            ),
            Sample::Ecg {
                sensor_timestamp,
                microvolts,
            } => write!(line, "ECG    yV: {} timeStamp: {}", microvolts, sensor_timestamp),
            Sample::Accelerometer {
                sensor_timestamp,
                x,
                y,
                z,
            } => write!(
                line,
                "ACC    x: {} y: {} z: {} timeStamp: {}",
                x, y, z, sensor_timestamp
            ),
            Sample::Ppg {
                sensor_timestamp,
                ch0,
                ch1,
                ch2,
                ambient,
            } => write!(
                line,
                "PPG    ppg0: {} ppg1: {} ppg2: {} ambient: {} timeStamp: {}",
                ch0, ch1, ch2, ambient, sensor_timestamp
            ),
            Sample::PulseInterval {
                pp_interval_ms,
                error_estimate_ms,
                blocker,
                ..
            } => write!(
                line,
                "PPI    ppi: {} blocker: {} errorEstimate: {}",
                pp_interval_ms,
                flag(*blocker),
                error_estimate_ms
            ),
            Sample::Gyroscope {
                sensor_timestamp,
                x,
                y,
                z,
            } => write!(
                line,
                "GYR    x: {} y: {} z: {} timeStamp: {}",
                x, y, z, sensor_timestamp
            ),
            Sample::Magnetometer {
                sensor_timestamp,
                x,
                y,
                z,
            } => write!(
                line,
                "MAG    x: {} y: {} z: {} timeStamp: {}",
                x, y, z, sensor_timestamp
            ),
        };
        line
    }
}
