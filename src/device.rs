//! # Device Capability
//!
//! The seam between stream orchestration and the wire-level link to the
//! wearable. A device capability can report the stream settings it offers
//! for a channel, open a cancellable sample stream for a channel, and switch
//! the device's operating mode.
//!
//! Streams are plain `tokio::sync::mpsc` receivers. The producer side stops
//! when the cancellation token passed to `subscribe` fires or the receiver is
//! dropped.

use crate::channel::Channel;
use crate::error::DeviceError;
use crate::sample::SampleBatch;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receiving end of one channel's sample flow
pub type SampleStream = mpsc::Receiver<SampleBatch>;

/// Buffer between a producer and its delivery task
pub const STREAM_BUFFER: usize = 256;

/// Configurable aspects of a measurement stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingKind {
    SampleRate,
}

/// Values a device offers for each setting of one channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvailableSettings {
    pub values: BTreeMap<SettingKind, Vec<u32>>,
}

impl AvailableSettings {
    pub fn with(mut self, kind: SettingKind, values: Vec<u32>) -> Self {
        self.values.insert(kind, values);
        self
    }

    /// Pick the highest offered value of every setting
    ///
    /// Settings offered with no values are left out rather than guessed.
    pub fn maximum(&self) -> StreamSettings {
        let chosen = self
            .values
            .iter()
            .filter_map(|(kind, values)| values.iter().max().map(|&max| (*kind, max)))
            .collect();
        StreamSettings { chosen }
    }
}

/// Concrete settings a stream is started with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSettings {
    pub chosen: BTreeMap<SettingKind, u32>,
}

impl StreamSettings {
    pub fn get(&self, kind: SettingKind) -> Option<u32> {
        self.chosen.get(&kind).copied()
    }
}

/// Wire-level capability of a connected wearable
#[async_trait]
pub trait DeviceCapability: Send + Sync {
    /// Stream settings the device offers for `channel`
    async fn available_settings(&self, channel: Channel) -> Result<AvailableSettings, DeviceError>;

    /// Start streaming `channel`. The stream ends once `cancel` fires.
    async fn subscribe(
        &self,
        channel: Channel,
        settings: Option<StreamSettings>,
        cancel: CancellationToken,
    ) -> Result<SampleStream, DeviceError>;

    /// Switch the device's SDK operating mode
    async fn set_device_mode(&self, enabled: bool) -> Result<(), DeviceError>;
}

/// Connection lifecycle of a wearable; progress is reported as UI events
#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn connect(&self, device_id: String);
    async fn disconnect(&self, device_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maximum_picks_highest_values() {
        let available =
            AvailableSettings::default().with(SettingKind::SampleRate, vec![50, 200, 25, 100]);

        let settings = available.maximum();
        assert_eq!(settings.get(SettingKind::SampleRate), Some(200));
        assert_eq!(settings.chosen.len(), 1);
    }

    #[test]
    fn test_maximum_skips_empty_settings() {
        let available = AvailableSettings::default().with(SettingKind::SampleRate, vec![]);
        assert!(available.maximum().chosen.is_empty());
    }
}
