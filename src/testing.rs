//! Test doubles: a scripted in-memory device and a sink that keeps every event.

use crate::channel::Channel;
use crate::device::{
    AvailableSettings, DeviceCapability, DeviceLink, SampleStream, SettingKind, StreamSettings,
    STREAM_BUFFER,
};
use crate::error::DeviceError;
use crate::events::{EventSink, UiEvent};
use crate::sample::SampleBatch;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Poll `check` until it returns `Some`, panicking after `WAIT_LIMIT`
async fn eventually<T, F>(mut check: F) -> T
where
    F: FnMut() -> Option<T>,
{
    let polling = async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    within_limit(polling).await
}

async fn within_limit<T>(future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT_LIMIT, future).await {
        Ok(value) => value,
        Err(_) => panic!("condition not met within {:?}", WAIT_LIMIT),
    }
}

/// Producer side of a subscription handed out by `ScriptedDevice`
#[derive(Clone)]
pub struct Producer {
    pub tx: mpsc::Sender<SampleBatch>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct Script {
    failing_negotiation: HashSet<Channel>,
    failing_subscribe: HashSet<Channel>,
    held_negotiation: HashMap<Channel, Arc<Notify>>,
    producers: HashMap<Channel, Producer>,
    subscribe_counts: HashMap<Channel, usize>,
    negotiation_counts: HashMap<Channel, usize>,
    settings_used: HashMap<Channel, StreamSettings>,
    device_mode_fails: bool,
    device_mode: Option<bool>,
    linked: Option<String>,
}

/// Device whose behaviour is set up by each test
#[derive(Default)]
pub struct ScriptedDevice {
    script: Mutex<Script>,
}

impl ScriptedDevice {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn fail_negotiation(&self, channel: Channel) {
        self.script().failing_negotiation.insert(channel);
    }

    pub fn fail_subscribe(&self, channel: Channel) {
        self.script().failing_subscribe.insert(channel);
    }

    /// Block `channel`'s negotiation until the returned notify fires
    pub fn hold_negotiation(&self, channel: Channel) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        self.script()
            .held_negotiation
            .insert(channel, release.clone());
        release
    }

    pub fn fail_device_mode(&self) {
        self.script().device_mode_fails = true;
    }

    pub fn allow_device_mode(&self) {
        self.script().device_mode_fails = false;
    }

    pub fn device_mode(&self) -> Option<bool> {
        self.script().device_mode
    }

    /// Latest subscription handed out for `channel`
    pub fn producer(&self, channel: Channel) -> Option<Producer> {
        self.script().producers.get(&channel).cloned()
    }

    pub fn subscribe_count(&self, channel: Channel) -> usize {
        self.script()
            .subscribe_counts
            .get(&channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn settings_used(&self, channel: Channel) -> Option<StreamSettings> {
        self.script().settings_used.get(&channel).cloned()
    }

    /// Device id of the current link, if any
    pub fn linked(&self) -> Option<String> {
        self.script().linked.clone()
    }

    /// Drop the producer side of `channel`'s stream, ending it
    pub fn end_stream(&self, channel: Channel) {
        self.script().producers.remove(&channel);
    }

    pub async fn wait_for_negotiation(&self, channel: Channel) {
        eventually(|| {
            let count = self
                .script()
                .negotiation_counts
                .get(&channel)
                .copied()
                .unwrap_or(0);
            (count > 0).then_some(())
        })
        .await
    }

    pub async fn wait_for_subscribe(&self, channel: Channel) {
        eventually(|| (self.subscribe_count(channel) > 0).then_some(())).await
    }
}

#[async_trait]
impl DeviceCapability for ScriptedDevice {
    async fn available_settings(&self, channel: Channel) -> Result<AvailableSettings, DeviceError> {
        let held = {
            let mut script = self.script();
            *script.negotiation_counts.entry(channel).or_insert(0) += 1;
            script.held_negotiation.get(&channel).cloned()
        };
        if let Some(release) = held {
            within_limit(release.notified()).await;
        }

        if self.script().failing_negotiation.contains(&channel) {
            return Err(DeviceError::Negotiation {
                channel,
                reason: "settings request timed out".to_string(),
            });
        }

        Ok(AvailableSettings::default().with(SettingKind::SampleRate, vec![25, 50, 100, 200]))
    }

    async fn subscribe(
        &self,
        channel: Channel,
        settings: Option<StreamSettings>,
        cancel: CancellationToken,
    ) -> Result<SampleStream, DeviceError> {
        let mut script = self.script();
        if script.failing_subscribe.contains(&channel) {
            return Err(DeviceError::Subscribe {
                channel,
                reason: "stream rejected".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        script.producers.insert(channel, Producer { tx, cancel });
        *script.subscribe_counts.entry(channel).or_insert(0) += 1;
        if let Some(settings) = settings {
            script.settings_used.insert(channel, settings);
        }
        Ok(rx)
    }

    async fn set_device_mode(&self, enabled: bool) -> Result<(), DeviceError> {
        let mut script = self.script();
        if script.device_mode_fails {
            return Err(DeviceError::ModeChange("device busy".to_string()));
        }
        script.device_mode = Some(enabled);
        Ok(())
    }
}

#[async_trait]
impl DeviceLink for ScriptedDevice {
    async fn connect(&self, device_id: String) {
        self.script().linked = Some(device_id);
    }

    async fn disconnect(&self, device_id: &str) {
        let mut script = self.script();
        if script.linked.as_deref() == Some(device_id) {
            script.linked = None;
        }
    }
}

/// Sink that records every event in order
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<UiEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &UiEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn data_lines(&self, channel: Channel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::ChannelData { channel: c, line } if c == channel => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn failed_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .events()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::ChannelFailed { channel, .. } => Some(channel),
                _ => None,
            })
            .collect();
        channels.sort();
        channels
    }

    /// Wait until at least `n` data lines arrived for `channel`
    pub async fn wait_for_data(&self, channel: Channel, n: usize) -> Vec<String> {
        eventually(|| {
            let lines = self.data_lines(channel);
            (lines.len() >= n).then_some(lines)
        })
        .await
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: UiEvent) {
        self.events.lock().unwrap().push(event);
    }
}
