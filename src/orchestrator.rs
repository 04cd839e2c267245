//! # Stream Orchestration
//!
//! Owns every live channel subscription and fans each channel's samples out
//! to the session recorder and the UI.
//!
//! ## Per-Channel Tasks
//! Each channel is opened on its own task (settings negotiation + subscribe),
//! so a slow channel never holds up the others. Once open, a channel is driven
//! by exactly one delivery task, which keeps that channel's samples in arrival
//! order all the way to the file and the UI.
//!
//! ## Cancellation
//! Every subscription holds a `CancellationToken`. Stopping or restarting a
//! channel cancels the token and then waits for the delivery task to finish,
//! so nothing is delivered for that subscription once the call returns.
//! A batch that is mid-delivery when cancellation arrives is completed;
//! batches still queued after that are discarded.
//!
//! ## Locking
//! The active set is only locked to take out or put in subscriptions, never
//! while a channel negotiates or a delivery task is awaited. Every stop bumps
//! the set's epoch; a channel that finishes opening under an older epoch is
//! cancelled instead of becoming Active.

use crate::channel::{self, Channel};
use crate::device::{DeviceCapability, SampleStream};
use crate::error::DeviceError;
use crate::events::{EventSink, UiEvent};
use crate::recorder::{SessionRecorder, SessionSummary};
use crate::sample::SampleBatch;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// A live channel subscription
struct Subscription {
    id: u64,
    cancel: CancellationToken,
    delivery: JoinHandle<()>,
}

impl Subscription {
    /// Cancel and wait until the delivery task has finished
    async fn cancel(self, channel: Channel) {
        self.cancel.cancel();
        if let Err(e) = self.delivery.await {
            if e.is_panic() {
                log::error!("{} delivery task panicked", channel);
            }
        }
    }
}

#[derive(Default)]
struct ActiveSet {
    subscriptions: HashMap<Channel, Subscription>,
    /// Bumped by every stop
    epoch: u64,
    next_id: u64,
}

/// Outcome of `start_channels`
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<Channel>,
    pub failed: Vec<(Channel, DeviceError)>,
}

pub struct StreamOrchestrator {
    device: Arc<dyn DeviceCapability>,
    recorder: Arc<SessionRecorder>,
    sink: Arc<dyn EventSink>,
    active: Arc<Mutex<ActiveSet>>,
}

impl StreamOrchestrator {
    pub fn new(
        device: Arc<dyn DeviceCapability>,
        recorder: Arc<SessionRecorder>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            device,
            recorder,
            sink,
            active: Arc::new(Mutex::new(ActiveSet::default())),
        }
    }

    /// Start streaming `channels`, replacing any existing subscription for them
    ///
    /// Returns once every requested channel is either Active or has failed.
    /// Failed channels are reported to the UI and not retried. Channels still
    /// opening when `stop_all_channels` runs are dropped without being started.
    pub async fn start_channels(&self, channels: &[Channel]) -> StartReport {
        let requested = channel::unique(channels);

        let (epoch, replaced) = {
            let mut active = self.active.lock().await;
            let replaced: Vec<(Channel, Subscription)> = requested
                .iter()
                .filter_map(|channel| {
                    active
                        .subscriptions
                        .remove(channel)
                        .map(|previous| (*channel, previous))
                })
                .collect();
            (active.epoch, replaced)
        };
        for (channel, previous) in replaced {
            log::info!("Restarting {} stream", channel);
            previous.cancel(channel).await;
        }

        let mut opening = JoinSet::new();
        for channel in requested {
            let device = self.device.clone();
            let cancel = CancellationToken::new();
            opening.spawn(async move {
                let result = open_stream(device.as_ref(), channel, cancel.clone()).await;
                (channel, cancel, result)
            });
        }

        let mut report = StartReport::default();
        while let Some(joined) = opening.join_next().await {
            let (channel, cancel, result) = match joined {
                Ok(opened) => opened,
                Err(e) => {
                    log::error!("Channel start task failed: {}", e);
                    continue;
                }
            };

            match result {
                Ok(samples) => {
                    if self.activate(channel, samples, cancel, epoch).await {
                        log::info!("{} stream active", channel);
                        report.started.push(channel);
                    }
                }
                Err(e) => {
                    log::error!("{}", e);
                    self.sink.emit(UiEvent::ChannelFailed {
                        channel,
                        reason: e.to_string(),
                    });
                    report.failed.push((channel, e));
                }
            }
        }

        report
    }

    /// Store an opened stream as Active and start delivering it
    ///
    /// Returns false if a stop ran since `epoch`; the stream is cancelled then.
    async fn activate(
        &self,
        channel: Channel,
        samples: SampleStream,
        cancel: CancellationToken,
        epoch: u64,
    ) -> bool {
        let displaced = {
            let mut active = self.active.lock().await;
            if active.epoch != epoch {
                log::info!("{} opened after streaming stopped, discarding", channel);
                cancel.cancel();
                return false;
            }

            active.next_id += 1;
            let id = active.next_id;
            let delivery = tokio::spawn(deliver(
                channel,
                id,
                samples,
                cancel.clone(),
                self.recorder.clone(),
                self.sink.clone(),
                self.active.clone(),
            ));
            active.subscriptions.insert(
                channel,
                Subscription {
                    id,
                    cancel,
                    delivery,
                },
            )
        };

        // A concurrent start for the same channel got here first
        if let Some(previous) = displaced {
            previous.cancel(channel).await;
        }
        true
    }

    /// Stop every channel, reset the UI and finalize the recording session
    ///
    /// Safe to call with nothing active.
    pub async fn stop_all_channels(&self) -> Option<SessionSummary> {
        let stopping: Vec<(Channel, Subscription)> = {
            let mut active = self.active.lock().await;
            active.epoch += 1;
            active.subscriptions.drain().collect()
        };
        for (channel, subscription) in stopping {
            subscription.cancel(channel).await;
            log::info!("{} stream stopped", channel);
        }

        self.sink.emit(UiEvent::ResetChannels);

        let recorder = self.recorder.clone();
        let finalized = match tokio::task::spawn_blocking(move || recorder.finalize_session()).await
        {
            Ok(finalized) => finalized,
            Err(e) => {
                log::error!("Failed to finalize recording session: {}", e);
                None
            }
        };

        if let Some(summary) = &finalized {
            self.sink.emit(UiEvent::SessionFinalized {
                id: summary.id.clone(),
                directory: summary.directory.clone(),
                files: summary.files.clone(),
            });
        }
        finalized
    }

    /// Ask the device to switch its operating mode
    ///
    /// Fire-and-forget: the outcome is only logged and, on failure, reported to
    /// the UI. The handle is returned for callers that want to wait anyway.
    pub fn toggle_device_mode(&self, enable: bool) -> JoinHandle<()> {
        let device = self.device.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match device.set_device_mode(enable).await {
                Ok(()) => {
                    log::info!("SDK mode {}", if enable { "enabled" } else { "disabled" });
                }
                Err(e) => {
                    log::error!("{}", e);
                    sink.emit(UiEvent::Error {
                        context: "toggleSDKMode".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        })
    }

    /// Channels with an Active subscription, sorted
    pub async fn active_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .active
            .lock()
            .await
            .subscriptions
            .keys()
            .copied()
            .collect();
        channels.sort();
        channels
    }
}

/// Negotiate settings if the channel needs them, then subscribe
async fn open_stream(
    device: &dyn DeviceCapability,
    channel: Channel,
    cancel: CancellationToken,
) -> Result<SampleStream, DeviceError> {
    let settings = if channel.requires_settings() {
        let available = device.available_settings(channel).await?;
        let settings = available.maximum();
        log::debug!("{} stream settings: {:?}", channel, settings.chosen);
        Some(settings)
    } else {
        None
    };

    device.subscribe(channel, settings, cancel).await
}

/// Delivery loop for one channel
///
/// When the producer ends the stream, the subscription removes itself from
/// the active set unless it has been replaced meanwhile.
async fn deliver(
    channel: Channel,
    id: u64,
    mut samples: SampleStream,
    cancel: CancellationToken,
    recorder: Arc<SessionRecorder>,
    sink: Arc<dyn EventSink>,
    active: Arc<Mutex<ActiveSet>>,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            batch = samples.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        dispatch(channel, batch, &recorder, sink.as_ref());
    }

    log::info!("{} stream complete", channel);
    let mut active = active.lock().await;
    if active
        .subscriptions
        .get(&channel)
        .is_some_and(|subscription| subscription.id == id)
    {
        active.subscriptions.remove(&channel);
    }
}

/// Decode one batch and hand each sample to the recorder and the UI
fn dispatch(channel: Channel, batch: SampleBatch, recorder: &SessionRecorder, sink: &dyn EventSink) {
    for sample in batch.samples {
        if sample.channel() != channel {
            log::warn!(
                "Dropping {} sample delivered on the {} stream",
                sample.channel(),
                channel
            );
            continue;
        }

        match batch.captured_at {
            Some(captured_at) => recorder.write_entry(channel, captured_at, &sample.data_fields()),
            None => recorder.write_data(channel, &sample.data_fields()),
        }
        sink.emit(UiEvent::ChannelData {
            channel,
            line: sample.display_line(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::FsStorage;
    use crate::sample::Sample;
    use crate::testing::{CollectingSink, ScriptedDevice};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn heart_rate(bpm: u16) -> Sample {
        Sample::HeartRate {
            bpm,
            rrs_ms: vec![],
            contact_status: true,
            contact_supported: true,
        }
    }

    fn accelerometer(sensor_timestamp: u64) -> Sample {
        Sample::Accelerometer {
            sensor_timestamp,
            x: 1,
            y: 2,
            z: 3,
        }
    }

    struct Fixture {
        device: Arc<ScriptedDevice>,
        recorder: Arc<SessionRecorder>,
        sink: Arc<CollectingSink>,
        orchestrator: StreamOrchestrator,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let device = Arc::new(ScriptedDevice::default());
        let recorder =
            Arc::new(SessionRecorder::new(Arc::new(FsStorage::new(dir.path())), 1024).unwrap());
        let sink = Arc::new(CollectingSink::default());
        let orchestrator = StreamOrchestrator::new(device.clone(), recorder.clone(), sink.clone());
        Fixture {
            device,
            recorder,
            sink,
            orchestrator,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_active_set_excludes_failed_channels() {
        let f = fixture();
        f.device.fail_negotiation(Channel::Ppg);
        f.device.fail_subscribe(Channel::Gyroscope);

        let report = f
            .orchestrator
            .start_channels(&[
                Channel::HeartRate,
                Channel::Ppg,
                Channel::Accelerometer,
                Channel::Gyroscope,
            ])
            .await;

        assert_eq!(
            f.orchestrator.active_channels().await,
            vec![Channel::HeartRate, Channel::Accelerometer]
        );
        assert_eq!(report.started.len(), 2);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(f.sink.failed_channels(), vec![Channel::Ppg, Channel::Gyroscope]);
    }

    #[tokio::test]
    async fn test_negotiated_settings_are_maximum() {
        let f = fixture();
        f.orchestrator
            .start_channels(&[Channel::Accelerometer, Channel::HeartRate])
            .await;

        let settings = f.device.settings_used(Channel::Accelerometer).unwrap();
        assert_eq!(settings.get(crate::device::SettingKind::SampleRate), Some(200));
        assert!(f.device.settings_used(Channel::HeartRate).is_none());
    }

    #[tokio::test]
    async fn test_restart_replaces_subscription() {
        let f = fixture();
        f.orchestrator.start_channels(&[Channel::HeartRate]).await;
        let first = f.device.producer(Channel::HeartRate).unwrap();

        f.orchestrator.start_channels(&[Channel::HeartRate]).await;
        let second = f.device.producer(Channel::HeartRate).unwrap();

        // Old subscription cancelled before the new one exists
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(f.device.subscribe_count(Channel::HeartRate), 2);
        assert_eq!(f.orchestrator.active_channels().await, vec![Channel::HeartRate]);

        // Batches pushed into the old stream are never delivered
        let _ = first.tx.send(SampleBatch::new(Channel::HeartRate, vec![heart_rate(99)])).await;
        second
            .tx
            .send(SampleBatch::new(Channel::HeartRate, vec![heart_rate(60)]))
            .await
            .unwrap();

        let lines = f.sink.wait_for_data(Channel::HeartRate, 1).await;
        assert!(lines[0].contains("bpm: 60"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.sink.data_lines(Channel::HeartRate).len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture();
        f.orchestrator
            .start_channels(&[Channel::HeartRate, Channel::Accelerometer])
            .await;

        assert!(f.orchestrator.stop_all_channels().await.is_none());
        assert!(f.orchestrator.stop_all_channels().await.is_none());

        assert!(f.orchestrator.active_channels().await.is_empty());
        assert!(f.device.producer(Channel::HeartRate).unwrap().cancel.is_cancelled());
        assert_eq!(f.sink.count(&UiEvent::ResetChannels), 2);
    }

    #[tokio::test]
    async fn test_nothing_delivered_after_stop_returns() {
        let f = fixture();
        f.orchestrator.start_channels(&[Channel::Accelerometer]).await;
        let producer = f.device.producer(Channel::Accelerometer).unwrap();

        for i in 0..10 {
            producer
                .tx
                .send(SampleBatch::new(Channel::Accelerometer, vec![accelerometer(i)]))
                .await
                .unwrap();
        }
        f.orchestrator.stop_all_channels().await;
        let delivered = f.sink.data_lines(Channel::Accelerometer).len();

        let _ = producer
            .tx
            .send(SampleBatch::new(Channel::Accelerometer, vec![accelerometer(10)]))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.sink.data_lines(Channel::Accelerometer).len(), delivered);
    }

    #[tokio::test]
    async fn test_heart_rate_recorded_end_to_end() {
        let f = fixture();
        f.recorder.start_session(&[Channel::HeartRate]).unwrap();
        f.orchestrator.start_channels(&[Channel::HeartRate]).await;
        let producer = f.device.producer(Channel::HeartRate).unwrap();

        for bpm in [72, 75, 74] {
            producer
                .tx
                .send(SampleBatch::new(Channel::HeartRate, vec![heart_rate(bpm)]))
                .await
                .unwrap();
        }
        f.sink.wait_for_data(Channel::HeartRate, 3).await;

        let summary = f.orchestrator.stop_all_channels().await.unwrap();
        let contents = fs::read_to_string(&summary.files[0]).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Phone timestamp;HR [bpm];");
        assert!(lines[1].ends_with(";72;"));
        assert!(lines[2].ends_with(";75;"));
        assert!(lines[3].ends_with(";74;"));
        assert!(f.sink.events().iter().any(|e| matches!(e, UiEvent::SessionFinalized { .. })));
    }

    #[tokio::test]
    async fn test_slow_negotiation_does_not_block_other_channels() {
        let f = fixture();
        let release = f.device.hold_negotiation(Channel::Ppg);

        let orchestrator = Arc::new(f.orchestrator);
        let starting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .start_channels(&[Channel::Ppg, Channel::HeartRate])
                    .await
            })
        };

        // HeartRate subscribes while PPG is still negotiating
        f.device.wait_for_subscribe(Channel::HeartRate).await;
        assert_eq!(f.device.subscribe_count(Channel::Ppg), 0);

        release.notify_one();
        let report = starting.await.unwrap();
        assert_eq!(report.started.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_negotiation_does_not_block_other_calls() {
        let f = fixture();
        let release = f.device.hold_negotiation(Channel::Ppg);

        let orchestrator = Arc::new(f.orchestrator);
        let starting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.start_channels(&[Channel::Ppg]).await })
        };
        f.device.wait_for_negotiation(Channel::Ppg).await;

        let report = tokio::time::timeout(
            Duration::from_millis(500),
            orchestrator.start_channels(&[Channel::HeartRate]),
        )
        .await
        .expect("start blocked by another channel's negotiation");
        assert_eq!(report.started, vec![Channel::HeartRate]);

        tokio::time::timeout(Duration::from_millis(500), orchestrator.stop_all_channels())
            .await
            .expect("stop blocked by another channel's negotiation");

        // PPG finishes opening after the stop and must not come back
        release.notify_one();
        let report = starting.await.unwrap();
        assert!(report.started.is_empty());
        assert!(orchestrator.active_channels().await.is_empty());
        assert!(f
            .device
            .producer(Channel::Ppg)
            .unwrap()
            .cancel
            .is_cancelled());
    }

    #[tokio::test]
    async fn test_ended_stream_leaves_active_set() {
        let f = fixture();
        f.orchestrator
            .start_channels(&[Channel::HeartRate, Channel::Accelerometer])
            .await;

        f.device.end_stream(Channel::HeartRate);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.orchestrator.active_channels().await.contains(&Channel::HeartRate) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("ended stream still listed as active");
        assert_eq!(
            f.orchestrator.active_channels().await,
            vec![Channel::Accelerometer]
        );
    }

    #[tokio::test]
    async fn test_ended_stream_does_not_remove_its_replacement() {
        let f = fixture();
        f.orchestrator.start_channels(&[Channel::HeartRate]).await;
        let first = f.device.producer(Channel::HeartRate).unwrap();

        f.orchestrator.start_channels(&[Channel::HeartRate]).await;
        // The replaced stream ends late, after its successor is Active
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            f.orchestrator.active_channels().await,
            vec![Channel::HeartRate]
        );
    }

    #[tokio::test]
    async fn test_mismatched_samples_are_dropped() {
        let f = fixture();
        f.orchestrator.start_channels(&[Channel::HeartRate]).await;
        let producer = f.device.producer(Channel::HeartRate).unwrap();

        producer
            .tx
            .send(SampleBatch::new(
                Channel::HeartRate,
                vec![accelerometer(1), heart_rate(70)],
            ))
            .await
            .unwrap();

        let lines = f.sink.wait_for_data(Channel::HeartRate, 1).await;
        assert!(lines[0].contains("bpm: 70"));
        assert!(f.sink.data_lines(Channel::Accelerometer).is_empty());
    }

    #[tokio::test]
    async fn test_device_mode_failure_reported_not_raised() {
        let f = fixture();
        f.device.fail_device_mode();

        f.orchestrator.toggle_device_mode(true).await.unwrap();
        assert!(f
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, UiEvent::Error { context, .. } if context == "toggleSDKMode")));

        f.device.allow_device_mode();
        f.orchestrator.toggle_device_mode(false).await.unwrap();
        assert_eq!(f.device.device_mode(), Some(false));
    }
}
