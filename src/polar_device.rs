//! # Polar H10 Device Capability
//!
//! Implements `DeviceCapability` for the Polar H10 chest strap through the
//! Arctic library. The H10 streams heart rate over the standard HR
//! notification and ECG/accelerometer over Polar's measurement data (PMD)
//! service; other channels are reported as unsupported.
//!
//! ## Connection Lifecycle
//! `connect` spawns a link task that connects, subscribes to both
//! notification streams, sets ECG and ACC to their maximum sample rates and
//! then runs Arctic's event loop until `disconnect` fires its stop token.
//! Status changes are reported as `updateConnectionStatus` events.
//!
//! ## Timestamps
//! PMD batches arrive without per-sample timestamps. Samples are spread evenly
//! at the configured sample rate, continuing from the previous batch so the
//! sensor timeline has no gaps or overlaps.

use crate::channel::Channel;
use crate::device::{
    AvailableSettings, DeviceCapability, DeviceLink, SampleStream, SettingKind, StreamSettings,
    STREAM_BUFFER,
};
use crate::error::DeviceError;
use crate::events::{ConnectionStatus, EventSink, UiEvent};
use crate::sample::{Sample, SampleBatch};
use arctic::{PmdData, PolarSensor};
use async_trait::async_trait;
use chrono::Local;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Rates used until the device reports what it supports
const DEFAULT_ECG_RATE_HZ: u64 = 130;
const DEFAULT_ACC_RATE_HZ: u64 = 200;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

const SUPPORTED: [Channel; 3] = [Channel::HeartRate, Channel::Ecg, Channel::Accelerometer];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Evenly spaced sensor timestamps for one PMD channel
#[derive(Debug, Clone)]
struct Timeline {
    rate_hz: u64,
    last: Option<u64>,
}

impl Timeline {
    fn new(rate_hz: u64) -> Self {
        Self {
            rate_hz: rate_hz.max(1),
            last: None,
        }
    }

    /// Calculate the starting timestamp for a batch
    ///
    /// Continues one interval after the last known point. The first batch is
    /// spread backwards from `now` so no timestamp lies in the future.
    fn calculate_start_time(
        last_point_time: Option<u64>,
        now: u64,
        sample_count: u64,
        timestep_ns: u64,
    ) -> u64 {
        if let Some(last_time) = last_point_time {
            last_time + timestep_ns
        } else if sample_count > 0 {
            now.saturating_sub((sample_count - 1) * timestep_ns)
        } else {
            now
        }
    }

    fn stamps(&mut self, now: u64, sample_count: u64) -> Vec<u64> {
        let timestep = NANOS_PER_SECOND / self.rate_hz;
        let start = Self::calculate_start_time(self.last, now, sample_count, timestep);
        let stamps: Vec<u64> = (0..sample_count).map(|i| start + i * timestep).collect();
        if let Some(&last) = stamps.last() {
            self.last = Some(last);
        }
        stamps
    }
}

struct Route {
    tx: mpsc::Sender<SampleBatch>,
    cancel: CancellationToken,
}

/// State shared between the capability, its link task and Arctic's handler
#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<Channel, Route>>,
    timelines: Mutex<HashMap<Channel, Timeline>>,
    /// Settings offered per PMD channel; `None` while disconnected
    offered: Mutex<Option<HashMap<Channel, AvailableSettings>>>,
}

impl Shared {
    /// Forward a batch to the channel's subscriber, if any
    async fn forward(&self, batch: SampleBatch) {
        let channel = batch.channel;
        let tx = {
            let mut routes = lock(&self.routes);
            let Some(route) = routes.get(&channel) else {
                return;
            };
            if route.cancel.is_cancelled() {
                routes.remove(&channel);
                return;
            }
            route.tx.clone()
        };

        if tx.send(batch).await.is_err() {
            log::debug!("{} subscriber gone", channel);
        }
    }

    fn reset(&self) {
        lock(&self.routes).clear();
        *lock(&self.offered) = None;
    }
}

/// Sends sensor data to the subscribed channels
#[derive(Clone)]
struct Handler {
    shared: Arc<Shared>,
}

#[arctic::async_trait]
impl arctic::EventHandler for Handler {
    async fn heart_rate_update(&self, _ctx: &arctic::PolarSensor, heartrate: arctic::HeartRate) {
        log::debug!("Heart rate: {:?}", heartrate);
        let rrs_ms = heartrate
            .rr()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|rr| rr as u32)
            .collect();

        let sample = Sample::HeartRate {
            bpm: u16::from(*heartrate.bpm()),
            rrs_ms,
            // Arctic does not expose the sensor contact bits
            contact_status: false,
            contact_supported: false,
        };
        self.shared
            .forward(SampleBatch::new(Channel::HeartRate, vec![sample]).captured_at(Local::now()))
            .await;
    }

    async fn measurement_update(&self, _ctx: &arctic::PolarSensor, data: arctic::PmdRead) {
        let captured_at = Local::now();
        let now = now_nanos();

        let mut ecg = Vec::new();
        let mut acc = Vec::new();
        for d in data.data().iter() {
            match d {
                PmdData::Ecg(sample) => ecg.push(*sample.val()),
                PmdData::Acc(sample) => {
                    let xyz = sample.data();
                    acc.push((xyz.0, xyz.1, xyz.2));
                }
            }
        }

        let (ecg_stamps, acc_stamps) = {
            let mut timelines = lock(&self.shared.timelines);
            let ecg_stamps = timelines
                .entry(Channel::Ecg)
                .or_insert_with(|| Timeline::new(DEFAULT_ECG_RATE_HZ))
                .stamps(now, ecg.len() as u64);
            let acc_stamps = timelines
                .entry(Channel::Accelerometer)
                .or_insert_with(|| Timeline::new(DEFAULT_ACC_RATE_HZ))
                .stamps(now, acc.len() as u64);
            (ecg_stamps, acc_stamps)
        };

        if !ecg.is_empty() {
            let samples = ecg
                .into_iter()
                .zip(ecg_stamps)
                .map(|(microvolts, sensor_timestamp)| Sample::Ecg {
                    sensor_timestamp,
                    microvolts,
                })
                .collect();
            self.shared
                .forward(SampleBatch::new(Channel::Ecg, samples).captured_at(captured_at))
                .await;
        }

        if !acc.is_empty() {
            let samples = acc
                .into_iter()
                .zip(acc_stamps)
                .map(|((x, y, z), sensor_timestamp)| Sample::Accelerometer {
                    sensor_timestamp,
                    x,
                    y,
                    z,
                })
                .collect();
            self.shared
                .forward(SampleBatch::new(Channel::Accelerometer, samples).captured_at(captured_at))
                .await;
        }
    }
}

struct Link {
    device_id: String,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Polar H10 reached over Bluetooth LE
pub struct PolarDevice {
    shared: Arc<Shared>,
    sink: Arc<dyn EventSink>,
    link: tokio::sync::Mutex<Option<Link>>,
}

impl PolarDevice {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            sink,
            link: tokio::sync::Mutex::new(None),
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.shared.offered).is_some()
    }
}

#[async_trait]
impl DeviceLink for PolarDevice {
    /// Connect to `device_id`, dropping any current link first
    ///
    /// Returns once the link task is running; progress is reported as events.
    async fn connect(&self, device_id: String) {
        let mut link = self.link.lock().await;
        if let Some(previous) = link.take() {
            log::info!("Dropping link to {} before connecting", previous.device_id);
            previous.stop.cancel();
            let _ = previous.task.await;
        }

        log::info!("Connecting to device: {}", device_id);
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_link(
            device_id.clone(),
            self.shared.clone(),
            self.sink.clone(),
            stop.clone(),
        ));
        *link = Some(Link {
            device_id,
            stop,
            task,
        });
    }

    /// Disconnect from `device_id` if it is the linked device
    async fn disconnect(&self, device_id: &str) {
        let mut link = self.link.lock().await;
        match link.take() {
            Some(current) if current.device_id == device_id => {
                log::info!("Disconnect requested for {}", device_id);
                current.stop.cancel();
                let _ = current.task.await;
            }
            other => {
                log::warn!("Disconnect requested for {}, which is not linked", device_id);
                *link = other;
            }
        }
    }
}

#[async_trait]
impl DeviceCapability for PolarDevice {
    async fn available_settings(&self, channel: Channel) -> Result<AvailableSettings, DeviceError> {
        match lock(&self.shared.offered).as_ref() {
            None => Err(DeviceError::NotConnected),
            Some(offered) => {
                let available = offered
                    .get(&channel)
                    .cloned()
                    .ok_or(DeviceError::Unsupported(channel))?;
                if available.values.values().all(Vec::is_empty) {
                    return Err(DeviceError::Negotiation {
                        channel,
                        reason: "device reported no settings".to_string(),
                    });
                }
                Ok(available)
            }
        }
    }

    async fn subscribe(
        &self,
        channel: Channel,
        settings: Option<StreamSettings>,
        cancel: CancellationToken,
    ) -> Result<SampleStream, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        if !SUPPORTED.contains(&channel) {
            return Err(DeviceError::Unsupported(channel));
        }
        // The H10 fixes its PMD rates at connect time
        let requested = settings.and_then(|s| s.get(SettingKind::SampleRate));
        let running = lock(&self.shared.timelines).get(&channel).map(|t| t.rate_hz);
        if let (Some(requested), Some(running)) = (requested, running) {
            if u64::from(requested) != running {
                return Err(DeviceError::Subscribe {
                    channel,
                    reason: format!("stream runs at {} Hz, {} Hz requested", running, requested),
                });
            }
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        lock(&self.shared.routes).insert(
            channel,
            Route {
                tx,
                cancel: cancel.clone(),
            },
        );
        if let Some(timeline) = lock(&self.shared.timelines).get_mut(&channel) {
            timeline.last = None;
        }

        // Unroute once cancelled, unless a newer subscription replaced this one
        let shared = self.shared.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let mut routes = lock(&shared.routes);
            if routes
                .get(&channel)
                .is_some_and(|route| route.cancel.is_cancelled())
            {
                routes.remove(&channel);
            }
        });

        Ok(rx)
    }

    async fn set_device_mode(&self, enabled: bool) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        Err(DeviceError::ModeChange(format!(
            "Polar H10 has no SDK mode (requested {})",
            if enabled { "on" } else { "off" }
        )))
    }
}

fn emit_status(sink: &dyn EventSink, device_id: &str, status: ConnectionStatus) {
    sink.emit(UiEvent::ConnectionStatus {
        status,
        device_id: device_id.to_string(),
    });
}

async fn connect_to_device(
    polar: &mut PolarSensor,
    device_id: &str,
    stop: &CancellationToken,
) -> Result<(), DeviceError> {
    while !polar.is_connected().await {
        if stop.is_cancelled() {
            return Err(DeviceError::NotConnected);
        }

        match polar.connect().await {
            Err(arctic::Error::NoBleAdaptor) => return Err(DeviceError::NoAdapter),
            Err(why) => {
                log::debug!("Could not connect to {}: {:?}", device_id, why);
                tokio::select! {
                    _ = stop.cancelled() => return Err(DeviceError::NotConnected),
                    _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
                }
            }
            _ => {}
        }
    }
    Ok(())
}

async fn subscribe_to_streams(polar: &mut PolarSensor) {
    if let Err(why) = polar.subscribe(arctic::NotifyStream::HeartRate).await {
        log::error!("Could not subscribe to heart rate notifications: {:?}", why)
    }
    if let Err(why) = polar.subscribe(arctic::NotifyStream::MeasurementData).await {
        log::error!("Could not subscribe to measurement data notifications: {:?}", why)
    }
}

fn setup_data_types(polar: &mut PolarSensor) {
    polar.data_type_push(arctic::H10MeasurementType::Acc);
    polar.data_type_push(arctic::H10MeasurementType::Ecg);
}

/// Query offered sample rates and switch ECG and ACC to their maximum
///
/// Returns the offered settings and the rate in effect per channel.
async fn configure_sample_rates(
    polar: &mut PolarSensor,
) -> (HashMap<Channel, AvailableSettings>, HashMap<Channel, u64>) {
    let mut offered = HashMap::new();
    let mut rates = HashMap::from([
        (Channel::Ecg, DEFAULT_ECG_RATE_HZ),
        (Channel::Accelerometer, DEFAULT_ACC_RATE_HZ),
    ]);

    match polar.settings().await {
        Ok(settings) => {
            for setting in settings {
                let channel = match setting.measurement_type() {
                    arctic::H10MeasurementType::Ecg => Channel::Ecg,
                    arctic::H10MeasurementType::Acc => Channel::Accelerometer,
                };
                let sample_rates = setting.sample_rate();
                let values: Vec<u32> = sample_rates.iter().map(|&rate| rate as u32).collect();
                log::info!("Available {} sample rates: {:?}", channel, values);
                offered.insert(
                    channel,
                    AvailableSettings::default().with(SettingKind::SampleRate, values),
                );

                if let Some(&max_rate) = sample_rates.iter().max() {
                    let applied = match channel {
                        Channel::Ecg => polar.ecg_sample_rate(max_rate),
                        _ => polar.acc_sample_rate(max_rate),
                    };
                    match applied {
                        Ok(_) => {
                            log::info!("{} sample rate set to {} Hz", channel, max_rate as u64);
                            rates.insert(channel, max_rate as u64);
                        }
                        Err(e) => log::warn!("Failed to set {} sample rate: {:?}", channel, e),
                    }
                }
            }
        }
        Err(e) => {
            log::warn!("Could not query device settings: {:?}", e);
        }
    }

    // Channels the device did not describe still stream at their default rate
    for (channel, rate) in &rates {
        offered.entry(*channel).or_insert_with(|| {
            AvailableSettings::default().with(SettingKind::SampleRate, vec![*rate as u32])
        });
    }

    (offered, rates)
}

/// Connect, configure and run the event loop until stopped or disconnected
async fn run_link(
    device_id: String,
    shared: Arc<Shared>,
    sink: Arc<dyn EventSink>,
    stop: CancellationToken,
) {
    emit_status(sink.as_ref(), &device_id, ConnectionStatus::Connecting);

    let mut polar = match PolarSensor::new(device_id.clone()).await {
        Ok(sensor) => sensor,
        Err(e) => {
            let error = DeviceError::Connection {
                device_id: device_id.clone(),
                reason: format!("{:?}", e),
            };
            log::error!("{}", error);
            emit_status(sink.as_ref(), &device_id, ConnectionStatus::Error(error.to_string()));
            return;
        }
    };

    if let Err(e) = connect_to_device(&mut polar, &device_id, &stop).await {
        match e {
            DeviceError::NotConnected => {
                emit_status(sink.as_ref(), &device_id, ConnectionStatus::Disconnected)
            }
            other => {
                log::error!("{}", other);
                emit_status(sink.as_ref(), &device_id, ConnectionStatus::Error(other.to_string()))
            }
        }
        return;
    }

    subscribe_to_streams(&mut polar).await;
    setup_data_types(&mut polar);
    let (offered, rates) = configure_sample_rates(&mut polar).await;

    {
        let mut timelines = lock(&shared.timelines);
        timelines.clear();
        for (channel, rate) in rates {
            timelines.insert(channel, Timeline::new(rate));
        }
    }
    *lock(&shared.offered) = Some(offered);

    polar.event_handler(Handler {
        shared: shared.clone(),
    });

    log::info!("Connected to {}", device_id);
    emit_status(sink.as_ref(), &device_id, ConnectionStatus::Connected);

    tokio::select! {
        result = polar.event_loop() => {
            log::info!("Event loop for {} ended: {:?}", device_id, result);
        }
        _ = stop.cancelled() => {
            log::info!("Disconnecting from {}", device_id);
        }
    }

    // Dropping the routes ends every open sample stream
    shared.reset();
    emit_status(sink.as_ref(), &device_id, ConnectionStatus::Disconnected);
}
