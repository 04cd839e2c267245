use crate::error::ScanError;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    pub id: String,
    pub name: String,
}

impl BluetoothDevice {
    pub fn new(id: String, name: String) -> Self {
        Self { id, name }
    }
}

/// Whether an advertised name matches the configured filter (case-insensitive)
fn matches_filter(local_name: &str, name_filter: &str) -> bool {
    local_name.to_lowercase().contains(&name_filter.to_lowercase())
}

/// Device id from an advertised name like "Polar H10 12345678", else the address
fn device_id(local_name: &str, address: &str) -> String {
    local_name
        .split_whitespace()
        .last()
        .unwrap_or(address)
        .to_string()
}

/// Scans for nearby Bluetooth devices whose name contains `name_filter`
pub async fn scan_devices(
    name_filter: &str,
    duration: Duration,
) -> Result<Vec<BluetoothDevice>, ScanError> {
    use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
    use btleplug::platform::Manager;

    let manager = Manager::new()
        .await
        .map_err(|e| ScanError::ManagerInit(e.to_string()))?;

    let adapters = manager
        .adapters()
        .await
        .map_err(|e| ScanError::ManagerInit(e.to_string()))?;

    let central = adapters.into_iter().next().ok_or(ScanError::NoAdapters)?;

    central
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| ScanError::ScanFailed(e.to_string()))?;

    tokio::time::sleep(duration).await;

    central
        .stop_scan()
        .await
        .map_err(|e| ScanError::ScanFailed(e.to_string()))?;

    let peripherals = central
        .peripherals()
        .await
        .map_err(|e| ScanError::ScanFailed(e.to_string()))?;

    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Ok(Some(props)) = peripheral.properties().await {
            if let Some(local_name) = props.local_name {
                if matches_filter(&local_name, name_filter) {
                    let id = device_id(&local_name, &peripheral.address().to_string());
                    devices.push(BluetoothDevice::new(id, local_name));
                }
            }
        }
    }

    log::info!("Scan found {} matching devices", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_is_case_insensitive() {
        assert!(matches_filter("Polar H10 12345678", "polar"));
        assert!(matches_filter("POLAR Verity Sense 0A1B2C3D", "Polar"));
        assert!(!matches_filter("Garmin HRM", "polar"));
    }

    #[test]
    fn test_device_id_from_name() {
        assert_eq!(device_id("Polar H10 12345678", "AA:BB"), "12345678");
        assert_eq!(device_id("", "AA:BB"), "AA:BB");
    }
}
