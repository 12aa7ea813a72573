// WiFi Module - Network scan with the device's "still scanning" retry rule
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::device::DeviceClient;
use crate::reachability::MonitorGate;

/// One row of the device's /available_wifi_networks answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    pub rssi: i32,
    pub channel: u8,
    pub security: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WifiScanOutcome {
    Networks(Vec<WifiNetwork>),
    NoNetworksFound,
    Failed(String),
}

impl WifiNetwork {
    /// Table cells in display order: SSID, RSSI, channel, security
    pub fn row(&self) -> [String; 4] {
        [
            self.ssid.clone(),
            format!("{} dBm", self.rssi),
            self.channel.to_string(),
            self.security.clone(),
        ]
    }
}

/// Ask the device for nearby networks.
///
/// The first request after boot usually kicks off a scan and returns an empty
/// list, so an empty answer is retried exactly once after `rescan_delay`. Only
/// the second answer is reported. Liveness probing is paused for the whole
/// scan because the radio is busy and probes would time out. Each request is
/// bounded by `request_timeout`, so a stalled device cannot hold the pause.
pub async fn scan_networks(
    device: &DeviceClient,
    gate: &MonitorGate,
    rescan_delay: Duration,
    request_timeout: Duration,
) -> WifiScanOutcome {
    let _suspended = gate.suspend();

    let first = match device.available_wifi_networks(request_timeout).await {
        Ok(networks) => networks,
        Err(e) => {
            warn!("WiFi scan failed: {:#}", e);
            return WifiScanOutcome::Failed(format!("{:#}", e));
        }
    };
    if !first.is_empty() {
        info!(count = first.len(), "WiFi scan complete");
        return WifiScanOutcome::Networks(first);
    }

    info!(delay_ms = rescan_delay.as_millis() as u64, "device still scanning, asking again");
    tokio::time::sleep(rescan_delay).await;

    match device.available_wifi_networks(request_timeout).await {
        Ok(networks) if networks.is_empty() => WifiScanOutcome::NoNetworksFound,
        Ok(networks) => {
            info!(count = networks.len(), "WiFi scan complete");
            WifiScanOutcome::Networks(networks)
        }
        Err(e) => {
            warn!("WiFi rescan failed: {:#}", e);
            WifiScanOutcome::Failed(format!("{:#}", e))
        }
    }
}
