// Session Module - Wires the sync client and reachability monitor to one panel owner
//
// Background tasks never touch the panel. They send AppEvents here, and the
// single owner (TUI loop or headless loop) applies them in arrival order.
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bindings::{BindingTable, UnknownFieldPolicy};
use crate::config::PanelConfig;
use crate::device::DeviceClient;
use crate::panel::{PanelModel, WifiView};
use crate::reachability::{MonitorGate, ReachabilityMonitor};
use crate::snapshot::ChannelControlIntent;
use crate::sync::{StateSyncClient, SyncHandle};
use crate::types::AppEvent;
use crate::wifi;

const EVENT_QUEUE: usize = 256;

pub struct Session {
    panel: PanelModel,
    table: BindingTable,
    sync: SyncHandle,
    device: DeviceClient,
    gate: MonitorGate,
    events: mpsc::Receiver<AppEvent>,
    // Weak so the queue closes once both background tasks are gone
    events_tx: mpsc::WeakSender<AppEvent>,
    stop: watch::Sender<bool>,
    runtime: Handle,
    rescan_delay: Duration,
    scan_timeout: Duration,
    slider_step: u8,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Spawn the sync client and the reachability monitor on `runtime`
    pub fn start(config: &PanelConfig, device: DeviceClient, runtime: Handle) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (stop, stop_rx) = watch::channel(false);
        let gate = MonitorGate::new();

        let (sync_client, sync) =
            StateSyncClient::new(device.index_data_url(), config.reconnect_delay());
        let monitor = ReachabilityMonitor::new(
            device.clone(),
            gate.clone(),
            config.probe_interval(),
            config.probe_timeout(),
        );

        let tasks = vec![
            runtime.spawn(sync_client.run(events_tx.clone(), stop_rx.clone())),
            runtime.spawn(monitor.run(events_tx.clone(), stop_rx)),
        ];

        let panel = PanelModel::new();
        let policy = if config.log_unknown_fields {
            UnknownFieldPolicy::LogAndSkip
        } else {
            UnknownFieldPolicy::Ignore
        };
        let table = BindingTable::standard(panel.element_ids().map(str::to_string).collect::<Vec<_>>())
            .with_unknown_policy(policy);

        info!(host = %device.host(), "session started");
        Session {
            panel,
            table,
            sync,
            device,
            gate,
            events,
            events_tx: events_tx.downgrade(),
            stop,
            runtime,
            rescan_delay: config.wifi_rescan_delay(),
            scan_timeout: config.wifi_scan_timeout(),
            slider_step: config.slider_step,
            tasks,
        }
    }

    pub fn panel(&self) -> &PanelModel {
        &self.panel
    }

    pub fn host(&self) -> &str {
        self.device.host()
    }

    pub fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::SocketConnected => self.panel.socket_connected = true,
            AppEvent::SocketDisconnected => self.panel.socket_connected = false,
            AppEvent::Snapshot(snapshot) => self.panel.apply_snapshot(&snapshot, &self.table),
            AppEvent::Reachability {
                overlay_visible,
                reload,
            } => {
                if reload {
                    // Same effect as reloading the page: forget everything and
                    // let the next full snapshot repopulate the panel
                    let socket_connected = self.panel.socket_connected;
                    self.panel = PanelModel::new();
                    self.panel.socket_connected = socket_connected;
                    self.sync.reconnect();
                }
                self.panel.overlay_visible = overlay_visible;
            }
            AppEvent::WifiScan(outcome) => self.panel.set_wifi(WifiView::Done(outcome)),
        }
    }

    /// Apply everything already queued without waiting. Returns false once
    /// the queue is closed.
    pub fn drain_events(&mut self) -> bool {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    pub async fn next_event(&mut self) -> Option<AppEvent> {
        self.events.recv().await
    }

    pub fn set_level(&mut self, slot: usize, value: u8) -> Result<ChannelControlIntent> {
        let intent = self.panel.set_slider(slot, value)?;
        self.send(intent)
    }

    pub fn nudge(&mut self, slot: usize, up: bool) -> Result<ChannelControlIntent> {
        let delta = if up {
            self.slider_step as i16
        } else {
            -(self.slider_step as i16)
        };
        let intent = self.panel.nudge_slider(slot, delta)?;
        self.send(intent)
    }

    fn send(&self, intent: ChannelControlIntent) -> Result<ChannelControlIntent> {
        self.sync.send_intent(&intent)?;
        debug!(channel = intent.channel, value = intent.value, "intent sent");
        Ok(intent)
    }

    /// Kick off a WiFi scan in the background; ignored while one is running
    pub fn start_wifi_scan(&mut self) -> Result<()> {
        if self.panel.wifi == WifiView::Scanning {
            return Ok(());
        }
        let events = self
            .events_tx
            .upgrade()
            .ok_or_else(|| anyhow!("session is shutting down"))?;
        self.panel.set_wifi(WifiView::Scanning);

        let device = self.device.clone();
        let gate = self.gate.clone();
        let delay = self.rescan_delay;
        let timeout = self.scan_timeout;
        self.runtime.spawn(async move {
            let outcome = wifi::scan_networks(&device, &gate, delay, timeout).await;
            if events.send(AppEvent::WifiScan(outcome)).await.is_err() {
                warn!("WiFi scan finished after the session ended");
            }
        });
        Ok(())
    }

    /// Signal both background tasks to stop; they close their sockets on the way out
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub async fn shutdown(mut self) {
        self.stop();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("session stopped");
    }
}
