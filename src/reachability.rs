// Reachability Module - Liveness probing with a latched lost-connection flag
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::device::DeviceClient;
use crate::types::AppEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    None,
    Reload,
}

/// `has_lost_connection` stays set from the first failure until the next
/// success, however many failures come in between
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReachabilityState {
    pub has_lost_connection: bool,
    pub overlay_visible: bool,
}

impl ReachabilityState {
    pub fn record(&mut self, result: ProbeResult) -> ProbeAction {
        match result {
            ProbeResult::Success => {
                self.overlay_visible = false;
                if self.has_lost_connection {
                    self.has_lost_connection = false;
                    ProbeAction::Reload
                } else {
                    ProbeAction::None
                }
            }
            ProbeResult::Failure => {
                self.has_lost_connection = true;
                self.overlay_visible = true;
                ProbeAction::None
            }
        }
    }
}

/// Shared switch that pauses probing. Cloning shares the same counter, so
/// overlapping guards keep the monitor paused until the last one drops.
#[derive(Debug, Clone, Default)]
pub struct MonitorGate {
    suspended: Arc<AtomicUsize>,
}

impl MonitorGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) -> SuspendGuard {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        SuspendGuard {
            suspended: self.suspended.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) == 0
    }
}

#[must_use = "monitoring resumes as soon as the guard is dropped"]
pub struct SuspendGuard {
    suspended: Arc<AtomicUsize>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.suspended.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ReachabilityMonitor {
    device: DeviceClient,
    gate: MonitorGate,
    interval: Duration,
    timeout: Duration,
    state: ReachabilityState,
}

impl ReachabilityMonitor {
    pub fn new(device: DeviceClient, gate: MonitorGate, interval: Duration, timeout: Duration) -> Self {
        ReachabilityMonitor {
            device,
            gate,
            interval,
            timeout,
            state: ReachabilityState::default(),
        }
    }

    /// Feed one probe result through the state machine, unless suspended.
    /// Returns None when the gate swallowed the tick.
    pub fn observe(&mut self, result: ProbeResult) -> Option<ProbeAction> {
        if !self.gate.is_enabled() {
            return None;
        }
        let was_lost = self.state.has_lost_connection;
        let action = self.state.record(result);
        if self.state.has_lost_connection && !was_lost {
            warn!(host = %self.device.host(), "device not reachable");
        }
        if action == ProbeAction::Reload {
            info!(host = %self.device.host(), "device reachable again, reloading");
        }
        Some(action)
    }

    /// Probe until `stop` flips. The next wait starts after the previous
    /// probe finishes, so a slow device never gets overlapping probes.
    pub async fn run(mut self, events: mpsc::Sender<AppEvent>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
            if !self.gate.is_enabled() {
                debug!("probe skipped, monitoring suspended");
                continue;
            }

            let reachable = tokio::select! {
                ok = self.device.connection_test(self.timeout) => ok,
                _ = stop.changed() => break,
            };
            let result = if reachable {
                ProbeResult::Success
            } else {
                ProbeResult::Failure
            };

            // A scan may have started while the probe was in flight
            let Some(action) = self.observe(result) else {
                continue;
            };

            let event = AppEvent::Reachability {
                overlay_visible: self.state.overlay_visible,
                reload: action == ProbeAction::Reload,
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
        debug!("reachability monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_device::FakeDevice;

    fn monitor(gate: MonitorGate) -> ReachabilityMonitor {
        let device = DeviceClient::new("127.0.0.1:9", Duration::from_millis(50)).unwrap();
        ReachabilityMonitor::new(device, gate, Duration::from_millis(10), Duration::from_millis(10))
    }

    #[test]
    fn fail_fail_success_reloads_exactly_once() {
        let mut state = ReachabilityState::default();
        let actions: Vec<_> = [ProbeResult::Failure, ProbeResult::Failure, ProbeResult::Success]
            .into_iter()
            .map(|r| state.record(r))
            .collect();

        assert_eq!(actions, vec![ProbeAction::None, ProbeAction::None, ProbeAction::Reload]);
        assert!(!state.overlay_visible);
        assert!(!state.has_lost_connection);
        assert_eq!(state.record(ProbeResult::Success), ProbeAction::None);
    }

    #[test]
    fn failure_shows_overlay_and_latches() {
        let mut state = ReachabilityState::default();
        state.record(ProbeResult::Failure);
        assert!(state.overlay_visible);
        assert!(state.has_lost_connection);
    }

    #[test]
    fn suspension_leaves_state_untouched() {
        let gate = MonitorGate::new();
        let mut m = monitor(gate.clone());

        let guard = gate.suspend();
        assert_eq!(m.observe(ProbeResult::Failure), None);
        assert_eq!(&m.state, &ReachabilityState::default());
        drop(guard);

        assert_eq!(m.observe(ProbeResult::Failure), Some(ProbeAction::None));
        assert!(m.state.overlay_visible);
    }

    #[test]
    fn nested_guards_keep_monitor_paused() {
        let gate = MonitorGate::new();
        let a = gate.suspend();
        let b = gate.suspend();
        drop(a);
        assert!(!gate.is_enabled());
        drop(b);
        assert!(gate.is_enabled());
    }

    #[tokio::test]
    async fn outage_then_recovery_sends_one_reload() {
        use std::sync::atomic::Ordering;

        let device = FakeDevice::start().await;
        device.state.reachable.store(false, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = ReachabilityMonitor::new(
            device.client(),
            MonitorGate::new(),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );
        let task = tokio::spawn(monitor.run(tx, stop_rx));

        // Wait for the overlay to come up
        loop {
            match rx.recv().await.unwrap() {
                AppEvent::Reachability { overlay_visible: true, reload } => {
                    assert!(!reload);
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        device.state.reachable.store(true, Ordering::SeqCst);
        let mut reloads = 0;
        loop {
            match rx.recv().await.unwrap() {
                AppEvent::Reachability { overlay_visible: false, reload } => {
                    if reload {
                        reloads += 1;
                    } else {
                        break;
                    }
                }
                AppEvent::Reachability { overlay_visible: true, .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(reloads, 1);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stop_ends_the_loop_during_the_wait() {
        let gate = MonitorGate::new();
        let device = DeviceClient::new("127.0.0.1:9", Duration::from_millis(50)).unwrap();
        let monitor = ReachabilityMonitor::new(device, gate, Duration::from_secs(60), Duration::from_secs(1));
        let (tx, _rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(monitor.run(tx, stop_rx));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
