// Shared types module - Common types used across multiple modules

use crate::snapshot::DeviceSnapshot;
use crate::wifi::WifiScanOutcome;

// The controller always reports exactly four DMX channels and four wall buttons
pub const CHANNEL_COUNT: usize = 4;
pub const BUTTON_COUNT: usize = 4;

// Why a monitor session ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionExit {
    UserQuit,     // User pressed 'q' or Ctrl+C
    EventsClosed, // Every background task is gone
}

/// Events produced by background tasks and consumed by the panel owner
#[derive(Debug)]
pub enum AppEvent {
    SocketConnected,
    SocketDisconnected,
    Snapshot(DeviceSnapshot),
    Reachability { overlay_visible: bool, reload: bool },
    WifiScan(WifiScanOutcome),
}
