// In-process stand-in for the controller's HTTP + WebSocket API
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::DeviceClient;
use crate::wifi::WifiNetwork;

pub const RAW_CONFIG: &str = "wifi_hostname=dmx-hall\nmqtt_port=1883\n";

pub const FULL_SNAPSHOT: &str = r#"{
    "kind": "full",
    "wifi_hostname": "dmx-hall",
    "mqtt_status": "Connected",
    "button_min_time": 50,
    "button_max_time": 500,
    "channels": [
        {"name": "Hall", "enabled": 1, "channel": 11, "min": 0, "max": 255, "dimmingSpeed": 5, "autoDimmingSpeed": 3, "holdPeriod": 700, "level": 120, "state": 1},
        {"name": "Porch", "enabled": 1, "channel": 12, "min": 0, "max": 255, "dimmingSpeed": 5, "autoDimmingSpeed": 3, "holdPeriod": 700, "level": 0, "state": 0},
        {"name": "Desk", "enabled": 1, "channel": 13, "min": 0, "max": 255, "dimmingSpeed": 5, "autoDimmingSpeed": 3, "holdPeriod": 700, "level": 0, "state": 0},
        {"name": "Shelf", "enabled": 0, "channel": 14, "min": 0, "max": 255, "dimmingSpeed": 5, "autoDimmingSpeed": 3, "holdPeriod": 700, "level": 0, "state": 0}
    ],
    "buttons": [
        {"channel": 11, "enabled": 1},
        {"channel": 12, "enabled": 0},
        {"channel": 13, "enabled": 0},
        {"channel": 14, "enabled": 0}
    ]
}"#;

/// Everything the device saw, plus knobs the tests turn
pub struct DeviceState {
    pub reachable: AtomicBool,
    pub probe_delay_ms: AtomicU64,
    pub factory_resets: AtomicUsize,
    pub reboots: AtomicUsize,
    pub saved_forms: Mutex<Vec<Vec<(String, String)>>>,
    pub scans: Mutex<VecDeque<Vec<WifiNetwork>>>,
    pub scan_requests: AtomicUsize,
    /// One entry per /update request: (field, file name, byte count) per part
    pub uploads: Mutex<Vec<Vec<(String, String, usize)>>>,
    pub update_status: AtomicU16,
    pub ws_connections: AtomicUsize,
    pub ws_received: Mutex<Vec<String>>,
    pub ws_greeting: Mutex<Vec<String>>,
    pub ws_close_after_greeting: AtomicBool,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            reachable: AtomicBool::new(true),
            probe_delay_ms: AtomicU64::new(0),
            factory_resets: AtomicUsize::new(0),
            reboots: AtomicUsize::new(0),
            saved_forms: Mutex::new(Vec::new()),
            scans: Mutex::new(VecDeque::new()),
            scan_requests: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            update_status: AtomicU16::new(200),
            ws_connections: AtomicUsize::new(0),
            ws_received: Mutex::new(Vec::new()),
            ws_greeting: Mutex::new(vec![FULL_SNAPSHOT.to_string()]),
            ws_close_after_greeting: AtomicBool::new(false),
        }
    }
}

pub struct FakeDevice {
    pub addr: SocketAddr,
    pub state: Arc<DeviceState>,
}

impl FakeDevice {
    pub async fn start() -> Self {
        let state = Arc::new(DeviceState::default());
        let app = Router::new()
            .route("/connection_test", get(connection_test))
            .route("/available_wifi_networks", get(available_wifi_networks))
            .route("/do_factory_reset", get(do_factory_reset))
            .route("/reboot", get(reboot))
            .route("/raw_config", get(|| async { RAW_CONFIG }))
            .route("/save_config", post(save_config))
            .route("/update", post(update))
            .route("/index_data", get(index_data))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        FakeDevice { addr, state }
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn client(&self) -> DeviceClient {
        DeviceClient::new(&self.host(), Duration::from_secs(2)).unwrap()
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/index_data", self.addr)
    }

    pub fn queue_scans(&self, scans: Vec<Vec<WifiNetwork>>) {
        self.state.scans.lock().unwrap().extend(scans);
    }

    pub fn set_ws_greeting(&self, messages: Vec<String>) {
        *self.state.ws_greeting.lock().unwrap() = messages;
    }

    /// First text frame the device received, waiting up to five seconds
    pub async fn wait_for_ws_message(&self) -> String {
        for _ in 0..500 {
            if let Some(first) = self.state.ws_received.lock().unwrap().first() {
                return first.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("device never received a websocket message");
    }
}

async fn connection_test(State(state): State<Arc<DeviceState>>) -> StatusCode {
    let delay = state.probe_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.reachable.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn available_wifi_networks(State(state): State<Arc<DeviceState>>) -> Json<Vec<WifiNetwork>> {
    state.scan_requests.fetch_add(1, Ordering::SeqCst);
    let next = state.scans.lock().unwrap().pop_front().unwrap_or_default();
    Json(next)
}

async fn do_factory_reset(State(state): State<Arc<DeviceState>>) -> &'static str {
    state.factory_resets.fetch_add(1, Ordering::SeqCst);
    "OK"
}

async fn reboot(State(state): State<Arc<DeviceState>>) -> &'static str {
    state.reboots.fetch_add(1, Ordering::SeqCst);
    "Rebooting..."
}

async fn save_config(
    State(state): State<Arc<DeviceState>>,
    Form(form): Form<Vec<(String, String)>>,
) -> Redirect {
    state.saved_forms.lock().unwrap().push(form);
    Redirect::to("/reboot")
}

async fn update(State(state): State<Arc<DeviceState>>, mut multipart: Multipart) -> Response {
    let mut parts = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        let len = field.bytes().await.map(|b| b.len()).unwrap_or(0);
        parts.push((name, file_name, len));
    }
    state.uploads.lock().unwrap().push(parts);

    let status = StatusCode::from_u16(state.update_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_success() {
        (status, "OK").into_response()
    } else {
        (status, "Update failed").into_response()
    }
}

async fn index_data(ws: WebSocketUpgrade, State(state): State<Arc<DeviceState>>) -> Response {
    ws.on_upgrade(move |socket| index_data_session(socket, state))
}

async fn index_data_session(mut socket: WebSocket, state: Arc<DeviceState>) {
    state.ws_connections.fetch_add(1, Ordering::SeqCst);

    let greeting = state.ws_greeting.lock().unwrap().clone();
    for text in greeting {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    if state.ws_close_after_greeting.load(Ordering::SeqCst) {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                state.ws_received.lock().unwrap().push(text);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}
