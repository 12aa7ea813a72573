// Sync Module - Persistent /index_data WebSocket with a fixed-delay reconnect loop
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::snapshot::{ChannelControlIntent, DeviceSnapshot};
use crate::types::AppEvent;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum SyncCommand {
    Send(String),
    Reconnect,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected to the device, intent dropped")]
    NotConnected,
    #[error("failed to encode intent: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Cloneable front end of a running StateSyncClient
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<SyncCommand>,
    connected: Arc<AtomicBool>,
}

impl SyncHandle {
    /// Intents are never queued: with no open socket the intent is dropped
    pub fn send_intent(&self, intent: &ChannelControlIntent) -> Result<(), SendError> {
        let payload = intent.to_wire()?;
        if !self.is_connected() {
            warn!(channel = intent.channel, value = intent.value, "socket closed, dropping intent");
            return Err(SendError::NotConnected);
        }
        self.commands
            .send(SyncCommand::Send(payload))
            .map_err(|_| SendError::NotConnected)
    }

    /// Drop the current socket and connect again after the reconnect delay
    pub fn reconnect(&self) {
        let _ = self.commands.send(SyncCommand::Reconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Closed,
    Stop,
}

pub struct StateSyncClient {
    url: String,
    reconnect_delay: Duration,
    commands: mpsc::UnboundedReceiver<SyncCommand>,
    connected: Arc<AtomicBool>,
}

impl StateSyncClient {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> (Self, SyncHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let client = StateSyncClient {
            url: url.into(),
            reconnect_delay,
            commands: rx,
            connected: connected.clone(),
        };
        (
            client,
            SyncHandle {
                commands: tx,
                connected,
            },
        )
    }

    /// Connect, pump, and reconnect forever. Only `stop` (or a dropped event
    /// receiver) ends the loop. No backoff: every attempt waits the same delay.
    pub async fn run(mut self, events: mpsc::Sender<AppEvent>, mut stop: watch::Receiver<bool>) {
        let mut attempt: u64 = 0;
        loop {
            if *stop.borrow() {
                break;
            }
            attempt += 1;
            debug!(url = %self.url, attempt, "connecting");

            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = stop.changed() => break,
            };

            match connected {
                Ok((socket, _)) => {
                    // Anything queued before this socket existed is stale
                    while self.commands.try_recv().is_ok() {}
                    self.connected.store(true, Ordering::SeqCst);
                    info!(url = %self.url, attempt, "socket connected");
                    if events.send(AppEvent::SocketConnected).await.is_err() {
                        break;
                    }

                    let end = self.pump(socket, &events, &mut stop).await;
                    self.connected.store(false, Ordering::SeqCst);
                    info!(url = %self.url, "socket closed");
                    let _ = events.send(AppEvent::SocketDisconnected).await;
                    if end == PumpEnd::Stop || events.is_closed() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, attempt, "connect failed: {}", e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = stop.changed() => break,
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        debug!("state sync stopped");
    }

    async fn pump(
        &mut self,
        socket: Socket,
        events: &mpsc::Sender<AppEvent>,
        stop: &mut watch::Receiver<bool>,
    ) -> PumpEnd {
        let (mut write, mut read) = socket.split();
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv(), if commands_open => match command {
                    Some(SyncCommand::Send(text)) => {
                        debug!(payload = %text, "sending intent");
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("socket write failed: {}", e);
                            return PumpEnd::Closed;
                        }
                    }
                    Some(SyncCommand::Reconnect) => {
                        info!("reconnect requested");
                        let _ = write.close().await;
                        return PumpEnd::Closed;
                    }
                    None => commands_open = false,
                },

                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => match DeviceSnapshot::decode(&text) {
                        Ok(snapshot) => {
                            if events.send(AppEvent::Snapshot(snapshot)).await.is_err() {
                                let _ = write.close().await;
                                return PumpEnd::Stop;
                            }
                        }
                        Err(e) => warn!("dropping device message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return PumpEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("socket error: {}", e);
                        return PumpEnd::Closed;
                    }
                },

                _ = stop.changed() => {
                    let _ = write.close().await;
                    return PumpEnd::Stop;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_device::FakeDevice;
    use std::sync::atomic::Ordering;

    async fn next_event(rx: &mut mpsc::Receiver<AppEvent>) -> AppEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn send_before_connect_is_dropped() {
        let (_client, handle) = StateSyncClient::new("ws://127.0.0.1:9/index_data", Duration::from_millis(10));
        let err = handle
            .send_intent(&ChannelControlIntent { channel: 1, value: 10 })
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[tokio::test]
    async fn snapshot_arrives_and_intent_reaches_device() {
        let device = FakeDevice::start().await;
        let (client, handle) = StateSyncClient::new(device.ws_url(), Duration::from_millis(20));
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(client.run(tx, stop_rx));

        assert!(matches!(next_event(&mut rx).await, AppEvent::SocketConnected));
        match next_event(&mut rx).await {
            AppEvent::Snapshot(snapshot) => assert!(snapshot.is_full()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(handle.is_connected());

        handle
            .send_intent(&ChannelControlIntent { channel: 2, value: 128 })
            .unwrap();
        let received = device.wait_for_ws_message().await;
        assert_eq!(received, r#"{"channel":2,"value":128}"#);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn malformed_messages_do_not_end_the_session() {
        let device = FakeDevice::start().await;
        device.set_ws_greeting(vec![
            "not json".to_string(),
            r#"{"channels":[{"state":1,"level":3}]}"#.to_string(),
            r#"{"channels":[{"state":1,"level":3},{"state":0,"level":0},{"state":0,"level":0},{"state":0,"level":0}]}"#
                .to_string(),
        ]);
        let (client, _handle) = StateSyncClient::new(device.ws_url(), Duration::from_millis(20));
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(client.run(tx, stop_rx));

        assert!(matches!(next_event(&mut rx).await, AppEvent::SocketConnected));
        match next_event(&mut rx).await {
            AppEvent::Snapshot(snapshot) => assert!(!snapshot.is_full()),
            other => panic!("unexpected event {:?}", other),
        }

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_device_closes() {
        let device = FakeDevice::start().await;
        device.state.ws_close_after_greeting.store(true, Ordering::SeqCst);
        let (client, _handle) = StateSyncClient::new(device.ws_url(), Duration::from_millis(20));
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(client.run(tx, stop_rx));

        let mut connects = 0;
        while connects < 2 {
            if let AppEvent::SocketConnected = next_event(&mut rx).await {
                connects += 1;
            }
        }
        assert!(device.state.ws_connections.load(Ordering::SeqCst) >= 2);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_command_opens_a_fresh_socket() {
        let device = FakeDevice::start().await;
        let (client, handle) = StateSyncClient::new(device.ws_url(), Duration::from_millis(20));
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(client.run(tx, stop_rx));

        assert!(matches!(next_event(&mut rx).await, AppEvent::SocketConnected));
        handle.reconnect();

        let mut saw_disconnect = false;
        loop {
            match next_event(&mut rx).await {
                AppEvent::SocketDisconnected => saw_disconnect = true,
                AppEvent::SocketConnected => break,
                _ => {}
            }
        }
        assert!(saw_disconnect);
        assert_eq!(device.state.ws_connections.load(Ordering::SeqCst), 2);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn keeps_retrying_while_device_is_down() {
        let (client, handle) = StateSyncClient::new("ws://127.0.0.1:9/index_data", Duration::from_millis(10));
        let (tx, _rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(client.run(tx, stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        assert!(!handle.is_connected());

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
