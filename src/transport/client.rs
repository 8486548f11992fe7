//! Persistent client connection with automatic reconnection
//!
//! One manager task owns the connect/monitor/teardown cycle. The socket is
//! replaced on every reconnect; the `TransportClient` itself lives for the
//! whole process. Inbound traffic and connection changes are delivered as
//! [`TransportEvent`]s on a channel.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::protocol::ControlMessage;
use crate::config::TransportSettings;
use crate::error::TransportError;

/// Upper bound on a single connection attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound events buffered ahead of the orchestrator
const EVENT_BUFFER: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; no further reconnection
    ShuttingDown,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Everything the connection reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new socket is up
    Connected { connection_id: u64 },
    /// The socket that was up has gone; emitted once per loss
    Disconnected,
    Control(ControlMessage),
    Audio(Vec<u8>),
}

struct Inner {
    url: String,
    heartbeat: Duration,
    backoff_base: f64,
    backoff_max: f64,
    status: watch::Sender<ConnectionStatus>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    reconnect_attempts: AtomicU32,
    connection_id: AtomicU64,
    events: mpsc::Sender<TransportEvent>,
}

/// Persistent connection to the server, reconnecting until shut down
pub struct TransportClient {
    inner: Arc<Inner>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl TransportClient {
    pub fn new(url: impl Into<String>, settings: &TransportSettings) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        let inner = Inner {
            url: url.into(),
            heartbeat: settings.heartbeat_interval(),
            backoff_base: settings.backoff_base_secs,
            backoff_max: settings.backoff_max_secs,
            status,
            sink: tokio::sync::Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            connection_id: AtomicU64::new(0),
            events,
        };

        (
            Self {
                inner: Arc::new(inner),
                manager: Mutex::new(None),
            },
            events_rx,
        )
    }

    /// Spawn the reconnection loop; later calls are no-ops
    pub fn start(&self) {
        let Ok(mut slot) = self.manager.lock() else {
            error!("transport manager slot poisoned");
            return;
        };
        if slot.is_some() {
            debug!("transport already started");
            return;
        }
        if self.status() == ConnectionStatus::ShuttingDown {
            warn!("transport has been shut down, not starting");
            return;
        }

        info!(url = %self.inner.url, "starting persistent connection");
        *slot = Some(tokio::spawn(Arc::clone(&self.inner).run()));
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Failed cycles since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Identifier of the current (or last) socket, starting at 1
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id.load(Ordering::SeqCst)
    }

    /// Send a control message
    ///
    /// Failures are logged and returned but never tear the connection down;
    /// loss detection belongs to the reconnection loop.
    pub async fn send_control(&self, message: ControlMessage) -> Result<(), TransportError> {
        let json = message.to_json()?;
        debug!(%message, "sending control message");
        self.send(Message::Text(json), "control message").await
    }

    /// Send one binary audio frame
    pub async fn send_binary(&self, pcm: Vec<u8>) -> Result<(), TransportError> {
        self.send(Message::Binary(pcm), "audio").await
    }

    /// Stop reconnecting and close the live socket; not reversible
    pub async fn shutdown(&self) {
        info!("shutting down transport");
        self.inner.status.send_replace(ConnectionStatus::ShuttingDown);

        let handle = self.manager.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let frame = CloseFrame {
                code: CloseCode::Away,
                reason: "client shutting down".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            let _ = sink.close().await;
        }
        info!("transport shutdown complete");
    }

    async fn send(&self, message: Message, kind: &'static str) -> Result<(), TransportError> {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            warn!(%status, "cannot send {kind}, not connected");
            return Err(TransportError::NotConnected);
        }

        let mut guard = self.inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            warn!("cannot send {kind}, no live socket");
            return Err(TransportError::NotConnected);
        };

        sink.send(message).await.map_err(|e| {
            warn!(error = %e, "failed to send {kind}");
            TransportError::from(e)
        })
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_max);

        while !self.shutting_down() {
            match self.connect_once().await {
                Ok(stream) => {
                    backoff.reset();
                    self.reconnect_attempts.store(0, Ordering::SeqCst);

                    let (sink, source) = stream.split();
                    *self.sink.lock().await = Some(sink);

                    if self.set_status(ConnectionStatus::Connected) {
                        let connection_id = self.connection_id.fetch_add(1, Ordering::SeqCst) + 1;
                        info!(connection_id, url = %self.url, "connected to server");
                        let _ = self
                            .events
                            .send(TransportEvent::Connected { connection_id })
                            .await;
                        self.monitor(source).await;
                    }
                }
                Err(e) => warn!(error = %e, url = %self.url, "connection attempt failed"),
            }

            if self.teardown().await {
                let _ = self.events.send(TransportEvent::Disconnected).await;
            }

            if self.shutting_down() {
                break;
            }

            let delay = backoff.next_delay();
            self.reconnect_attempts
                .store(backoff.attempts(), Ordering::SeqCst);
            info!(
                delay_secs = format!("{:.1}", delay.as_secs_f64()),
                attempt = backoff.attempts(),
                "reconnecting"
            );
            tokio::time::sleep(delay).await;
        }
        debug!("reconnection loop exited");
    }

    async fn connect_once(&self) -> Result<WsStream, TransportError> {
        if !self.set_status(ConnectionStatus::Connecting) {
            return Err(TransportError::Closed);
        }
        info!(url = %self.url, "connecting");

        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))),
        }
    }

    /// Pump inbound frames and heartbeats until the socket dies
    async fn monitor(&self, mut source: SplitStream<WsStream>) {
        let start = tokio::time::Instant::now() + self.heartbeat;
        let mut heartbeat = tokio::time::interval_at(start, self.heartbeat);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Binary(pcm))) => {
                        let _ = self.events.send(TransportEvent::Audio(pcm)).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(message) = ControlMessage::parse(&text) {
                            debug!(%message, "control message received");
                            let _ = self.events.send(TransportEvent::Control(message)).await;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "server closed connection");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "receive failed");
                        return;
                    }
                    None => {
                        info!("connection stream ended");
                        return;
                    }
                },
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        warn!("heartbeat not answered, treating connection as lost");
                        return;
                    }
                    let mut guard = self.sink.lock().await;
                    let Some(sink) = guard.as_mut() else { return };
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        warn!(error = %e, "heartbeat failed");
                        return;
                    }
                    awaiting_pong = true;
                }
            }
        }
    }

    /// Drop the socket; true if it had been connected
    async fn teardown(&self) -> bool {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }

        let mut was_connected = false;
        self.status.send_if_modified(|status| {
            was_connected = *status == ConnectionStatus::Connected;
            if *status == ConnectionStatus::ShuttingDown || *status == ConnectionStatus::Disconnected {
                return false;
            }
            *status = ConnectionStatus::Disconnected;
            true
        });

        if was_connected {
            info!("disconnected from server");
        }
        was_connected
    }

    /// Change status unless shutting down
    fn set_status(&self, next: ConnectionStatus) -> bool {
        let mut applied = false;
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::ShuttingDown {
                return false;
            }
            applied = true;
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
        applied
    }

    fn shutting_down(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::ShuttingDown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_settings(heartbeat_secs: f64) -> TransportSettings {
        TransportSettings {
            heartbeat_interval_secs: heartbeat_secs,
            backoff_base_secs: 0.01,
            backoff_max_secs: 0.05,
        }
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_dispatches_inbound_frames() {
        let (listener, url) = listener().await;
        let (client, mut events) = TransportClient::new(url, &fast_settings(30.0));
        client.start();
        client.start();

        let mut server = accept(&listener).await;
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Connected { connection_id: 1 }
        );

        server.send(Message::Text("{broken".into())).await.unwrap();
        server
            .send(Message::Text(r#"{"type":"tts_stream_end"}"#.into()))
            .await
            .unwrap();
        server.send(Message::Binary(vec![1, 2, 3, 4])).await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Control(ControlMessage::TtsStreamEnd)
        );
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Audio(vec![1, 2, 3, 4])
        );

        client.send_control(ControlMessage::HotwordDetected).await.unwrap();
        let inbound = server.next().await.unwrap().unwrap();
        assert_eq!(inbound, Message::Text(r#"{"type":"hotword_detected"}"#.into()));

        client.shutdown().await;
        assert_eq!(client.status(), ConnectionStatus::ShuttingDown);
    }

    #[tokio::test]
    async fn test_reconnects_after_remote_close() {
        let (listener, url) = listener().await;
        let (client, mut events) = TransportClient::new(url, &fast_settings(30.0));
        client.start();

        let mut first = accept(&listener).await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected { connection_id: 1 }
        ));
        assert_eq!(client.reconnect_attempts(), 0);

        first.close(None).await.unwrap();
        assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);

        let _second = accept(&listener).await;
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Connected { connection_id: 2 }
        );
        assert!(client.is_connected());
        assert_eq!(client.reconnect_attempts(), 0);

        client.shutdown().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(200), events.recv())
                .await
                .map_or(true, |event| event.is_none()),
            "no further events after shutdown"
        );
    }

    #[tokio::test]
    async fn test_missed_heartbeat_drops_connection() {
        let (listener, url) = listener().await;
        let (client, mut events) = TransportClient::new(url, &fast_settings(0.1));
        client.start();

        // Hold the socket without polling it so pings are never answered
        let _silent = accept(&listener).await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected { .. }
        ));
        assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_when_disconnected_is_rejected() {
        let (client, _events) = TransportClient::new("ws://127.0.0.1:9", &fast_settings(30.0));
        let result = client.send_control(ControlMessage::PlaybackComplete).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert!(client.send_binary(vec![0, 0]).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_connects_count_attempts() {
        let (listener, url) = listener().await;
        drop(listener);

        let (client, _events) = TransportClient::new(url, &fast_settings(30.0));
        client.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(client.reconnect_attempts() >= 1);
        assert_ne!(client.status(), ConnectionStatus::Connected);

        client.shutdown().await;
        client.start();
        assert_eq!(client.status(), ConnectionStatus::ShuttingDown);
    }
}
