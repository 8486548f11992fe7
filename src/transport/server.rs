//! WebSocket listener serving exactly one client at a time
//!
//! A second client is refused with close code 1013 while one is attached.
//! Outbound frames for the attached client go through a single queue so
//! control messages and audio keep their relative order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use super::protocol::ControlMessage;
use crate::error::TransportError;

const BUSY_REASON: &str = "Server busy, another client is connected.";

/// Ping period; a ping still unanswered at the next one drops the client
const HEARTBEAT: Duration = Duration::from_secs(20);

/// What the attached client did
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected { peer: SocketAddr },
    Control(ControlMessage),
    Audio(Vec<u8>),
    Disconnected,
}

struct Attached {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Shared {
    client: Mutex<Option<Attached>>,
    next_id: AtomicU64,
}

/// Send side of the link to the attached client
#[derive(Clone, Default)]
pub struct LinkHandle {
    shared: Arc<Shared>,
}

impl LinkHandle {
    /// Whether a client currently holds the slot
    pub fn is_connected(&self) -> bool {
        self.shared
            .client
            .lock()
            .map(|client| client.is_some())
            .unwrap_or(false)
    }

    pub fn send_control(&self, message: ControlMessage) -> Result<(), TransportError> {
        let json = message.to_json()?;
        debug!(%message, "sending control message");
        self.enqueue(Message::Text(json))
    }

    pub fn send_audio(&self, pcm: Vec<u8>) -> Result<(), TransportError> {
        self.enqueue(Message::Binary(pcm))
    }

    /// Close the attached client's socket, if any
    pub fn close(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if self.enqueue(Message::Close(Some(frame))).is_ok() {
            info!(%code, reason, "closing client connection");
        }
    }

    fn enqueue(&self, message: Message) -> Result<(), TransportError> {
        let client = self
            .shared
            .client
            .lock()
            .map_err(|_| TransportError::Closed)?;
        let Some(client) = client.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        client
            .outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Attach a new client unless one is already attached
    fn attach(&self, outbound: mpsc::UnboundedSender<Message>) -> Option<u64> {
        let mut client = self.shared.client.lock().ok()?;
        if client.is_some() {
            return None;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        *client = Some(Attached { id, outbound });
        Some(id)
    }

    fn detach(&self, id: u64) {
        if let Ok(mut client) = self.shared.client.lock() {
            if client.as_ref().is_some_and(|c| c.id == id) {
                *client = None;
            }
        }
    }
}

/// Accepts the client connection and feeds its traffic into [`LinkEvent`]s
pub struct LinkServer {
    listener: TcpListener,
    handle: LinkHandle,
    events: mpsc::Sender<LinkEvent>,
    heartbeat: Duration,
}

impl LinkServer {
    /// Bind the listener; events from the attached client go to `events`
    pub async fn bind(addr: &str, events: mpsc::Sender<LinkEvent>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "websocket server listening");
        Ok(Self {
            listener,
            handle: LinkHandle::default(),
            events,
            heartbeat: HEARTBEAT,
        })
    }

    /// Override the ping period used to detect vanished clients
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Address actually bound, useful when binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Send side shared with the assistant
    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Accept connections until the task is dropped
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "tcp connection accepted");
                    let handle = self.handle.clone();
                    let events = self.events.clone();
                    let heartbeat = self.heartbeat;
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, peer, handle, events, heartbeat).await
                        {
                            warn!(error = %e, %peer, "client handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handle: LinkHandle,
    events: mpsc::Sender<LinkEvent>,
    heartbeat: Duration,
) -> Result<(), TransportError> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let Some(id) = handle.attach(outbound.clone()) else {
        warn!(%peer, "rejecting client, another one is already connected");
        let frame = CloseFrame {
            code: CloseCode::Again,
            reason: BUSY_REASON.into(),
        };
        ws.close(Some(frame)).await?;
        return Ok(());
    };

    info!(%peer, "client connected");
    let _ = events.send(LinkEvent::Connected { peer }).await;

    let (mut sink, source) = ws.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                warn!(error = %e, "send to client failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    read_client(source, &outbound, &events, heartbeat).await;

    // Announce before freeing the slot so a newcomer's Connected comes after
    info!(%peer, "client disconnected");
    let _ = events.send(LinkEvent::Disconnected).await;
    handle.detach(id);
    writer.abort();
    Ok(())
}

/// Forward client frames until it closes, errors or misses a heartbeat
async fn read_client(
    mut source: SplitStream<WebSocketStream<TcpStream>>,
    outbound: &mpsc::UnboundedSender<Message>,
    events: &mpsc::Sender<LinkEvent>,
    heartbeat: Duration,
) {
    let start = tokio::time::Instant::now() + heartbeat;
    let mut ticker = tokio::time::interval_at(start, heartbeat);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(message) = ControlMessage::parse(&text) {
                        debug!(%message, "control message received");
                        let _ = events.send(LinkEvent::Control(message)).await;
                    }
                }
                Some(Ok(Message::Binary(pcm))) => {
                    let _ = events.send(LinkEvent::Audio(pcm)).await;
                }
                Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "client sent close");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "receive from client failed");
                    return;
                }
                None => return,
            },
            _ = ticker.tick() => {
                if awaiting_pong {
                    warn!("client missed a heartbeat, dropping it");
                    return;
                }
                if outbound.send(Message::Ping(Vec::new())).is_err() {
                    return;
                }
                awaiting_pong = true;
            }
        }
    }
}
