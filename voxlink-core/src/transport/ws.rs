//! WebSocket connector for the live endpoint.
//!
//! ```text
//! connect_async(url) ─► send setup ─► wait setupComplete ─┬─► writer task  (WriterQueue → socket)
//!                                                         └─► reader task  (socket → TransportEvent)
//! ```
//!
//! The writer owns the sink half; [`LiveTransport::send`] only pushes onto a
//! small newest-wins queue so capture never waits on the socket.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    live::{parse_server_message, realtime_input_message, setup_message},
    ConnectConfig, ConnectFuture, Connection, Connector, Delivery, Transport, TransportEvent,
};
use crate::{
    codec::EncodedChunk,
    error::{Result, VoxError},
    playback::output::PLAYBACK_SAMPLE_RATE,
};

/// Public bidirectional streaming endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages the writer may hold before the oldest gives way.
const OUTBOUND_CAPACITY: usize = 32;

/// Connects to the live endpoint over TLS WebSocket.
#[derive(Clone)]
pub struct LiveConnector {
    endpoint: String,
    api_key: String,
    setup_timeout: Duration,
}

impl LiveConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    fn url(&self) -> String {
        if self.api_key.is_empty() {
            return self.endpoint.clone();
        }
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, self.api_key)
    }
}

impl std::fmt::Debug for LiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the key
        f.debug_struct("LiveConnector")
            .field("endpoint", &self.endpoint)
            .field("setup_timeout", &self.setup_timeout)
            .finish_non_exhaustive()
    }
}

impl Connector for LiveConnector {
    fn connect(&self, config: &ConnectConfig) -> ConnectFuture {
        let url = self.url();
        let endpoint = self.endpoint.clone();
        let setup_timeout = self.setup_timeout;
        let config = config.clone();
        Box::pin(async move {
            info!(endpoint = endpoint.as_str(), model = config.model.as_str(), "connecting");
            open(url, config, setup_timeout).await
        })
    }
}

async fn open(url: String, config: ConnectConfig, setup_timeout: Duration) -> Result<Connection> {
    let (socket, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| VoxError::ConnectFailed(e.to_string()))?;
    let (mut sink, mut stream) = socket.split();

    sink.send(Message::Text(setup_message(&config)))
        .await
        .map_err(|e| VoxError::ConnectFailed(format!("setup send: {e}")))?;

    tokio::time::timeout(setup_timeout, await_setup_complete(&mut stream))
        .await
        .map_err(|_| VoxError::ConnectFailed("setup not acknowledged in time".into()))??;
    info!("live session established");

    let outbound = Arc::new(WriterQueue::new(OUTBOUND_CAPACITY));
    let (event_tx, event_rx) = mpsc::channel(config.inbound_capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));

    tokio::spawn(write_loop(sink, Arc::clone(&outbound)));
    tokio::spawn(read_loop(stream, event_tx, Arc::clone(&closed)));

    Ok(Connection {
        transport: Arc::new(LiveTransport { outbound, closed }),
        events: event_rx,
    })
}

async fn await_setup_complete<S>(stream: &mut S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.into_owned())
                    .unwrap_or_else(|| "closed during setup".into());
                return Err(VoxError::ConnectFailed(reason));
            }
            Ok(_) => continue,
            Err(e) => return Err(VoxError::ConnectFailed(e.to_string())),
        };
        if parse_server_message(&text, PLAYBACK_SAMPLE_RATE)?.setup_complete {
            return Ok(());
        }
    }
    Err(VoxError::ConnectFailed("stream ended during setup".into()))
}

/// Newest-wins message queue in front of the socket writer.
struct WriterQueue {
    pending: Mutex<VecDeque<Message>>,
    capacity: usize,
    wake: Notify,
    /// Set once the writer stopped; later pushes fail.
    finished: AtomicBool,
}

impl WriterQueue {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            wake: Notify::new(),
            finished: AtomicBool::new(false),
        }
    }

    fn push(&self, msg: Message) -> Result<Delivery> {
        if self.finished.load(Ordering::Acquire) {
            return Err(VoxError::SendFailed("writer gone".into()));
        }
        let delivery = {
            let mut pending = self.pending.lock();
            let delivery = if pending.len() >= self.capacity {
                pending.pop_front();
                Delivery::Displaced
            } else {
                Delivery::Queued
            };
            pending.push_back(msg);
            delivery
        };
        self.wake.notify_one();
        Ok(delivery)
    }

    async fn next(&self) -> Message {
        loop {
            if let Some(msg) = self.pending.lock().pop_front() {
                return msg;
            }
            self.wake.notified().await;
        }
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.pending.lock().clear();
    }
}

async fn write_loop<S>(mut sink: S, outbound: Arc<WriterQueue>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let msg = outbound.next().await;
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            warn!("websocket write failed: {e}");
            break;
        }
        if is_close {
            break;
        }
    }
    outbound.finish();
    let _ = sink.close().await;
    debug!("websocket writer finished");
}

async fn read_loop<S>(mut stream: S, events: mpsc::Sender<TransportEvent>, closed: Arc<AtomicBool>)
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    let terminal = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break TransportEvent::Closed {
                    reason: frame.map(|f| f.reason.into_owned()),
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break TransportEvent::Error(e.to_string()),
            None => break TransportEvent::Closed { reason: None },
        };

        match parse_server_message(&text, PLAYBACK_SAMPLE_RATE) {
            Ok(frame) => {
                for event in frame.events {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("ignoring server message: {e}"),
        }
    };

    closed.store(true, Ordering::Release);
    debug!(?terminal, "websocket reader finished");
    let _ = events.send(terminal).await;
}

/// Outbound half of a live WebSocket connection.
pub struct LiveTransport {
    outbound: Arc<WriterQueue>,
    closed: Arc<AtomicBool>,
}

impl Transport for LiveTransport {
    fn send(&self, chunk: EncodedChunk) -> Result<Delivery> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VoxError::SendFailed("connection closed".into()));
        }
        let delivery = self
            .outbound
            .push(Message::Text(realtime_input_message(&chunk)))?;
        if delivery == Delivery::Displaced {
            debug!("websocket writer backed up, oldest chunk displaced");
        }
        Ok(delivery)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Writer gone means the socket is already down.
        let _ = self.outbound.push(Message::Close(None));
        Ok(())
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
