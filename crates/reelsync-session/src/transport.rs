//! Identity-addressed frame transport over WebSocket.
//!
//! One WebSocket binary message carries one frame set. Inside it, every frame
//! is a big-endian `u32` length followed by its bytes.
//!
//! A bound transport (server role) tags every inbound frame set with the
//! identity of the socket it came from, and [`Transport::send`] addresses a
//! peer by that identity. A connected transport (client role) has exactly one
//! peer and sends to it implicitly. Sends are best-effort: each peer has a
//! bounded outbound queue and a message that does not fit is dropped.

use crate::config::SessionConfig;
use futures_util::{SinkExt, StreamExt};
use reelsync_core::Frame;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Opaque name of one accepted socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A frame set and where it came from (`None` in the client role).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub peer: Option<PeerIdentity>,
    pub frames: Vec<Frame>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed frame set: {0}")]
    MalformedFrames(String),
    #[error("frame of {0} bytes does not fit a length prefix")]
    FrameTooLarge(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub outbound_capacity: usize,
    pub forced_poll: Duration,
}

impl TransportConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            outbound_capacity: config.outbound_queue_capacity,
            forced_poll: config.forced_poll(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_session(&SessionConfig::default())
    }
}

fn length_prefix(len: usize) -> Result<[u8; 4], TransportError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| TransportError::FrameTooLarge(len))
}

pub fn encode_frames(frames: &[Frame]) -> Result<Vec<u8>, TransportError> {
    let total = frames.iter().map(|f| 4 + f.len()).sum();
    let mut payload = Vec::with_capacity(total);
    for frame in frames {
        payload.extend_from_slice(&length_prefix(frame.len())?);
        payload.extend_from_slice(frame);
    }
    Ok(payload)
}

pub fn decode_frames(mut payload: &[u8]) -> Result<Vec<Frame>, TransportError> {
    let mut frames = Vec::new();
    while !payload.is_empty() {
        if payload.len() < 4 {
            return Err(TransportError::MalformedFrames("truncated length prefix".into()));
        }
        let (prefix, rest) = payload.split_at(4);
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if rest.len() < len {
            return Err(TransportError::MalformedFrames(format!(
                "frame declares {len} bytes, {} left",
                rest.len()
            )));
        }
        let (frame, rest) = rest.split_at(len);
        frames.push(frame.to_vec());
        payload = rest;
    }
    Ok(frames)
}

struct TransportInner {
    config: TransportConfig,
    local_addr: Option<SocketAddr>,
    peers: RefCell<HashMap<Option<PeerIdentity>, mpsc::Sender<Vec<u8>>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: RefCell<Option<mpsc::UnboundedReceiver<Inbound>>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    closed: Cell<bool>,
}

/// Must be used from within a `tokio::task::LocalSet`.
#[derive(Clone)]
pub struct Transport {
    inner: Rc<TransportInner>,
}

impl Transport {
    fn new(config: TransportConfig, local_addr: Option<SocketAddr>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Rc::new(TransportInner {
                config,
                local_addr,
                peers: RefCell::new(HashMap::new()),
                inbound_tx,
                inbound_rx: RefCell::new(Some(inbound_rx)),
                tasks: RefCell::new(Vec::new()),
                closed: Cell::new(false),
            }),
        }
    }

    /// Server role: listen on `addr` and accept any number of peers.
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;
        let transport = Self::new(config, Some(local_addr));

        let weak = Rc::downgrade(&transport.inner);
        let accept = tokio::task::spawn_local(async move {
            let mut accepted = 0u64;
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let Some(inner) = weak.upgrade() else { break };
                accepted += 1;
                let identity = PeerIdentity(format!("{remote}#{accepted}"));
                tracing::debug!(peer = %identity, "accepted socket");
                let weak = Rc::downgrade(&inner);
                let handshake = tokio::task::spawn_local(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => {
                            if let Some(inner) = weak.upgrade() {
                                attach(&inner, Some(identity), ws);
                            }
                        }
                        Err(e) => tracing::debug!(peer = %identity, "websocket handshake failed: {}", e),
                    }
                });
                inner.tasks.borrow_mut().push(handshake);
            }
        });
        transport.inner.tasks.borrow_mut().push(accept);
        tracing::info!("listening on ws://{}", local_addr);
        Ok(transport)
    }

    /// Client role: connect to a single host.
    pub async fn connect(host: &str, port: u16, config: TransportConfig) -> Result<Self, TransportError> {
        let invalid = |reason: String| TransportError::InvalidAddress {
            addr: format!("{host}:{port}"),
            reason,
        };
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| invalid(e.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(invalid("host resolved to no addresses".into()));
        }
        // "localhost" may resolve to ::1 first while the host only listens on IPv4.
        let mut last_error = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(source) => last_error = Some(TransportError::Connect { addr, source }),
            }
        }
        let stream = match (connected, last_error) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(e),
            (None, None) => return Err(invalid("host resolved to no addresses".into())),
        };
        let url = format!("ws://{host}:{port}/");
        let (ws, _) = tokio_tungstenite::client_async(url, stream).await?;

        let transport = Self::new(config, None);
        attach(&transport.inner, None, ws);
        Ok(transport)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Hand every received batch to `on_batch`.
    ///
    /// The queue is woken by arrivals and also polled every
    /// `forced_poll` in case a wake-up goes missing. A batch is delivered
    /// only after the previous callback returned, and reading stops once the
    /// transport is closed from inside the callback.
    pub fn start_reading(&self, mut on_batch: impl FnMut(Vec<Inbound>) + 'static) {
        let Some(mut inbound) = self.inner.inbound_rx.borrow_mut().take() else {
            tracing::warn!("transport is already being read");
            return;
        };
        let weak = Rc::downgrade(&self.inner);
        let forced_poll = self.inner.config.forced_poll;
        let reader = tokio::task::spawn_local(async move {
            let mut poll = tokio::time::interval(forced_poll);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let mut batch = Vec::new();
                tokio::select! {
                    received = inbound.recv() => match received {
                        Some(frames) => batch.push(frames),
                        None => break,
                    },
                    _ = poll.tick() => {}
                }
                while let Ok(frames) = inbound.try_recv() {
                    batch.push(frames);
                }
                if batch.is_empty() {
                    continue;
                }
                on_batch(batch);
                match weak.upgrade() {
                    Some(inner) if !inner.closed.get() => {}
                    _ => break,
                }
            }
        });
        self.inner.tasks.borrow_mut().push(reader);
    }

    /// Queue a frame set. `peer` is ignored in the client role.
    pub fn send(&self, peer: Option<&PeerIdentity>, frames: &[Frame]) {
        if self.inner.closed.get() {
            tracing::debug!("dropping frames on a closed transport");
            return;
        }
        let key = match self.inner.local_addr {
            Some(_) => peer.cloned(),
            None => None,
        };
        let peers = self.inner.peers.borrow();
        let Some(outbound) = peers.get(&key) else {
            tracing::debug!(peer = ?key, "dropping frames for unknown peer");
            return;
        };
        let payload = match encode_frames(frames) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(peer = ?key, "dropping message: {}", e);
                return;
            }
        };
        match outbound.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(peer = ?key, "outbound queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(peer = ?key, "peer socket closed, dropping message");
            }
        }
    }

    /// Hang up on one peer once its queued frames are flushed.
    pub fn drop_peer(&self, peer: &PeerIdentity) {
        if self.inner.peers.borrow_mut().remove(&Some(peer.clone())).is_some() {
            tracing::debug!(peer = %peer, "hanging up");
        }
    }

    /// Sockets that are still open for sending.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.borrow().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Stop reading and accepting. Already queued frames are still flushed.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl TransportInner {
    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        // Writers end on their own once their queue drains.
        self.peers.borrow_mut().clear();
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        self.close();
    }
}

fn attach<S>(inner: &Rc<TransportInner>, identity: Option<PeerIdentity>, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    if inner.closed.get() {
        return;
    }
    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(inner.config.outbound_capacity);
    inner.peers.borrow_mut().insert(identity.clone(), outbound_tx);

    let peer = identity.clone();
    tokio::task::spawn_local(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if let Err(e) = sink.send(WsMessage::Binary(payload.into())).await {
                tracing::debug!(peer = ?peer, "write failed: {}", e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    let inbound_tx = inner.inbound_tx.clone();
    let weak: Weak<TransportInner> = Rc::downgrade(inner);
    let reader = tokio::task::spawn_local(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(WsMessage::Binary(data)) => match decode_frames(&data) {
                    Ok(frames) => {
                        let inbound = Inbound {
                            peer: identity.clone(),
                            frames,
                        };
                        if inbound_tx.send(inbound).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(peer = ?identity, "{}", e),
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(peer = ?identity, "read failed: {}", e);
                    break;
                }
            }
        }
        if let Some(inner) = weak.upgrade() {
            inner.peers.borrow_mut().remove(&identity);
        }
        tracing::debug!(peer = ?identity, "socket closed");
    });
    inner.tasks.borrow_mut().push(reader);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    #[test]
    fn frames_are_length_prefixed() {
        let frames = vec![b"Ping".to_vec(), Vec::new(), b"broadcast".to_vec()];
        let payload = encode_frames(&frames).unwrap();
        assert_eq!(&payload[..4], &4u32.to_be_bytes());
        assert_eq!(decode_frames(&payload).unwrap(), frames);
        assert!(decode_frames(&payload[..payload.len() - 1]).is_err());
        assert!(decode_frames(&[0, 0]).is_err());
    }

    #[test]
    fn oversized_frame_has_no_length_prefix() {
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), [0xff; 4]);
        #[cfg(target_pointer_width = "64")]
        {
            let len = u32::MAX as usize + 1;
            assert!(matches!(length_prefix(len), Err(TransportError::FrameTooLarge(n)) if n == len));
            assert!(matches!(length_prefix(usize::MAX), Err(TransportError::FrameTooLarge(_))));
        }
    }

    async fn wait_for<T>(inbox: &Rc<RefCell<Vec<T>>>, count: usize) {
        for _ in 0..200 {
            if inbox.borrow().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} frame sets");
    }

    #[tokio::test]
    async fn server_replies_by_identity() {
        LocalSet::new()
            .run_until(async {
                let server = Transport::bind(([127, 0, 0, 1], 0).into(), TransportConfig::default())
                    .await
                    .unwrap();
                let port = server.local_addr().unwrap().port();

                let received = Rc::new(RefCell::new(Vec::new()));
                let sink = received.clone();
                let echo = server.clone();
                server.start_reading(move |batch| {
                    for inbound in batch {
                        let mut reply = inbound.frames.clone();
                        reply.push(b"ack".to_vec());
                        echo.send(inbound.peer.as_ref(), &reply);
                        sink.borrow_mut().push(inbound);
                    }
                });

                let client = Transport::connect("127.0.0.1", port, TransportConfig::default())
                    .await
                    .unwrap();
                let replies = Rc::new(RefCell::new(Vec::new()));
                let inbox = replies.clone();
                client.start_reading(move |batch| inbox.borrow_mut().extend(batch));
                client.send(None, &[b"hello".to_vec()]);

                wait_for(&replies, 1).await;
                assert!(received.borrow()[0].peer.is_some());
                assert_eq!(replies.borrow()[0].peer, None);
                assert_eq!(replies.borrow()[0].frames, vec![b"hello".to_vec(), b"ack".to_vec()]);

                client.close();
                client.close();
                assert!(client.is_closed());
                server.close();
            })
            .await;
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        LocalSet::new()
            .run_until(async {
                let first = Transport::bind(([127, 0, 0, 1], 0).into(), TransportConfig::default())
                    .await
                    .unwrap();
                let taken = first.local_addr().unwrap();
                let second = Transport::bind(taken, TransportConfig::default()).await;
                assert!(matches!(second, Err(TransportError::Bind { .. })));
            })
            .await;
    }

    #[tokio::test]
    async fn unresolvable_host_is_invalid_address() {
        LocalSet::new()
            .run_until(async {
                let result = Transport::connect("host.invalid", 9000, TransportConfig::default()).await;
                assert!(matches!(result, Err(TransportError::InvalidAddress { .. })));
            })
            .await;
    }
}
