//! Rendezvous client: one long-lived signaling session.

use super::protocol::{ClientMessage, ErrorCode, RendezvousError, ServerMessage};
use crate::peer::{PeerId, PeerRecord};
use crate::region::RegionId;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Client-side WebSocket stream
type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Rendezvous client configuration
#[derive(Debug, Clone)]
pub struct RendezvousClientConfig {
    /// Server URL, `ws://host:port`
    pub server_url: String,
    /// Region announced at registration
    pub region: Option<RegionId>,
    /// Limit on connect plus registration acknowledgement
    pub register_timeout: Duration,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
}

impl Default for RendezvousClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8765".to_string(),
            region: None,
            register_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

impl RendezvousClientConfig {
    /// Configuration for a server URL with default timings
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Check configuration invariants
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError::InvalidConfig` for a non-WebSocket URL or a
    /// zero interval.
    pub fn validate(&self) -> Result<(), RendezvousError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(RendezvousError::InvalidConfig(format!(
                "server_url must be a ws:// or wss:// URL, got {}",
                self.server_url
            )));
        }
        if self.register_timeout.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(RendezvousError::InvalidConfig(
                "timeouts and intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Rendezvous session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Opening the connection and awaiting registration
    Connecting,
    /// Session id assigned, I/O tasks not yet running
    Registered,
    /// Able to send and receive
    Connected,
    /// Terminal; every send fails with `NotConnected`
    Disconnected,
}

/// Events delivered to the session owner
#[derive(Debug, Clone, PartialEq)]
pub enum RendezvousEvent {
    /// Pushed peer list, including this session
    PeerList(Vec<PeerRecord>),
    /// Directed message from another peer
    Directed {
        /// Sender, as stamped by the server
        from: PeerId,
        /// Application message type
        kind: String,
        /// Application payload
        data: Value,
    },
    /// Broadcast from another peer
    Broadcast {
        /// Sender, as stamped by the server
        from: PeerId,
        /// Application message type
        kind: String,
        /// Application payload
        payload: Value,
    },
    /// A directed message was not delivered because the recipient is gone
    DeliveryFailed {
        /// Intended recipient
        to: PeerId,
    },
    /// The session ended
    Disconnected,
}

/// Receiver for session events
pub type EventReceiver = mpsc::UnboundedReceiver<RendezvousEvent>;

enum Outbound {
    Frame {
        text: String,
        ack: oneshot::Sender<Result<(), RendezvousError>>,
    },
    Close,
}

/// Handle to a registered rendezvous session
///
/// Cloning yields another handle to the same session. A session never
/// reconnects: after `Disconnected`, call [`RendezvousClient::connect`] again
/// and expect a different [`PeerId`].
#[derive(Clone)]
pub struct RendezvousClient {
    peer_id: PeerId,
    server_url: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ChannelState>,
}

impl RendezvousClient {
    /// Connect, register, and start the session's I/O tasks
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError::Timeout` if connect plus registration exceeds
    /// the configured limit, `RendezvousError::Registration` if the server
    /// refuses, or a transport error.
    pub async fn connect(
        config: RendezvousClientConfig,
    ) -> Result<(Self, EventReceiver), RendezvousError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let state_tx = Arc::new(state_tx);

        let (ws, peer_id) = time::timeout(config.register_timeout, handshake(&config))
            .await
            .map_err(|_| RendezvousError::Timeout)??;
        state_tx.send_replace(ChannelState::Registered);
        tracing::info!(
            "Registered with {} as {}",
            config.server_url,
            peer_id.short()
        );

        let (sink, source) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_loop(sink, outbound_rx, state_tx.clone()));
        tokio::spawn(reader_loop(source, event_tx, state_tx.clone()));
        tokio::spawn(heartbeat_loop(
            outbound_tx.clone(),
            state_rx.clone(),
            config.heartbeat_interval,
        ));

        state_tx.send_replace(ChannelState::Connected);

        Ok((
            Self {
                peer_id,
                server_url: config.server_url,
                outbound: outbound_tx,
                state: state_rx,
            },
            event_rx,
        ))
    }

    /// Session id assigned by the server
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Server URL
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Watch channel following the session state
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Send a directed message to one peer
    ///
    /// Resolves once the frame is written to the socket. Delivery to a peer
    /// that is not connected is reported later as
    /// [`RendezvousEvent::DeliveryFailed`].
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError::NotConnected` if the session is down or goes
    /// down before the frame is written.
    pub async fn send_to(
        &self,
        to: &PeerId,
        kind: impl Into<String>,
        data: Value,
    ) -> Result<(), RendezvousError> {
        self.send(ClientMessage::Directed {
            to: to.clone(),
            kind: kind.into(),
            data,
        })
        .await
    }

    /// Broadcast to every other connected peer
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError::NotConnected` if the session is down.
    pub async fn broadcast(
        &self,
        kind: impl Into<String>,
        payload: Value,
    ) -> Result<(), RendezvousError> {
        self.send(ClientMessage::Broadcast {
            kind: kind.into(),
            payload,
        })
        .await
    }

    /// Close the session
    pub fn disconnect(&self) {
        if self.outbound.send(Outbound::Close).is_ok() {
            tracing::info!("Disconnecting session {}", self.peer_id.short());
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), RendezvousError> {
        if self.state() == ChannelState::Disconnected {
            return Err(RendezvousError::NotConnected);
        }
        let text = msg.to_text()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Frame { text, ack: ack_tx })
            .map_err(|_| RendezvousError::NotConnected)?;
        ack_rx.await.map_err(|_| RendezvousError::NotConnected)?
    }
}

/// Open the socket and wait for the registration acknowledgement
async fn handshake(
    config: &RendezvousClientConfig,
) -> Result<(ClientWs, PeerId), RendezvousError> {
    let (mut ws, _) = connect_async(config.server_url.as_str()).await?;

    let register = ClientMessage::Register {
        region: config.region,
    };
    ws.send(Message::Text(register.to_text()?)).await?;

    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Err(RendezvousError::ConnectionClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        match ServerMessage::from_text(&text) {
            Ok(ServerMessage::Registered { peer_id }) => return Ok((ws, peer_id)),
            Ok(ServerMessage::Error { message, .. }) => {
                return Err(RendezvousError::Registration(message));
            }
            Ok(other) => {
                tracing::debug!("Ignoring {} before registration", other.message_type());
            }
            Err(e) => tracing::warn!("Dropping malformed frame during registration: {}", e),
        }
    }
}

async fn writer_loop(
    mut sink: SplitSink<ClientWs, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<watch::Sender<ChannelState>>,
) {
    let mut state_rx = state.subscribe();

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Frame { text, ack }) => {
                    let result = sink
                        .send(Message::Text(text))
                        .await
                        .map_err(|_| RendezvousError::NotConnected);
                    let failed = result.is_err();
                    let _ = ack.send(result);
                    if failed {
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() == ChannelState::Disconnected {
                    break;
                }
            }
        }
    }

    state.send_replace(ChannelState::Disconnected);
    outbound.close();
    while let Ok(pending) = outbound.try_recv() {
        if let Outbound::Frame { ack, .. } = pending {
            let _ = ack.send(Err(RendezvousError::NotConnected));
        }
    }
    let _ = sink.close().await;
}

async fn reader_loop(
    mut source: SplitStream<ClientWs>,
    events: mpsc::UnboundedSender<RendezvousEvent>,
    state: Arc<watch::Sender<ChannelState>>,
) {
    let mut state_rx = state.subscribe();

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_text(&text) {
                    Ok(msg) => {
                        if let Some(event) = into_event(msg) {
                            let _ = events.send(event);
                        }
                    }
                    Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Rendezvous read error: {}", e);
                    break;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() == ChannelState::Disconnected {
                    break;
                }
            }
        }
    }

    state.send_replace(ChannelState::Disconnected);
    tracing::info!("Rendezvous session closed");
    let _ = events.send(RendezvousEvent::Disconnected);
}

fn into_event(msg: ServerMessage) -> Option<RendezvousEvent> {
    match msg {
        ServerMessage::Peers { peers } => Some(RendezvousEvent::PeerList(peers)),
        ServerMessage::Directed { from, kind, data } => {
            tracing::trace!("Directed {} from {}", kind, from.short());
            Some(RendezvousEvent::Directed { from, kind, data })
        }
        ServerMessage::Broadcast {
            from,
            kind,
            payload,
        } => Some(RendezvousEvent::Broadcast {
            from,
            kind,
            payload,
        }),
        ServerMessage::Error {
            code: ErrorCode::PeerNotFound,
            to: Some(to),
            ..
        } => {
            tracing::debug!("Delivery to {} failed: peer not connected", to.short());
            Some(RendezvousEvent::DeliveryFailed { to })
        }
        ServerMessage::Error { code, message, .. } => {
            tracing::warn!("Rendezvous server error {:?}: {}", code, message);
            None
        }
        ServerMessage::Registered { .. } => {
            tracing::debug!("Ignoring repeated registration acknowledgement");
            None
        }
    }
}

/// Send heartbeats until the session ends
async fn heartbeat_loop(
    outbound: mpsc::UnboundedSender<Outbound>,
    mut state: watch::Receiver<ChannelState>,
    interval: Duration,
) {
    let mut ticker = time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Ok(text) = ClientMessage::Heartbeat.to_text() else {
                    break;
                };
                let (ack, _) = oneshot::channel();
                if outbound.send(Outbound::Frame { text, ack }).is_err() {
                    break;
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ChannelState::Disconnected {
                    break;
                }
            }
        }
    }
}
