//! Rendezvous signaling channel.
//!
//! Peers hold one WebSocket session each with a rendezvous server. The server
//! assigns a session [`PeerId`](crate::peer::PeerId), pushes the live peer set,
//! and relays directed and broadcast messages. Delivery is at most once and a
//! message for a peer that is not connected is never queued.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ChannelState, EventReceiver, RendezvousClient, RendezvousClientConfig, RendezvousEvent};
pub use protocol::{ClientMessage, ErrorCode, RendezvousError, ServerMessage};
pub use server::{RendezvousServer, RendezvousServerConfig, RendezvousServerHandle};
