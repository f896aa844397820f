//! # Shoal Discovery
//!
//! Finding peers for the Shoal multi-source downloader.
//!
//! This crate provides:
//! - A region classifier mapping coordinates and timezone ids to coarse regions
//! - Session peer ids and the process-wide peer table
//! - The rendezvous signaling protocol, server and client

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod peer;
pub mod region;
pub mod rendezvous;

pub use peer::{PeerId, PeerRecord, PeerTable, now_millis};
pub use region::{Coordinate, Region, RegionCatalogue, RegionError, RegionId};
pub use rendezvous::{
    ChannelState, ClientMessage, EventReceiver, RendezvousClient, RendezvousClientConfig,
    RendezvousError, RendezvousEvent, RendezvousServer, RendezvousServerConfig,
    RendezvousServerHandle, ServerMessage,
};
