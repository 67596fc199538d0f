//! Peer transports, wire protocol, and the peer/picker manager.

pub mod handshake;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod transport;

pub use protocol::{PeerId, PeerInfo, PeerSession, ProtocolError};
