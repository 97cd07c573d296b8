//! Reliable, ordered, multiplexed message transport over an unreliable
//! datagram socket, for robot/basestation links (spec §1-§2).
//!
//! Layers, bottom to top: [`socket`] (L0 raw datagrams), [`emulator`] (L1
//! loss/latency injection), [`unreliable`] (L2 framing), [`reliable`] (L3/L4
//! per-peer reliability and the connection-table scheduler), and [`channel`]
//! (L5 the `ConnectionId`-keyed application surface).

#![warn(clippy::all)]
#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

pub mod channel;
pub mod config;
pub mod crc;
pub mod emulator;
pub mod endpoint;
pub mod error;
pub mod reliable;
pub mod socket;
pub mod stats;
pub mod time;
pub mod unreliable;

pub use channel::{Channel, ConnectionId, IncomingPacket, IncomingTag, OutgoingPacket};
pub use endpoint::Endpoint;
pub use error::{ConnectError, FrameError, SendError, SocketError, TransportError};
pub use reliable::{ConnectionState, ReliableTransport};
