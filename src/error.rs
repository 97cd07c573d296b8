//! Error taxonomy for the transport stack.
//!
//! Every error kind here is recoverable at the transport layer (§7): nothing
//! in this crate panics on a malformed or lost datagram. Counters in
//! [`crate::stats`] are incremented independently of whether a logger is
//! installed, so callers that never touch `log` still observe the outcome.

use crate::endpoint::Endpoint;

/// Errors surfaced by a [`DatagramSocket`](crate::socket::DatagramSocket) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
	/// No datagram is currently available; not a failure.
	#[error("would block")]
	WouldBlock,
	/// The socket is not bound/connected.
	#[error("not connected")]
	NotConnected,
	/// The socket id does not refer to an open socket.
	#[error("not a socket")]
	NotASocket,
	/// The requested local address is already bound.
	#[error("address in use")]
	AddressInUse,
	/// The socket registry has no free slots.
	#[error("too many open sockets")]
	TooManyOpen,
	/// Some other OS-level failure, identified by a raw error code.
	#[error("io error ({0})")]
	OtherIo(i32),
}

/// Errors encountered while framing or de-framing an unreliable datagram (§4.3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
	/// The datagram is smaller than the configured header.
	#[error("datagram too small to contain a header")]
	TooSmall,
	/// The datagram prefix does not match the configured prefix bytes.
	#[error("header prefix mismatch")]
	WrongHeader,
	/// The CRC-CCITT checksum did not match.
	#[error("CRC check failed")]
	BadCRC,
	/// An unrecognized sub-message class byte was encountered.
	#[error("unrecognized message class byte {0}")]
	BadType(u8),
	/// The socket reported truncation (the datagram did not fit the receive buffer).
	#[error("datagram was truncated")]
	TooBig,
}

/// Errors from the connection-lifecycle surface (§4.4.6, §4.6).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
	/// Attempted an action that requires a connection already in the map.
	#[error("no connection for endpoint {0}")]
	NoSuchConnection(Endpoint),
	/// Attempted an action not valid from the connection's current state.
	#[error("invalid state transition for endpoint {0}")]
	InvalidState(Endpoint),
	/// The `ConnectionId`/`Endpoint` bijection would be violated.
	#[error("connection id or endpoint already bound")]
	AlreadyBound,
}

/// Errors from the outgoing send path (§4.6, §7 "reaching a nullptr connection").
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
	/// The destination connection id is not active.
	#[error("connection is not active")]
	NotActive,
	/// The payload exceeds the transport's hard size limit even after fragmentation.
	#[error("payload too large to send")]
	PayloadTooLarge,
}

/// Umbrella error returned by the handful of entry points that can fail for
/// more than one reason (kept small; most of the public surface returns
/// `bool`/`Option` per spec §4.5-§4.6 rather than `Result`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
	#[error(transparent)]
	Socket(#[from] SocketError),
	#[error(transparent)]
	Frame(#[from] FrameError),
	#[error(transparent)]
	Connect(#[from] ConnectError),
	#[error(transparent)]
	Send(#[from] SendError),
}
