//! The reliability layer (L3/L4, §4.4-§4.5): sequence ids, per-connection
//! scheduling, and the transport that owns the connection table.

pub mod connection;
pub mod pending;
pub mod transport;

use std::num::Wrapping;

pub use connection::ReliableConnection;
pub use transport::ReliableTransport;

/// A 16-bit wrap-around reliable sequence id (§3.5). `0` is reserved to mean
/// "invalid / no reliable content"; the usable range is `1..=65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqId(pub u16);

impl SeqId {
	pub const INVALID: SeqId = SeqId(0);
	pub const FIRST: SeqId = SeqId(1);

	pub fn is_valid(self) -> bool {
		self.0 != 0
	}

	/// The successor, wrapping `65535 -> 1` and always skipping `0` (§3.5).
	pub fn successor(self) -> SeqId {
		let next = (Wrapping(self.0) + Wrapping(1)).0;
		SeqId(if next == 0 { 1 } else { next })
	}

	/// Whether `self` lies in the wrap-aware inclusive range `[a, b]`,
	/// reached by repeatedly taking successors from `a` (§3.5).
	pub fn in_range(self, a: SeqId, b: SeqId) -> bool {
		if !a.is_valid() || !b.is_valid() || !self.is_valid() {
			return false;
		}
		let span = distance(b, a);
		let offset = distance(self, a);
		offset <= span
	}
}

/// Forward distance from `from` to `to` within the usable `1..=65535` ring,
/// i.e. the number of `successor()` calls needed to go from `from` to `to`.
pub fn distance(to: SeqId, from: SeqId) -> u32 {
	const RANGE: u32 = 65535;
	let to = to.0 as u32;
	let from = from.0 as u32;
	if to >= from {
		to - from
	} else {
		RANGE - (from - to)
	}
}

/// Message class byte (§3.4). "Always-unreliable" classes never carry a
/// reliable sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageClass {
	SingleReliable = 0,
	SingleUnreliable = 1,
	MultiPartMessage = 2,
	MultipleReliableMessages = 3,
	MultipleUnreliableMessages = 4,
	MultipleMixedMessages = 5,
	Ack = 6,
	Ping = 7,
	ConnectionRequest = 8,
	ConnectionResponse = 9,
	DisconnectRequest = 10,
}

impl MessageClass {
	pub fn is_always_unreliable(self) -> bool {
		matches!(self, Self::SingleUnreliable | Self::MultipleUnreliableMessages | Self::Ack | Self::Ping)
	}

	pub fn from_byte(byte: u8) -> Option<Self> {
		Some(match byte {
			0 => Self::SingleReliable,
			1 => Self::SingleUnreliable,
			2 => Self::MultiPartMessage,
			3 => Self::MultipleReliableMessages,
			4 => Self::MultipleUnreliableMessages,
			5 => Self::MultipleMixedMessages,
			6 => Self::Ack,
			7 => Self::Ping,
			8 => Self::ConnectionRequest,
			9 => Self::ConnectionResponse,
			10 => Self::DisconnectRequest,
			_ => return None,
		})
	}
}

/// Per-connection lifecycle state (§4.4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	WaitingForConnectionResponse,
	MustSendConnectionResponse,
	Connected,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn successor_wraps_skipping_zero() {
		assert_eq!(SeqId(65535).successor(), SeqId(1));
		assert_eq!(SeqId(1).successor(), SeqId(2));
	}

	#[test]
	fn distance_handles_wraparound() {
		assert_eq!(distance(SeqId(1), SeqId(65535)), 1);
		assert_eq!(distance(SeqId(5), SeqId(5)), 0);
		assert_eq!(distance(SeqId(10), SeqId(5)), 5);
	}

	#[test]
	fn in_range_across_wrap_boundary() {
		assert!(SeqId(1).in_range(SeqId(65535), SeqId(2)));
		assert!(SeqId(65535).in_range(SeqId(65535), SeqId(2)));
		assert!(!SeqId(3).in_range(SeqId(65535), SeqId(2)));
	}

	#[test]
	fn invalid_id_is_never_in_range() {
		assert!(!SeqId::INVALID.in_range(SeqId(1), SeqId(10)));
	}

	#[test]
	fn message_class_round_trips_through_byte() {
		for class in [
			MessageClass::SingleReliable,
			MessageClass::Ping,
			MessageClass::DisconnectRequest,
		] {
			assert_eq!(MessageClass::from_byte(class as u8), Some(class));
		}
		assert_eq!(MessageClass::from_byte(255), None);
	}
}
