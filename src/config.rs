//! Transport configuration (§6.2, §9 "process-wide mutable configuration statics").
//!
//! The original source kept these as static globals set once before
//! `start_host`/`start_client`. Per the REDESIGN FLAGS this is instead an
//! owned, `Clone`-able struct constructed by the embedder and handed to
//! [`crate::reliable::transport::ReliableTransport::new`] by value; no
//! global mutable state exists anywhere in this crate.

/// Default prefix bytes for the unreliable frame (§4.3); one of the two
/// profiles observed in the source (`{'A','N','K',0x02}`).
pub const ANKI_PREFIX: [u8; 4] = [b'A', b'N', b'K', 0x02];
/// The other observed profile (`{'C','O','Z',0x02}`).
pub const COZ_PREFIX: [u8; 4] = [b'C', b'O', b'Z', 0x02];

/// Header prefix bytes, 1 to 4 of them are significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPrefix {
	bytes: [u8; 4],
	len: u8,
}

impl HeaderPrefix {
	/// Build a prefix from 1..=4 bytes.
	pub fn new(bytes: &[u8]) -> Self {
		debug_assert!(!bytes.is_empty() && bytes.len() <= 4);
		let mut buf = [0u8; 4];
		buf[..bytes.len()].copy_from_slice(bytes);
		Self { bytes: buf, len: bytes.len() as u8 }
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.bytes[..self.len as usize]
	}

	pub fn len(&self) -> usize {
		self.len as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

impl Default for HeaderPrefix {
	fn default() -> Self {
		Self::new(&ANKI_PREFIX)
	}
}

/// Hard ceiling on a single datagram, MTU-bound (§4.3, §6.2).
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// All tunables from §6.2, gathered into one owned, `Clone`-able value.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
	/// Unreliable-frame header prefix (§4.3).
	pub header_prefix: HeaderPrefix,
	/// Whether a CRC-CCITT checksum follows the prefix.
	pub use_crc: bool,
	/// Hard cap on the size of one outbound datagram, including header.
	pub max_datagram_size: usize,

	/// Cadence of keep-alive pings, in milliseconds.
	pub ping_interval_ms: f64,
	/// Minimum time a reliable message waits before being considered due for resend.
	pub resend_interval_ms: f64,
	/// Longest time a connection may go without sending before a near-empty packet
	/// becomes "worth sending" anyway; defaults to `resend_interval_ms - 1`.
	pub max_time_since_last_send_ms: f64,
	/// Idle time after which a connection having received nothing is torn down.
	pub connection_timeout_ms: f64,
	/// Minimum time between successive outbound packets to the same peer (0 disables).
	pub packet_separation_interval_ms: f64,
	/// Grace period after which a packet having gone unacked counts as likely lost.
	pub min_expected_packet_ack_time_ms: f64,
	/// Depth of the ping round-trip-time ring buffer.
	pub max_ping_round_trips_to_track: usize,
	/// Depth of the ack round-trip-time ring buffer.
	pub max_ack_round_trips_to_track: usize,
	/// Packet budget for `send_optimal_unacked_packets` called from `update()`.
	pub max_packets_to_resend_on_update: u32,
	/// Packet budget for `send_optimal_unacked_packets` called after an ack.
	pub max_packets_to_resend_on_ack: u32,
	/// Packet budget for `send_optimal_unacked_packets` called opportunistically after `enqueue`.
	pub max_packets_to_send_on_send_message: u32,
	/// A packet within this many bytes of `max_payload_bytes` is always worth sending.
	pub max_bytes_free_in_full_packet: usize,
	/// If set, pings are sent on their own cadence rather than only as a keep-alive floor.
	pub send_separate_ping_messages: bool,
	/// If set, nearly-empty packets are always sent rather than coalesced.
	pub send_packets_immediately: bool,
	/// If set, a standalone `Ack` sub-message is enqueued on every accepted packet.
	pub send_ack_on_receipt: bool,
	/// If set, unreliable sends attempt to flush a packet immediately rather than
	/// waiting for the next scheduler tick.
	pub send_unreliable_messages_immediately: bool,
}

impl Config {
	/// `max_payload_bytes = max_datagram_size - header_size` (§4.3).
	pub fn max_payload_bytes(&self) -> usize {
		self.max_datagram_size - self.header_prefix.len() - if self.use_crc { 2 } else { 0 }
	}
}

impl Default for Config {
	/// The "33.3ms profile" observed in `ReliableUDPChannel::ConfigureReliableTransport`:
	/// pings and resends run close to the scheduler's own 2ms/2ms-class cadence rather
	/// than the coarser 250ms/50ms profile also seen in the source.
	fn default() -> Self {
		let resend_interval_ms = 33.3;
		Self {
			header_prefix: HeaderPrefix::default(),
			use_crc: true,
			max_datagram_size: MAX_DATAGRAM_SIZE,

			ping_interval_ms: 33.3,
			resend_interval_ms,
			max_time_since_last_send_ms: resend_interval_ms - 1.0,
			connection_timeout_ms: 5000.0,
			packet_separation_interval_ms: 2.0,
			min_expected_packet_ack_time_ms: 1.0,
			max_ping_round_trips_to_track: 20,
			max_ack_round_trips_to_track: 100,
			max_packets_to_resend_on_update: 3,
			max_packets_to_resend_on_ack: 1,
			max_packets_to_send_on_send_message: 1,
			max_bytes_free_in_full_packet: 44,
			send_separate_ping_messages: false,
			send_packets_immediately: false,
			send_ack_on_receipt: false,
			send_unreliable_messages_immediately: true,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn max_payload_bytes_accounts_for_prefix_and_crc() {
		let mut config = Config::default();
		config.header_prefix = HeaderPrefix::new(&ANKI_PREFIX);
		config.use_crc = true;
		assert_eq!(config.max_payload_bytes(), MAX_DATAGRAM_SIZE - 4 - 2);

		config.use_crc = false;
		assert_eq!(config.max_payload_bytes(), MAX_DATAGRAM_SIZE - 4);
	}
}
