//! Per-peer reliable connection state (L3, §4.4).

use log::{debug, warn};

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::{FrameError, SocketError};
use crate::stats::{ConnectionStats, RecentStats};

use super::pending::{PendingList, PendingMessage, PendingMultiPart};
use super::{distance, ConnectionState, MessageClass, SeqId};

/// Fixed prefix of the 10-byte reliable header (§4.4.1).
pub const RELIABLE_PREFIX: [u8; 3] = [b'R', b'E', 0x01];
/// Size in bytes of the reliable header.
pub const RELIABLE_HEADER_SIZE: usize = 10;
/// Overhead of one sub-message framing tuple: class byte + 16-bit length.
pub const SUBMESSAGE_HEADER_SIZE: usize = 3;
/// Overhead of a multi-part chunk header: part index + total parts.
pub const MULTIPART_HEADER_SIZE: usize = 2;
/// Size of the ping payload (§6.1).
pub const PING_PAYLOAD_SIZE: usize = 17;

/// Events a [`ReliableConnection`] raises for the application/channel layer
/// to observe (§4.4.3, §4.4.6).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
	OnConnectRequest,
	OnConnected,
	OnDisconnected,
	NormalMessage(Vec<u8>),
}

/// Parsed reliable header (§4.4.1).
#[derive(Debug, Clone, Copy)]
struct Header {
	class: MessageClass,
	seq_min: SeqId,
	seq_max: SeqId,
	last_received: SeqId,
}

fn encode_header(buf: &mut Vec<u8>, header: Header) {
	buf.extend_from_slice(&RELIABLE_PREFIX);
	buf.push(header.class as u8);
	buf.extend_from_slice(&header.seq_min.0.to_be_bytes());
	buf.extend_from_slice(&header.seq_max.0.to_be_bytes());
	buf.extend_from_slice(&header.last_received.0.to_be_bytes());
}

fn decode_header(bytes: &[u8]) -> Result<(Header, &[u8]), FrameError> {
	if bytes.len() < RELIABLE_HEADER_SIZE {
		return Err(FrameError::TooSmall);
	}
	if bytes[0..3] != RELIABLE_PREFIX[..] {
		return Err(FrameError::WrongHeader);
	}
	let class = MessageClass::from_byte(bytes[3]).ok_or(FrameError::BadType(bytes[3]))?;
	let seq_min = SeqId(u16::from_be_bytes([bytes[4], bytes[5]]));
	let seq_max = SeqId(u16::from_be_bytes([bytes[6], bytes[7]]));
	let last_received = SeqId(u16::from_be_bytes([bytes[8], bytes[9]]));
	Ok((Header { class, seq_min, seq_max, last_received }, &bytes[RELIABLE_HEADER_SIZE..]))
}

fn encode_ping_payload(sender_time_ms: f64, pings_sent: u32, pings_received: u32, is_reply: bool) -> Vec<u8> {
	let mut out = Vec::with_capacity(PING_PAYLOAD_SIZE);
	out.extend_from_slice(&sender_time_ms.to_ne_bytes());
	out.extend_from_slice(&pings_sent.to_ne_bytes());
	out.extend_from_slice(&pings_received.to_ne_bytes());
	out.push(is_reply as u8);
	out
}

fn decode_ping_payload(bytes: &[u8]) -> Option<(f64, u32, u32, bool)> {
	if bytes.len() < PING_PAYLOAD_SIZE {
		return None;
	}
	let sender_time_ms = f64::from_ne_bytes(bytes[0..8].try_into().unwrap());
	let pings_sent = u32::from_ne_bytes(bytes[8..12].try_into().unwrap());
	let pings_received = u32::from_ne_bytes(bytes[12..16].try_into().unwrap());
	let is_reply = bytes[16] != 0;
	Some((sender_time_ms, pings_sent, pings_received, is_reply))
}

/// Per-peer reliable delivery state: sequencing, the pending/retransmit
/// queue, ping RTT, reassembly buffer, and timeout bookkeeping (§3.6).
pub struct ReliableConnection {
	pub peer: Endpoint,
	pub state: ConnectionState,
	config: Config,
	max_payload_bytes: usize,

	next_out_seq: SeqId,
	pending: PendingList,
	last_in_acked: SeqId,
	/// Highest self-assigned (outgoing) id the peer has reported receiving so
	/// far, i.e. the previous value of the incoming `last_received` header
	/// field; the boundary `acknowledge_up_to` needs to avoid re-scanning
	/// already-acknowledged ids on every packet (§4.4.3).
	last_out_acked: SeqId,
	next_in_seq: SeqId,
	reassembly: PendingMultiPart,

	last_sent_ms: f64,
	last_recv_ms: f64,
	last_ping_sent_ms: f64,
	last_packet_sent_ms: f64,

	pub ack_round_trip_times: RecentStats,
	pub ping_round_trip_times: RecentStats,
	/// Time from a message being enqueued in this connection's pending list
	/// to its first send, sampled from `PendingMessage::queued_at_ms` (§3.6).
	pub queued_time: RecentStats,
	pub stats: ConnectionStats,
}

impl ReliableConnection {
	pub fn new(peer: Endpoint, config: Config, max_payload_bytes: usize, now_ms: f64) -> Self {
		let max_ping = config.max_ping_round_trips_to_track;
		let max_ack = config.max_ack_round_trips_to_track;
		Self {
			peer,
			state: ConnectionState::Disconnected,
			config,
			max_payload_bytes,
			next_out_seq: SeqId::FIRST,
			pending: PendingList::new(),
			last_in_acked: SeqId::INVALID,
			last_out_acked: SeqId::INVALID,
			next_in_seq: SeqId::FIRST,
			reassembly: PendingMultiPart::default(),
			last_sent_ms: now_ms,
			last_recv_ms: now_ms,
			last_ping_sent_ms: now_ms,
			last_packet_sent_ms: f64::NEG_INFINITY,
			ack_round_trip_times: RecentStats::new(max_ack),
			ping_round_trip_times: RecentStats::new(max_ping),
			queued_time: RecentStats::new(max_ack),
			stats: ConnectionStats::default(),
		}
	}

	/// §3.6 invariant: `next_in_seq == successor(last_in_acked)`.
	pub fn invariants_hold(&self) -> bool {
		self.next_in_seq == self.last_in_acked.successor_or_first()
			&& self.pending.iter().filter(|m| m.is_reliable()).map(|m| m.seq_id).is_sorted_by_distance()
	}

	fn reliable_payload_budget(&self) -> usize {
		self.max_payload_bytes.saturating_sub(RELIABLE_HEADER_SIZE)
	}

	/// The largest a single (unsplit) message payload may be (§4.4.2 step 1).
	pub fn max_single_message_len(&self) -> usize {
		self.reliable_payload_budget().saturating_sub(MULTIPART_HEADER_SIZE)
	}

	fn next_seq(&mut self) -> SeqId {
		let id = self.next_out_seq;
		self.next_out_seq = self.next_out_seq.successor();
		id
	}

	/// Enqueue application data or a control message (§4.4.2).
	pub fn enqueue(&mut self, bytes: &[u8], class: MessageClass, reliable: bool, flush: bool, now_ms: f64) {
		let threshold = self.max_single_message_len();
		if bytes.len() > threshold && !matches!(class, MessageClass::MultiPartMessage) {
			self.enqueue_fragmented(bytes, flush, now_ms, threshold);
			return;
		}
		let seq_id = if reliable { self.next_seq() } else { SeqId::INVALID };
		self.push_pending(bytes.to_vec(), class, seq_id, flush, now_ms);
	}

	fn enqueue_fragmented(&mut self, bytes: &[u8], flush: bool, now_ms: f64, threshold: usize) {
		let total_parts = ((bytes.len() + threshold - 1) / threshold).max(1);
		debug_assert!(total_parts <= u8::MAX as usize, "message too large to fragment into at most 255 parts");
		let total_parts = total_parts.min(u8::MAX as usize) as u8;
		let chunk_size = (bytes.len() + total_parts as usize - 1) / total_parts as usize;
		for (i, chunk) in bytes.chunks(chunk_size.max(1)).enumerate() {
			let mut payload = Vec::with_capacity(MULTIPART_HEADER_SIZE + chunk.len());
			payload.push((i + 1) as u8);
			payload.push(total_parts);
			payload.extend_from_slice(chunk);
			let seq_id = self.next_seq();
			self.push_pending(payload, MessageClass::MultiPartMessage, seq_id, flush, now_ms);
		}
	}

	fn push_pending(&mut self, payload: Vec<u8>, class: MessageClass, seq_id: SeqId, flush: bool, now_ms: f64) {
		self.pending.push_back(PendingMessage { payload, class, seq_id, flush, queued_at_ms: now_ms, first_sent_ms: None, last_sent_ms: None });
	}

	/// §4.4.4 "worth sending" policy, evaluated against the chosen anchor.
	fn is_worth_sending(&self, now_ms: f64, anchor_index: usize, next_packet_bytes: usize) -> bool {
		if self.config.send_packets_immediately {
			return true;
		}
		if now_ms - self.last_sent_ms > self.config.max_time_since_last_send_ms {
			return true;
		}
		let Some(anchor) = self.pending.get(anchor_index) else { return false };
		if anchor.flush {
			return true;
		}
		if let Some(last_sent) = anchor.last_sent_ms {
			if now_ms - last_sent > self.config.resend_interval_ms {
				return true;
			}
		} else {
			return true;
		}
		if next_packet_bytes + self.config.max_bytes_free_in_full_packet >= self.max_payload_bytes {
			return true;
		}
		false
	}

	fn packet_separation_elapsed(&self, now_ms: f64) -> bool {
		self.config.packet_separation_interval_ms <= 0.0
			|| now_ms - self.last_packet_sent_ms >= self.config.packet_separation_interval_ms
	}

	/// Core scheduler (§4.4.2): pack as many due pending messages as fit into
	/// one datagram, hand it to `send`, and repeat up to `budget` times.
	pub fn send_optimal_unacked_packets(
		&mut self,
		budget: u32,
		now_ms: f64,
		mut send: impl FnMut(&[u8]) -> Result<usize, SocketError>,
	) -> u32 {
		let mut sent_packets = 0;
		while sent_packets < budget {
			if self.pending.is_empty() || !self.packet_separation_elapsed(now_ms) {
				break;
			}
			let Some(anchor_index) = self.pending.position_of_anchor(
				now_ms,
				self.config.resend_interval_ms,
				self.last_recv_ms,
				self.config.min_expected_packet_ack_time_ms,
			) else {
				break;
			};

			let (included, body, seq_min, seq_max, any_unreliable, any_reliable) = self.gather_packet(anchor_index);

			if !self.is_worth_sending(now_ms, anchor_index, body.len() + RELIABLE_HEADER_SIZE) {
				break;
			}

			// A lone sub-message keeps its own class in the header (so control
			// messages like ConnectionRequest/ConnectionResponse/Ack survive);
			// only a genuinely bundled packet needs the synthetic Multiple*
			// class, since each bundled sub-message already carries its own
			// class byte in its framing tuple.
			let class = if included.len() == 1 {
				self.pending.get(included[0]).unwrap().class
			} else {
				packet_class(any_reliable, any_unreliable)
			};
			let mut framed = Vec::with_capacity(RELIABLE_HEADER_SIZE + body.len());
			encode_header(&mut framed, Header { class, seq_min, seq_max, last_received: self.last_in_acked });
			framed.extend_from_slice(&body);

			match send(&framed) {
				Ok(_) => {
					self.last_sent_ms = now_ms;
					self.last_packet_sent_ms = now_ms;
					self.apply_send_bookkeeping(&included, now_ms);
					sent_packets += 1;
				}
				Err(err) => {
					warn!("send to {} failed: {}", self.peer, err);
					break;
				}
			}
		}
		sent_packets
	}

	/// Greedily gather consecutive pending messages starting at `anchor_index`
	/// that fit into one packet, plus opportunistically any earlier pending
	/// messages that also still fit (§4.4.2).
	fn gather_packet(&self, anchor_index: usize) -> (Vec<usize>, Vec<u8>, SeqId, SeqId, bool, bool) {
		let mut included = Vec::new();
		let mut body = Vec::new();
		let mut seq_min = SeqId::INVALID;
		let mut seq_max = SeqId::INVALID;
		let mut any_unreliable = false;
		let mut any_reliable = false;

		let mut try_add = |index: usize, body: &mut Vec<u8>, included: &mut Vec<usize>| -> bool {
			let Some(message) = self.pending.get(index) else { return false };
			let added_len = message.payload.len();
			if body.len() + added_len + RELIABLE_HEADER_SIZE > self.max_payload_bytes {
				return false;
			}
			body.extend_from_slice(&message.payload);
			included.push(index);
			true
		};

		let mut index = anchor_index;
		loop {
			if !try_add(index, &mut body, &mut included) {
				break;
			}
			index += 1;
			if index >= self.pending.len() {
				break;
			}
		}
		for earlier in (0..anchor_index).rev() {
			let Some(message) = self.pending.get(earlier) else { continue };
			let added_len = message.payload.len();
			if body.len() + added_len + RELIABLE_HEADER_SIZE > self.max_payload_bytes {
				break;
			}
			body.extend_from_slice(&message.payload);
			included.push(earlier);
		}
		included.sort_unstable();

		for &i in &included {
			let message = self.pending.get(i).unwrap();
			if message.is_reliable() {
				any_reliable = true;
			} else {
				any_unreliable = true;
			}
		}
		// reliable ids are strictly increasing in pending_list order, so the
		// first/last reliable entries among those included bound the range.
		let reliable_ids: Vec<SeqId> = included
			.iter()
			.filter_map(|&i| self.pending.get(i))
			.filter(|m| m.is_reliable())
			.map(|m| m.seq_id)
			.collect();
		if let (Some(&first), Some(&last)) = (reliable_ids.first(), reliable_ids.last()) {
			seq_min = first;
			seq_max = last;
		}

		let body = if included.len() <= 1 {
			body
		} else {
			let mut framed_body = Vec::with_capacity(body.len() + included.len() * SUBMESSAGE_HEADER_SIZE);
			for &i in &included {
				let message = self.pending.get(i).unwrap();
				framed_body.push(message.class as u8);
				framed_body.extend_from_slice(&(message.payload.len() as u16).to_be_bytes());
				framed_body.extend_from_slice(&message.payload);
			}
			framed_body
		};

		(included, body, seq_min, seq_max, any_unreliable, any_reliable)
	}

	fn apply_send_bookkeeping(&mut self, included: &[usize], now_ms: f64) {
		let mut unreliable_done = Vec::new();
		for &index in included {
			if let Some(message) = self.pending.get_mut(index) {
				if message.first_sent_ms.is_none() {
					self.queued_time.push(now_ms - message.queued_at_ms);
					message.first_sent_ms = Some(now_ms);
				}
				message.last_sent_ms = Some(now_ms);
				if !message.is_reliable() {
					unreliable_done.push(index);
				}
			}
		}
		self.pending.remove_sent_unreliable(&unreliable_done);
	}

	/// §4.4.4: is there currently anything worth flushing right now (used by
	/// [`enqueue`](Self::enqueue)'s "send immediately" fast path and by the
	/// transport's opportunistic post-enqueue call).
	pub fn has_due_work(&self, now_ms: f64) -> bool {
		!self.pending.is_empty() && self.packet_separation_elapsed(now_ms)
	}

	/// Keep-alive ping cadence and scheduler tick (§4.4.5, §4.5 `update()`).
	pub fn update(&mut self, now_ms: f64, budget: u32, mut send: impl FnMut(&[u8]) -> Result<usize, SocketError>) -> u32 {
		self.maybe_send_ping(now_ms, &mut send);
		self.send_optimal_unacked_packets(budget, now_ms, send)
	}

	fn maybe_send_ping(&mut self, now_ms: f64, send: &mut impl FnMut(&[u8]) -> Result<usize, SocketError>) {
		let due = if self.config.send_separate_ping_messages {
			now_ms - self.last_ping_sent_ms > self.config.ping_interval_ms
		} else {
			self.pending.is_empty() && now_ms - self.last_sent_ms > self.config.ping_interval_ms
		};
		if !due {
			return;
		}
		self.send_ping(now_ms, false, send);
	}

	fn send_ping(&mut self, now_ms: f64, is_reply: bool, send: &mut impl FnMut(&[u8]) -> Result<usize, SocketError>) {
		let payload = encode_ping_payload(now_ms, self.stats.pings_sent, self.stats.pings_received, is_reply);
		let mut framed = Vec::with_capacity(RELIABLE_HEADER_SIZE + payload.len());
		encode_header(
			&mut framed,
			Header { class: MessageClass::Ping, seq_min: SeqId::INVALID, seq_max: SeqId::INVALID, last_received: self.last_in_acked },
		);
		framed.extend_from_slice(&payload);
		if send(&framed).is_ok() {
			self.last_sent_ms = now_ms;
			self.last_packet_sent_ms = now_ms;
			self.last_ping_sent_ms = now_ms;
			if !is_reply {
				self.stats.pings_sent += 1;
			}
		}
	}

	/// Dispatch a freshly-received, already-deframed reliable payload (§4.4.3).
	/// Returns the events to surface to the channel/application and whether
	/// any reliable message was newly acknowledged on this packet.
	pub fn handle_incoming(
		&mut self,
		payload: &[u8],
		now_ms: f64,
		mut send: impl FnMut(&[u8]) -> Result<usize, SocketError>,
	) -> Vec<ConnectionEvent> {
		self.last_recv_ms = now_ms;
		let mut events = Vec::new();

		let (header, body) = match decode_header(payload) {
			Ok(parsed) => parsed,
			Err(err) => {
				warn!("malformed reliable header from {}: {}", self.peer, err);
				self.stats.malformed_frames += 1;
				return events;
			}
		};

		let prev_last_acked = self.last_out_acked;
		let newly_acked = self.pending.acknowledge_up_to(prev_last_acked, header.last_received, now_ms);
		let got_new_ack = !newly_acked.is_empty();
		for sample in newly_acked {
			self.ack_round_trip_times.push(sample);
		}
		if header.last_received.is_valid() {
			self.last_out_acked = header.last_received;
		}

		let has_reliable_content = header.seq_min.is_valid();
		let mut accept_submessages = true;
		if has_reliable_content {
			let contains_next = self.seq_range_contains(header.seq_min, header.seq_max, self.next_in_seq);
			if contains_next {
				self.last_in_acked = header.seq_max;
			} else {
				self.stats.out_of_order += 1;
				accept_submessages = matches!(header.class, MessageClass::MultipleMixedMessages);
			}
		}

		if accept_submessages {
			self.dispatch_submessages(header, body, now_ms, &mut send, &mut events);
		}

		if got_new_ack {
			self.send_optimal_unacked_packets(self.config.max_packets_to_resend_on_ack, now_ms, &mut send);
		}
		if self.config.send_ack_on_receipt {
			self.enqueue(&[], MessageClass::Ack, false, false, now_ms);
		}

		events
	}

	fn seq_range_contains(&self, min: SeqId, max: SeqId, target: SeqId) -> bool {
		target.in_range(min, max)
	}

	fn dispatch_submessages(
		&mut self,
		header: Header,
		body: &[u8],
		now_ms: f64,
		send: &mut impl FnMut(&[u8]) -> Result<usize, SocketError>,
		events: &mut Vec<ConnectionEvent>,
	) {
		let is_multi = matches!(
			header.class,
			MessageClass::MultipleReliableMessages | MessageClass::MultipleUnreliableMessages | MessageClass::MultipleMixedMessages
		);

		if !is_multi {
			self.dispatch_one(header.class, header.seq_min, body, now_ms, send, events);
			return;
		}

		let mut cursor = body;
		let mut next_reliable_id = header.seq_min;
		while !cursor.is_empty() {
			if cursor.len() < SUBMESSAGE_HEADER_SIZE {
				warn!("truncated sub-message from {}", self.peer);
				self.stats.malformed_frames += 1;
				break;
			}
			let Some(class) = MessageClass::from_byte(cursor[0]) else {
				warn!("unknown sub-message class byte from {}", self.peer);
				self.stats.malformed_frames += 1;
				break;
			};
			let len = u16::from_be_bytes([cursor[1], cursor[2]]) as usize;
			if cursor.len() < SUBMESSAGE_HEADER_SIZE + len {
				warn!("sub-message length out of bounds from {}", self.peer);
				self.stats.malformed_frames += 1;
				break;
			}
			let sub_payload = &cursor[SUBMESSAGE_HEADER_SIZE..SUBMESSAGE_HEADER_SIZE + len];

			let id = if class.is_always_unreliable() { SeqId::INVALID } else { next_reliable_id };
			self.dispatch_one(class, id, sub_payload, now_ms, send, events);
			if id.is_valid() {
				next_reliable_id = next_reliable_id.successor();
			}

			cursor = &cursor[SUBMESSAGE_HEADER_SIZE + len..];
		}
	}

	fn dispatch_one(
		&mut self,
		class: MessageClass,
		id: SeqId,
		payload: &[u8],
		now_ms: f64,
		send: &mut impl FnMut(&[u8]) -> Result<usize, SocketError>,
		events: &mut Vec<ConnectionEvent>,
	) {
		if id.is_valid() {
			if id == self.next_in_seq {
				self.next_in_seq = self.next_in_seq.successor();
			} else {
				// Reliable but not the next expected id: already-delivered duplicate, ignore.
				return;
			}
		}

		match class {
			MessageClass::ConnectionRequest => {
				if self.state == ConnectionState::Disconnected {
					self.state = ConnectionState::MustSendConnectionResponse;
					events.push(ConnectionEvent::OnConnectRequest);
				} else {
					debug!("duplicate connection request from {}", self.peer);
				}
			}
			MessageClass::ConnectionResponse => {
				if matches!(self.state, ConnectionState::Disconnected | ConnectionState::WaitingForConnectionResponse) {
					self.state = ConnectionState::Connected;
					events.push(ConnectionEvent::OnConnected);
				}
			}
			MessageClass::DisconnectRequest => {
				self.state = ConnectionState::Disconnected;
				events.push(ConnectionEvent::OnDisconnected);
			}
			MessageClass::SingleReliable | MessageClass::SingleUnreliable => {
				events.push(ConnectionEvent::NormalMessage(payload.to_vec()));
			}
			MessageClass::MultiPartMessage => {
				if payload.len() >= MULTIPART_HEADER_SIZE {
					let part_index = payload[0];
					let total_parts = payload[1];
					let chunk = &payload[MULTIPART_HEADER_SIZE..];
					if let Some(complete) = self.reassembly.accept(part_index, total_parts, chunk) {
						events.push(ConnectionEvent::NormalMessage(complete));
					}
				}
			}
			MessageClass::Ack => {}
			MessageClass::Ping => {
				if let Some((sender_time_ms, sent_counter, received_counter, is_reply)) = decode_ping_payload(payload) {
					if is_reply {
						self.ping_round_trip_times.push(now_ms - sender_time_ms);
						self.stats.pings_sent_that_arrived += 1;
					} else {
						self.stats.pings_received += 1;
						self.stats.pings_sent_towards_us = sent_counter.max(self.stats.pings_sent_towards_us);
						let _ = received_counter;
						self.send_ping_reply(sender_time_ms, now_ms, send);
					}
				}
			}
			MessageClass::MultipleReliableMessages | MessageClass::MultipleUnreliableMessages | MessageClass::MultipleMixedMessages => {
				// Only ever the outer header class; never a sub-message class.
				debug_assert!(false, "nested multi-message sub-message class");
			}
		}
	}

	fn send_ping_reply(&mut self, original_sender_time_ms: f64, now_ms: f64, send: &mut impl FnMut(&[u8]) -> Result<usize, SocketError>) {
		let payload = encode_ping_payload(original_sender_time_ms, self.stats.pings_sent, self.stats.pings_received, true);
		let mut framed = Vec::with_capacity(RELIABLE_HEADER_SIZE + payload.len());
		encode_header(
			&mut framed,
			Header { class: MessageClass::Ping, seq_min: SeqId::INVALID, seq_max: SeqId::INVALID, last_received: self.last_in_acked },
		);
		framed.extend_from_slice(&payload);
		let _ = send(&framed);
		self.last_packet_sent_ms = now_ms;
	}

	/// §4.4.6: application-initiated handshake start.
	pub fn connect(&mut self, now_ms: f64) {
		self.state = ConnectionState::WaitingForConnectionResponse;
		self.enqueue(&[], MessageClass::ConnectionRequest, true, true, now_ms);
	}

	/// Accept a pending incoming handshake (§4.4.6). A no-op that logs and
	/// returns `false` if called outside `MustSendConnectionResponse` — a
	/// duplicate `accept` call, or one racing `refuse`/`disconnect`/timeout,
	/// must not panic the process (§7).
	pub fn accept(&mut self, now_ms: f64) -> bool {
		if self.state != ConnectionState::MustSendConnectionResponse {
			warn!("accept from {} ignored; not awaiting a connection response (state {:?})", self.peer, self.state);
			return false;
		}
		self.state = ConnectionState::Connected;
		self.enqueue(&[], MessageClass::ConnectionResponse, true, true, now_ms);
		true
	}

	pub fn refuse(&mut self) {
		self.state = ConnectionState::Disconnected;
	}

	/// §4.4.6: best-effort `DisconnectRequest`, then teardown is the caller's
	/// responsibility (removing this `ReliableConnection` from the table).
	pub fn disconnect(&mut self, now_ms: f64, mut send: impl FnMut(&[u8]) -> Result<usize, SocketError>) {
		let mut framed = Vec::with_capacity(RELIABLE_HEADER_SIZE);
		encode_header(
			&mut framed,
			Header { class: MessageClass::DisconnectRequest, seq_min: SeqId::INVALID, seq_max: SeqId::INVALID, last_received: self.last_in_acked },
		);
		let _ = send(&framed);
		self.state = ConnectionState::Disconnected;
	}

	/// §3.6 timeout invariant: fires at most once per call.
	pub fn is_timed_out(&self, now_ms: f64) -> bool {
		now_ms - self.last_recv_ms > self.config.connection_timeout_ms
	}
}

/// Outer header class for a packet bundling more than one sub-message (§4.4.1);
/// a single included message keeps its own class instead of calling this.
fn packet_class(any_reliable: bool, any_unreliable: bool) -> MessageClass {
	match (any_reliable, any_unreliable) {
		(true, true) => MessageClass::MultipleMixedMessages,
		(true, false) => MessageClass::MultipleReliableMessages,
		(false, _) => MessageClass::MultipleUnreliableMessages,
	}
}

trait SeqIdExt {
	fn successor_or_first(self) -> SeqId;
}

impl SeqIdExt for SeqId {
	fn successor_or_first(self) -> SeqId {
		if self.is_valid() {
			self.successor()
		} else {
			SeqId::FIRST
		}
	}
}

trait SeqIterExt: Iterator<Item = SeqId> + Sized {
	fn is_sorted_by_distance(self) -> bool {
		let mut prev: Option<SeqId> = None;
		for id in self {
			if let Some(p) = prev {
				if distance(id, p) == 0 {
					return false;
				}
			}
			prev = Some(id);
		}
		true
	}
}

impl<I: Iterator<Item = SeqId>> SeqIterExt for I {}
