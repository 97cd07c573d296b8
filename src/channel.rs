//! Application-facing connection-id surface (L5, §3.8, §4.6).
//!
//! Wraps a [`ReliableTransport`] with an application-chosen `ConnectionId`
//! bijected against [`Endpoint`], and turns connection/message events into a
//! FIFO of [`IncomingPacket`]s.

use std::collections::{HashMap, VecDeque};

use log::warn;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::SocketError;
use crate::reliable::connection::ConnectionEvent;
use crate::reliable::transport::{is_connected, ReliableTransport};
use crate::socket::DatagramSocket;
use crate::time::Clock;

/// Application-chosen connection identifier (§3.2). `-1` names "unspecified".
pub type ConnectionId = i32;
/// Reserved value meaning "no connection id" (§3.2).
pub const UNSPECIFIED_CONNECTION_ID: ConnectionId = -1;

/// One queued outbound send (§3.3).
pub struct OutgoingPacket {
	pub bytes: Vec<u8>,
	pub destination: ConnectionId,
	pub reliable: bool,
	/// Hint to flush this packet immediately rather than coalesce it (§4.4.4).
	pub hot: bool,
}

/// The kind of event carried by an [`IncomingPacket`] (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingTag {
	NormalMessage,
	ConnectionRequest,
	Connected,
	Disconnected,
}

/// One delivered event, FIFO-ordered (§3.3, §5 "Packet-level events").
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingPacket {
	pub tag: IncomingTag,
	pub payload: Option<Vec<u8>>,
	pub source_id: ConnectionId,
	pub source_endpoint: Endpoint,
}

/// Owns the `ConnectionId <-> Endpoint` bijection and the incoming event FIFO
/// on top of one [`ReliableTransport`] (§3.8, §4.6).
///
/// §3.8 describes per-peer `ConnectionData` tracking whether a binding is
/// "real or merely queued-for-close". Every mutator on this `Channel` runs to
/// completion synchronously from the application's point of view (there is no
/// concurrent mutator it could race against), so that distinction collapses
/// to two facts already on hand: whether the bijection holds an entry for the
/// id at all (bound), and whether [`is_connected`] reports the underlying
/// handshake complete (live). No separate status enum is kept.
pub struct Channel<S> {
	transport: ReliableTransport<S>,
	id_to_endpoint: HashMap<ConnectionId, Endpoint>,
	endpoint_to_id: HashMap<Endpoint, ConnectionId>,
	incoming: VecDeque<IncomingPacket>,
	/// Sends queued while a bound id is still `WaitingForConnectionResponse`
	/// (§4.6 "pre-connection sends queue until the handshake completes"),
	/// drained into the transport on the corresponding `OnConnected` event.
	connection_packets: HashMap<ConnectionId, Vec<OutgoingPacket>>,
}

impl<S: DatagramSocket + Send + 'static> Channel<S> {
	pub fn new(socket: S, config: Config) -> Self {
		Self {
			transport: ReliableTransport::new(socket, config),
			id_to_endpoint: HashMap::new(),
			endpoint_to_id: HashMap::new(),
			incoming: VecDeque::new(),
			connection_packets: HashMap::new(),
		}
	}

	pub fn start_host(&self, bind_endpoint: Endpoint) -> Result<(), SocketError> {
		self.transport.start_host(bind_endpoint)
	}

	pub fn start_client(&self) -> Result<(), SocketError> {
		self.transport.start_client()
	}

	pub fn stop(&self) -> Result<(), SocketError> {
		self.transport.stop()
	}

	pub fn local_endpoint(&self) -> Endpoint {
		self.transport.local_endpoint()
	}

	pub fn connect(&self, endpoint: Endpoint) {
		self.transport.connect(endpoint);
	}

	/// Caller-driven scheduler tick; a no-op if the transport is in
	/// asynchronous mode (§4.5).
	pub fn update(&self, clock: &dyn Clock) {
		self.transport.update(clock);
	}

	pub fn get_id(&self, endpoint: Endpoint) -> Option<ConnectionId> {
		self.endpoint_to_id.get(&endpoint).copied()
	}

	pub fn get_endpoint(&self, id: ConnectionId) -> Option<Endpoint> {
		self.id_to_endpoint.get(&id).copied()
	}

	/// Bind `(id, endpoint)`. If either half is already bound to something
	/// else, the stale pairing is force-disconnected first (§4.6 "Address/id
	/// reuse policy"): a warning is logged, `OnDisconnected` is queued for the
	/// stale pair, and its incoming-queue entries are cleared.
	pub fn add_connection(&mut self, id: ConnectionId, endpoint: Endpoint) {
		if let Some(&stale_endpoint) = self.id_to_endpoint.get(&id) {
			if stale_endpoint != endpoint {
				warn!("connection id {} reassigned from {} to {}", id, stale_endpoint, endpoint);
				self.force_disconnect(id, stale_endpoint);
			}
		}
		if let Some(&stale_id) = self.endpoint_to_id.get(&endpoint) {
			if stale_id != id {
				warn!("endpoint {} reassigned from id {} to {}", endpoint, stale_id, id);
				self.force_disconnect(stale_id, endpoint);
			}
		}
		self.id_to_endpoint.insert(id, endpoint);
		self.endpoint_to_id.insert(endpoint, id);
	}

	fn force_disconnect(&mut self, id: ConnectionId, endpoint: Endpoint) {
		self.id_to_endpoint.remove(&id);
		self.endpoint_to_id.remove(&endpoint);
		self.connection_packets.remove(&id);
		self.transport.disconnect(endpoint);
		self.clear_packets_for_address(endpoint);
		self.incoming.push_back(IncomingPacket {
			tag: IncomingTag::Disconnected,
			payload: None,
			source_id: id,
			source_endpoint: endpoint,
		});
	}

	pub fn remove_connection(&mut self, id: ConnectionId) {
		if let Some(endpoint) = self.id_to_endpoint.remove(&id) {
			self.endpoint_to_id.remove(&endpoint);
			self.connection_packets.remove(&id);
			self.transport.disconnect(endpoint);
		}
	}

	pub fn remove_all(&mut self) {
		for id in self.id_to_endpoint.keys().copied().collect::<Vec<_>>() {
			self.remove_connection(id);
		}
	}

	/// Whether `id` is bound to a live, handshake-complete connection. `send`
	/// accepts any *bound* id regardless of this, queuing rather than sending
	/// while the handshake is still in flight (§4.6).
	pub fn is_active(&self, id: ConnectionId) -> bool {
		let Some(&endpoint) = self.id_to_endpoint.get(&id) else { return false };
		is_connected(&self.transport, endpoint)
	}

	/// Accept a pending `ConnectionRequest`, binding it to `id` (§4.6).
	/// Returns `false` without binding anything if the transport reports
	/// the handshake was not actually awaiting a response (duplicate
	/// accept, or one racing `refuse`/`disconnect`/timeout).
	pub fn accept_incoming(&mut self, id: ConnectionId, endpoint: Endpoint) -> bool {
		if !self.transport.accept(endpoint) {
			return false;
		}
		self.add_connection(id, endpoint);
		true
	}

	pub fn refuse_incoming(&self, endpoint: Endpoint) {
		self.transport.refuse(endpoint);
	}

	/// Queue `packet`; rejected (returns `false`) if `destination` is not a
	/// bound connection id at all. A bound id whose handshake has not yet
	/// completed does not reject the send — it is held in
	/// `connection_packets` and flushed once `OnConnected` arrives, matching
	/// §4.6's "pre-connection sends queue until the connection handshake
	/// completes".
	pub fn send(&mut self, packet: OutgoingPacket) -> bool {
		let Some(&endpoint) = self.id_to_endpoint.get(&packet.destination) else {
			return false;
		};
		if is_connected(&self.transport, endpoint) {
			self.transport.send(endpoint, packet.reliable, packet.bytes, packet.hot);
		} else {
			self.connection_packets.entry(packet.destination).or_default().push(packet);
		}
		true
	}

	/// Drain freshly-raised transport events into the incoming FIFO, then pop
	/// the oldest one (§4.6 `pop_incoming`).
	pub fn pop_incoming(&mut self) -> Option<IncomingPacket> {
		self.absorb_transport_events();
		self.incoming.pop_front()
	}

	fn absorb_transport_events(&mut self) {
		for event in self.transport.drain_events() {
			let source_endpoint = event.endpoint;
			let source_id = self.endpoint_to_id.get(&source_endpoint).copied().unwrap_or(UNSPECIFIED_CONNECTION_ID);
			let (tag, payload) = match event.event {
				ConnectionEvent::OnConnectRequest => (IncomingTag::ConnectionRequest, None),
				ConnectionEvent::OnConnected => {
					if let Some(queued) = self.connection_packets.remove(&source_id) {
						for packet in queued {
							self.transport.send(source_endpoint, packet.reliable, packet.bytes, packet.hot);
						}
					}
					(IncomingTag::Connected, None)
				}
				ConnectionEvent::OnDisconnected => {
					if let Some(&id) = self.endpoint_to_id.get(&source_endpoint) {
						self.id_to_endpoint.remove(&id);
						self.connection_packets.remove(&id);
					}
					self.endpoint_to_id.remove(&source_endpoint);
					(IncomingTag::Disconnected, None)
				}
				ConnectionEvent::NormalMessage(bytes) => (IncomingTag::NormalMessage, Some(bytes)),
			};
			self.incoming.push_back(IncomingPacket { tag, payload, source_id, source_endpoint });
		}
	}

	/// Remove every queued event from `addr` (§4.6).
	pub fn clear_packets_for_address(&mut self, addr: Endpoint) {
		self.incoming.retain(|packet| packet.source_endpoint != addr);
	}

	/// Remove queued events from `addr` up to and including the most recent
	/// `Disconnected` event for it, keeping anything queued after that point
	/// (a racing reconnect) untouched (§4.6).
	pub fn clear_packets_until_newest_connection(&mut self, addr: Endpoint) {
		let Some(boundary) = self
			.incoming
			.iter()
			.enumerate()
			.rev()
			.find(|(_, packet)| packet.source_endpoint == addr && packet.tag == IncomingTag::Disconnected)
			.map(|(index, _)| index)
		else {
			return;
		};
		let mut index = 0;
		self.incoming.retain(|packet| {
			let keep = !(packet.source_endpoint == addr && index <= boundary);
			index += 1;
			keep
		});
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::socket::FakeSocket;
	use std::sync::Arc;

	fn channel() -> Channel<Arc<FakeSocket>> {
		Channel::new(Arc::new(FakeSocket::new()), Config::default())
	}

	#[test]
	fn add_connection_establishes_bijection() {
		let mut ch = channel();
		ch.add_connection(7, Endpoint::virtual_id(1));
		assert_eq!(ch.get_id(Endpoint::virtual_id(1)), Some(7));
		assert_eq!(ch.get_endpoint(7), Some(Endpoint::virtual_id(1)));
	}

	#[test]
	fn reassigning_id_force_disconnects_the_stale_endpoint() {
		let mut ch = channel();
		ch.add_connection(1, Endpoint::virtual_id(1));
		ch.add_connection(1, Endpoint::virtual_id(2));
		assert_eq!(ch.get_endpoint(1), Some(Endpoint::virtual_id(2)));
		assert_eq!(ch.get_id(Endpoint::virtual_id(1)), None);
		let popped = ch.pop_incoming().unwrap();
		assert_eq!(popped.tag, IncomingTag::Disconnected);
		assert_eq!(popped.source_endpoint, Endpoint::virtual_id(1));
	}

	#[test]
	fn send_to_unbound_id_is_rejected() {
		let mut ch = channel();
		let accepted = ch.send(OutgoingPacket { bytes: vec![1], destination: 42, reliable: true, hot: false });
		assert!(!accepted);
	}

	#[test]
	fn send_while_handshake_pending_is_queued_not_rejected() {
		let mut ch = channel();
		ch.add_connection(1, Endpoint::virtual_id(1));
		ch.connect(Endpoint::virtual_id(1));
		let accepted = ch.send(OutgoingPacket { bytes: vec![9], destination: 1, reliable: true, hot: false });
		assert!(accepted);
		assert_eq!(ch.connection_packets.get(&1).map(Vec::len), Some(1));
	}

	#[test]
	fn remove_all_clears_every_mapping() {
		let mut ch = channel();
		ch.add_connection(1, Endpoint::virtual_id(1));
		ch.add_connection(2, Endpoint::virtual_id(2));
		ch.remove_all();
		assert_eq!(ch.get_endpoint(1), None);
		assert_eq!(ch.get_endpoint(2), None);
	}

	fn packet(tag: IncomingTag, endpoint: Endpoint) -> IncomingPacket {
		IncomingPacket { tag, payload: None, source_id: UNSPECIFIED_CONNECTION_ID, source_endpoint: endpoint }
	}

	#[test]
	fn clear_packets_for_address_removes_only_that_address() {
		let mut ch = channel();
		ch.incoming.push_back(packet(IncomingTag::Connected, Endpoint::virtual_id(1)));
		ch.incoming.push_back(packet(IncomingTag::Connected, Endpoint::virtual_id(2)));
		ch.clear_packets_for_address(Endpoint::virtual_id(1));
		assert_eq!(ch.incoming.len(), 1);
		assert_eq!(ch.incoming[0].source_endpoint, Endpoint::virtual_id(2));
	}

	#[test]
	fn clear_until_newest_connection_preserves_the_reconnect() {
		let mut ch = channel();
		let addr = Endpoint::virtual_id(1);
		ch.incoming.push_back(packet(IncomingTag::ConnectionRequest, addr));
		ch.incoming.push_back(packet(IncomingTag::Connected, addr));
		ch.incoming.push_back(packet(IncomingTag::Disconnected, addr));
		ch.incoming.push_back(packet(IncomingTag::ConnectionRequest, addr));
		ch.incoming.push_back(packet(IncomingTag::Connected, addr));

		ch.clear_packets_until_newest_connection(addr);

		assert_eq!(ch.incoming.len(), 2);
		assert_eq!(ch.incoming[0].tag, IncomingTag::ConnectionRequest);
		assert_eq!(ch.incoming[1].tag, IncomingTag::Connected);
	}

	#[test]
	fn clear_until_newest_connection_is_noop_without_a_disconnect() {
		let mut ch = channel();
		let addr = Endpoint::virtual_id(1);
		ch.incoming.push_back(packet(IncomingTag::Connected, addr));
		ch.clear_packets_until_newest_connection(addr);
		assert_eq!(ch.incoming.len(), 1);
	}
}
