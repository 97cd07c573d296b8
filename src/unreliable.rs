//! Unreliable transport framing (L2, §4.3).
//!
//! Every outbound payload gets a small prefix (plus an optional CRC-CCITT)
//! and is handed to a [`DatagramSocket`]; on receive the header is validated
//! and stripped before the payload is handed upward.

use log::{debug, trace, warn};

use crate::config::Config;
use crate::crc::crc16;
use crate::endpoint::Endpoint;
use crate::error::{FrameError, SocketError};
use crate::socket::{DatagramSocket, SocketDomain, SocketId};
use crate::stats::FrameStats;

/// Outcome of draining one ready datagram during [`UnreliableTransport::update`].
pub enum Received {
	Payload { source: Endpoint, bytes: Vec<u8> },
	Dropped(FrameError),
	NoneReady,
}

/// Frames payloads for a single logical socket with the configured header
/// prefix and optional CRC, and tracks per-socket send/recv statistics (§4.3).
pub struct UnreliableTransport<S> {
	socket: S,
	id: Option<SocketId>,
	/// The endpoint passed to `start_host`, if any, so `update` can reopen on
	/// the same port after a `NotConnected` recv (§4.3). `None` for a
	/// client socket, which reopens on a fresh ephemeral port instead.
	bound_endpoint: Option<Endpoint>,
	config: Config,
	pub stats: FrameStats,
}

impl<S: DatagramSocket> UnreliableTransport<S> {
	pub fn new(socket: S, config: Config) -> Self {
		Self { socket, id: None, bound_endpoint: None, config, stats: FrameStats::default() }
	}

	/// `max_payload_bytes = max_datagram - header_size` (§4.3).
	pub fn max_payload_bytes(&self) -> usize {
		self.config.max_payload_bytes()
	}

	fn header_size(&self) -> usize {
		self.config.header_prefix.len() + if self.config.use_crc { 2 } else { 0 }
	}

	/// Open and bind to `bind_endpoint` (§4.3 `start_host`).
	pub fn start_host(&mut self, bind_endpoint: Endpoint) -> Result<(), SocketError> {
		let id = self.socket.open(SocketDomain { ipv6: matches!(bind_endpoint, Endpoint::V6(..)) })?;
		self.socket.bind(id, bind_endpoint)?;
		self.id = Some(id);
		self.bound_endpoint = Some(bind_endpoint);
		debug!("unreliable transport hosting on {}", bind_endpoint);
		Ok(())
	}

	/// Open with an ephemeral local port (§4.3 `start_client`).
	pub fn start_client(&mut self) -> Result<(), SocketError> {
		let id = self.socket.open(SocketDomain { ipv6: false })?;
		self.id = Some(id);
		self.bound_endpoint = None;
		debug!("unreliable transport started as client");
		Ok(())
	}

	/// Close and reopen on the same port (or a fresh ephemeral port for a
	/// client socket) after the socket reports `NotConnected` (§4.3).
	fn reopen(&mut self) -> Result<(), SocketError> {
		if let Some(id) = self.id.take() {
			let _ = self.socket.close(id);
		}
		match self.bound_endpoint {
			Some(endpoint) => self.start_host(endpoint),
			None => self.start_client(),
		}
	}

	pub fn stop(&mut self) -> Result<(), SocketError> {
		if let Some(id) = self.id.take() {
			self.socket.close(id)?;
		}
		Ok(())
	}

	pub fn local_endpoint(&self) -> Endpoint {
		self.id.map(|id| self.socket.local_endpoint(id)).unwrap_or(Endpoint::None)
	}

	/// Frame `payload` and send it to `dest`.
	pub fn send_to(&mut self, dest: Endpoint, payload: &[u8]) -> Result<usize, SocketError> {
		let id = self.id.ok_or(SocketError::NotConnected)?;
		let mut framed = Vec::with_capacity(self.header_size() + payload.len());
		framed.extend_from_slice(self.config.header_prefix.as_slice());
		if self.config.use_crc {
			framed.extend_from_slice(&crc16(payload).to_be_bytes());
		}
		framed.extend_from_slice(payload);
		let sent = self.socket.send_to(id, &framed, dest)?;
		self.stats.bytes_sent += sent as u64;
		self.stats.packets_sent += 1;
		trace!("sent {} bytes to {}", sent, dest);
		Ok(sent)
	}

	/// Validate and strip the header from one raw datagram already read from
	/// the socket (used by tests and by [`Self::update`]).
	fn deframe(&mut self, raw: &[u8], truncated: bool) -> Result<Vec<u8>, FrameError> {
		if truncated {
			self.stats.too_big += 1;
			return Err(FrameError::TooBig);
		}
		let header_size = self.header_size();
		if raw.len() < header_size {
			self.stats.too_small += 1;
			return Err(FrameError::TooSmall);
		}
		let prefix = self.config.header_prefix.as_slice();
		if &raw[..prefix.len()] != prefix {
			self.stats.wrong_header += 1;
			return Err(FrameError::WrongHeader);
		}
		let payload = &raw[header_size..];
		if self.config.use_crc {
			let expected = u16::from_be_bytes([raw[prefix.len()], raw[prefix.len() + 1]]);
			if crc16(payload) != expected {
				self.stats.bad_crc += 1;
				return Err(FrameError::BadCRC);
			}
		}
		Ok(payload.to_vec())
	}

	/// Drain the socket of all currently-ready datagrams, returning each
	/// valid payload in arrival order; invalid datagrams are counted and
	/// silently dropped (§7 "Frame validation").
	pub fn update(&mut self) -> Vec<(Endpoint, Vec<u8>)> {
		if self.id.is_none() {
			return Vec::new();
		}
		let mut out = Vec::new();
		let mut buf = vec![0u8; self.config.max_datagram_size];
		let mut reopened_once = false;
		loop {
			let Some(id) = self.id else { break };
			match self.socket.recv(id, &mut buf) {
				Ok(result) => {
					self.stats.bytes_received += result.bytes as u64;
					self.stats.packets_received += 1;
					match self.deframe(&buf[..result.bytes], result.truncated) {
						Ok(payload) => out.push((result.source, payload)),
						Err(err) => warn!("dropped datagram from {}: {}", result.source, err),
					}
				}
				Err(SocketError::WouldBlock) => break,
				Err(SocketError::NotConnected) if !reopened_once => {
					reopened_once = true;
					warn!("unreliable transport socket not connected; closing and reopening once");
					if let Err(err) = self.reopen() {
						warn!("failed to reopen socket after NotConnected: {}", err);
						break;
					}
				}
				Err(_) => break,
			}
		}
		out
	}
}
