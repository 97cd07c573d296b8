//! The raw datagram socket abstraction (L0, §4.1).

use std::collections::VecDeque;
use std::net::UdpSocket;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::error::SocketError;

/// Opaque handle returned by [`DatagramSocket::open`].
pub type SocketId = u32;

/// Result of a successful, non-blocking receive.
pub struct RecvResult {
	pub bytes: usize,
	pub source: Endpoint,
	pub truncated: bool,
}

/// The socket family/type/protocol triple accepted by `open` (§4.1). Only
/// datagram sockets are modeled; the fields exist so a caller can express
/// "IPv4 vs IPv6" without the trait growing IP-specific methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketDomain {
	pub ipv6: bool,
}

/// Generic byte-bag socket option, set/get by an opaque key (§4.1 `get_opt`/`set_opt`).
pub type SocketOption = (u32, Vec<u8>);

/// An unordered, best-effort datagram transport (§4.1). No ordering or
/// delivery guarantees are made; errors are limited to the set named here.
///
/// Every method takes `&self`: both implementations guard their mutable
/// state internally, which lets a socket be shared (e.g. `Arc<FakeSocket>`)
/// between the two ends of an in-process test without a second layer of
/// external synchronization.
pub trait DatagramSocket {
	fn open(&self, domain: SocketDomain) -> Result<SocketId, SocketError>;
	fn bind(&self, socket: SocketId, endpoint: Endpoint) -> Result<(), SocketError>;
	fn set_opt(&self, socket: SocketId, opt: SocketOption) -> Result<(), SocketError>;
	fn get_opt(&self, socket: SocketId, key: u32) -> Result<Vec<u8>, SocketError>;
	fn close(&self, socket: SocketId) -> Result<(), SocketError>;
	fn send_to(&self, socket: SocketId, bytes: &[u8], dest: Endpoint) -> Result<usize, SocketError>;
	fn recv(&self, socket: SocketId, buf: &mut [u8]) -> Result<RecvResult, SocketError>;
	fn local_endpoint(&self, socket: SocketId) -> Endpoint;
}

impl<T: DatagramSocket + ?Sized> DatagramSocket for Arc<T> {
	fn open(&self, domain: SocketDomain) -> Result<SocketId, SocketError> {
		(**self).open(domain)
	}
	fn bind(&self, socket: SocketId, endpoint: Endpoint) -> Result<(), SocketError> {
		(**self).bind(socket, endpoint)
	}
	fn set_opt(&self, socket: SocketId, opt: SocketOption) -> Result<(), SocketError> {
		(**self).set_opt(socket, opt)
	}
	fn get_opt(&self, socket: SocketId, key: u32) -> Result<Vec<u8>, SocketError> {
		(**self).get_opt(socket, key)
	}
	fn close(&self, socket: SocketId) -> Result<(), SocketError> {
		(**self).close(socket)
	}
	fn send_to(&self, socket: SocketId, bytes: &[u8], dest: Endpoint) -> Result<usize, SocketError> {
		(**self).send_to(socket, bytes, dest)
	}
	fn recv(&self, socket: SocketId, buf: &mut [u8]) -> Result<RecvResult, SocketError> {
		(**self).recv(socket, buf)
	}
	fn local_endpoint(&self, socket: SocketId) -> Endpoint {
		(**self).local_endpoint(socket)
	}
}

/// A real OS-backed socket, one per [`SocketId`].
#[derive(Default)]
pub struct RealSocket {
	sockets: Mutex<Vec<Option<UdpSocket>>>,
}

fn endpoint_to_std(endpoint: Endpoint) -> Result<std::net::SocketAddr, SocketError> {
	match endpoint {
		Endpoint::V4(addr, port) => Ok(std::net::SocketAddr::from((addr, port))),
		Endpoint::V6(addr, port) => Ok(std::net::SocketAddr::from((addr, port))),
		_ => Err(SocketError::NotASocket),
	}
}

fn std_to_endpoint(addr: std::net::SocketAddr) -> Endpoint {
	match addr {
		std::net::SocketAddr::V4(a) => Endpoint::V4(*a.ip(), a.port()),
		std::net::SocketAddr::V6(a) => Endpoint::V6(*a.ip(), a.port()),
	}
}

fn io_err(e: std::io::Error) -> SocketError {
	SocketError::OtherIo(e.raw_os_error().unwrap_or(-1))
}

impl DatagramSocket for RealSocket {
	fn open(&self, domain: SocketDomain) -> Result<SocketId, SocketError> {
		let bind_addr: std::net::SocketAddr = if domain.ipv6 {
			(std::net::Ipv6Addr::UNSPECIFIED, 0).into()
		} else {
			(std::net::Ipv4Addr::UNSPECIFIED, 0).into()
		};
		let socket = UdpSocket::bind(bind_addr).map_err(io_err)?;
		socket.set_nonblocking(true).map_err(io_err)?;
		let mut sockets = self.sockets.lock();
		sockets.push(Some(socket));
		Ok((sockets.len() - 1) as SocketId)
	}

	fn bind(&self, socket: SocketId, endpoint: Endpoint) -> Result<(), SocketError> {
		let addr = endpoint_to_std(endpoint)?;
		let mut sockets = self.sockets.lock();
		let slot = sockets.get_mut(socket as usize).and_then(Option::as_mut).ok_or(SocketError::NotASocket)?;
		let rebound = UdpSocket::bind(addr).map_err(|e| match e.kind() {
			std::io::ErrorKind::AddrInUse => SocketError::AddressInUse,
			_ => io_err(e),
		})?;
		rebound.set_nonblocking(true).map_err(io_err)?;
		*slot = rebound;
		Ok(())
	}

	fn set_opt(&self, _socket: SocketId, _opt: SocketOption) -> Result<(), SocketError> {
		Ok(())
	}

	fn get_opt(&self, _socket: SocketId, _key: u32) -> Result<Vec<u8>, SocketError> {
		Ok(Vec::new())
	}

	fn close(&self, socket: SocketId) -> Result<(), SocketError> {
		let mut sockets = self.sockets.lock();
		let slot = sockets.get_mut(socket as usize).ok_or(SocketError::NotASocket)?;
		*slot = None;
		Ok(())
	}

	fn send_to(&self, socket: SocketId, bytes: &[u8], dest: Endpoint) -> Result<usize, SocketError> {
		let addr = endpoint_to_std(dest)?;
		let sockets = self.sockets.lock();
		let slot = sockets.get(socket as usize).and_then(Option::as_ref).ok_or(SocketError::NotASocket)?;
		slot.send_to(bytes, addr).map_err(io_err)
	}

	fn recv(&self, socket: SocketId, buf: &mut [u8]) -> Result<RecvResult, SocketError> {
		let sockets = self.sockets.lock();
		let slot = sockets.get(socket as usize).and_then(Option::as_ref).ok_or(SocketError::NotASocket)?;
		match slot.recv_from(buf) {
			Ok((bytes, from)) => Ok(RecvResult { bytes, source: std_to_endpoint(from), truncated: false }),
			Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(SocketError::WouldBlock),
			Err(e) => Err(io_err(e)),
		}
	}

	fn local_endpoint(&self, socket: SocketId) -> Endpoint {
		self.sockets
			.lock()
			.get(socket as usize)
			.and_then(Option::as_ref)
			.and_then(|s| s.local_addr().ok())
			.map(std_to_endpoint)
			.unwrap_or(Endpoint::None)
	}
}

/// Maximum concurrently-open sockets in one [`FakeSocket`] registry (§5).
pub const MAX_FAKE_SOCKETS: usize = 4;

struct FakeQueuedDatagram {
	bytes: Vec<u8>,
	source: Endpoint,
}

struct FakeSlot {
	bound: Endpoint,
	inbox: VecDeque<FakeQueuedDatagram>,
}

/// In-process registry of sockets that deliver datagrams by copying between
/// peer queues, keyed by [`Endpoint::Virtual`] (§4.1(b), §9 "shared-ownership
/// of sockets... a registry indexed by a sequential socket id"). Share one
/// instance (typically via `Arc<FakeSocket>`) between both ends of a test so
/// that `send_to` on one side is visible to `recv` on the other.
#[derive(Default)]
pub struct FakeSocket {
	slots: Mutex<Vec<Option<FakeSlot>>>,
}

impl FakeSocket {
	pub fn new() -> Self {
		Self { slots: Mutex::new(Vec::new()) }
	}

	fn find_bound(slots: &[Option<FakeSlot>], endpoint: Endpoint) -> Option<usize> {
		slots.iter().position(|s| matches!(s, Some(slot) if slot.bound == endpoint))
	}
}

impl DatagramSocket for FakeSocket {
	fn open(&self, _domain: SocketDomain) -> Result<SocketId, SocketError> {
		let mut slots = self.slots.lock();
		let open_count = slots.iter().filter(|s| s.is_some()).count();
		if open_count >= MAX_FAKE_SOCKETS {
			return Err(SocketError::TooManyOpen);
		}
		if let Some(index) = slots.iter().position(Option::is_none) {
			slots[index] = Some(FakeSlot { bound: Endpoint::None, inbox: VecDeque::new() });
			Ok(index as SocketId)
		} else {
			slots.push(Some(FakeSlot { bound: Endpoint::None, inbox: VecDeque::new() }));
			Ok((slots.len() - 1) as SocketId)
		}
	}

	fn bind(&self, socket: SocketId, endpoint: Endpoint) -> Result<(), SocketError> {
		let mut slots = self.slots.lock();
		if Self::find_bound(&slots, endpoint).is_some() {
			return Err(SocketError::AddressInUse);
		}
		let slot = slots.get_mut(socket as usize).and_then(Option::as_mut).ok_or(SocketError::NotASocket)?;
		slot.bound = endpoint;
		Ok(())
	}

	fn set_opt(&self, _socket: SocketId, _opt: SocketOption) -> Result<(), SocketError> {
		Ok(())
	}

	fn get_opt(&self, _socket: SocketId, _key: u32) -> Result<Vec<u8>, SocketError> {
		Ok(Vec::new())
	}

	fn close(&self, socket: SocketId) -> Result<(), SocketError> {
		let mut slots = self.slots.lock();
		let slot = slots.get_mut(socket as usize).ok_or(SocketError::NotASocket)?;
		*slot = None;
		Ok(())
	}

	fn send_to(&self, socket: SocketId, bytes: &[u8], dest: Endpoint) -> Result<usize, SocketError> {
		let mut slots = self.slots.lock();
		let source = slots.get(socket as usize).and_then(Option::as_ref).map(|s| s.bound).ok_or(SocketError::NotASocket)?;
		if let Some(index) = Self::find_bound(&slots, dest) {
			if let Some(target) = slots[index].as_mut() {
				target.inbox.push_back(FakeQueuedDatagram { bytes: bytes.to_vec(), source });
			}
		}
		// Delivery is best-effort: an unbound destination silently drops the datagram,
		// matching a real UDP socket sending to a host with nothing listening.
		Ok(bytes.len())
	}

	fn recv(&self, socket: SocketId, buf: &mut [u8]) -> Result<RecvResult, SocketError> {
		let mut slots = self.slots.lock();
		let slot = slots.get_mut(socket as usize).and_then(Option::as_mut).ok_or(SocketError::NotASocket)?;
		match slot.inbox.pop_front() {
			Some(datagram) => {
				let truncated = datagram.bytes.len() > buf.len();
				let copy_len = datagram.bytes.len().min(buf.len());
				buf[..copy_len].copy_from_slice(&datagram.bytes[..copy_len]);
				Ok(RecvResult { bytes: copy_len, source: datagram.source, truncated })
			}
			None => Err(SocketError::WouldBlock),
		}
	}

	fn local_endpoint(&self, socket: SocketId) -> Endpoint {
		self.slots.lock().get(socket as usize).and_then(Option::as_ref).map(|s| s.bound).unwrap_or(Endpoint::None)
	}
}
