//! Network emulation shim (L1, §4.2): random loss and latency-jittered,
//! reordering-capable delivery, layered over any [`DatagramSocket`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::endpoint::Endpoint;
use crate::error::SocketError;
use crate::socket::{DatagramSocket, RecvResult, SocketDomain, SocketId, SocketOption};

/// Maximum logical sockets one emulator instance may multiplex (§5).
pub const MAX_EMULATED_SOCKETS: usize = 8;

struct QueuedDatagram {
	bytes: Vec<u8>,
	source: Endpoint,
	truncated: bool,
	deliver_at_ms: f64,
}

#[derive(Default)]
struct SocketQueue {
	pending: VecDeque<QueuedDatagram>,
}

/// Emulator configuration: drop probability and a latency window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmulatorConfig {
	/// Probability in `[0.0, 1.0]` that an inbound datagram is discarded.
	pub loss_pct: f64,
	pub min_latency_ms: f64,
	pub max_latency_ms: f64,
}

impl Default for EmulatorConfig {
	fn default() -> Self {
		Self { loss_pct: 0.0, min_latency_ms: 0.0, max_latency_ms: 0.0 }
	}
}

#[derive(Default)]
struct EmulatorState {
	queues: Vec<SocketQueue>,
}

impl EmulatorState {
	fn queue_for(&mut self, socket: SocketId) -> &mut SocketQueue {
		let index = socket as usize;
		if index >= self.queues.len() {
			self.queues.resize_with(index + 1, SocketQueue::default);
		}
		&mut self.queues[index]
	}
}

/// Wraps an inner [`DatagramSocket`] and deterministically injects loss and
/// delivery-time jitter on the receive path (§4.2). Sending is pass-through.
///
/// All mutable state (the per-socket delay queues, the PRNG, and the
/// emulator's notion of "now") lives behind interior mutability so the
/// emulator satisfies `DatagramSocket`'s `&self` receivers and can be shared,
/// like any other socket, between both ends of a test. `recv` itself drives
/// `pump`/`recv_ready` using that stored time, so `NetEmulator` can sit under
/// [`crate::reliable::transport::ReliableTransport`] transparently: callers
/// that want the real wall clock never touch `set_now_ms`; deterministic
/// tests call it once per tick, in step with their own [`Clock`].
pub struct NetEmulator<S> {
	inner: S,
	config: EmulatorConfig,
	rng: Mutex<StdRng>,
	state: Mutex<EmulatorState>,
	drop_count: AtomicU64,
	now_ms_bits: AtomicU64,
}

impl<S: DatagramSocket> NetEmulator<S> {
	/// `seed` makes loss/latency decisions reproducible across test runs.
	pub fn new(inner: S, config: EmulatorConfig, seed: u64) -> Self {
		Self {
			inner,
			config,
			rng: Mutex::new(StdRng::seed_from_u64(seed)),
			state: Mutex::new(EmulatorState::default()),
			drop_count: AtomicU64::new(0),
			now_ms_bits: AtomicU64::new(0f64.to_bits()),
		}
	}

	pub fn drop_count(&self) -> u64 {
		self.drop_count.load(Ordering::Relaxed)
	}

	/// Advance the emulator's notion of "now", used by the `DatagramSocket`
	/// `recv` impl to decide which delayed datagrams have arrived. Real
	/// deployments never call this; it exists for deterministic tests that
	/// drive a [`ManualClock`](crate::time::ManualClock) alongside the
	/// transport under test.
	pub fn set_now_ms(&self, now_ms: f64) {
		self.now_ms_bits.store(now_ms.to_bits(), Ordering::Relaxed);
	}

	fn current_now_ms(&self) -> f64 {
		f64::from_bits(self.now_ms_bits.load(Ordering::Relaxed))
	}

	/// Drain the inner socket's ready datagrams into this socket's delayed
	/// queue, applying loss and scheduling a delivery time for survivors.
	/// Must be called once per tick before `recv`, supplying the current time.
	pub fn pump(&self, socket: SocketId, now_ms: f64, clock_buf_size: usize) {
		let mut buf = vec![0u8; clock_buf_size];
		loop {
			match self.inner.recv(socket, &mut buf) {
				Ok(RecvResult { bytes, source, truncated }) => {
					let mut rng = self.rng.lock();
					let dropped = rng.gen_bool(self.config.loss_pct.clamp(0.0, 1.0));
					if dropped {
						self.drop_count.fetch_add(1, Ordering::Relaxed);
						continue;
					}
					let jitter = if self.config.max_latency_ms > self.config.min_latency_ms {
						rng.gen_range(self.config.min_latency_ms..self.config.max_latency_ms)
					} else {
						self.config.min_latency_ms
					};
					drop(rng);
					let deliver_at_ms = now_ms + jitter;
					self.state.lock().queue_for(socket).pending.push_back(QueuedDatagram {
						bytes: buf[..bytes].to_vec(),
						source,
						truncated,
						deliver_at_ms,
					});
				}
				Err(SocketError::WouldBlock) => break,
				Err(_) => break,
			}
		}
	}

	/// Pop the earliest queued datagram whose delivery time has passed, if any.
	pub fn recv_ready(&self, socket: SocketId, now_ms: f64, buf: &mut [u8]) -> Result<RecvResult, SocketError> {
		let mut state = self.state.lock();
		let queue = state.queue_for(socket);
		let ready_index = queue
			.pending
			.iter()
			.enumerate()
			.filter(|(_, d)| d.deliver_at_ms <= now_ms)
			.min_by(|a, b| a.1.deliver_at_ms.partial_cmp(&b.1.deliver_at_ms).unwrap())
			.map(|(i, _)| i);

		match ready_index {
			Some(index) => {
				let datagram = queue.pending.remove(index).unwrap();
				let copy_len = datagram.bytes.len().min(buf.len());
				buf[..copy_len].copy_from_slice(&datagram.bytes[..copy_len]);
				Ok(RecvResult { bytes: copy_len, source: datagram.source, truncated: datagram.truncated })
			}
			None => Err(SocketError::WouldBlock),
		}
	}
}

impl<S: DatagramSocket> DatagramSocket for NetEmulator<S> {
	fn open(&self, domain: SocketDomain) -> Result<SocketId, SocketError> {
		let id = self.inner.open(domain)?;
		if id as usize >= MAX_EMULATED_SOCKETS {
			return Err(SocketError::TooManyOpen);
		}
		Ok(id)
	}

	fn bind(&self, socket: SocketId, endpoint: Endpoint) -> Result<(), SocketError> {
		self.inner.bind(socket, endpoint)
	}

	fn set_opt(&self, socket: SocketId, opt: SocketOption) -> Result<(), SocketError> {
		self.inner.set_opt(socket, opt)
	}

	fn get_opt(&self, socket: SocketId, key: u32) -> Result<Vec<u8>, SocketError> {
		self.inner.get_opt(socket, key)
	}

	fn close(&self, socket: SocketId) -> Result<(), SocketError> {
		self.inner.close(socket)
	}

	fn send_to(&self, socket: SocketId, bytes: &[u8], dest: Endpoint) -> Result<usize, SocketError> {
		self.inner.send_to(socket, bytes, dest)
	}

	fn recv(&self, socket: SocketId, buf: &mut [u8]) -> Result<RecvResult, SocketError> {
		let now_ms = self.current_now_ms();
		self.pump(socket, now_ms, buf.len().max(crate::config::MAX_DATAGRAM_SIZE));
		self.recv_ready(socket, now_ms, buf)
	}

	fn local_endpoint(&self, socket: SocketId) -> Endpoint {
		self.inner.local_endpoint(socket)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::socket::FakeSocket;

	#[test]
	fn zero_loss_zero_latency_is_transparent() {
		let inner = FakeSocket::new();
		let emulator = NetEmulator::new(inner, EmulatorConfig::default(), 1);
		let socket = emulator.open(SocketDomain { ipv6: false }).unwrap();
		emulator.bind(socket, Endpoint::virtual_id(1)).unwrap();
		emulator.send_to(socket, b"ping", Endpoint::virtual_id(1)).unwrap();
		emulator.pump(socket, 0.0, 64);

		let mut buf = [0u8; 16];
		let result = emulator.recv_ready(socket, 0.0, &mut buf).unwrap();
		assert_eq!(&buf[..result.bytes], b"ping");
		assert_eq!(emulator.drop_count(), 0);
	}

	#[test]
	fn full_loss_drops_everything() {
		let inner = FakeSocket::new();
		let emulator = NetEmulator::new(inner, EmulatorConfig { loss_pct: 1.0, min_latency_ms: 0.0, max_latency_ms: 0.0 }, 42);
		let socket = emulator.open(SocketDomain { ipv6: false }).unwrap();
		emulator.bind(socket, Endpoint::virtual_id(1)).unwrap();
		emulator.send_to(socket, b"x", Endpoint::virtual_id(1)).unwrap();
		emulator.pump(socket, 0.0, 64);
		assert_eq!(emulator.drop_count(), 1);
		let mut buf = [0u8; 16];
		assert_eq!(emulator.recv_ready(socket, 0.0, &mut buf), Err(SocketError::WouldBlock));
	}

	#[test]
	fn latency_defers_delivery_until_deadline() {
		let inner = FakeSocket::new();
		let emulator = NetEmulator::new(inner, EmulatorConfig { loss_pct: 0.0, min_latency_ms: 100.0, max_latency_ms: 100.0 }, 7);
		let a = emulator.open(SocketDomain { ipv6: false }).unwrap();
		emulator.bind(a, Endpoint::virtual_id(1)).unwrap();
		emulator.send_to(a, b"late", Endpoint::virtual_id(1)).unwrap();
		emulator.pump(a, 0.0, 64);

		let mut buf = [0u8; 16];
		assert_eq!(emulator.recv_ready(a, 50.0, &mut buf), Err(SocketError::WouldBlock));
		let result = emulator.recv_ready(a, 150.0, &mut buf).unwrap();
		assert_eq!(&buf[..result.bytes], b"late");
	}

	#[test]
	fn recv_through_the_datagram_socket_trait_honors_set_now_ms() {
		let inner = FakeSocket::new();
		let emulator = NetEmulator::new(inner, EmulatorConfig { loss_pct: 0.0, min_latency_ms: 20.0, max_latency_ms: 20.0 }, 3);
		let socket = emulator.open(SocketDomain { ipv6: false }).unwrap();
		emulator.bind(socket, Endpoint::virtual_id(1)).unwrap();
		emulator.send_to(socket, b"hi", Endpoint::virtual_id(1)).unwrap();

		let mut buf = [0u8; 16];
		emulator.set_now_ms(0.0);
		assert_eq!(DatagramSocket::recv(&emulator, socket, &mut buf), Err(SocketError::WouldBlock));

		emulator.set_now_ms(25.0);
		let result = DatagramSocket::recv(&emulator, socket, &mut buf).unwrap();
		assert_eq!(&buf[..result.bytes], b"hi");
	}
}
