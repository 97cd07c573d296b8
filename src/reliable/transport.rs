//! Owns the connection table and the scheduler (L4, §4.5, §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{error, warn};
use parking_lot::ReentrantMutex;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::SocketError;
use crate::socket::DatagramSocket;
use crate::time::{Clock, SystemClock};
use crate::unreliable::UnreliableTransport;

use super::connection::{ConnectionEvent, ReliableConnection};
use super::{ConnectionState, MessageClass};

/// Scheduler tick target in asynchronous mode (§4.5).
const SCHEDULER_TICK: Duration = Duration::from_millis(2);

/// Work items accepted by the task queue (§5); executed FIFO on the
/// scheduler task so that, e.g., a `disconnect` enqueued after a `send`
/// transmits the send first.
enum Task {
	Send { endpoint: Endpoint, reliable: bool, bytes: Vec<u8>, flush: bool },
	Connect { endpoint: Endpoint },
	Disconnect { endpoint: Endpoint },
	Refuse { endpoint: Endpoint },
}

/// An event surfaced up to [`crate::channel::Channel`] (§4.4.3, §4.4.6),
/// paired with the peer it concerns.
pub struct TransportEvent {
	pub endpoint: Endpoint,
	pub event: ConnectionEvent,
}

/// Owns `Endpoint -> ReliableConnection`, a work queue, and a scheduler
/// (§4.5). All public methods are thread-safe; state mutation happens only
/// on the scheduler task, guarded by a reentrant "transport lock" (§5).
pub struct ReliableTransport<S> {
	inner: Arc<ReentrantMutex<std::cell::RefCell<Inner<S>>>>,
	task_tx: Sender<Task>,
	task_rx: Receiver<Task>,
	scheduler_thread: Option<JoinHandle<()>>,
	async_mode: Arc<AtomicBool>,
}

struct Inner<S> {
	unreliable: UnreliableTransport<S>,
	connections: HashMap<Endpoint, ReliableConnection>,
	config: Config,
	events: Vec<TransportEvent>,
	last_scheduler_warning_ms: f64,
	/// The most recent tick's timestamp, reused by synchronous, queue-bypassing
	/// calls like [`ReliableTransport::accept`] that need "now" but must
	/// return their result immediately rather than via a deferred task (§4.4.6).
	last_now_ms: f64,
}

impl<S: DatagramSocket + Send + 'static> ReliableTransport<S> {
	pub fn new(socket: S, config: Config) -> Self {
		let (task_tx, task_rx) = crossbeam_channel::unbounded();
		let unreliable = UnreliableTransport::new(socket, config.clone());
		let inner = Inner {
			unreliable,
			connections: HashMap::new(),
			config: config.clone(),
			events: Vec::new(),
			last_scheduler_warning_ms: f64::NEG_INFINITY,
			last_now_ms: 0.0,
		};
		Self {
			inner: Arc::new(ReentrantMutex::new(std::cell::RefCell::new(inner))),
			task_tx,
			task_rx,
			scheduler_thread: None,
			async_mode: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn start_host(&self, bind_endpoint: Endpoint) -> Result<(), SocketError> {
		let guard = self.inner.lock();
		guard.borrow_mut().unreliable.start_host(bind_endpoint)
	}

	pub fn start_client(&self) -> Result<(), SocketError> {
		let guard = self.inner.lock();
		guard.borrow_mut().unreliable.start_client()
	}

	pub fn stop(&self) -> Result<(), SocketError> {
		let guard = self.inner.lock();
		guard.borrow_mut().unreliable.stop()
	}

	pub fn local_endpoint(&self) -> Endpoint {
		let guard = self.inner.lock();
		guard.borrow().unreliable.local_endpoint()
	}

	/// Enqueue work; returns immediately (§4.5, §5).
	pub fn send(&self, endpoint: Endpoint, reliable: bool, bytes: Vec<u8>, flush: bool) {
		let _ = self.task_tx.send(Task::Send { endpoint, reliable, bytes, flush });
	}

	pub fn connect(&self, endpoint: Endpoint) {
		let _ = self.task_tx.send(Task::Connect { endpoint });
	}

	pub fn disconnect(&self, endpoint: Endpoint) {
		let _ = self.task_tx.send(Task::Disconnect { endpoint });
	}

	/// Accept a pending incoming handshake immediately, bypassing the task
	/// queue (mirroring [`is_connected`]'s direct-lock read): the caller
	/// needs the real accept/reject outcome back synchronously, not on the
	/// next tick. Returns `false` and logs a warning, without panicking, if
	/// `endpoint` has no connection awaiting a response (§4.4.6, §7).
	pub fn accept(&self, endpoint: Endpoint) -> bool {
		let guard = self.inner.lock();
		let mut state = guard.borrow_mut();
		let now_ms = state.last_now_ms;
		match state.connections.get_mut(&endpoint) {
			Some(connection) => connection.accept(now_ms),
			None => {
				warn!("accept for unknown endpoint {}", endpoint);
				false
			}
		}
	}

	pub fn refuse(&self, endpoint: Endpoint) {
		let _ = self.task_tx.send(Task::Refuse { endpoint });
	}

	/// Switch between a dedicated scheduler thread (asynchronous) and a
	/// caller-driven tick (synchronous). Atomic: cancels any running timer
	/// before returning (§4.5, §5).
	pub fn set_async_mode(&mut self, enabled: bool)
	where
		S: 'static,
	{
		self.async_mode.store(enabled, Ordering::SeqCst);
		if enabled {
			if self.scheduler_thread.is_some() {
				return;
			}
			let inner = self.inner.clone();
			let task_rx = self.task_rx.clone();
			let async_mode = self.async_mode.clone();
			let clock = SystemClock::new();
			self.scheduler_thread = Some(std::thread::spawn(move || {
				while async_mode.load(Ordering::SeqCst) {
					run_scheduler_tick(&inner, &task_rx, &clock);
					std::thread::sleep(SCHEDULER_TICK);
				}
			}));
		} else if let Some(handle) = self.scheduler_thread.take() {
			let _ = handle.join();
		}
	}

	/// Caller-driven scheduler tick (synchronous mode); a no-op while
	/// asynchronous mode owns the tick (§4.5).
	pub fn update(&self, clock: &dyn Clock) {
		if self.async_mode.load(Ordering::SeqCst) {
			return;
		}
		run_scheduler_tick(&self.inner, &self.task_rx, clock);
	}

	/// Drain events raised since the last call (connection/application events,
	/// forwarded to [`crate::channel::Channel`]).
	pub fn drain_events(&self) -> Vec<TransportEvent> {
		let guard = self.inner.lock();
		std::mem::take(&mut guard.borrow_mut().events)
	}

	/// A snapshot of the per-connection counters (§3.6, §7), for diagnostics
	/// and tests; `None` if there is no connection table entry for `endpoint`.
	pub fn connection_stats(&self, endpoint: Endpoint) -> Option<crate::stats::ConnectionStats> {
		let guard = self.inner.lock();
		let state = guard.borrow();
		state.connections.get(&endpoint).map(|c| c.stats.clone())
	}
}

impl<S> Drop for ReliableTransport<S> {
	fn drop(&mut self) {
		self.async_mode.store(false, Ordering::SeqCst);
		if let Some(handle) = self.scheduler_thread.take() {
			let _ = handle.join();
		}
	}
}

fn run_scheduler_tick<S: DatagramSocket>(inner: &ReentrantMutex<std::cell::RefCell<Inner<S>>>, task_rx: &Receiver<Task>, clock: &dyn Clock) {
	let guard = inner.lock();
	let mut state = guard.borrow_mut();
	let now_ms = clock.now_ms();
	state.last_now_ms = now_ms;

	while let Ok(task) = task_rx.try_recv() {
		state.handle_task(task, now_ms);
	}

	state.drain_socket(now_ms);
	state.tick_connections(now_ms);
}

impl<S: DatagramSocket> Inner<S> {
	fn connection_mut(&mut self, endpoint: Endpoint, now_ms: f64) -> &mut ReliableConnection {
		let max_payload = self.unreliable.max_payload_bytes();
		let config = self.config.clone();
		self.connections
			.entry(endpoint)
			.or_insert_with(|| ReliableConnection::new(endpoint, config, max_payload, now_ms))
	}

	fn handle_task(&mut self, task: Task, now_ms: f64) {
		match task {
			Task::Send { endpoint, reliable, bytes, flush } => {
				if !self.connections.contains_key(&endpoint) {
					warn!("send to unknown endpoint {}", endpoint);
					return;
				}
				let class = if reliable { MessageClass::SingleReliable } else { MessageClass::SingleUnreliable };
				let budget = self.config.max_packets_to_send_on_send_message;
				let unreliable = &mut self.unreliable;
				let connection = self.connections.get_mut(&endpoint).unwrap();
				connection.enqueue(&bytes, class, reliable, flush, now_ms);
				if connection.has_due_work(now_ms) {
					connection.send_optimal_unacked_packets(budget, now_ms, |framed| unreliable.send_to(endpoint, framed));
				}
			}
			Task::Connect { endpoint } => {
				self.connection_mut(endpoint, now_ms).connect(now_ms);
			}
			Task::Disconnect { endpoint } => {
				if let Some(mut connection) = self.connections.remove(&endpoint) {
					let unreliable = &mut self.unreliable;
					connection.disconnect(now_ms, |framed| unreliable.send_to(endpoint, framed));
					self.events.push(TransportEvent { endpoint, event: ConnectionEvent::OnDisconnected });
				}
			}
			Task::Refuse { endpoint } => {
				if let Some(mut connection) = self.connections.remove(&endpoint) {
					connection.refuse();
				}
			}
		}
	}

	fn drain_socket(&mut self, now_ms: f64) {
		for (source, payload) in self.unreliable.update() {
			let max_payload = self.unreliable.max_payload_bytes();
			let config = self.config.clone();
			let connection = self
				.connections
				.entry(source)
				.or_insert_with(|| ReliableConnection::new(source, config, max_payload, now_ms));
			let unreliable = &mut self.unreliable;
			let events = connection.handle_incoming(&payload, now_ms, |framed| unreliable.send_to(source, framed));
			for event in events {
				self.events.push(TransportEvent { endpoint: source, event });
			}
		}
	}

	fn tick_connections(&mut self, now_ms: f64) {
		let budget = self.config.max_packets_to_resend_on_update;
		let timeout_endpoints: Vec<Endpoint> = self
			.connections
			.iter()
			.filter(|(_, connection)| connection.is_timed_out(now_ms))
			.map(|(endpoint, _)| *endpoint)
			.collect();

		for endpoint in &self.connections.keys().copied().collect::<Vec<_>>() {
			if timeout_endpoints.contains(endpoint) {
				continue;
			}
			let unreliable = &mut self.unreliable;
			if let Some(connection) = self.connections.get_mut(endpoint) {
				connection.update(now_ms, budget, |framed| unreliable.send_to(*endpoint, framed));
			}
		}

		for endpoint in timeout_endpoints {
			self.connections.remove(&endpoint);
			self.events.push(TransportEvent { endpoint, event: ConnectionEvent::OnDisconnected });
		}
	}
}

/// Whether a connection for `endpoint` is currently in the `Connected` state;
/// used by [`crate::channel::Channel`] to decide whether `send` should queue
/// or reject (§4.6).
pub fn is_connected<S: DatagramSocket>(transport: &ReliableTransport<S>, endpoint: Endpoint) -> bool {
	let guard = transport.inner.lock();
	let state = guard.borrow();
	matches!(state.connections.get(&endpoint).map(|c| c.state), Some(ConnectionState::Connected))
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::socket::FakeSocket;
	use crate::time::ManualClock;

	#[test]
	fn connect_and_send_round_trip_between_two_transports() {
		// Both transports share one registry, the same way two real hosts
		// share one network: `a`'s SYN is visible to `b` immediately.
		let registry = Arc::new(FakeSocket::new());
		let a = ReliableTransport::new(registry.clone(), Config::default());
		let b = ReliableTransport::new(registry.clone(), Config::default());
		a.start_host(Endpoint::virtual_id(1)).unwrap();
		b.start_host(Endpoint::virtual_id(2)).unwrap();

		let clock = ManualClock::new();
		a.connect(Endpoint::virtual_id(2));
		a.update(&clock);
		clock.advance(5.0);
		b.update(&clock);

		let b_events = b.drain_events();
		assert!(b_events.iter().any(|e| matches!(e.event, ConnectionEvent::OnConnectRequest)));

		b.accept(Endpoint::virtual_id(1));
		clock.advance(5.0);
		b.update(&clock);
		clock.advance(5.0);
		a.update(&clock);

		let a_events = a.drain_events();
		assert!(a_events.iter().any(|e| matches!(e.event, ConnectionEvent::OnConnected)));

		a.send(Endpoint::virtual_id(2), true, b"hello".to_vec(), true);
		clock.advance(5.0);
		a.update(&clock);
		clock.advance(5.0);
		b.update(&clock);

		let b_events = b.drain_events();
		assert!(b_events.iter().any(|e| matches!(&e.event, ConnectionEvent::NormalMessage(bytes) if bytes == b"hello")));
	}
}
