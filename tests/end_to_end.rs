//! End-to-end scenarios driving two [`ReliableTransport`] instances against
//! each other over a shared [`FakeSocket`] registry, with [`NetEmulator`]
//! spliced in where a scenario calls for loss, latency, or reordering.

use std::sync::Arc;

use relnet::config::Config;
use relnet::emulator::{EmulatorConfig, NetEmulator};
use relnet::endpoint::Endpoint;
use relnet::reliable::connection::ConnectionEvent;
use relnet::reliable::transport::ReliableTransport;
use relnet::socket::{DatagramSocket, FakeSocket};
use relnet::time::ManualClock;

const HOST_A: Endpoint = Endpoint::Virtual(1);
const HOST_B: Endpoint = Endpoint::Virtual(2);

/// Advance `clock` by `step_ms`, `iterations` times, calling `before_tick`
/// (to step any [`NetEmulator`]'s notion of "now") and then `update` on both
/// transports after every advance.
fn drive<S: DatagramSocket + Send + 'static>(
	clock: &ManualClock,
	a: &ReliableTransport<S>,
	b: &ReliableTransport<S>,
	iterations: usize,
	step_ms: f64,
	mut before_tick: impl FnMut(f64),
) {
	for _ in 0..iterations {
		clock.advance(step_ms);
		before_tick(clock.now_ms());
		a.update(clock);
		b.update(clock);
	}
}

/// Run the handshake (`a` connects, `b` accepts) to completion.
fn handshake<S: DatagramSocket + Send + 'static>(
	clock: &ManualClock,
	a: &ReliableTransport<S>,
	b: &ReliableTransport<S>,
	before_tick: impl FnMut(f64) + Copy,
) {
	a.connect(HOST_B);
	drive(clock, a, b, 5, 5.0, before_tick);
	assert!(b.drain_events().iter().any(|e| matches!(e.event, ConnectionEvent::OnConnectRequest)));

	b.accept(HOST_A);
	drive(clock, a, b, 5, 5.0, before_tick);
	assert!(a.drain_events().iter().any(|e| matches!(e.event, ConnectionEvent::OnConnected)));
}

/// Scenario 1: happy path, single reliable message (§8.4.1).
#[test]
fn happy_path_delivers_a_single_message_once() {
	let registry = Arc::new(FakeSocket::new());
	let a = ReliableTransport::new(registry.clone(), Config::default());
	let b = ReliableTransport::new(registry.clone(), Config::default());
	a.start_host(HOST_A).unwrap();
	b.start_host(HOST_B).unwrap();

	let clock = ManualClock::new();
	handshake(&clock, &a, &b, |_| {});

	a.send(HOST_B, true, b"ABC".to_vec(), true);
	drive(&clock, &a, &b, 5, 5.0, |_| {});

	let delivered: Vec<Vec<u8>> = b
		.drain_events()
		.into_iter()
		.filter_map(|e| match e.event {
			ConnectionEvent::NormalMessage(bytes) => Some(bytes),
			_ => None,
		})
		.collect();
	assert_eq!(delivered, vec![b"ABC".to_vec()]);

	// Idle well past one resend interval (33.3ms) but far short of the
	// 5s connection timeout: no further NormalMessage duplicates appear,
	// and the connection never times out.
	drive(&clock, &a, &b, 40, 5.0, |_| {});
	let later = b.drain_events();
	assert!(!later.iter().any(|e| matches!(e.event, ConnectionEvent::NormalMessage(_))));
	assert!(!later.iter().any(|e| matches!(e.event, ConnectionEvent::OnDisconnected)));
	assert_eq!(a.connection_stats(HOST_B).unwrap().out_of_order, 0);
}

/// Scenario 2: a dropped reliable message is still delivered, exactly once,
/// despite loss (§8.4.2).
#[test]
fn dropped_reliable_message_is_still_delivered_exactly_once() {
	let registry = Arc::new(FakeSocket::new());
	let emu_a = Arc::new(NetEmulator::new(registry.clone(), EmulatorConfig { loss_pct: 0.5, min_latency_ms: 1.0, max_latency_ms: 5.0 }, 11));
	let emu_b = Arc::new(NetEmulator::new(registry.clone(), EmulatorConfig { loss_pct: 0.5, min_latency_ms: 1.0, max_latency_ms: 5.0 }, 12));
	let a = ReliableTransport::new(emu_a.clone(), Config::default());
	let b = ReliableTransport::new(emu_b.clone(), Config::default());
	a.start_host(HOST_A).unwrap();
	b.start_host(HOST_B).unwrap();

	let clock = ManualClock::new();
	let before = |now: f64| {
		emu_a.set_now_ms(now);
		emu_b.set_now_ms(now);
	};
	handshake(&clock, &a, &b, before);

	a.send(HOST_B, true, b"lossy".to_vec(), true);
	// Generous budget: several resend intervals' worth of ticks so a dropped
	// packet has many chances to be retransmitted and land.
	drive(&clock, &a, &b, 400, 5.0, before);

	let delivered: Vec<Vec<u8>> = b
		.drain_events()
		.into_iter()
		.filter_map(|e| match e.event {
			ConnectionEvent::NormalMessage(bytes) => Some(bytes),
			_ => None,
		})
		.collect();
	assert_eq!(delivered, vec![b"lossy".to_vec()], "message must arrive exactly once despite loss");
}

/// Scenario 3: jittered reordering at the datagram layer never reorders the
/// reliable byte stream the application sees (§8.4.3).
#[test]
fn reordering_jitter_never_reorders_the_reliable_stream() {
	let registry = Arc::new(FakeSocket::new());
	let emu_a = Arc::new(NetEmulator::new(registry.clone(), EmulatorConfig { loss_pct: 0.0, min_latency_ms: 3.0, max_latency_ms: 60.0 }, 21));
	let emu_b = Arc::new(NetEmulator::new(registry.clone(), EmulatorConfig { loss_pct: 0.0, min_latency_ms: 3.0, max_latency_ms: 60.0 }, 22));
	let a = ReliableTransport::new(emu_a.clone(), Config::default());
	let b = ReliableTransport::new(emu_b.clone(), Config::default());
	a.start_host(HOST_A).unwrap();
	b.start_host(HOST_B).unwrap();

	let clock = ManualClock::new();
	let before = |now: f64| {
		emu_a.set_now_ms(now);
		emu_b.set_now_ms(now);
	};
	handshake(&clock, &a, &b, before);

	a.send(HOST_B, true, b"P1".to_vec(), true);
	a.send(HOST_B, true, b"P2".to_vec(), true);
	a.send(HOST_B, true, b"P3".to_vec(), true);
	drive(&clock, &a, &b, 200, 5.0, before);

	let delivered: Vec<Vec<u8>> = b
		.drain_events()
		.into_iter()
		.filter_map(|e| match e.event {
			ConnectionEvent::NormalMessage(bytes) => Some(bytes),
			_ => None,
		})
		.collect();
	assert_eq!(delivered, vec![b"P1".to_vec(), b"P2".to_vec(), b"P3".to_vec()]);
}

/// Scenario 4: an oversized payload is fragmented, survives loss and latency,
/// and reassembles byte-identical with no partial deliveries (§8.4.4).
#[test]
fn huge_payload_reassembles_byte_identical_under_loss_and_latency() {
	let registry = Arc::new(FakeSocket::new());
	let emu_a = Arc::new(NetEmulator::new(registry.clone(), EmulatorConfig { loss_pct: 0.25, min_latency_ms: 3.0, max_latency_ms: 200.0 }, 31));
	let emu_b = Arc::new(NetEmulator::new(registry.clone(), EmulatorConfig { loss_pct: 0.25, min_latency_ms: 3.0, max_latency_ms: 200.0 }, 32));
	let a = ReliableTransport::new(emu_a.clone(), Config::default());
	let b = ReliableTransport::new(emu_b.clone(), Config::default());
	a.start_host(HOST_A).unwrap();
	b.start_host(HOST_B).unwrap();

	let clock = ManualClock::new();
	let before = |now: f64| {
		emu_a.set_now_ms(now);
		emu_b.set_now_ms(now);
	};
	handshake(&clock, &a, &b, before);

	let mut payload = Vec::with_capacity(8192);
	for i in 0..(8192 / 4) {
		payload.extend_from_slice(&(i as u32).to_le_bytes());
	}
	assert_eq!(payload.len(), 8192);

	a.send(HOST_B, true, payload.clone(), true);
	drive(&clock, &a, &b, 2000, 5.0, before);

	let delivered: Vec<Vec<u8>> = b
		.drain_events()
		.into_iter()
		.filter_map(|e| match e.event {
			ConnectionEvent::NormalMessage(bytes) => Some(bytes),
			_ => None,
		})
		.collect();
	assert_eq!(delivered.len(), 1, "exactly one reassembled message, no partial deliveries");
	assert_eq!(delivered[0], payload);
}

/// Scenario 5: a reliable byte stream interleaved with unreliable keep-alive
/// style traffic survives loss in order, while the unreliable side is
/// best-effort (§8.4.5).
#[test]
fn mixed_reliable_and_unreliable_traffic_keeps_the_reliable_stream_intact() {
	let registry = Arc::new(FakeSocket::new());
	let emu_a = Arc::new(NetEmulator::new(registry.clone(), EmulatorConfig { loss_pct: 0.12, min_latency_ms: 1.0, max_latency_ms: 20.0 }, 41));
	let emu_b = Arc::new(NetEmulator::new(registry.clone(), EmulatorConfig { loss_pct: 0.12, min_latency_ms: 1.0, max_latency_ms: 20.0 }, 42));
	let a = ReliableTransport::new(emu_a.clone(), Config::default());
	let b = ReliableTransport::new(emu_b.clone(), Config::default());
	a.start_host(HOST_A).unwrap();
	b.start_host(HOST_B).unwrap();

	let clock = ManualClock::new();
	let before = |now: f64| {
		emu_a.set_now_ms(now);
		emu_b.set_now_ms(now);
	};
	handshake(&clock, &a, &b, before);

	let chunks: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 250]).collect();
	let unreliable_sent = 6usize;
	for chunk in &chunks {
		a.send(HOST_B, true, chunk.clone(), true);
		a.send(HOST_B, false, b"UNRELT".to_vec(), true);
	}
	for _ in chunks.len()..unreliable_sent {
		a.send(HOST_B, false, b"UNRELT".to_vec(), true);
	}
	drive(&clock, &a, &b, 600, 5.0, before);

	let mut reliable_delivered = Vec::new();
	let mut unreliable_count = 0usize;
	for event in b.drain_events() {
		match event.event {
			ConnectionEvent::NormalMessage(bytes) if bytes.len() == 250 => reliable_delivered.push(bytes),
			ConnectionEvent::NormalMessage(bytes) => {
				assert_eq!(bytes, b"UNRELT");
				unreliable_count += 1;
			}
			_ => {}
		}
	}
	assert_eq!(reliable_delivered, chunks, "reliable chunks arrive in order, byte-identical");
	assert!(unreliable_count <= unreliable_sent);
}

/// Scenario 6: if a peer goes silent, the survivor times the connection out
/// exactly once and refuses to keep sending to it (§8.4.6).
#[test]
fn silent_peer_is_disconnected_after_the_timeout() {
	let registry = Arc::new(FakeSocket::new());
	let mut config = Config::default();
	config.connection_timeout_ms = 200.0;
	let a = ReliableTransport::new(registry.clone(), config.clone());
	let b = ReliableTransport::new(registry.clone(), config);
	a.start_host(HOST_A).unwrap();
	b.start_host(HOST_B).unwrap();

	let clock = ManualClock::new();
	handshake(&clock, &a, &b, |_| {});
	assert!(a.connection_stats(HOST_B).is_some());

	// b goes silent: only a keeps ticking from here on.
	for _ in 0..80 {
		clock.advance(5.0);
		a.update(&clock);
	}

	let disconnects: Vec<_> =
		a.drain_events().into_iter().filter(|e| matches!(e.event, ConnectionEvent::OnDisconnected) && e.endpoint == HOST_B).collect();
	assert_eq!(disconnects.len(), 1, "exactly one timeout disconnect for the silent peer");
	assert!(a.connection_stats(HOST_B).is_none(), "the connection table entry is removed");

	a.send(HOST_B, true, b"too late".to_vec(), true);
	clock.advance(5.0);
	a.update(&clock);
	assert!(a.drain_events().is_empty(), "sends to a torn-down peer are silently rejected");
}
