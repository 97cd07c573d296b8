//! Outgoing message bookkeeping (§3.6 `PendingMessage`, §3.7 reassembly).

use std::collections::VecDeque;

use super::{distance, MessageClass, SeqId};

/// An outgoing message that has been enqueued but not yet deleted: an
/// unreliable message lives until its first send; a reliable one lives
/// until acknowledged (§3.6).
#[derive(Debug, Clone)]
pub struct PendingMessage {
	pub payload: Vec<u8>,
	pub class: MessageClass,
	/// `SeqId::INVALID` for unreliable messages.
	pub seq_id: SeqId,
	pub flush: bool,
	/// When this message was enqueued into the connection's pending list;
	/// `queued_time` (§3.6) samples `first_sent_ms - queued_at_ms`.
	pub queued_at_ms: f64,
	pub first_sent_ms: Option<f64>,
	pub last_sent_ms: Option<f64>,
}

impl PendingMessage {
	pub fn is_reliable(&self) -> bool {
		self.seq_id.is_valid()
	}

	/// The "effective oldest time" used to pick a scheduling anchor (§4.4.2):
	/// `last_sent` if ever sent, otherwise treated as just past due.
	pub fn effective_time_ms(&self, now_ms: f64, resend_interval_ms: f64, last_recv_ms: f64, min_expected_ack_time_ms: f64) -> f64 {
		let mut t = match self.last_sent_ms {
			Some(sent) => sent,
			None => now_ms - resend_interval_ms - 1.0,
		};
		if t < last_recv_ms - min_expected_ack_time_ms {
			t -= resend_interval_ms;
		}
		t
	}
}

/// The ordered outgoing queue for one peer. Maintains the invariant that the
/// subsequence of reliable entries has strictly increasing (wrap-aware)
/// sequence ids, and that the first reliable entry's id is the oldest
/// unacknowledged outgoing id (§3.6).
#[derive(Debug, Default)]
pub struct PendingList {
	messages: VecDeque<PendingMessage>,
}

impl PendingList {
	pub fn new() -> Self {
		Self { messages: VecDeque::new() }
	}

	pub fn push_back(&mut self, message: PendingMessage) {
		debug_assert!(
			!message.is_reliable()
				|| self
					.messages
					.iter()
					.rev()
					.find(|m| m.is_reliable())
					.map(|last| distance(message.seq_id, last.seq_id) > 0)
					.unwrap_or(true),
			"reliable sequence ids must be strictly increasing"
		);
		self.messages.push_back(message);
	}

	pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
		self.messages.iter()
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingMessage> {
		self.messages.iter_mut()
	}

	pub fn is_empty(&self) -> bool {
		self.messages.is_empty()
	}

	pub fn len(&self) -> usize {
		self.messages.len()
	}

	pub fn front(&self) -> Option<&PendingMessage> {
		self.messages.front()
	}

	/// Remove every reliable message whose id falls in `(prev_last_acked,
	/// new_last_acked]` (wrap-aware), returning the `(now - first_sent)`
	/// ack-RTT sample for each removed message (§4.4.3 `update_last_acked`).
	pub fn acknowledge_up_to(&mut self, prev_last_acked: SeqId, new_last_acked: SeqId, now_ms: f64) -> Vec<f64> {
		if !new_last_acked.is_valid() {
			return Vec::new();
		}
		let mut samples = Vec::new();
		self.messages.retain(|message| {
			if message.is_reliable() && in_open_closed_range(message.seq_id, prev_last_acked, new_last_acked) {
				if let Some(first_sent) = message.first_sent_ms {
					samples.push(now_ms - first_sent);
				}
				false
			} else {
				true
			}
		});
		samples
	}

	/// Drop every unreliable entry matching `predicate` (used once a packet
	/// carrying them has actually been sent).
	pub fn remove_sent_unreliable(&mut self, sent_indices: &[usize]) {
		let mut sorted = sent_indices.to_vec();
		sorted.sort_unstable_by(|a, b| b.cmp(a));
		for index in sorted {
			if self.messages.get(index).map(|m| !m.is_reliable()).unwrap_or(false) {
				self.messages.remove(index);
			}
		}
	}

	pub fn get(&self, index: usize) -> Option<&PendingMessage> {
		self.messages.get(index)
	}

	pub fn get_mut(&mut self, index: usize) -> Option<&mut PendingMessage> {
		self.messages.get_mut(index)
	}

	pub fn position_of_anchor(
		&self,
		now_ms: f64,
		resend_interval_ms: f64,
		last_recv_ms: f64,
		min_expected_ack_time_ms: f64,
	) -> Option<usize> {
		self.messages
			.iter()
			.enumerate()
			.min_by(|(_, a), (_, b)| {
				a.effective_time_ms(now_ms, resend_interval_ms, last_recv_ms, min_expected_ack_time_ms)
					.partial_cmp(&b.effective_time_ms(now_ms, resend_interval_ms, last_recv_ms, min_expected_ack_time_ms))
					.unwrap()
			})
			.map(|(i, _)| i)
	}
}

/// `s` in the half-open-from-below range reached by successor-walking from
/// `a` (exclusive) to `b` (inclusive); used by ack processing (§4.4.3).
fn in_open_closed_range(s: SeqId, a: SeqId, b: SeqId) -> bool {
	if !b.is_valid() {
		return false;
	}
	if !a.is_valid() {
		// Nothing acknowledged yet: everything up to and including b qualifies.
		return s.in_range(SeqId::FIRST, b) || s == b;
	}
	s != a && s.in_range(a, b)
}

/// Growing buffer for an in-progress [`MessageClass::MultiPartMessage`] (§3.7).
#[derive(Debug, Default)]
pub struct PendingMultiPart {
	bytes: Vec<u8>,
	total_parts: u8,
	next_expected_part: u8,
}

impl PendingMultiPart {
	pub fn is_in_progress(&self) -> bool {
		self.next_expected_part > 1
	}

	/// Append `chunk` if it is the expected next part, in order. Returns
	/// `Some(payload)` once the final part completes the message.
	pub fn accept(&mut self, part_index: u8, total_parts: u8, chunk: &[u8]) -> Option<Vec<u8>> {
		if !self.is_in_progress() {
			self.total_parts = total_parts;
			self.next_expected_part = 1;
		}
		if part_index != self.next_expected_part || total_parts != self.total_parts {
			// Out-of-order or mismatched part: reset, dropping partial progress.
			self.reset();
			return None;
		}
		self.bytes.extend_from_slice(chunk);
		if part_index == self.total_parts {
			let completed = std::mem::take(&mut self.bytes);
			self.reset();
			Some(completed)
		} else {
			self.next_expected_part += 1;
			None
		}
	}

	pub fn reset(&mut self) {
		self.bytes.clear();
		self.total_parts = 0;
		self.next_expected_part = 0;
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn msg(seq: u16, reliable: bool) -> PendingMessage {
		PendingMessage {
			payload: Vec::new(),
			class: if reliable { MessageClass::SingleReliable } else { MessageClass::SingleUnreliable },
			seq_id: if reliable { SeqId(seq) } else { SeqId::INVALID },
			flush: false,
			queued_at_ms: 0.0,
			first_sent_ms: None,
			last_sent_ms: None,
		}
	}

	#[test]
	fn acknowledge_up_to_removes_only_the_acked_range() {
		let mut list = PendingList::new();
		list.push_back(msg(1, true));
		list.push_back(msg(2, true));
		list.push_back(msg(3, true));

		for m in list.iter_mut() {
			m.first_sent_ms = Some(0.0);
		}

		let samples = list.acknowledge_up_to(SeqId::INVALID, SeqId(2), 100.0);
		assert_eq!(samples.len(), 2);
		assert_eq!(list.len(), 1);
		assert_eq!(list.front().unwrap().seq_id, SeqId(3));
	}

	#[test]
	fn acknowledge_handles_wraparound() {
		let mut list = PendingList::new();
		list.push_back(msg(65535, true));
		list.push_back(msg(1, true));
		for m in list.iter_mut() {
			m.first_sent_ms = Some(0.0);
		}
		let samples = list.acknowledge_up_to(SeqId(65534), SeqId(1), 10.0);
		assert_eq!(samples.len(), 2);
		assert!(list.is_empty());
	}

	#[test]
	fn multi_part_delivers_only_on_final_chunk() {
		let mut reassembly = PendingMultiPart::default();
		assert_eq!(reassembly.accept(1, 3, b"AAA"), None);
		assert_eq!(reassembly.accept(2, 3, b"BBB"), None);
		assert_eq!(reassembly.accept(3, 3, b"CCC"), Some(b"AAABBBCCC".to_vec()));
		assert!(!reassembly.is_in_progress());
	}

	#[test]
	fn multi_part_resets_on_out_of_order_chunk() {
		let mut reassembly = PendingMultiPart::default();
		reassembly.accept(1, 2, b"A");
		assert_eq!(reassembly.accept(1, 2, b"B"), None);
		assert!(!reassembly.is_in_progress());
	}
}
