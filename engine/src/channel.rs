//! Per-channel state machine: seqno windows, pending messages, reply
//! serialization, and the ANS/NUL reply stream (§4.2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use wire::{Frame, FrameType, Reassembler, SeqFrame};

use crate::error::{EngineError, Result};
use crate::profile::FrameReceivedHook;
use crate::sequencer::SequencerWaker;
use crate::ticket::WaitReplyTicket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
	Opening,
	Open,
	Closing,
	Closed,
}

#[derive(Debug, Clone, Copy)]
struct Window {
	next_seq_no: u32,
	max_seq_no_remote_accepted: u32,
	next_expected_seq_no: u32,
	max_seq_no_accepted: u32,
	window_size: u32,
}

/// One not-yet-fully-sent message or reply frame sitting in a channel's
/// send queue. May be drained over several wire frames if it outgrows the
/// window or the sequencer's per-iteration size hint.
#[derive(Clone)]
struct Outgoing {
	kind: FrameType,
	msg_no: u32,
	ans_no: Option<u32>,
	payload: Bytes,
	offset: usize,
	/// `false` only for a streaming MSG the caller asked to keep open
	/// (`send_msg(.., more = true)`) awaiting a further chunk.
	final_frame: bool,
}

fn seq_gt(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) > 0
}

pub struct Channel {
	pub number: u32,
	pub profile_uri: String,
	connection_id: u64,
	state: Mutex<ChannelState>,
	window: Mutex<Window>,
	next_msg_no: AtomicU32,
	next_ans_no: Mutex<IndexMap<u32, u32>>,
	/// MSGs we sent that are still awaiting their reply series.
	outstanding_sent: Mutex<VecDeque<u32>>,
	/// MSGs we received, in receipt order; a reply is only moved onto the
	/// wire once its msg-no reaches the front of this queue.
	reply_order: Mutex<VecDeque<u32>>,
	pending_replies: Mutex<IndexMap<u32, Vec<Outgoing>>>,
	/// ANS frames accumulated for a series not yet finalized by a NUL.
	series_buffer: Mutex<IndexMap<u32, Vec<Outgoing>>>,
	send_queue: Mutex<VecDeque<Outgoing>>,
	reassembler: Mutex<Reassembler>,
	complete_flag: AtomicBool,
	serialize: AtomicBool,
	frame_received: Mutex<Option<FrameReceivedHook>>,
	outstanding_limit: Mutex<Option<usize>>,
	wait_tickets: Mutex<IndexMap<u32, Arc<WaitReplyTicket>>>,
	waker: Arc<SequencerWaker>,
	being_closed: AtomicBool,
	/// Held for the duration of a frame-received callback when
	/// `serialize` is on, so the next frame's callback waits its turn.
	dispatch_mutex: Mutex<()>,
}

impl Channel {
	pub fn new(number: u32, profile_uri: String, connection_id: u64, window_size: u32, reassembly_limit: usize, waker: Arc<SequencerWaker>) -> Arc<Self> {
		Arc::new(Self {
			number,
			profile_uri,
			connection_id,
			state: Mutex::new(ChannelState::Opening),
			window: Mutex::new(Window { next_seq_no: 0, max_seq_no_remote_accepted: window_size, next_expected_seq_no: 0, max_seq_no_accepted: window_size, window_size }),
			next_msg_no: AtomicU32::new(0),
			next_ans_no: Mutex::new(IndexMap::new()),
			outstanding_sent: Mutex::new(VecDeque::new()),
			reply_order: Mutex::new(VecDeque::new()),
			pending_replies: Mutex::new(IndexMap::new()),
			series_buffer: Mutex::new(IndexMap::new()),
			send_queue: Mutex::new(VecDeque::new()),
			reassembler: Mutex::new(Reassembler::new(reassembly_limit)),
			complete_flag: AtomicBool::new(true),
			serialize: AtomicBool::new(false),
			frame_received: Mutex::new(None),
			outstanding_limit: Mutex::new(None),
			wait_tickets: Mutex::new(IndexMap::new()),
			waker,
			being_closed: AtomicBool::new(false),
			dispatch_mutex: Mutex::new(()),
		})
	}

	/// Acquired by the dispatcher before invoking the frame-received hook
	/// when `serialize` is on; a no-op scope otherwise.
	pub fn lock_dispatch(&self) -> parking_lot::MutexGuard<'_, ()> {
		self.dispatch_mutex.lock()
	}

	pub fn state(&self) -> ChannelState {
		*self.state.lock()
	}

	pub fn set_state(&self, state: ChannelState) {
		*self.state.lock() = state;
	}

	pub fn set_complete_flag(&self, on: bool) {
		self.complete_flag.store(on, Ordering::Relaxed);
	}

	pub fn complete_flag(&self) -> bool {
		self.complete_flag.load(Ordering::Relaxed)
	}

	pub fn set_serialize(&self, on: bool) {
		self.serialize.store(on, Ordering::Relaxed);
	}

	pub fn serialize(&self) -> bool {
		self.serialize.load(Ordering::Relaxed)
	}

	pub fn set_window_size(&self, size: u32) {
		self.window.lock().window_size = size;
	}

	pub fn set_frame_received(&self, hook: FrameReceivedHook) {
		*self.frame_received.lock() = Some(hook);
	}

	pub fn frame_received_hook(&self) -> Option<FrameReceivedHook> {
		self.frame_received.lock().clone()
	}

	pub fn set_outstanding_limit(&self, limit: Option<usize>) {
		*self.outstanding_limit.lock() = limit;
	}

	/// Used only by channel zero, to reserve msg-no 0 for the greeting
	/// exchange and start its own start/close requests at 1.
	pub(crate) fn set_next_msg_no(&self, value: u32) {
		self.next_msg_no.store(value, Ordering::SeqCst);
	}

	pub fn being_closed(&self) -> bool {
		self.being_closed.load(Ordering::Relaxed)
	}

	pub fn set_being_closed(&self, on: bool) {
		self.being_closed.store(on, Ordering::Relaxed);
	}

	fn enqueue(&self, outgoing: Outgoing) {
		self.send_queue.lock().push_back(outgoing);
		self.waker.notify(self.connection_id, self.number);
	}

	/// Allocates a fresh msg-no and queues `payload`. `more = true` leaves
	/// the message open for a later chunk under the same msg-no.
	pub fn send_msg(&self, payload: Bytes, more: bool) -> Result<u32> {
		if let Some(limit) = *self.outstanding_limit.lock() {
			if self.outstanding_sent.lock().len() >= limit {
				return Err(EngineError::Channel(format!("channel {}: outstanding-message limit reached", self.number)));
			}
		}

		let msg_no = self.next_msg_no.fetch_add(1, Ordering::SeqCst);
		self.outstanding_sent.lock().push_back(msg_no);
		self.enqueue(Outgoing { kind: FrameType::Msg, msg_no, ans_no: None, payload, offset: 0, final_frame: !more });
		Ok(msg_no)
	}

	/// Like [`Channel::send_msg`], but registers the reply wait ticket
	/// before the message is handed to the sequencer, so a fast peer's
	/// reply can never race ahead of the caller's wait.
	pub fn send_msg_and_wait_ticket(&self, payload: Bytes, more: bool) -> Result<(u32, Arc<WaitReplyTicket>)> {
		if let Some(limit) = *self.outstanding_limit.lock() {
			if self.outstanding_sent.lock().len() >= limit {
				return Err(EngineError::Channel(format!("channel {}: outstanding-message limit reached", self.number)));
			}
		}

		let msg_no = self.next_msg_no.fetch_add(1, Ordering::SeqCst);
		let ticket = self.register_wait_ticket(msg_no);
		self.outstanding_sent.lock().push_back(msg_no);
		self.enqueue(Outgoing { kind: FrameType::Msg, msg_no, ans_no: None, payload, offset: 0, final_frame: !more });
		Ok((msg_no, ticket))
	}

	fn stage_reply(&self, msg_no: u32, frames: Vec<Outgoing>) {
		self.pending_replies.lock().insert(msg_no, frames);
		self.flush_ready_replies();
	}

	/// Moves every reply series that has reached the front of
	/// `reply_order` onto the send queue, in order, regardless of the
	/// order the caller actually submitted them in.
	fn flush_ready_replies(&self) {
		loop {
			let head = { self.reply_order.lock().front().copied() };
			let Some(head) = head else { break };

			let taken = { self.pending_replies.lock().shift_remove(&head) };
			let Some(frames) = taken else { break };

			self.reply_order.lock().pop_front();

			let mut queue = self.send_queue.lock();
			queue.extend(frames);
			drop(queue);

			self.waker.notify(self.connection_id, self.number);
		}
	}

	/// Records that a MSG was received, establishing its place in the
	/// reply-ordering FIFO before the caller's frame-received hook runs.
	pub fn record_received_msg(&self, msg_no: u32) {
		self.reply_order.lock().push_back(msg_no);
	}

	pub fn send_rpy(&self, msg_no: u32, payload: Bytes) {
		self.stage_reply(msg_no, vec![Outgoing { kind: FrameType::Rpy, msg_no, ans_no: None, payload, offset: 0, final_frame: true }]);
	}

	pub fn send_err(&self, msg_no: u32, payload: Bytes) {
		self.stage_reply(msg_no, vec![Outgoing { kind: FrameType::Err, msg_no, ans_no: None, payload, offset: 0, final_frame: true }]);
	}

	/// Queues one frame of an ANS series for `msg_no`; the series is not
	/// eligible for the wire until [`Channel::finalize_ans`] is called.
	pub fn send_ans(&self, msg_no: u32, payload: Bytes) -> u32 {
		let mut next_ans = self.next_ans_no.lock();
		let ans_no = *next_ans.entry(msg_no).and_modify(|n| *n += 1).or_insert(0);
		drop(next_ans);

		self.series_buffer.lock().entry(msg_no).or_default().push(Outgoing { kind: FrameType::Ans, msg_no, ans_no: Some(ans_no), payload, offset: 0, final_frame: true });

		ans_no
	}

	/// Appends the terminating NUL and stages the whole series.
	pub fn finalize_ans(&self, msg_no: u32) {
		let mut frames = self.series_buffer.lock().shift_remove(&msg_no).unwrap_or_default();
		frames.push(Outgoing { kind: FrameType::Nul, msg_no, ans_no: None, payload: Bytes::new(), offset: 0, final_frame: true });
		self.next_ans_no.lock().shift_remove(&msg_no);
		self.stage_reply(msg_no, frames);
	}

	pub fn register_wait_ticket(&self, msg_no: u32) -> Arc<WaitReplyTicket> {
		let ticket = WaitReplyTicket::new();
		self.wait_tickets.lock().insert(msg_no, ticket.clone());
		ticket
	}

	pub(crate) fn wait_ticket_for(&self, msg_no: u32) -> Option<Arc<WaitReplyTicket>> {
		self.wait_tickets.lock().get(&msg_no).cloned()
	}

	pub(crate) fn remove_wait_ticket(&self, msg_no: u32) {
		self.wait_tickets.lock().shift_remove(&msg_no);
	}

	pub fn wait_reply(&self, msg_no: u32, timeout: Option<Duration>) -> Option<Frame> {
		self.wait_ticket_for(msg_no)?.wait(timeout)
	}

	pub(crate) fn complete_outstanding(&self, msg_no: u32) {
		let mut out = self.outstanding_sent.lock();
		if let Some(pos) = out.iter().position(|&m| m == msg_no) {
			out.remove(pos);
		}
	}

	/// Applies a received data frame to the receive-side window and (if
	/// the complete-flag is on) reassembly state. Returns the frame ready
	/// for dispatch, if any, plus a SEQ frame to emit, if the advertised
	/// window should advance.
	pub fn receive(&self, frame: Frame) -> Result<(Option<Frame>, Option<SeqFrame>)> {
		let mut window = self.window.lock();

		if frame.seq_no != window.next_expected_seq_no {
			return Err(EngineError::Protocol(format!("channel {}: seqno mismatch: expected {}, got {}", self.number, window.next_expected_seq_no, frame.seq_no)));
		}

		window.next_expected_seq_no = window.next_expected_seq_no.wrapping_add(frame.payload.len() as u32);

		let mut seq_to_emit = None;
		let room_left = window.max_seq_no_accepted.wrapping_sub(window.next_expected_seq_no);
		if window.window_size > 0 && room_left <= window.window_size / 2 {
			window.max_seq_no_accepted = window.next_expected_seq_no.wrapping_add(window.window_size);
			seq_to_emit = Some(SeqFrame { channel: self.number, ack_no: window.next_expected_seq_no, window: window.window_size });
		}
		drop(window);

		if self.complete_flag.load(Ordering::Relaxed) {
			let joined = self.reassembler.lock().accept(frame)?;
			Ok((joined, seq_to_emit))
		} else {
			Ok((Some(frame), seq_to_emit))
		}
	}

	/// Applies a SEQ frame from the peer, expanding our send window.
	pub fn apply_seq(&self, seq: SeqFrame) -> Result<()> {
		let mut window = self.window.lock();

		if seq_gt(seq.ack_no, window.next_seq_no) {
			return Err(EngineError::Protocol(format!("channel {}: SEQ ackno {} beyond sent seqno {}", self.number, seq.ack_no, window.next_seq_no)));
		}

		window.max_seq_no_remote_accepted = seq.ack_no.wrapping_add(seq.window);
		drop(window);

		self.waker.notify(self.connection_id, self.number);
		Ok(())
	}

	fn remaining_window(&self) -> u32 {
		let w = self.window.lock();
		w.max_seq_no_remote_accepted.wrapping_sub(w.next_seq_no)
	}

	pub fn has_pending_work(&self) -> bool {
		!self.send_queue.lock().is_empty()
	}

	/// Pops and encodes the next wire frame from the head of the send
	/// queue, consuming up to `max_size` bytes and never more than the
	/// remaining remote window. Returns `None` if there is no work or the
	/// channel is window-stalled.
	pub fn next_outgoing(&self, max_size: usize) -> Option<Frame> {
		let remaining_window = self.remaining_window() as usize;
		if remaining_window == 0 {
			return None;
		}

		let mut queue = self.send_queue.lock();
		let item = queue.front_mut()?;

		let remaining_payload = item.payload.len() - item.offset;
		let take = remaining_payload.min(max_size).min(remaining_window);

		if take == 0 {
			return None;
		}

		let chunk = item.payload.slice(item.offset..item.offset + take);

		let mut window = self.window.lock();
		let seq_no = window.next_seq_no;
		window.next_seq_no = window.next_seq_no.wrapping_add(take as u32);
		drop(window);

		item.offset += take;
		let item_done = item.offset >= item.payload.len();
		let kind = item.kind;
		let msg_no = item.msg_no;
		let ans_no = item.ans_no;
		let final_frame = item.final_frame;

		let more = !(item_done && final_frame);

		if item_done {
			queue.pop_front();
		}
		drop(queue);

		Some(Frame { kind, channel: self.number, msg_no, more, seq_no, ans_no, payload: chunk })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_channel() -> Arc<Channel> {
		Channel::new(1, "http://example.org/echo".into(), 1, 4096, 1 << 20, SequencerWaker::new())
	}

	#[test]
	fn send_msg_segments_across_window() {
		let ch = test_channel();
		ch.set_window_size(4096);
		let payload = Bytes::from(vec![b'x'; 10_000]);
		ch.send_msg(payload, false).unwrap();

		let mut sizes = Vec::new();
		let mut more_flags = Vec::new();
		let mut sent = 0u32;
		loop {
			if let Some(frame) = ch.next_outgoing(4096) {
				sent += frame.payload.len() as u32;
				sizes.push(frame.payload.len());
				more_flags.push(frame.more);
				continue;
			}
			if sent as usize >= 10_000 {
				break;
			}
			// The initial 4096-byte window is exhausted; simulate the peer's
			// SEQ frame granting another window's worth of room.
			ch.apply_seq(SeqFrame { channel: ch.number, ack_no: sent, window: 4096 }).unwrap();
		}

		assert_eq!(sizes, vec![4096, 4096, 1808]);
		assert_eq!(more_flags, vec![true, true, false]);
	}

	#[test]
	fn replies_flush_in_receipt_order_not_submission_order() {
		let ch = test_channel();
		ch.record_received_msg(1);
		ch.record_received_msg(2);

		ch.send_rpy(2, Bytes::from_static(b"second"));
		assert!(ch.next_outgoing(4096).is_none());

		ch.send_rpy(1, Bytes::from_static(b"first"));
		let first = ch.next_outgoing(4096).unwrap();
		assert_eq!(first.msg_no, 1);
		let second = ch.next_outgoing(4096).unwrap();
		assert_eq!(second.msg_no, 2);
	}

	#[test]
	fn ans_series_ends_with_nul() {
		let ch = test_channel();
		ch.record_received_msg(7);
		ch.send_ans(7, Bytes::from_static(b"a"));
		ch.send_ans(7, Bytes::from_static(b"bb"));
		ch.finalize_ans(7);

		let a = ch.next_outgoing(4096).unwrap();
		assert_eq!(a.kind, FrameType::Ans);
		assert_eq!(a.ans_no, Some(0));

		let b = ch.next_outgoing(4096).unwrap();
		assert_eq!(b.ans_no, Some(1));

		let nul = ch.next_outgoing(4096).unwrap();
		assert_eq!(nul.kind, FrameType::Nul);
		assert!(nul.payload.is_empty());
	}

	#[test]
	fn zero_window_stalls_sends() {
		let ch = test_channel();
		ch.window.lock().max_seq_no_remote_accepted = 0;
		ch.send_msg(Bytes::from_static(b"ping"), false).unwrap();
		assert!(ch.next_outgoing(4096).is_none());
	}

	#[test]
	fn seqno_mismatch_on_receive_is_protocol_error() {
		let ch = test_channel();
		let frame = Frame { kind: FrameType::Msg, channel: 1, msg_no: 0, more: false, seq_no: 5, ans_no: None, payload: Bytes::from_static(b"x") };
		assert!(ch.receive(frame).is_err());
	}
}
