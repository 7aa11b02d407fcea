//! Continuation-frame reassembly for a single channel's receive side. Pure
//! data structure; the engine's `Channel` owns one of these per direction
//! it needs reassembly on.

use bytes::{Bytes, BytesMut};

use crate::error::WireError;
use crate::frame::Frame;

/// Joins a run of same-type, same-channel continuation frames (`more =
/// '*'`) into one logical frame, capped at `limit` bytes.
pub struct Reassembler {
	limit: usize,
	pending: Option<Pending>,
}

struct Pending {
	kind: crate::frame::FrameType,
	channel: u32,
	msg_no: u32,
	ans_no: Option<u32>,
	start_seq_no: u32,
	next_seq_no: u32,
	buf: BytesMut,
}

impl Reassembler {
	pub fn new(limit: usize) -> Self {
		Self { limit, pending: None }
	}

	/// Feed one parsed frame. Returns `Some(frame)` once a complete
	/// (possibly joined) frame is available, or `None` while still
	/// accumulating continuation frames.
	pub fn accept(&mut self, frame: Frame) -> Result<Option<Frame>, WireError> {
		match self.pending.take() {
			None => {
				if frame.is_final() {
					return Ok(Some(frame));
				}

				let mut buf = BytesMut::with_capacity(frame.payload.len());
				buf.extend_from_slice(&frame.payload);

				self.pending = Some(Pending {
					kind: frame.kind,
					channel: frame.channel,
					msg_no: frame.msg_no,
					ans_no: frame.ans_no,
					start_seq_no: frame.seq_no,
					next_seq_no: frame.next_seq_no(),
					buf,
				});

				Ok(None)
			}
			Some(mut pending) => {
				if frame.kind != pending.kind || frame.channel != pending.channel || frame.msg_no != pending.msg_no {
					return Err(WireError::MalformedHeader("continuation frame type/channel/msgno mismatch".into()));
				}

				if frame.seq_no != pending.next_seq_no {
					return Err(WireError::SeqnoMismatch { channel: frame.channel, expected: pending.next_seq_no, got: frame.seq_no });
				}

				if pending.buf.len() + frame.payload.len() > self.limit {
					return Err(WireError::ReassemblyTooLarge { channel: frame.channel, limit: self.limit });
				}

				pending.buf.extend_from_slice(&frame.payload);
				pending.next_seq_no = frame.next_seq_no();

				if frame.is_final() {
					let payload: Bytes = pending.buf.freeze();
					return Ok(Some(Frame {
						kind: pending.kind,
						channel: pending.channel,
						msg_no: pending.msg_no,
						more: false,
						seq_no: pending.start_seq_no,
						ans_no: pending.ans_no,
						payload,
					}));
				}

				self.pending = Some(pending);
				Ok(None)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::frame::FrameType;

	fn frame(more: bool, seq_no: u32, payload: &'static [u8]) -> Frame {
		Frame { kind: FrameType::Msg, channel: 1, msg_no: 0, more, seq_no, ans_no: None, payload: Bytes::from_static(payload) }
	}

	#[test]
	fn joins_three_continuation_frames() {
		let mut r = Reassembler::new(1 << 20);
		assert!(r.accept(frame(true, 0, b"abcd")).unwrap().is_none());
		assert!(r.accept(frame(true, 4, b"efgh")).unwrap().is_none());
		let joined = r.accept(frame(false, 8, b"ij")).unwrap().unwrap();
		assert_eq!(joined.payload, Bytes::from_static(b"abcdefghij"));
		assert_eq!(joined.seq_no, 0);
		assert!(joined.is_final());
	}

	#[test]
	fn seqno_gap_is_rejected() {
		let mut r = Reassembler::new(1 << 20);
		assert!(r.accept(frame(true, 0, b"abcd")).unwrap().is_none());
		assert!(r.accept(frame(false, 5, b"e")).is_err());
	}

	#[test]
	fn complete_frame_passes_straight_through() {
		let mut r = Reassembler::new(1 << 20);
		let out = r.accept(frame(false, 0, b"ping")).unwrap().unwrap();
		assert_eq!(out.payload, Bytes::from_static(b"ping"));
	}

	#[test]
	fn oversized_reassembly_is_rejected() {
		let mut r = Reassembler::new(4);
		assert!(r.accept(frame(true, 0, b"abcd")).unwrap().is_none());
		assert!(r.accept(frame(false, 4, b"e")).is_err());
	}
}
