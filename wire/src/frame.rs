use bytes::Bytes;

use crate::error::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
	Msg,
	Rpy,
	Err,
	Ans,
	Nul,
}

impl FrameType {
	pub fn as_str(self) -> &'static str {
		match self {
			FrameType::Msg => "MSG",
			FrameType::Rpy => "RPY",
			FrameType::Err => "ERR",
			FrameType::Ans => "ANS",
			FrameType::Nul => "NUL",
		}
	}

	pub fn parse(s: &str) -> Result<Self, WireError> {
		match s {
			"MSG" => Ok(FrameType::Msg),
			"RPY" => Ok(FrameType::Rpy),
			"ERR" => Ok(FrameType::Err),
			"ANS" => Ok(FrameType::Ans),
			"NUL" => Ok(FrameType::Nul),
			other => Err(WireError::UnknownFrameType(other.to_string())),
		}
	}

	/// Only ANS frames carry an ans-no field.
	pub fn carries_ans_no(self) -> bool {
		matches!(self, FrameType::Ans)
	}
}

/// A single parsed BEEP frame (MSG/RPY/ERR/ANS/NUL). Immutable once built;
/// cheap to clone since the payload is a `Bytes` handle.
#[derive(Debug, Clone)]
pub struct Frame {
	pub kind: FrameType,
	pub channel: u32,
	pub msg_no: u32,
	/// `true` when this frame is a continuation (wire `more = '*'`); `false`
	/// marks the final frame of a message (wire `more = '.'`).
	pub more: bool,
	pub seq_no: u32,
	pub ans_no: Option<u32>,
	pub payload: Bytes,
}

impl Frame {
	pub fn is_final(&self) -> bool {
		!self.more
	}

	/// The byte index one past the last payload byte this frame carries,
	/// wrapping at 2^32 per the channel seqno space.
	pub fn next_seq_no(&self) -> u32 {
		self.seq_no.wrapping_add(self.payload.len() as u32)
	}

	/// Splits the payload into its MIME header region (through the first
	/// blank line) and body region. Returns an empty header if no blank
	/// line is present.
	pub fn mime_split(&self) -> (&[u8], &[u8]) {
		const SEP: &[u8] = b"\r\n\r\n";

		match self.payload.windows(SEP.len()).position(|w| w == SEP) {
			Some(idx) => (&self.payload[..idx + SEP.len()], &self.payload[idx + SEP.len()..]),
			None => (&[], &self.payload[..]),
		}
	}
}

/// A SEQ frame: no payload, just a flow-control acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqFrame {
	pub channel: u32,
	pub ack_no: u32,
	pub window: u32,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mime_split_finds_blank_line() {
		let frame = Frame {
			kind: FrameType::Msg,
			channel: 1,
			msg_no: 0,
			more: false,
			seq_no: 0,
			ans_no: None,
			payload: Bytes::from_static(b"Content-Type: text/plain\r\n\r\nhello"),
		};

		let (header, body) = frame.mime_split();
		assert_eq!(header, b"Content-Type: text/plain\r\n\r\n");
		assert_eq!(body, b"hello");
	}

	#[test]
	fn mime_split_with_no_header_is_all_body() {
		let frame = Frame { kind: FrameType::Msg, channel: 1, msg_no: 0, more: false, seq_no: 0, ans_no: None, payload: Bytes::from_static(b"ping") };

		let (header, body) = frame.mime_split();
		assert!(header.is_empty());
		assert_eq!(body, b"ping");
	}
}
