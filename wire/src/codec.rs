use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::frame::{Frame, FrameType, SeqFrame};

const TRAILER: &[u8] = b"END\r\n";
const CRLF: &[u8] = b"\r\n";

/// Encode a data frame (MSG/RPY/ERR/ANS/NUL) onto `out`.
pub fn encode_frame(frame: &Frame, out: &mut BytesMut) {
	out.put_slice(frame.kind.as_str().as_bytes());
	out.put_u8(b' ');
	put_decimal(out, frame.channel);
	out.put_u8(b' ');
	put_decimal(out, frame.msg_no);
	out.put_u8(b' ');
	out.put_u8(if frame.more { b'*' } else { b'.' });
	out.put_u8(b' ');
	put_decimal(out, frame.seq_no);
	out.put_u8(b' ');
	put_decimal(out, frame.payload.len() as u32);

	if let Some(ans_no) = frame.ans_no {
		out.put_u8(b' ');
		put_decimal(out, ans_no);
	}

	out.put_slice(CRLF);
	out.put_slice(&frame.payload);
	out.put_slice(TRAILER);
}

/// Encode a SEQ frame (no payload, no trailer).
pub fn encode_seq(seq: &SeqFrame, out: &mut BytesMut) {
	out.put_slice(b"SEQ ");
	put_decimal(out, seq.channel);
	out.put_u8(b' ');
	put_decimal(out, seq.ack_no);
	out.put_u8(b' ');
	put_decimal(out, seq.window);
	out.put_slice(CRLF);
}

fn put_decimal(out: &mut BytesMut, value: u32) {
	out.put_slice(value.to_string().as_bytes());
}

/// The result of a successful decode: either a data frame or a SEQ frame.
#[derive(Debug, Clone)]
pub enum Decoded {
	Frame(Frame),
	Seq(SeqFrame),
}

/// Attempts to decode exactly one frame from the front of `buf`. Returns
/// `Ok(None)` if `buf` does not yet hold a complete frame (the caller
/// should read more bytes and retry); advances `buf` past the consumed
/// bytes on success.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Decoded>, WireError> {
	let Some(header_end) = find_crlf(buf) else { return Ok(None) };

	let header_line = std::str::from_utf8(&buf[..header_end]).map_err(|_| WireError::MalformedHeader("non-UTF8 header".into()))?;

	let mut fields = header_line.split(' ');
	let kind_field = fields.next().ok_or_else(|| WireError::MalformedHeader("empty header".into()))?;

	if kind_field == "SEQ" {
		let seq = parse_seq(&mut fields)?;
		buf.split_to(header_end + CRLF.len());
		return Ok(Some(Decoded::Seq(seq)));
	}

	let kind = FrameType::parse(kind_field)?;

	let channel = parse_u32(fields.next(), "channel")?;
	let msg_no = parse_u32(fields.next(), "msgno")?;
	let more = parse_more(fields.next())?;
	let seq_no = parse_u32(fields.next(), "seqno")?;
	let size = parse_u32(fields.next(), "size")? as usize;

	let ans_no = if kind.carries_ans_no() {
		Some(parse_u32(fields.next(), "ansno")?)
	} else {
		None
	};

	if fields.next().is_some() {
		return Err(WireError::MalformedHeader("trailing fields after header".into()));
	}

	let payload_start = header_end + CRLF.len();
	let needed = payload_start + size + TRAILER.len();

	if buf.len() < needed {
		return Ok(None);
	}

	let trailer = &buf[payload_start + size..needed];
	if trailer != TRAILER {
		return Err(WireError::MissingTrailer);
	}

	let mut consumed = buf.split_to(needed);
	let payload: Bytes = consumed.split_to(payload_start + size).split_off(payload_start).freeze();

	Ok(Some(Decoded::Frame(Frame { kind, channel, msg_no, more, seq_no, ans_no, payload })))
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
	buf.windows(CRLF.len()).position(|w| w == CRLF)
}

fn parse_u32(field: Option<&str>, name: &'static str) -> Result<u32, WireError> {
	field
		.ok_or_else(|| WireError::MalformedHeader(format!("missing {name}")))?
		.parse()
		.map_err(|_| WireError::MalformedHeader(format!("invalid {name}")))
}

fn parse_more(field: Option<&str>) -> Result<bool, WireError> {
	match field {
		Some(".") => Ok(false),
		Some("*") => Ok(true),
		_ => Err(WireError::MalformedHeader("invalid more flag".into())),
	}
}

fn parse_seq(fields: &mut std::str::Split<'_, char>) -> Result<SeqFrame, WireError> {
	let channel = parse_u32(fields.next(), "channel")?;
	let ack_no = parse_u32(fields.next(), "ackno")?;
	let window = parse_u32(fields.next(), "window")?;

	if fields.next().is_some() {
		return Err(WireError::MalformedHeader("trailing fields after SEQ header".into()));
	}

	Ok(SeqFrame { channel, ack_no, window })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_a_simple_msg_frame() {
		let frame = Frame { kind: FrameType::Msg, channel: 1, msg_no: 0, more: false, seq_no: 0, ans_no: None, payload: Bytes::from_static(b"ping") };

		let mut buf = BytesMut::new();
		encode_frame(&frame, &mut buf);
		assert_eq!(&buf[..], b"MSG 1 0 . 0 4\r\nping\r\nEND\r\n".as_slice());

		let decoded = decode(&mut buf).unwrap().unwrap();
		let Decoded::Frame(decoded) = decoded else { panic!("expected a frame") };
		assert_eq!(decoded.channel, 1);
		assert_eq!(decoded.payload, Bytes::from_static(b"ping"));
		assert!(buf.is_empty());
	}

	#[test]
	fn zero_length_payload_is_legal() {
		let frame = Frame { kind: FrameType::Nul, channel: 5, msg_no: 7, more: false, seq_no: 2, ans_no: None, payload: Bytes::new() };

		let mut buf = BytesMut::new();
		encode_frame(&frame, &mut buf);
		assert_eq!(&buf[..], b"NUL 5 7 . 2 0\r\n\r\nEND\r\n".as_slice());
	}

	#[test]
	fn ans_frame_carries_ans_no() {
		let frame = Frame { kind: FrameType::Ans, channel: 5, msg_no: 7, more: false, seq_no: 0, ans_no: Some(1), payload: Bytes::from_static(b"bb") };

		let mut buf = BytesMut::new();
		encode_frame(&frame, &mut buf);
		assert_eq!(&buf[..], b"ANS 5 7 . 0 2 1\r\nbb\r\nEND\r\n".as_slice());
	}

	#[test]
	fn decode_returns_none_until_trailer_arrives() {
		let mut buf = BytesMut::from(&b"MSG 1 0 . 0 4\r\npin"[..]);
		assert!(decode(&mut buf).unwrap().is_none());
		buf.put_slice(b"g\r\nEND\r\n");
		assert!(decode(&mut buf).unwrap().is_some());
	}

	#[test]
	fn seq_frame_round_trips() {
		let seq = SeqFrame { channel: 3, ack_no: 4096, window: 8192 };
		let mut buf = BytesMut::new();
		encode_seq(&seq, &mut buf);
		assert_eq!(&buf[..], b"SEQ 3 4096 8192\r\n".as_slice());

		let decoded = decode(&mut buf).unwrap().unwrap();
		let Decoded::Seq(decoded) = decoded else { panic!("expected a SEQ frame") };
		assert_eq!(decoded, seq);
	}

	#[test]
	fn mismatched_trailer_is_rejected() {
		let mut buf = BytesMut::from(&b"MSG 1 0 . 0 4\r\npingXXXXX"[..]);
		assert!(decode(&mut buf).is_err());
	}
}
