use thiserror::Error;

/// Failures produced while parsing or emitting wire bytes: malformed
/// frames, channel-zero XML that doesn't fit the fixed vocabulary, or a
/// peer's greeting that cannot be understood.
#[derive(Debug, Error)]
pub enum WireError {
	#[error("malformed frame header: {0}")]
	MalformedHeader(String),

	#[error("unknown frame type {0:?}")]
	UnknownFrameType(String),

	#[error("frame trailer missing or corrupt")]
	MissingTrailer,

	#[error("continuation frame mismatch on channel {channel}: expected seqno {expected}, got {got}")]
	SeqnoMismatch { channel: u32, expected: u32, got: u32 },

	#[error("reassembly budget of {limit} bytes exceeded on channel {channel}")]
	ReassemblyTooLarge { channel: u32, limit: usize },

	#[error("malformed channel-zero XML: {0}")]
	MalformedGreeting(String),

	#[error("peer greeting reported error {code}: {message}")]
	GreetingRejected { code: u32, message: String },
}
