use thiserror::Error;

use wire::WireError;

/// The six failure categories named for the engine. `Protocol`,
/// `Transport`, and `Greeting` are connection-fatal; `Channel` and
/// `Resource` are local to the request that triggered them; `UserHandler`
/// is logged but never shuts anything down on its own.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("transport error: {0}")]
	Transport(#[from] std::io::Error),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("greeting failed: {0}")]
	Greeting(String),

	#[error("channel error: {0}")]
	Channel(String),

	#[error("resource error: {0}")]
	Resource(String),

	#[error("user handler error: {0}")]
	UserHandler(String),
}

impl From<WireError> for EngineError {
	fn from(err: WireError) -> Self {
		match err {
			WireError::GreetingRejected { code, message } => EngineError::Greeting(format!("{code}: {message}")),
			WireError::MalformedGreeting(msg) => EngineError::Greeting(msg),
			other => EngineError::Protocol(other.to_string()),
		}
	}
}

pub type Result<T> = std::result::Result<T, EngineError>;
