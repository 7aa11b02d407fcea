use thiserror::Error;

/// Failures raised by the I/O reactor and worker pool substrate.
#[derive(Debug, Error)]
pub enum RuntimeError {
	#[error("poll() failed: {0}")]
	Poll(#[source] std::io::Error),

	#[error("{0}")]
	Signal(String),
}
