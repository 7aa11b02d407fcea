//! The pluggable I/O contract (§4.8). TLS, WebSocket, and "external"
//! transports all implement `Read + Write` plus the platform's raw-fd
//! trait; `Connection` is generic over nothing more than that.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use runtime::poll::{AsRawFd, RawFd};

use crate::error::{EngineError, Result};

/// `dyn Transport` can't be bounded by `AsRawFd` directly (a trait object
/// doesn't implement its supertraits as a reusable generic bound), so the
/// raw descriptor accessor is a dispatchable method on `Transport` itself,
/// filled in once by the blanket impl below.
pub trait Transport: Read + Write + Send {
	fn raw_fd(&self) -> RawFd;
}

impl<T> Transport for T
where
	T: Read + Write + AsRawFd + Send,
{
	fn raw_fd(&self) -> RawFd {
		runtime::poll::raw_fd_of(self)
	}
}

/// Default transport: a plain TCP socket. Left in blocking mode; reads and
/// writes only happen once the reader's poll loop (or the sequencer, for
/// writes) knows the socket is ready, so they don't actually block in the
/// steady state.
pub fn connect(addr: impl ToSocketAddrs, connect_timeout: Duration, write_timeout: Option<Duration>) -> Result<TcpStream> {
	let addr = addr.to_socket_addrs().map_err(EngineError::Transport)?.next().ok_or_else(|| EngineError::Transport(io::Error::new(io::ErrorKind::NotFound, "no address resolved")))?;

	let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(EngineError::Transport)?;
	stream.set_nodelay(true).map_err(EngineError::Transport)?;
	stream.set_write_timeout(write_timeout).map_err(EngineError::Transport)?;

	Ok(stream)
}
