//! `poll(2)`-based readiness multiplexer.
//!
//! This is the reader loop's polling strategy (one of several the
//! surrounding engine could plug in behind a `{register, deregister, wait}`
//! seam); it only reports readiness, it never reads or writes bytes itself.

use std::time::Duration;

use crate::error::RuntimeError;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}

	pub fn make(fd: RawFd, events: i16) -> Poll {
		Poll { fd, events, revents: 0 }
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{
		WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}

	pub fn make(fd: RawFd, events: i16) -> Poll {
		Poll { fd, events: events as _, revents: 0 }
	}
}

pub use sys::{AsRawFd, RawFd};
use sys::*;

/// Platform-correct raw-descriptor extraction: `as_raw_fd()` on unix,
/// `as_raw_socket()` on windows, behind one name callers outside this
/// crate can use without matching on `cfg(windows)` themselves.
pub fn raw_fd_of<T: AsRawFd>(source: &T) -> RawFd {
	as_raw(source)
}

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

/// Opaque handle identifying a registered source; callers use this to
/// recover which Connection a ready event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
	pub readable: bool,
	pub writable: bool,
	pub closed: bool,
}

struct Source {
	token: Token,
	wants_write: bool,
}

/// A reader-loop-owned set of watched descriptors. Not `Send` across
/// threads that don't already coordinate externally; the engine owns
/// exactly one of these per Context, from the reader thread.
pub struct Reactor {
	fds: Vec<Poll>,
	sources: Vec<Source>,
}

impl Reactor {
	pub fn new() -> Self {
		Self { fds: Vec::new(), sources: Vec::new() }
	}

	fn idx_of(&self, raw: RawFd) -> Option<usize> {
		self.fds.iter().position(|f| f.fd == raw)
	}

	/// Start watching `source` for readability (and, if `wants_write`, for
	/// writability too) under `token`.
	pub fn register<T: AsRawFd>(&mut self, source: &T, token: Token, wants_write: bool) {
		self.register_raw(as_raw(source), token, wants_write);
	}

	/// Raw-fd equivalent of `register`, for callers holding a `dyn Trait`
	/// that can't be named as a concrete `T: AsRawFd`.
	pub fn register_raw(&mut self, raw: RawFd, token: Token, wants_write: bool) {
		let mut events = POLLIN;
		if wants_write {
			events |= POLLOUT;
		}
		self.fds.push(make(raw, events));
		self.sources.push(Source { token, wants_write });
	}

	/// Flip whether a previously registered source is also watched for
	/// writability (used when the sequencer has buffered bytes to flush).
	pub fn set_writable<T: AsRawFd>(&mut self, source: &T, wants_write: bool) {
		self.set_writable_raw(as_raw(source), wants_write);
	}

	pub fn set_writable_raw(&mut self, raw: RawFd, wants_write: bool) {
		if let Some(idx) = self.idx_of(raw) {
			self.sources[idx].wants_write = wants_write;
			self.fds[idx].events = if wants_write { POLLIN | POLLOUT } else { POLLIN };
		}
	}

	pub fn deregister<T: AsRawFd>(&mut self, source: &T) {
		self.deregister_raw(as_raw(source));
	}

	pub fn deregister_raw(&mut self, raw: RawFd) {
		if let Some(idx) = self.idx_of(raw) {
			self.fds.swap_remove(idx);
			self.sources.swap_remove(idx);
		}
	}

	pub fn is_empty(&self) -> bool {
		self.fds.is_empty()
	}

	/// Block up to `timeout` waiting for readiness, appending `(token,
	/// readiness)` pairs for every source that became ready to `ready`.
	pub fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<(Token, Readiness)>) -> Result<(), RuntimeError> {
		let count = unsafe { poll(self.fds.as_mut_ptr(), self.fds.len().try_into().expect("fewer than u32::MAX fds"), as_timeout(timeout)) };

		let mut pending: i32 = count.try_into().map_err(|_| RuntimeError::Poll(std::io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(());
		}

		for idx in 0..self.fds.len() {
			if pending == 0 {
				break;
			}

			let revents = self.fds[idx].revents;
			if revents == 0 {
				continue;
			}

			pending -= 1;
			self.fds[idx].revents = 0;

			let closed = revents & (POLLERR | POLLHUP | POLLNVAL) != 0;
			let readiness = Readiness { readable: revents & POLLIN != 0, writable: revents & POLLOUT != 0, closed };

			ready.push((self.sources[idx].token, readiness));
		}

		Ok(())
	}
}

impl Default for Reactor {
	fn default() -> Self {
		Self::new()
	}
}
