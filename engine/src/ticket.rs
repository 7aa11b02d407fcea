use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use wire::Frame;

/// Lets a synchronous "send and wait" caller block for the reply series
/// matching one outstanding MSG. A channel hands one of these out per
/// outstanding request; further frames of an ANS series are retrieved by
/// calling `wait` again on the same ticket.
pub struct WaitReplyTicket {
	slot: Mutex<std::collections::VecDeque<Frame>>,
	done: Mutex<bool>,
	cv: Condvar,
}

impl WaitReplyTicket {
	pub fn new() -> Arc<Self> {
		Arc::new(Self { slot: Mutex::new(std::collections::VecDeque::new()), done: Mutex::new(false), cv: Condvar::new() })
	}

	/// Deliver one frame of the reply series. `last` marks the terminating
	/// frame (an RPY, an ERR, or a NUL).
	pub fn fulfil(&self, frame: Frame, last: bool) {
		self.slot.lock().push_back(frame);
		if last {
			*self.done.lock() = true;
		}
		self.cv.notify_all();
	}

	/// Blocks until a frame is available or `timeout` elapses. Returns
	/// `None` on timeout or once the series is exhausted.
	pub fn wait(&self, timeout: Option<Duration>) -> Option<Frame> {
		let mut guard = self.slot.lock();
		loop {
			if let Some(frame) = guard.pop_front() {
				return Some(frame);
			}
			if *self.done.lock() {
				return None;
			}
			match timeout {
				Some(t) => {
					let result = self.cv.wait_for(&mut guard, t);
					if result.timed_out() {
						return None;
					}
				}
				None => self.cv.wait(&mut guard),
			}
		}
	}
}
