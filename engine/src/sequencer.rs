//! The segmenter/flow-controller thread (§4.6): one per `Context`, turning
//! each channel's pending messages into wire frames while respecting the
//! remote window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::connection::Connection;

const DEFAULT_FRAME_SIZE: usize = 4096;

/// Shared wakeup queue: channels push `(connection_id, channel_no)` onto
/// it whenever they gain work or window, and the sequencer thread drains
/// it between iterations.
pub struct SequencerWaker {
	queue: Mutex<VecDeque<(u64, u32)>>,
	cv: Condvar,
}

impl SequencerWaker {
	pub fn new() -> Arc<Self> {
		Arc::new(Self { queue: Mutex::new(VecDeque::new()), cv: Condvar::new() })
	}

	pub fn notify(&self, connection_id: u64, channel_no: u32) {
		let mut queue = self.queue.lock();
		if !queue.contains(&(connection_id, channel_no)) {
			queue.push_back((connection_id, channel_no));
		}
		drop(queue);
		self.cv.notify_all();
	}

	fn drain(&self, timeout: Duration) -> Vec<(u64, u32)> {
		let mut queue = self.queue.lock();
		if queue.is_empty() {
			self.cv.wait_for(&mut queue, timeout);
		}
		queue.drain(..).collect()
	}
}

/// Looks up the live `Connection` for a sequencer wakeup; supplied by
/// `Context` so the sequencer thread doesn't need to know about the whole
/// connection table's locking directly.
pub type ConnectionLookup = Arc<dyn Fn(u64) -> Option<Arc<Connection>> + Send + Sync>;

pub struct Sequencer {
	waker: Arc<SequencerWaker>,
	shutdown: Arc<AtomicBool>,
	thread: Option<thread::JoinHandle<()>>,
}

impl Sequencer {
	pub fn start(waker: Arc<SequencerWaker>, lookup: ConnectionLookup) -> Self {
		let shutdown = Arc::new(AtomicBool::new(false));

		let thread = {
			let waker = waker.clone();
			let shutdown = shutdown.clone();
			thread::Builder::new().name("beep-sequencer".into()).spawn(move || Self::run(waker, lookup, shutdown)).expect("sequencer thread to spawn")
		};

		Self { waker, shutdown, thread: Some(thread) }
	}

	fn run(waker: Arc<SequencerWaker>, lookup: ConnectionLookup, shutdown: Arc<AtomicBool>) {
		while !shutdown.load(Ordering::Relaxed) {
			let ready = waker.drain(Duration::from_millis(200));

			for (connection_id, channel_no) in ready {
				if shutdown.load(Ordering::Relaxed) {
					break;
				}

				let Some(connection) = lookup(connection_id) else { continue };
				let Some(channel) = connection.channel(channel_no) else { continue };

				// Drain everything currently ready; re-notify happens
				// naturally via `apply_seq`/`enqueue` if more becomes
				// available later.
				while let Some(frame) = channel.next_outgoing(DEFAULT_FRAME_SIZE) {
					if connection.send_frame(&frame).is_err() {
						break;
					}
				}
			}
		}
	}

	pub fn shutdown(&self) {
		self.shutdown.store(true, Ordering::Relaxed);
		self.waker.notify(0, 0);
	}
}

impl Drop for Sequencer {
	fn drop(&mut self) {
		self.shutdown();
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}
