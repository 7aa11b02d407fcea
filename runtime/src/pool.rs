//! Worker pool for user callbacks (frame-received, channel-start hooks,
//! on-close handlers) plus the idle/timed-event scheduler.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Fixed-capacity pool of workers that run short user callbacks off the
/// reader and sequencer threads.
pub struct WorkerPool {
	inner: ThreadPool,
}

impl WorkerPool {
	pub fn new(threads: usize) -> Self {
		let inner = ThreadPoolBuilder::new()
			.num_threads(threads.max(1))
			.stack_size(2 * 1024 * 1024)
			.thread_name(|i| format!("beep-worker-{i}"))
			.build()
			.expect("worker pool to build with a sane thread count");

		Self { inner }
	}

	/// Run `job` on a worker thread; does not block the caller.
	pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
		self.inner.spawn(job);
	}
}

/// A single periodic callback registered with [`Scheduler`]. `handler`
/// returning `false` removes the event.
struct Event {
	interval: Duration,
	next_due: Duration,
	handler: Box<dyn FnMut() -> bool + Send>,
	running: bool,
}

struct SchedulerState {
	events: Vec<Arc<Mutex<Event>>>,
	shutdown: bool,
}

/// A background timer thread that re-fires registered handlers on the
/// worker pool at their configured interval, until a handler asks to be
/// removed or the scheduler is shut down.
pub struct Scheduler {
	state: Arc<Mutex<SchedulerState>>,
	wake: Arc<Condvar>,
	thread: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
	pub fn start(pool: Arc<WorkerPool>) -> Self {
		let state = Arc::new(Mutex::new(SchedulerState { events: Vec::new(), shutdown: false }));
		let wake = Arc::new(Condvar::new());

		let thread = {
			let state = state.clone();
			let wake = wake.clone();
			thread::Builder::new()
				.name("beep-scheduler".into())
				.spawn(move || Self::run(state, wake, pool))
				.expect("scheduler thread to spawn")
		};

		Self { state, wake, thread: Some(thread) }
	}

	fn run(state: Arc<Mutex<SchedulerState>>, wake: Arc<Condvar>, pool: Arc<WorkerPool>) {
		let mut elapsed = Duration::ZERO;
		let tick = Duration::from_millis(50);

		loop {
			let mut guard = state.lock();
			if guard.shutdown {
				return;
			}

			for slot in guard.events.iter() {
				let mut event = slot.lock();
				if event.running || elapsed < event.next_due {
					continue;
				}
				event.next_due = elapsed + event.interval;
				event.running = true;
				drop(event);

				let slot = slot.clone();
				let wake = wake.clone();
				pool.spawn(move || {
					let keep = (slot.lock().handler)();
					let mut event = slot.lock();
					event.running = false;
					if !keep {
						event.next_due = Duration::MAX;
					}
					drop(event);
					wake.notify_all();
				});
			}

			guard.events.retain(|e| e.lock().next_due != Duration::MAX);
			drop(guard);

			wake.wait_for(&mut state.lock(), tick);
			elapsed += tick;
		}
	}

	/// Register a handler to re-fire every `interval` until it returns
	/// `false`.
	pub fn schedule(&self, interval: Duration, handler: impl FnMut() -> bool + Send + 'static) {
		let event = Event { interval, next_due: Duration::ZERO, handler: Box::new(handler), running: false };
		let mut guard = self.state.lock();
		guard.events.push(Arc::new(Mutex::new(event)));
		drop(guard);
		self.wake.notify_all();
	}

	pub fn shutdown(&self) {
		let mut guard = self.state.lock();
		guard.shutdown = true;
		drop(guard);
		self.wake.notify_all();
	}
}

impl Drop for Scheduler {
	fn drop(&mut self) {
		self.shutdown();
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use std::time::Duration;

	use super::*;

	#[test]
	fn schedule_fires_until_handler_declines() {
		let pool = Arc::new(WorkerPool::new(2));
		let scheduler = Scheduler::start(pool);
		let fires = Arc::new(AtomicUsize::new(0));

		let counted = fires.clone();
		scheduler.schedule(Duration::from_millis(10), move || {
			let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
			n < 3
		});

		std::thread::sleep(Duration::from_millis(300));
		assert_eq!(fires.load(Ordering::SeqCst), 3);
	}
}
