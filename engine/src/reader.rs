//! The demultiplexer thread (§4.5): one per `Context`, turning poll
//! readiness into `read_into_buffer` + `pump_decoded` calls, and accepting
//! new inbound connections off any listeners registered with it.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use runtime::poll::{Reactor, Token};
use runtime::{Event as LogEvent, LogSink};

use crate::config::ContextConfig;
use crate::connection::{Connection, Role};
use crate::profile::ProfileRegistry;
use crate::sequencer::SequencerWaker;

pub type AcceptHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Runs on the worker pool once per idle window for a connection that has
/// gone `ContextConfig::idle_period` without a read or write (§3, §4.5).
pub type IdleHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Listener tokens count down from here; connection ids (assigned by
/// `Context` starting at 1 and counting up) never reach this high, so the
/// two token spaces never collide.
const LISTENER_TOKEN_BASE: usize = usize::MAX - 1024;

enum ReaderCommand {
	Watch(Arc<Connection>),
	Unwatch(u64),
	Listen(TcpListener, Option<AcceptHook>),
}

struct Shared {
	connections: Arc<Mutex<IndexMap<u64, Arc<Connection>>>>,
	profile_registry: Arc<ProfileRegistry>,
	waker: Arc<SequencerWaker>,
	pool: Arc<runtime::WorkerPool>,
	config: Arc<ContextConfig>,
	log_sink: Arc<dyn LogSink>,
	next_id: Arc<AtomicU64>,
	idle_hook: Arc<RwLock<Option<IdleHook>>>,
}

impl Shared {
	fn warn(&self, message: &str) {
		self.log_sink.emit(LogEvent { level: log::Level::Warn, target: "engine::reader", message });
	}
}

/// Owns the reader thread's `Reactor` and the channel used to tell it about
/// connections and listeners created after the thread started.
pub struct Reader {
	commands: Sender<ReaderCommand>,
	shutdown: Arc<AtomicBool>,
	thread: Option<thread::JoinHandle<()>>,
}

impl Reader {
	#[allow(clippy::too_many_arguments)]
	pub fn start(
		connections: Arc<Mutex<IndexMap<u64, Arc<Connection>>>>,
		profile_registry: Arc<ProfileRegistry>,
		waker: Arc<SequencerWaker>,
		pool: Arc<runtime::WorkerPool>,
		config: Arc<ContextConfig>,
		log_sink: Arc<dyn LogSink>,
		next_id: Arc<AtomicU64>,
		idle_hook: Arc<RwLock<Option<IdleHook>>>,
	) -> Self {
		let (tx, rx) = mpsc::channel();
		let shutdown = Arc::new(AtomicBool::new(false));
		let shared = Shared { connections, profile_registry, waker, pool, config, log_sink, next_id, idle_hook };

		let thread = {
			let shutdown = shutdown.clone();
			thread::Builder::new().name("beep-reader".into()).spawn(move || Self::run(shared, rx, shutdown)).expect("reader thread to spawn")
		};

		Self { commands: tx, shutdown, thread: Some(thread) }
	}

	/// Registers a connection the reader didn't create itself (an
	/// initiator-side `open`) for readability polling.
	pub fn watch(&self, connection: Arc<Connection>) {
		let _ = self.commands.send(ReaderCommand::Watch(connection));
	}

	pub fn unwatch(&self, id: u64) {
		let _ = self.commands.send(ReaderCommand::Unwatch(id));
	}

	/// Starts accepting on `listener`, running `on_accept` (if any) once per
	/// accepted connection, right after its greeting has gone out.
	pub fn listen(&self, listener: TcpListener, on_accept: Option<AcceptHook>) {
		let _ = self.commands.send(ReaderCommand::Listen(listener, on_accept));
	}

	pub fn shutdown(&self) {
		self.shutdown.store(true, Ordering::Relaxed);
	}

	fn run(shared: Shared, commands: Receiver<ReaderCommand>, shutdown: Arc<AtomicBool>) {
		let mut reactor = Reactor::new();
		let mut watched: IndexMap<usize, u64> = IndexMap::new();
		let mut listeners: IndexMap<usize, (TcpListener, Option<AcceptHook>)> = IndexMap::new();
		let mut next_listener_token = LISTENER_TOKEN_BASE;

		let mut ready = Vec::new();
		while !shutdown.load(Ordering::Relaxed) {
			ready.clear();
			if let Err(err) = reactor.wait(Some(Duration::from_millis(200)), &mut ready) {
				shared.warn(&format!("poll failed: {err}"));
				continue;
			}

			for (token, readiness) in ready.drain(..) {
				if token.0 >= LISTENER_TOKEN_BASE {
					if let Some((listener, hook)) = listeners.get(&token.0) {
						Self::accept_all(listener, hook.clone(), &shared, &mut reactor, &mut watched);
					}
					continue;
				}

				let Some(&id) = watched.get(&token.0) else { continue };
				let Some(connection) = shared.connections.lock().get(&id).cloned() else { continue };

				if readiness.closed {
					connection.fail(200, "transport closed".into());
					shared.connections.lock().shift_remove(&id);
					reactor.deregister_raw(connection.raw_fd());
					watched.shift_remove(&token.0);
					continue;
				}

				if readiness.readable {
					match connection.read_into_buffer() {
						Ok(0) => {
							connection.fail(200, "connection closed by peer".into());
							shared.connections.lock().shift_remove(&id);
							reactor.deregister_raw(connection.raw_fd());
							watched.shift_remove(&token.0);
							continue;
						}
						Ok(_) => {
							if let Err(err) = connection.pump_decoded() {
								shared.warn(&format!("connection {id} protocol error: {err}"));
							}
						}
						Err(err) => {
							shared.warn(&format!("connection {id} read failed: {err}"));
							connection.fail(451, format!("read error: {err}"));
							shared.connections.lock().shift_remove(&id);
							reactor.deregister_raw(connection.raw_fd());
							watched.shift_remove(&token.0);
						}
					}
				}
			}

			while let Ok(command) = commands.try_recv() {
				match command {
					ReaderCommand::Watch(connection) => {
						let token = Token(connection.id as usize);
						reactor.register_raw(connection.raw_fd(), token, false);
						watched.insert(token.0, connection.id);
					}
					ReaderCommand::Unwatch(id) => {
						if let Some(connection) = shared.connections.lock().get(&id).cloned() {
							reactor.deregister_raw(connection.raw_fd());
						}
						watched.shift_remove(&(id as usize));
					}
					ReaderCommand::Listen(listener, hook) => {
						let _ = listener.set_nonblocking(true);
						let token = next_listener_token;
						next_listener_token += 1;
						reactor.register(&listener, Token(token), false);
						listeners.insert(token, (listener, hook));
					}
				}
			}

			Self::check_idle(&shared, &watched);
		}
	}

	/// §4.5's idle detection: any watched connection that has gone
	/// `idle_period` without a read or write gets the Context-wide idle
	/// handler scheduled on the worker pool, once per idle window.
	fn check_idle(shared: &Shared, watched: &IndexMap<usize, u64>) {
		let Some(period) = shared.config.idle_period else { return };
		let Some(hook) = shared.idle_hook.read().clone() else { return };

		for &id in watched.values() {
			let Some(connection) = shared.connections.lock().get(&id).cloned() else { continue };
			if connection.idle_for() < period {
				continue;
			}
			connection.reset_idle();
			let hook = hook.clone();
			shared.pool.spawn(move || hook(&connection));
		}
	}

	fn accept_all(listener: &TcpListener, hook: Option<AcceptHook>, shared: &Shared, reactor: &mut Reactor, watched: &mut IndexMap<usize, u64>) {
		loop {
			match listener.accept() {
				Ok((stream, _addr)) => {
					let live = shared.connections.lock().len();
					if live >= shared.config.hard_socket_limit {
						shared.warn(&format!("accept: hard_socket_limit ({}) reached, dropping new connection", shared.config.hard_socket_limit));
						drop(stream);
						continue;
					}
					if live >= shared.config.soft_socket_limit {
						shared.warn(&format!("accept: soft_socket_limit ({}) exceeded, {live} connections live", shared.config.soft_socket_limit));
					}

					if let Err(err) = stream.set_nodelay(true) {
						shared.warn(&format!("accept: set_nodelay failed: {err}"));
					}
					if let Err(err) = stream.set_write_timeout(shared.config.write_timeout) {
						shared.warn(&format!("accept: set_write_timeout failed: {err}"));
					}
					let _ = stream.set_nonblocking(false);

					let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
					let connection = Connection::new(id, Role::ListenerAccepted, Box::new(stream), shared.profile_registry.clone(), shared.waker.clone(), shared.pool.clone(), shared.config.clone(), shared.log_sink.clone());

					if let Err(err) = connection.send_greeting() {
						shared.warn(&format!("accept: failed to send greeting: {err}"));
						continue;
					}

					let token = Token(connection.id as usize);
					reactor.register_raw(connection.raw_fd(), token, false);
					watched.insert(token.0, connection.id);
					shared.connections.lock().insert(id, connection.clone());

					if let Some(hook) = &hook {
						hook(&connection);
					}
				}
				Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
				Err(err) => {
					shared.warn(&format!("accept failed: {err}"));
					break;
				}
			}
		}
	}
}

impl Drop for Reader {
	fn drop(&mut self) {
		self.shutdown();
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}
