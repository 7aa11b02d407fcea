//! The top-level handle an application holds: one profile registry, one
//! reader thread, one sequencer thread, one worker pool, and the table of
//! live connections they all share (§4.1).

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use runtime::{ConsoleLogSink, LogSink, Scheduler, WorkerPool};

use crate::config::ContextConfig;
use crate::connection::{Connection, Role};
use crate::error::Result;
use crate::profile::{ProfileEntry, ProfileRegistry};
use crate::reader::{AcceptHook, IdleHook, Reader};
use crate::sequencer::{Sequencer, SequencerWaker};
use crate::transport;

/// Owns every thread and shared table a running BEEP endpoint needs.
/// Cheap to clone (it's handed out as `Arc<Context>`); dropping the last
/// handle signals every background thread to stop and blocks until they
/// have actually joined.
pub struct Context {
	config: Arc<ContextConfig>,
	profile_registry: Arc<ProfileRegistry>,
	connections: Arc<Mutex<IndexMap<u64, Arc<Connection>>>>,
	next_id: Arc<AtomicU64>,
	waker: Arc<SequencerWaker>,
	pool: Arc<WorkerPool>,
	log_sink: Arc<dyn LogSink>,
	idle_hook: Arc<RwLock<Option<IdleHook>>>,
	scheduler: Scheduler,
	sequencer: Sequencer,
	reader: Reader,
}

impl Context {
	pub fn new(config: ContextConfig) -> Arc<Self> {
		Self::with_log_sink(config, Arc::new(ConsoleLogSink::default()))
	}

	pub fn with_log_sink(config: ContextConfig, log_sink: Arc<dyn LogSink>) -> Arc<Self> {
		let config = Arc::new(config);
		let profile_registry = Arc::new(ProfileRegistry::new());
		let connections: Arc<Mutex<IndexMap<u64, Arc<Connection>>>> = Arc::new(Mutex::new(IndexMap::new()));
		let next_id = Arc::new(AtomicU64::new(1));
		let waker = SequencerWaker::new();
		let pool = Arc::new(WorkerPool::new(config.worker_threads));
		let scheduler = Scheduler::start(pool.clone());

		let lookup_table = connections.clone();
		let lookup = Arc::new(move |id: u64| lookup_table.lock().get(&id).cloned());
		let sequencer = Sequencer::start(waker.clone(), lookup);

		let idle_hook: Arc<RwLock<Option<IdleHook>>> = Arc::new(RwLock::new(None));
		let reader = Reader::start(connections.clone(), profile_registry.clone(), waker.clone(), pool.clone(), config.clone(), log_sink.clone(), next_id.clone(), idle_hook.clone());

		Arc::new(Self { config, profile_registry, connections, next_id, waker, pool, log_sink, idle_hook, scheduler, sequencer, reader })
	}

	// ---- profile registry ----

	pub fn register_profile(&self, entry: ProfileEntry) {
		self.profile_registry.register(entry);
	}

	pub fn unregister_profile(&self, uri: &str) {
		self.profile_registry.unregister(uri);
	}

	/// Hides `uri` from future greetings without disturbing channels
	/// already open under it.
	pub fn mask_profile(&self, uri: &str) {
		self.profile_registry.mask(uri);
	}

	pub fn unmask_profile(&self, uri: &str) {
		self.profile_registry.unmask(uri);
	}

	pub fn set_global_frame_received(&self, hook: crate::profile::FrameReceivedHook) {
		*self.profile_registry.global_frame_received.write() = Some(hook);
	}

	pub fn set_global_channel_added(&self, hook: crate::profile::ChannelAddedHook) {
		*self.profile_registry.global_channel_added.write() = Some(hook);
	}

	pub fn set_global_channel_removed(&self, hook: crate::profile::ChannelAddedHook) {
		*self.profile_registry.global_channel_removed.write() = Some(hook);
	}

	/// Registers the handler the reader schedules on the worker pool for a
	/// connection that has gone `ContextConfig::idle_period` without a read
	/// or write. No-op unless `idle_period` is also set.
	pub fn set_idle_handler(&self, hook: IdleHook) {
		*self.idle_hook.write() = Some(hook);
	}

	// ---- listening ----

	/// Binds `addr` and starts accepting connections on it, running
	/// `on_accept` (if given) once the accepted connection's own greeting
	/// has gone out.
	pub fn listen(&self, addr: impl ToSocketAddrs, on_accept: Option<AcceptHook>) -> Result<SocketAddr> {
		let listener = TcpListener::bind(addr).map_err(crate::error::EngineError::Transport)?;
		socket2::SockRef::from(&listener)
			.listen(self.config.listen_backlog)
			.map_err(crate::error::EngineError::Transport)?;
		let local_addr = listener.local_addr().map_err(crate::error::EngineError::Transport)?;
		self.reader.listen(listener, on_accept);
		Ok(local_addr)
	}

	// ---- connecting ----

	/// Opens a TCP connection to `addr`, exchanges greetings, and returns
	/// once the peer's greeting has been received (or `connect_timeout` /
	/// `greeting_timeout` elapses).
	pub fn connect(self: &Arc<Self>, addr: impl ToSocketAddrs) -> Result<Arc<Connection>> {
		let stream = transport::connect(addr, self.config.connect_timeout, self.config.write_timeout)?;

		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let connection = Connection::new(id, Role::Initiator, Box::new(stream), self.profile_registry.clone(), self.waker.clone(), self.pool.clone(), self.config.clone(), self.log_sink.clone());

		self.connections.lock().insert(id, connection.clone());
		self.reader.watch(connection.clone());

		connection.send_greeting()?;
		connection.wait_for_greeting(self.config.greeting_timeout)?;

		Ok(connection)
	}

	pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
		self.connections.lock().get(&id).cloned()
	}

	pub fn connections(&self) -> Vec<Arc<Connection>> {
		self.connections.lock().values().cloned().collect()
	}

	pub fn connection_count(&self) -> usize {
		self.connections.lock().len()
	}

	// ---- lifecycle ----

	/// Signals every background thread to stop and fails every live
	/// connection; does not block. The threads finish joining when the
	/// last `Arc<Context>` is dropped.
	pub fn stop(&self) {
		for connection in self.connections.lock().values() {
			connection.fail(200, "context stopped".into());
		}
		self.reader.shutdown();
		self.sequencer.shutdown();
		if !self.config.skip_pool_wait_on_exit {
			self.scheduler.shutdown();
		}
	}

	pub fn config(&self) -> &ContextConfig {
		&self.config
	}
}
