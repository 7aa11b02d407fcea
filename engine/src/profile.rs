//! The Context-wide profile registry (§4.4): URI → hooks, plus the global
//! overrides that run ahead of any per-profile hook.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::channel::Channel;
use crate::connection::Connection;

/// What a channel-start hook decides for an incoming `<start>` request.
pub enum StartOutcome {
	Accept { piggyback: Option<Bytes> },
	Reject { code: u32, message: String },
	/// The hook wants to answer later (e.g. after a database lookup); the
	/// engine holds the request open under `DeferTicket` until
	/// `Connection::notify_start` is called.
	Defer,
}

pub struct StartContext<'a> {
	pub connection: &'a Arc<Connection>,
	pub channel_number: u32,
	pub server_name: Option<&'a str>,
	pub piggyback: Option<&'a str>,
}

pub struct CloseContext<'a> {
	pub connection: &'a Arc<Connection>,
	pub channel: &'a Arc<Channel>,
}

pub struct FrameReceivedContext<'a> {
	pub connection: &'a Arc<Connection>,
	pub channel: &'a Arc<Channel>,
	pub msg_no: u32,
	pub payload: &'a Bytes,
}

pub type StartHook = Arc<dyn Fn(StartContext<'_>) -> StartOutcome + Send + Sync>;
pub type CloseHook = Arc<dyn Fn(CloseContext<'_>) -> std::result::Result<(), (u32, String)> + Send + Sync>;
pub type FrameReceivedHook = Arc<dyn Fn(FrameReceivedContext<'_>) + Send + Sync>;
pub type OnCloseHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type ChannelAddedHook = Arc<dyn Fn(&Arc<Connection>, &Arc<Channel>) + Send + Sync>;

#[derive(Clone)]
pub struct ProfileEntry {
	pub uri: String,
	pub start: Option<StartHook>,
	pub close: Option<CloseHook>,
	pub frame_received: FrameReceivedHook,
}

/// Context-scoped URI → hooks mapping, plus global overrides that run
/// ahead of (and, for frame-received, never instead of) the per-profile
/// hook. Append-mostly: `unregister` is permitted only by the caller's own
/// discipline of not unregistering a profile with live channels.
pub struct ProfileRegistry {
	entries: RwLock<IndexMap<String, Arc<ProfileEntry>>>,
	/// URIs that stay registered (existing channels keep working) but drop
	/// out of the greeting's profile list, e.g. while a profile is being
	/// drained ahead of removal.
	masked: RwLock<HashSet<String>>,
	pub global_frame_received: RwLock<Option<FrameReceivedHook>>,
	pub global_channel_added: RwLock<Option<ChannelAddedHook>>,
	pub global_channel_removed: RwLock<Option<ChannelAddedHook>>,
}

impl ProfileRegistry {
	pub fn new() -> Self {
		Self { entries: RwLock::new(IndexMap::new()), masked: RwLock::new(HashSet::new()), global_frame_received: RwLock::new(None), global_channel_added: RwLock::new(None), global_channel_removed: RwLock::new(None) }
	}

	pub fn register(&self, entry: ProfileEntry) {
		self.entries.write().insert(entry.uri.clone(), Arc::new(entry));
	}

	pub fn unregister(&self, uri: &str) {
		self.entries.write().shift_remove(uri);
		self.masked.write().remove(uri);
	}

	pub fn get(&self, uri: &str) -> Option<Arc<ProfileEntry>> {
		self.entries.read().get(uri).cloned()
	}

	/// Hides `uri` from future greetings without touching existing channels
	/// or unregistering its hooks.
	pub fn mask(&self, uri: &str) {
		self.masked.write().insert(uri.to_string());
	}

	pub fn unmask(&self, uri: &str) {
		self.masked.write().remove(uri);
	}

	/// A snapshot of every registered, unmasked URI, taken under the lock,
	/// for the greeting builder to walk without blocking concurrent
	/// registration.
	pub fn snapshot_uris(&self) -> Vec<String> {
		let masked = self.masked.read();
		self.entries.read().keys().filter(|uri| !masked.contains(*uri)).cloned().collect()
	}
}

impl Default for ProfileRegistry {
	fn default() -> Self {
		Self::new()
	}
}
