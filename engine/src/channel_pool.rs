//! A small convenience over repeatedly opening channels against the same
//! profile: pre-open a handful, hand them out round-robin, grow on demand.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::connection::Connection;
use crate::error::Result;

pub struct ChannelPool {
	connection: Arc<Connection>,
	profile_uri: String,
	idle: Mutex<VecDeque<Arc<Channel>>>,
}

impl ChannelPool {
	/// Opens `initial_count` channels offering `profile_uri` against
	/// `connection`, blocking on each in turn.
	pub fn new(connection: Arc<Connection>, profile_uri: &str, initial_count: usize, open_timeout: Duration) -> Result<Self> {
		let mut idle = VecDeque::with_capacity(initial_count);
		for _ in 0..initial_count {
			idle.push_back(connection.open_channel(profile_uri, None, open_timeout)?);
		}
		Ok(Self { connection, profile_uri: profile_uri.to_string(), idle: Mutex::new(idle) })
	}

	/// Hands out an idle channel, opening a fresh one if the pool is
	/// currently exhausted.
	pub fn next_ready(&self, open_timeout: Duration) -> Result<Arc<Channel>> {
		if let Some(channel) = self.idle.lock().pop_front() {
			return Ok(channel);
		}
		self.connection.open_channel(&self.profile_uri, None, open_timeout)
	}

	/// Returns a channel obtained from [`ChannelPool::next_ready`] back to
	/// the idle set.
	pub fn release(&self, channel: Arc<Channel>) {
		self.idle.lock().push_back(channel);
	}

	pub fn len(&self) -> usize {
		self.idle.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.idle.lock().is_empty()
	}
}
