use std::time::Duration;

/// How the engine handles MIME headers it wasn't asked about explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomaticMime {
	Off,
	OnForAll,
	OnForUnconfiguredChannels,
}

/// Every externally tunable knob a `Context` exposes. Constructed once via
/// `Default` and overridden field-by-field; nothing here is read from the
/// environment or a config file.
#[derive(Debug, Clone)]
pub struct ContextConfig {
	pub soft_socket_limit: usize,
	pub hard_socket_limit: usize,
	pub listen_backlog: i32,
	pub enforce_registered_profiles: bool,
	pub automatic_mime: AutomaticMime,
	pub skip_pool_wait_on_exit: bool,
	/// How long a connection may go without a read or write before the
	/// Context-wide idle handler (if one is registered) fires for it.
	/// `None` disables idle detection entirely.
	pub idle_period: Option<Duration>,
	pub default_window_size: u32,
	pub connect_timeout: Duration,
	pub greeting_timeout: Duration,
	pub channel_timeout: Duration,
	pub write_timeout: Option<Duration>,
	pub worker_threads: usize,
	pub reassembly_limit: usize,
	pub log_level: log::Level,
}

impl Default for ContextConfig {
	fn default() -> Self {
		Self {
			soft_socket_limit: 512,
			hard_socket_limit: 1024,
			listen_backlog: 128,
			enforce_registered_profiles: true,
			automatic_mime: AutomaticMime::OnForUnconfiguredChannels,
			skip_pool_wait_on_exit: false,
			idle_period: None,
			default_window_size: 4096,
			connect_timeout: Duration::from_secs(30),
			greeting_timeout: Duration::from_secs(30),
			channel_timeout: Duration::from_secs(60),
			write_timeout: Some(Duration::from_secs(3)),
			worker_threads: 5,
			reassembly_limit: 4 * 1024 * 1024,
			log_level: log::Level::Info,
		}
	}
}
