//! A single BEEP transport endpoint: the channel table, the greeting
//! handshake, and the channel-zero start/close dialogue (§4.3).

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use parking_lot::Mutex;
use wire::xml::{self, ChannelZeroMessage, ProfileOffer};
use wire::{encode_frame, encode_seq, Frame, FrameType, SeqFrame};

use runtime::{Event as LogEvent, LogSink};

use crate::channel::{Channel, ChannelState};
use crate::config::ContextConfig;
use crate::error::{EngineError, Result};
use crate::profile::{CloseContext, FrameReceivedContext, ProfileRegistry, StartContext, StartOutcome};
use crate::sequencer::SequencerWaker;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Initiator,
	ListenerAccepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Ok,
	Error,
}

/// Management-channel message numbers below this are reserved for the
/// greeting exchange (always msg-no 0, sent as an unsolicited RPY).
const GREETING_MSG_NO: u32 = 0;

pub struct Connection {
	pub id: u64,
	pub role: Role,
	transport: Mutex<Box<dyn Transport>>,
	channels: Mutex<IndexMap<u32, Arc<Channel>>>,
	next_channel_no: AtomicU32,
	status: Mutex<Status>,
	last_errors: Mutex<std::collections::VecDeque<(u32, String)>>,
	server_name: Mutex<Option<String>>,
	peer_profiles: Mutex<Vec<String>>,
	recv_buf: Mutex<BytesMut>,
	on_close: Mutex<Vec<Arc<dyn Fn(&Arc<Connection>) + Send + Sync>>>,
	last_activity: Mutex<Instant>,
	profile_registry: Arc<ProfileRegistry>,
	waker: Arc<SequencerWaker>,
	pool: Arc<runtime::WorkerPool>,
	config: Arc<ContextConfig>,
	log_sink: Arc<dyn LogSink>,
}

impl Connection {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		id: u64,
		role: Role,
		transport: Box<dyn Transport>,
		profile_registry: Arc<ProfileRegistry>,
		waker: Arc<SequencerWaker>,
		pool: Arc<runtime::WorkerPool>,
		config: Arc<ContextConfig>,
		log_sink: Arc<dyn LogSink>,
	) -> Arc<Self> {
		let next_channel_no = AtomicU32::new(if role == Role::Initiator { 1 } else { 2 });

		let connection = Arc::new(Self {
			id,
			role,
			transport: Mutex::new(transport),
			channels: Mutex::new(IndexMap::new()),
			next_channel_no,
			status: Mutex::new(Status::Ok),
			last_errors: Mutex::new(std::collections::VecDeque::new()),
			server_name: Mutex::new(None),
			peer_profiles: Mutex::new(Vec::new()),
			recv_buf: Mutex::new(BytesMut::new()),
			on_close: Mutex::new(Vec::new()),
			last_activity: Mutex::new(Instant::now()),
			profile_registry,
			waker: waker.clone(),
			pool,
			config: config.clone(),
			log_sink,
		});

		let channel_zero = Channel::new(0, "channel-zero".into(), id, config.default_window_size, config.reassembly_limit, waker);
		channel_zero.set_state(ChannelState::Open);
		// Msg-no 0 on channel zero is reserved for the greeting; start/close
		// requests begin numbering at 1.
		channel_zero.set_next_msg_no(1);
		// Registered immediately, before the connection is handed to the
		// reader, so the peer's greeting can never race ahead of
		// `wait_for_greeting`'s ticket registration.
		channel_zero.register_wait_ticket(GREETING_MSG_NO);
		connection.channels.lock().insert(0, channel_zero);

		connection
	}

	pub fn channel(&self, number: u32) -> Option<Arc<Channel>> {
		self.channels.lock().get(&number).cloned()
	}

	fn channel_zero(&self) -> Arc<Channel> {
		self.channel(0).expect("channel zero exists for the lifetime of a non-error connection")
	}

	pub fn status(&self) -> Status {
		*self.status.lock()
	}

	pub fn last_error(&self) -> Option<(u32, String)> {
		self.last_errors.lock().back().cloned()
	}

	fn push_error(&self, code: u32, message: String) {
		let mut errors = self.last_errors.lock();
		errors.push_back((code, message));
		if errors.len() > 16 {
			errors.pop_front();
		}
	}

	pub fn on_close(&self, hook: Arc<dyn Fn(&Arc<Connection>) + Send + Sync>) {
		self.on_close.lock().push(hook);
	}

	fn fire_channel_added(self: &Arc<Self>, channel: &Arc<Channel>) {
		if let Some(hook) = self.profile_registry.global_channel_added.read().clone() {
			hook(self, channel);
		}
	}

	fn fire_channel_removed(self: &Arc<Self>, channel: &Arc<Channel>) {
		if let Some(hook) = self.profile_registry.global_channel_removed.read().clone() {
			hook(self, channel);
		}
	}

	fn touch(&self) {
		*self.last_activity.lock() = Instant::now();
	}

	pub fn idle_for(&self) -> Duration {
		self.last_activity.lock().elapsed()
	}

	/// Resets the idle clock without touching any bytes; called once the
	/// reader has fired the idle handler for this window, so it fires at
	/// most once per `idle_period`.
	pub(crate) fn reset_idle(&self) {
		self.touch();
	}

	/// The transport's raw descriptor, for the reader thread to register
	/// with its `Reactor`. Stable for the lifetime of the connection: the
	/// transport is never swapped out after construction.
	pub fn raw_fd(&self) -> runtime::poll::RawFd {
		self.transport.lock().raw_fd()
	}

	/// Marks the connection as failed and runs the on-close chain exactly
	/// once. Safe to call more than once; only the first call has effect.
	pub fn fail(self: &Arc<Self>, code: u32, message: String) {
		{
			let mut status = self.status.lock();
			if *status == Status::Error {
				return;
			}
			*status = Status::Error;
		}

		self.push_error(code, message.clone());
		self.log_sink.emit(LogEvent { level: log::Level::Warn, target: "engine::connection", message: &format!("connection {} failed: {message}", self.id) });

		for hook in self.on_close.lock().iter() {
			hook(self);
		}
	}

	fn encode_and_write(&self, bytes: &[u8]) -> Result<()> {
		let mut transport = self.transport.lock();
		transport.write_all(bytes).map_err(EngineError::Transport)?;
		transport.flush().map_err(EngineError::Transport)?;
		Ok(())
	}

	pub fn send_frame(&self, frame: &Frame) -> Result<()> {
		let mut buf = BytesMut::new();
		encode_frame(frame, &mut buf);
		self.encode_and_write(&buf)?;
		self.touch();
		Ok(())
	}

	pub fn send_seq(&self, seq: &SeqFrame) -> Result<()> {
		let mut buf = BytesMut::new();
		encode_seq(seq, &mut buf);
		self.encode_and_write(&buf)?;
		Ok(())
	}

	pub fn read_into_buffer(&self) -> Result<usize> {
		let mut chunk = [0u8; 8192];
		let n = {
			let mut transport = self.transport.lock();
			transport.read(&mut chunk).map_err(EngineError::Transport)?
		};
		if n > 0 {
			self.recv_buf.lock().extend_from_slice(&chunk[..n]);
			self.touch();
		}
		Ok(n)
	}

	/// Pulls and dispatches every complete frame currently buffered.
	pub fn pump_decoded(self: &Arc<Self>) -> Result<()> {
		loop {
			let decoded = {
				let mut buf = self.recv_buf.lock();
				wire::decode(&mut buf)?
			};

			let Some(decoded) = decoded else { break };

			match decoded {
				wire::Decoded::Seq(seq) => {
					let Some(channel) = self.channel(seq.channel) else {
						self.fail(550, format!("SEQ frame for unknown channel {}", seq.channel));
						return Ok(());
					};
					if let Err(err) = channel.apply_seq(seq) {
						self.fail(550, err.to_string());
						return Ok(());
					}
				}
				wire::Decoded::Frame(frame) => self.dispatch_data_frame(frame)?,
			}
		}
		Ok(())
	}

	fn dispatch_data_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
		let channel_no = frame.channel;
		let Some(channel) = self.channel(channel_no) else {
			self.fail(550, format!("frame for unknown channel {channel_no}"));
			return Ok(());
		};

		let kind = frame.kind;
		let msg_no = frame.msg_no;

		let (joined, seq_to_emit) = match channel.receive(frame) {
			Ok(pair) => pair,
			Err(err) => {
				self.fail(550, err.to_string());
				return Ok(());
			}
		};

		if let Some(seq) = seq_to_emit {
			self.send_seq(&seq)?;
		}

		let Some(frame) = joined else { return Ok(()) };

		if kind == FrameType::Msg {
			channel.record_received_msg(msg_no);
		}

		if channel_no == 0 {
			self.handle_channel_zero(frame);
			return Ok(());
		}

		if kind != FrameType::Msg {
			if let Some(ticket) = channel.wait_ticket_for(msg_no) {
				let last = matches!(kind, FrameType::Rpy | FrameType::Err | FrameType::Nul);
				ticket.fulfil(frame, last);
				if last {
					channel.remove_wait_ticket(msg_no);
					channel.complete_outstanding(msg_no);
				}
				return Ok(());
			}
		}

		let hook = channel.frame_received_hook();
		let global_hook = self.profile_registry.global_frame_received.read().clone();
		if hook.is_none() && global_hook.is_none() {
			return Ok(());
		}

		let connection = self.clone();
		let channel = channel.clone();
		self.pool.spawn(move || {
			let _guard = channel.serialize().then(|| channel.lock_dispatch());
			let payload = frame.payload.clone();
			// The global override runs ahead of (never instead of) the
			// per-profile hook.
			if let Some(global_hook) = &global_hook {
				global_hook(FrameReceivedContext { connection: &connection, channel: &channel, msg_no, payload: &payload });
			}
			if let Some(hook) = &hook {
				hook(FrameReceivedContext { connection: &connection, channel: &channel, msg_no, payload: &payload });
			}
		});

		Ok(())
	}

	// ---- greeting ----

	pub fn send_greeting(&self) -> Result<()> {
		let profiles = self.profile_registry.snapshot_uris();
		let greeting = xml::Greeting { profiles, features: None, localize: None };
		let payload = Bytes::from(xml::encode_greeting(&greeting).into_bytes());

		let frame = Frame { kind: FrameType::Rpy, channel: 0, msg_no: GREETING_MSG_NO, more: false, seq_no: 0, ans_no: None, payload };
		self.send_frame(&frame)
	}

	fn handle_channel_zero(self: &Arc<Self>, frame: Frame) {
		if frame.msg_no == GREETING_MSG_NO && frame.kind != FrameType::Msg {
			self.handle_greeting_reply(frame);
			return;
		}

		// Any non-MSG frame here is the reply to one of our own pending
		// start/close requests: whatever it parses as (a `<profile>`
		// accept, an `<ok/>`, or an `<error>`), it's opaque to us beyond
		// the error-code extraction `open_channel`/`close_channel` already
		// do on the ticket's behalf — just hand it to the waiting ticket.
		if frame.kind != FrameType::Msg {
			let channel_zero = self.channel_zero();
			if let Some(ticket) = channel_zero.wait_ticket_for(frame.msg_no) {
				ticket.fulfil(frame, true);
				channel_zero.remove_wait_ticket(frame.msg_no);
			}
			return;
		}

		let payload = match std::str::from_utf8(&frame.payload) {
			Ok(p) => p,
			Err(_) => {
				self.fail(500, "channel-zero payload was not valid UTF-8".into());
				return;
			}
		};

		let message = match xml::parse(payload) {
			Ok(m) => m,
			Err(err) => {
				self.fail(500, err.to_string());
				return;
			}
		};

		match message {
			ChannelZeroMessage::Start(start) => self.handle_start_request(frame.msg_no, start),
			ChannelZeroMessage::Close(close) => self.handle_close_request(frame.msg_no, close),
			_ => self.fail(500, "unexpected channel-zero message".into()),
		}
	}

	fn handle_greeting_reply(self: &Arc<Self>, frame: Frame) {
		let channel_zero = self.channel_zero();

		if frame.kind == FrameType::Err {
			let message = std::str::from_utf8(&frame.payload).unwrap_or("").to_string();
			let code = xml::parse(&message).ok().and_then(|m| match m {
				ChannelZeroMessage::Error { code, .. } => Some(code),
				_ => None,
			});
			self.fail(code.unwrap_or(550), message);
			if let Some(ticket) = channel_zero.wait_ticket_for(GREETING_MSG_NO) {
				ticket.fulfil(frame, true);
				channel_zero.remove_wait_ticket(GREETING_MSG_NO);
			}
			return;
		}

		let payload = std::str::from_utf8(&frame.payload).unwrap_or("");
		match xml::parse(payload) {
			Ok(ChannelZeroMessage::Greeting(greeting)) => {
				*self.peer_profiles.lock() = greeting.profiles;
			}
			_ => {
				self.fail(500, "malformed greeting".into());
			}
		}

		if let Some(ticket) = channel_zero.wait_ticket_for(GREETING_MSG_NO) {
			ticket.fulfil(frame, true);
			channel_zero.remove_wait_ticket(GREETING_MSG_NO);
		}
	}

	/// Blocks until the peer's greeting arrives (or `timeout` elapses). The
	/// wait ticket is registered at construction time, not here, so a
	/// fast peer can never race ahead of it.
	pub fn wait_for_greeting(&self, timeout: Duration) -> Result<()> {
		let channel_zero = self.channel_zero();
		let ticket = channel_zero.wait_ticket_for(GREETING_MSG_NO).expect("greeting ticket registered at construction");
		match ticket.wait(Some(timeout)) {
			Some(_) if self.status() == Status::Ok => Ok(()),
			Some(_) => Err(EngineError::Greeting(self.last_error().map(|(_, m)| m).unwrap_or_default())),
			None => Err(EngineError::Greeting("greeting timed out".into())),
		}
	}

	pub fn peer_profiles(&self) -> Vec<String> {
		self.peer_profiles.lock().clone()
	}

	// ---- channel open/close (initiator side) ----

	fn expected_local_parity(&self) -> u32 {
		if self.role == Role::Initiator {
			1
		} else {
			0
		}
	}

	/// Opens a new channel offering `profile_uri`; blocks until the peer
	/// accepts or rejects.
	pub fn open_channel(self: &Arc<Self>, profile_uri: &str, server_name: Option<&str>, timeout: Duration) -> Result<Arc<Channel>> {
		let number = self.next_channel_no.fetch_add(2, Ordering::SeqCst);

		let offers = vec![ProfileOffer { uri: profile_uri.to_string(), base64_content: None }];
		let xml = xml::encode_start(number, server_name, &offers);

		let channel_zero = self.channel_zero();
		let (_, ticket) = channel_zero.send_msg_and_wait_ticket(Bytes::from(xml.into_bytes()), false)?;

		let reply = ticket.wait(Some(timeout)).ok_or_else(|| EngineError::Channel(format!("start request for channel {number} timed out")))?;

		let payload = std::str::from_utf8(&reply.payload).map_err(|_| EngineError::Channel("non-UTF8 start reply".into()))?;

		if reply.kind == FrameType::Err {
			let (code, message) = match xml::parse(payload) {
				Ok(ChannelZeroMessage::Error { code, message }) => (code, message),
				_ => (550, "start request refused".to_string()),
			};
			return Err(EngineError::Channel(format!("{code}: {message}")));
		}

		let channel = Channel::new(number, profile_uri.to_string(), self.id, self.config.default_window_size, self.config.reassembly_limit, self.waker.clone());
		channel.set_state(ChannelState::Open);
		self.channels.lock().insert(number, channel.clone());
		self.fire_channel_added(&channel);
		Ok(channel)
	}

	fn handle_start_request(self: &Arc<Self>, msg_no: u32, start: xml::StartRequest) {
		let channel_zero = self.channel_zero();

		if self.channels.lock().contains_key(&start.number) {
			channel_zero.send_err(msg_no, Bytes::from(xml::encode_error(550, "channel already in use").into_bytes()));
			return;
		}

		if start.number % 2 == self.expected_local_parity() {
			channel_zero.send_err(msg_no, Bytes::from(xml::encode_error(501, "channel number has the wrong parity").into_bytes()));
			return;
		}

		let offered = start.profiles.first();
		let Some(offered) = offered else {
			channel_zero.send_err(msg_no, Bytes::from(xml::encode_error(501, "no profile offered").into_bytes()));
			return;
		};

		let entry = self.profile_registry.get(&offered.uri);

		let Some(entry) = entry else {
			if self.config.enforce_registered_profiles {
				channel_zero.send_err(msg_no, Bytes::from(xml::encode_error(550, "profile not registered").into_bytes()));
				return;
			}

			// Non-enforcing mode: accept the channel with no registered
			// hooks; the caller only finds out about frames through
			// whatever global frame-received handler it installed.
			let channel = Channel::new(start.number, offered.uri.clone(), self.id, self.config.default_window_size, self.config.reassembly_limit, self.waker.clone());
			channel.set_state(ChannelState::Open);
			self.channels.lock().insert(start.number, channel.clone());
			self.fire_channel_added(&channel);

			let reply = xml::encode_start(start.number, None, &[ProfileOffer { uri: offered.uri.clone(), base64_content: None }]);
			channel_zero.send_rpy(msg_no, Bytes::from(reply.into_bytes()));
			return;
		};

		let outcome = match &entry.start {
			Some(hook) => hook(StartContext { connection: self, channel_number: start.number, server_name: start.server_name.as_deref(), piggyback: offered.base64_content.as_deref() }),
			None => StartOutcome::Accept { piggyback: None },
		};

		match outcome {
			StartOutcome::Accept { .. } => {
				let channel = Channel::new(start.number, entry.uri.clone(), self.id, self.config.default_window_size, self.config.reassembly_limit, self.waker.clone());
				channel.set_frame_received(entry.frame_received.clone());
				channel.set_state(ChannelState::Open);
				self.channels.lock().insert(start.number, channel.clone());
				self.fire_channel_added(&channel);

				if start.server_name.is_some() && self.server_name.lock().is_none() {
					*self.server_name.lock() = start.server_name.clone();
				}

				let reply = xml::encode_start(start.number, None, &[ProfileOffer { uri: entry.uri.clone(), base64_content: None }]);
				channel_zero.send_rpy(msg_no, Bytes::from(reply.into_bytes()));
			}
			StartOutcome::Reject { code, message } => {
				channel_zero.send_err(msg_no, Bytes::from(xml::encode_error(code, &message).into_bytes()));
			}
			StartOutcome::Defer => {
				// Deferred accept: the caller is expected to hold its own
				// reference to the connection and msg-no and reply later
				// via the same channel-zero reply path.
			}
		}
	}

	fn handle_close_request(self: &Arc<Self>, msg_no: u32, close: xml::CloseRequest) {
		let channel_zero = self.channel_zero();

		let Some(channel) = self.channel(close.number) else {
			channel_zero.send_err(msg_no, Bytes::from(xml::encode_error(550, "no such channel").into_bytes()));
			return;
		};

		if close.number == 0 && self.channels.lock().len() > 1 {
			channel_zero.send_err(msg_no, Bytes::from(xml::encode_error(550, "channel zero must be closed last").into_bytes()));
			return;
		}

		channel.set_state(ChannelState::Closing);

		let entry = self.profile_registry.get(&channel.profile_uri);
		if let Some(Some(hook)) = entry.map(|e| e.close.clone()) {
			if let Err((code, message)) = hook(CloseContext { connection: self, channel: &channel }) {
				channel.set_state(ChannelState::Open);
				channel_zero.send_err(msg_no, Bytes::from(xml::encode_error(code, &message).into_bytes()));
				return;
			}
		}

		channel.set_state(ChannelState::Closed);
		self.channels.lock().shift_remove(&close.number);
		self.fire_channel_removed(&channel);
		channel_zero.send_rpy(msg_no, Bytes::from(xml::encode_ok().as_bytes().to_vec()));

		if close.number == 0 {
			self.fail(200, "connection closed by peer".into());
		}
	}

	/// Initiates the close dialogue for `channel`; blocks until the peer
	/// confirms or rejects.
	pub fn close_channel(self: &Arc<Self>, channel: &Arc<Channel>, timeout: Duration) -> Result<()> {
		let channel_zero = self.channel_zero();
		let xml = xml::encode_close(channel.number, 200);
		let (_, ticket) = channel_zero.send_msg_and_wait_ticket(Bytes::from(xml.into_bytes()), false)?;

		channel.set_state(ChannelState::Closing);

		let reply = ticket.wait(Some(timeout)).ok_or_else(|| EngineError::Channel(format!("close request for channel {} timed out", channel.number)))?;

		if reply.kind == FrameType::Err {
			channel.set_state(ChannelState::Open);
			let payload = std::str::from_utf8(&reply.payload).unwrap_or("");
			let message = match xml::parse(payload) {
				Ok(ChannelZeroMessage::Error { message, .. }) => message,
				_ => "close request refused".to_string(),
			};
			return Err(EngineError::Channel(message));
		}

		channel.set_state(ChannelState::Closed);
		self.channels.lock().shift_remove(&channel.number);
		self.fire_channel_removed(channel);

		if channel.number == 0 {
			self.fail(200, "connection closed locally".into());
		}

		Ok(())
	}

	pub fn shutdown(self: &Arc<Self>) {
		self.fail(200, "connection shut down".into());
	}
}
