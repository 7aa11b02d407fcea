//! End-to-end tests over real loopback TCP sockets, each spinning up a
//! server `Context` and a client `Context` that talk to it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use engine::{Context, ContextConfig, FrameReceivedContext, ProfileEntry};
use wire::FrameType;

const TIMEOUT: Duration = Duration::from_secs(5);

fn quiet_config() -> ContextConfig {
	ContextConfig { worker_threads: 2, ..ContextConfig::default() }
}

fn server() -> Arc<Context> {
	Context::with_log_sink(quiet_config(), Arc::new(runtime::NullLogSink))
}

fn client() -> Arc<Context> {
	Context::with_log_sink(quiet_config(), Arc::new(runtime::NullLogSink))
}

#[test]
fn single_request_reply_round_trips_payload() {
	let srv = server();
	srv.register_profile(ProfileEntry {
		uri: "http://example.org/echo".into(),
		start: None,
		close: None,
		frame_received: Arc::new(|ctx: FrameReceivedContext| {
			ctx.channel.send_rpy(ctx.msg_no, ctx.payload.clone());
		}),
	});
	let addr = srv.listen("127.0.0.1:0", None).unwrap();

	let cli = client();
	let conn = cli.connect(addr).unwrap();
	let channel = conn.open_channel("http://example.org/echo", None, TIMEOUT).unwrap();

	let (msg_no, ticket) = channel.send_msg_and_wait_ticket(Bytes::from_static(b"hello beep"), false).unwrap();
	let reply = ticket.wait(Some(TIMEOUT)).expect("reply");

	assert_eq!(reply.kind, FrameType::Rpy);
	assert_eq!(reply.msg_no, msg_no);
	assert_eq!(&reply.payload[..], b"hello beep");

	cli.stop();
	srv.stop();
}

#[test]
fn large_message_segments_and_reassembles_across_the_wire() {
	let srv = server();
	srv.register_profile(ProfileEntry {
		uri: "http://example.org/echo".into(),
		start: None,
		close: None,
		frame_received: Arc::new(|ctx: FrameReceivedContext| {
			// Only reply once reassembly handed us the whole message.
			ctx.channel.send_rpy(ctx.msg_no, Bytes::from(ctx.payload.len().to_string()));
		}),
	});
	let addr = srv.listen("127.0.0.1:0", None).unwrap();

	let cli = client();
	let conn = cli.connect(addr).unwrap();
	// The default 4096-byte window is well under this payload, so the
	// sequencer has to stall and resume on SEQ frames from the peer
	// several times before the whole message reaches the wire.
	let channel = conn.open_channel("http://example.org/echo", None, TIMEOUT).unwrap();

	let payload = Bytes::from(vec![b'z'; 50_000]);
	let (_, ticket) = channel.send_msg_and_wait_ticket(payload, false).unwrap();
	let reply = ticket.wait(Some(TIMEOUT)).expect("reply");

	assert_eq!(&reply.payload[..], b"50000");

	cli.stop();
	srv.stop();
}

#[test]
fn ans_series_is_terminated_by_nul() {
	let srv = server();
	srv.register_profile(ProfileEntry {
		uri: "http://example.org/ans".into(),
		start: None,
		close: None,
		frame_received: Arc::new(|ctx: FrameReceivedContext| {
			for i in 0..3 {
				ctx.channel.send_ans(ctx.msg_no, Bytes::from(format!("chunk-{i}")));
			}
			ctx.channel.finalize_ans(ctx.msg_no);
		}),
	});
	let addr = srv.listen("127.0.0.1:0", None).unwrap();

	let cli = client();
	let conn = cli.connect(addr).unwrap();
	let channel = conn.open_channel("http://example.org/ans", None, TIMEOUT).unwrap();

	let (_, ticket) = channel.send_msg_and_wait_ticket(Bytes::from_static(b"go"), false).unwrap();

	let mut frames = Vec::new();
	while let Some(frame) = ticket.wait(Some(TIMEOUT)) {
		let is_nul = frame.kind == FrameType::Nul;
		frames.push(frame);
		if is_nul {
			break;
		}
	}

	assert_eq!(frames.len(), 4);
	assert_eq!(frames[0].kind, FrameType::Ans);
	assert_eq!(&frames[0].payload[..], b"chunk-0");
	assert_eq!(&frames[1].payload[..], b"chunk-1");
	assert_eq!(&frames[2].payload[..], b"chunk-2");
	assert_eq!(frames[3].kind, FrameType::Nul);
	assert!(frames[3].payload.is_empty());

	cli.stop();
	srv.stop();
}

#[test]
fn pipelined_requests_are_each_answered_with_their_own_payload() {
	let srv = server();
	srv.register_profile(ProfileEntry {
		uri: "http://example.org/echo".into(),
		start: None,
		close: None,
		frame_received: Arc::new(|ctx: FrameReceivedContext| {
			// Deliberately answer the second request faster than the
			// first, to exercise reply reordering back onto receipt order.
			if &ctx.payload[..] == b"first" {
				std::thread::sleep(Duration::from_millis(150));
			}
			ctx.channel.send_rpy(ctx.msg_no, ctx.payload.clone());
		}),
	});
	let addr = srv.listen("127.0.0.1:0", None).unwrap();

	let cli = client();
	let conn = cli.connect(addr).unwrap();
	let channel = conn.open_channel("http://example.org/echo", None, TIMEOUT).unwrap();

	let (first_no, first_ticket) = channel.send_msg_and_wait_ticket(Bytes::from_static(b"first"), false).unwrap();
	let (second_no, second_ticket) = channel.send_msg_and_wait_ticket(Bytes::from_static(b"second"), false).unwrap();

	let first_reply = first_ticket.wait(Some(TIMEOUT)).expect("first reply");
	let second_reply = second_ticket.wait(Some(TIMEOUT)).expect("second reply");

	assert_eq!(first_reply.msg_no, first_no);
	assert_eq!(&first_reply.payload[..], b"first");
	assert_eq!(second_reply.msg_no, second_no);
	assert_eq!(&second_reply.payload[..], b"second");

	cli.stop();
	srv.stop();
}

#[test]
fn global_channel_added_and_frame_received_hooks_run_alongside_the_profile_hook() {
	let srv = server();

	let added = Arc::new(AtomicUsize::new(0));
	let added_counted = added.clone();
	srv.set_global_channel_added(Arc::new(move |_conn, _channel| {
		added_counted.fetch_add(1, Ordering::SeqCst);
	}));

	let global_seen = Arc::new(AtomicUsize::new(0));
	let global_counted = global_seen.clone();
	srv.set_global_frame_received(Arc::new(move |_ctx: FrameReceivedContext| {
		global_counted.fetch_add(1, Ordering::SeqCst);
	}));

	srv.register_profile(ProfileEntry {
		uri: "http://example.org/echo".into(),
		start: None,
		close: None,
		frame_received: Arc::new(|ctx: FrameReceivedContext| {
			ctx.channel.send_rpy(ctx.msg_no, ctx.payload.clone());
		}),
	});
	let addr = srv.listen("127.0.0.1:0", None).unwrap();

	let cli = client();
	let conn = cli.connect(addr).unwrap();
	let channel = conn.open_channel("http://example.org/echo", None, TIMEOUT).unwrap();

	let (_, ticket) = channel.send_msg_and_wait_ticket(Bytes::from_static(b"ping"), false).unwrap();
	let reply = ticket.wait(Some(TIMEOUT)).expect("reply");
	assert_eq!(&reply.payload[..], b"ping");

	assert_eq!(added.load(Ordering::SeqCst), 1);
	assert_eq!(global_seen.load(Ordering::SeqCst), 1);

	cli.stop();
	srv.stop();
}

#[test]
fn on_close_fires_exactly_once() {
	let srv = server();
	let addr = srv.listen("127.0.0.1:0", None).unwrap();

	let cli = client();
	let conn = cli.connect(addr).unwrap();

	let fired = Arc::new(AtomicUsize::new(0));
	let counted = fired.clone();
	conn.on_close(Arc::new(move |_| {
		counted.fetch_add(1, Ordering::SeqCst);
	}));

	conn.shutdown();
	conn.shutdown();
	conn.shutdown();

	assert_eq!(fired.load(Ordering::SeqCst), 1);

	cli.stop();
	srv.stop();
}
