//! Context-scoped sink for user-visible BEEP events (connection status
//! transitions, greeting outcomes, channel open/close, idle firing). Kept
//! separate from the process-wide `log` facade so that each `Context` can
//! redirect its own events without touching global state.

use std::time::SystemTime;

use log::Level;
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

/// A single BEEP-level event delivered to a [`LogSink`].
pub struct Event<'a> {
	pub level: Level,
	pub target: &'a str,
	pub message: &'a str,
}

pub trait LogSink: Send + Sync {
	fn emit(&self, event: Event<'_>);
}

/// Default sink: renders to stderr in the same ANSI-coloured format as
/// [`crate::logger::Logger`].
pub struct ConsoleLogSink {
	pub min_level: Level,
}

impl Default for ConsoleLogSink {
	fn default() -> Self {
		Self { min_level: Level::Info }
	}
}

impl LogSink for ConsoleLogSink {
	fn emit(&self, event: Event<'_>) {
		if event.level > self.min_level {
			return;
		}

		let time = humantime::format_rfc3339_nanos(SystemTime::now());
		let dim = Style::new().dimmed().prefix();

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			match event.level {
				Level::Trace => Color::Purple,
				Level::Debug => Color::Blue,
				Level::Info => Color::Green,
				Level::Warn => Color::Yellow,
				Level::Error => Color::Red,
			}
			.bold()
			.prefix(),
			event.level,
			Style::new().bold().prefix(),
			event.target,
			event.message
		);
	}
}

/// A sink that discards everything; useful for tests that don't want
/// stderr noise.
pub struct NullLogSink;

impl LogSink for NullLogSink {
	fn emit(&self, _: Event<'_>) {}
}
