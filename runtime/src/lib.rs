pub mod clock;
pub mod error;
pub mod logger;
pub mod logsink;
pub mod pool;
pub mod poll;
pub mod signal;

pub use error::RuntimeError;
pub use logger::Logger;
pub use logsink::{ConsoleLogSink, Event, LogSink, NullLogSink};
pub use pool::{Scheduler, WorkerPool};
pub use poll::{Reactor, Readiness, Token};
pub use signal::ShutdownFlag;
