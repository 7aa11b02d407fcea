//! The BEEP core engine: frame codec consumers, the channel state
//! machine, connection lifecycle, and the reader/sequencer/worker-pool
//! threading model that drives them (§4).

pub mod channel;
pub mod channel_pool;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod profile;
pub mod reader;
pub mod sequencer;
pub mod ticket;
pub mod transport;

pub use channel::{Channel, ChannelState};
pub use channel_pool::ChannelPool;
pub use config::{AutomaticMime, ContextConfig};
pub use connection::{Connection, Role, Status};
pub use context::Context;
pub use error::{EngineError, Result};
pub use profile::{ChannelAddedHook, CloseContext, CloseHook, FrameReceivedContext, FrameReceivedHook, ProfileEntry, ProfileRegistry, StartContext, StartHook, StartOutcome};
pub use reader::{AcceptHook, IdleHook};
pub use ticket::WaitReplyTicket;
pub use transport::Transport;

pub use wire::{Frame, FrameType};
