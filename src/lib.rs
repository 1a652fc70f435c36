//! byte-drain: a point-to-point TCP byte-transfer benchmark.
//!
//! A [`Server`] accepts connections and drains each one through a bounded
//! [`SessionPool`]; a [`Client`] connects and pushes a single length-prefixed
//! payload. Both sides measure bytes moved and elapsed time.
//!
//! Wire format (one frame per connection):
//!
//! ```text
//! [u32 big-endian payload length][payload bytes]
//! ```
//!
//! Modules:
//! - [`frame`]: length-prefix codec
//! - [`connection`]: close-once stream ownership
//! - [`session`]: per-connection drain state machine
//! - [`pool`]: bounded session pool with two-phase shutdown
//! - [`server`]: listener, accept loop and lifecycle
//! - [`client`]: outbound connector and multi-client runner
//! - [`stats`]: transfer statistics and reporters
//! - [`config`]: CLI and TOML configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod pool;
pub mod server;
pub mod session;
pub mod stats;

pub use client::{run_clients, Client, SizeUnit, Volume};
pub use config::{ClientSettings, Config, ServerSettings};
pub use error::{AcceptorError, ClientError, FrameError, PoolError, SessionError};
pub use pool::{DrainOutcome, SessionPool};
pub use server::{Server, ServerState};
pub use stats::{ChannelReporter, LogReporter, Reporter, SessionOutcome, SessionReport, TransferStats};
