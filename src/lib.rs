#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! revdial library: reverse-dial tunnels over WebSocket.
//!
//! An agent behind NAT keeps one outbound control WebSocket open to the
//! server. When server-side code calls [`ConnectionManager::dial`], the
//! server asks the agent (over that control connection) to open a fresh data
//! WebSocket back, and hands the resulting byte stream to the caller. If the
//! agent's control connection drops, dials for its key are queued for a
//! grace period and replayed when it reconnects.
//!
//! - `protocol`: control message codec, correlation IDs, key validation
//! - `dialer`: per-agent pending dials matched by correlation ID
//! - `manager`: key → dialer registry with grace-period queueing
//! - `stream`: data connection byte streams and the WebSocket pump
//! - `server`: axum router: control, pickup, stats and health endpoints
//! - `listener`: agent side: reconnecting control loop and pickups
//! - `forward`: local TCP ports forwarded through a dial
//! - `auth`: bearer token middleware
//! - `config`: TOML + env-var configuration

pub mod auth;
pub mod config;
pub mod dialer;
pub mod error;
pub mod forward;
pub mod listener;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod stream;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use dialer::{CloseReason, Dialer, DialerConfig};
pub use error::{DialError, ListenerError, ProtocolError, RegisterError};
pub use listener::{AgentConfig, AgentListener, ListenerStats, Target};
pub use manager::{ConnectionManager, ManagerConfig, ManagerStats};
pub use protocol::ControlMessage;
pub use server::{router, ServerState};
pub use stream::Connection;
