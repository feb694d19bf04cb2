//! # DevRoom - real-time collaborative room server
//!
//! Users create short-lived named rooms and share one document per room.
//! The server keeps the authoritative document, language, roster and a
//! bounded snapshot history, and fans every change out to room members.
//!
//! ## Features
//!
//! - **Admission** - Room creation and existence checks over HTTP
//! - **Real-time channel** - JSON events over a WebSocket per user
//! - **Snapshot history** - Deduplicated, capped per room, restorable
//! - **Abuse control** - Fixed-window rate limits, roster and room ceilings
//! - **Lifecycle** - Grace-period deletion of empty rooms, ghost room sweeping
//! - **Metrics** - Prometheus counters and gauges
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin devroom-server
//!
//! # Pretty logs, custom port
//! cargo run --bin devroom-server -- --port 8080 --log-format pretty
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Configuration management
//! - [`logging`] - Structured logging and startup output
//! - [`http_server`] - HTTP admission API and WebSocket transport
//! - [`hub`] - Per-connection protocol state machine and fan-out
//! - [`room`] - Room registry
//! - [`history`] - Snapshot history log
//! - [`session`] - Connection to room bindings
//! - [`rate_limit`] - Fixed-window rate limiters
//! - [`sweeper`] - Room lifecycle background work
//! - [`metrics`] - Prometheus metrics

pub mod config;
pub mod error;
pub mod history;
pub mod http_server;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod rate_limit;
pub mod room;
pub mod session;
pub mod shutdown;
pub mod sweeper;

// Re-export commonly used types
pub use config::Config;
pub use error::{CreateRoomError, JoinError, ProtocolError, RunError};
pub use history::{HistoryLog, Snapshot, SnapshotTrigger};
pub use hub::{Flow, RoomHub};
pub use metrics::METRICS;
pub use protocol::{ClientEvent, ServerEvent};
pub use rate_limit::{RateLimiter, RateLimiters};
pub use room::{Language, Room, RoomRegistry};
pub use session::SessionRegistry;
pub use shutdown::ShutdownCoordinator;
