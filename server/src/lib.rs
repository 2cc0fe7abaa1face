//! # Hexmap Server Library
//!
//! This library provides the session and dispatch engine for the hexmap
//! server: a shared hex board that many clients watch and edit at once,
//! with chat, dice rolls and unit moves broadcast to everybody in a single
//! agreed order.
//!
//! ## Core Responsibilities
//!
//! ### Ordered Broadcast
//! Every message a client sends lands in one arrival queue. A single
//! dispatch loop applies them one at a time, so every connected client sees
//! chat lines, unit moves and new units in exactly the same order.
//!
//! ### Session Management
//! Each TCP connection gets a reader task and a writer task. The reader
//! decodes newline-delimited JSON envelopes and forwards them to the
//! arrival queue; the writer drains a bounded outbound queue. Clients that
//! stop answering keepalive pings, send garbage, or fall too far behind are
//! disconnected with a stated reason.
//!
//! ### Permissions and Commands
//! Text commands (`/roll`, `/setup`, `/add`, `/stop`) are checked against a
//! hierarchical permission tree. Grants come from per-group files and
//! per-user override files, and may use `a.b.*` wildcards.
//!
//! ## Module Organization
//!
//! - `network`: listener, arrival queue, dispatch loop, shutdown
//! - `session`, `session_manager`: per-connection tasks and the registry
//! - `state`, `dispatch`: shared state and per-message server rules
//! - `commands`, `builtins`: the command registry and stock commands
//! - `permissions`: permission tree, grants and on-disk group/user files
//! - `scheduler`, `keepalive`: deferred tasks and liveness checks
//! - `board`, `users`, `config`, `error`: supporting pieces
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:7777".to_string(),
//!         ..ServerConfig::default()
//!     };
//!
//!     let server = Server::bind(config).await?;
//!     let handle = server.handle();
//!
//!     // Console lines go through the same command registry as clients,
//!     // minus the permission check.
//!     handle.console("/setup 12 8").await;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod board;
pub mod builtins;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod network;
pub mod permissions;
pub mod scheduler;
pub mod session;
pub mod session_manager;
pub mod state;
pub mod users;
