//! Runtime configuration for the server.

use shared::{DEFAULT_PORT, MAX_LINE_LENGTH, PROTOCOL_VERSION};
use std::path::PathBuf;
use std::time::Duration;

/// Interval between keepalive pings sent to every logged-in session.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Everything the server needs to know before it binds.
///
/// The binary builds this from command line flags; tests build it directly
/// to get a random port, a temporary data directory and short timers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to, e.g. `0.0.0.0:7777`.
    pub bind_addr: String,
    /// Root for `users.json` and the `permissions/` tree.
    pub data_dir: PathBuf,
    /// Version string clients must present in their handshake.
    pub version: String,
    pub ping_interval: Duration,
    /// How long `close` waits for a session's tasks before aborting them.
    pub close_timeout: Duration,
    /// Capacity of the arrival queue feeding the dispatch loop.
    pub arrival_capacity: usize,
    /// Capacity of each session's outbound queue.
    pub outbound_capacity: usize,
    pub max_line_length: usize,
    /// Group applied to users without an explicit override.
    pub default_group: String,
    pub board_width: i32,
    pub board_height: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            data_dir: PathBuf::from("."),
            version: PROTOCOL_VERSION.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            close_timeout: Duration::from_secs(2),
            arrival_capacity: 1024,
            outbound_capacity: 256,
            max_line_length: MAX_LINE_LENGTH,
            default_group: "default".to_string(),
            board_width: 10,
            board_height: 10,
        }
    }
}

impl ServerConfig {
    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.data_dir.join("permissions").join("groups")
    }

    pub fn user_permissions_dir(&self) -> PathBuf {
        self.data_dir.join("permissions").join("users")
    }
}
