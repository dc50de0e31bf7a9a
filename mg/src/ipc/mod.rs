//! Monitor IPC over a Unix domain socket
//!
//! One [`MonitorServer`] accepts any number of connections. Producers
//! ([`MonitorClient`]) stream event lines in; viewers ([`MonitorReceiver`])
//! send a history request, get a replay of recent messages, then follow live
//! traffic. Every line is a JSON [`IpcMessage`].

use std::path::PathBuf;

pub mod client;
pub mod history;
pub mod listener;
pub mod messages;
pub mod receiver;
pub mod server;

pub use client::MonitorClient;
pub use history::{DEFAULT_HISTORY_CAPACITY, EventHistory};
pub use messages::IpcMessage;
pub use receiver::MonitorReceiver;
pub use server::MonitorServer;

/// Default monitor socket path
///
/// Lives in the user's runtime directory, falling back to the local data
/// directory and then `/tmp`.
pub fn socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("morgana")
        .join("monitor.sock")
}
