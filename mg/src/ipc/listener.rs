//! Socket setup and teardown for the monitor server

use std::path::Path;

use eyre::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tracing::{debug, warn};

use super::messages::IpcMessage;

/// Bind a listener at `socket_path`
///
/// Creates the parent directory and removes a stale socket left by a previous
/// run before binding.
pub fn create_listener_at(socket_path: &Path) -> Result<UnixListener> {
    debug!(?socket_path, "create_listener_at: creating monitor socket");

    if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind monitor socket")?;
    debug!(?socket_path, "create_listener_at: socket bound");
    Ok(listener)
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Write one message as a JSON line
pub async fn write_message(writer: &mut OwnedWriteHalf, message: &IpcMessage) -> Result<()> {
    let line = message.to_line().context("Failed to serialize message")?;
    writer.write_all(line.as_bytes()).await.context("Failed to write message")?;
    writer.flush().await.context("Failed to flush message")?;
    Ok(())
}

/// Read the next newline-terminated frame into `buf` as raw bytes
///
/// Returns false at end of stream. Bytes need not be valid UTF-8; callers
/// decide what to do with a frame that does not parse.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool> {
    buf.clear();
    Ok(reader.read_until(b'\n', buf).await? > 0)
}

/// Decode a frame; `None` for a blank one
pub fn parse_frame(frame: &[u8]) -> Option<serde_json::Result<IpcMessage>> {
    let frame = frame.trim_ascii();
    if frame.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(frame))
}
