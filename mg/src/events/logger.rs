//! Event file writer - appends events to a JSONL file
//!
//! Each line is the flat form of an event ([`Event::to_data`]), which is the
//! shape the event consumer tails. Attach a writer to a bus to record every
//! event it delivers.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use eyre::{Context, Result};
use tracing::{debug, error, warn};

use super::bus::{EventBus, SubscriptionId};
use super::decode::decode_record;
use super::types::Event;

/// Appends events to a single JSONL file
pub struct EventFileWriter {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl EventFileWriter {
    /// Open (or create) the file for appending, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventFileWriter::open");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(format!("Failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open event file {}", path.display()))?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event as a line and flush
    pub fn write_event(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(&event.to_data())?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    /// Record every event delivered by the bus
    pub fn attach(self: Arc<Self>, bus: &EventBus) -> SubscriptionId {
        debug!(path = ?self.path, "EventFileWriter::attach");
        bus.subscribe_all(move |event| {
            if let Err(e) = self.write_event(event) {
                error!(path = ?self.path, task_id = %event.task_id, error = %e, "EventFileWriter: failed to write event");
            }
        })
    }
}

/// Read every decodable event from a JSONL file
///
/// A missing file reads as empty; unparseable lines are skipped.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<Event>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    let mut events = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str(line).ok().and_then(decode_record) {
            Some(event) => events.push(event),
            None => warn!(line, "read_events: skipping unparseable line"),
        }
    }

    debug!(count = events.len(), "read_events: loaded events");
    Ok(events)
}
