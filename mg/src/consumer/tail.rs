//! Offset-tracking reader for an append-only file
//!
//! Only complete lines are consumed. A trailing fragment without its newline
//! stays on disk past the offset and is read again on the next poll. When the
//! file shrinks below the offset, is replaced (new inode), is removed, or has
//! its already-read leading bytes rewritten in place, the reader starts over
//! at offset 0 of whatever file is there next.

use std::io::{ErrorKind, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// Leading bytes remembered to spot a truncate-and-rewrite on the same inode
const HEAD_LEN: usize = 64;

pub struct Tail {
    path: PathBuf,
    file: Option<File>,
    inode: Option<u64>,
    offset: u64,
    chunk: Vec<u8>,
    /// First consumed bytes of the current file
    head: Vec<u8>,
    reopen: bool,
    rotations: u64,
}

impl Tail {
    pub fn new(path: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            path: path.into(),
            file: None,
            inode: None,
            offset: 0,
            chunk: vec![0; buffer_size.max(1)],
            head: Vec::new(),
            reopen: false,
            rotations: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset just past the last consumed line
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Treat the file as rotated on the next poll
    pub fn force_reopen(&mut self) {
        self.reopen = true;
    }

    fn reset(&mut self, reason: &str) {
        info!(path = ?self.path, reason, offset = self.offset, "Tail: file rotated, reading from start");
        self.file = None;
        self.inode = None;
        self.offset = 0;
        self.head.clear();
        self.rotations += 1;
    }

    async fn check_rotation(&mut self) -> std::io::Result<()> {
        if std::mem::take(&mut self.reopen) && self.file.is_some() {
            self.reset("removed or renamed");
        }

        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.file.is_some() {
                    self.reset("missing");
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.file.is_some() {
            if self.inode != Some(meta.ino()) {
                self.reset("replaced");
            } else if meta.len() < self.offset {
                self.reset("truncated");
            }
        }

        // Truncated and regrown past the offset between polls
        let rewritten = match self.file.as_mut() {
            Some(file) if !self.head.is_empty() => read_head(file, self.head.len()).await? != self.head,
            _ => false,
        };
        if rewritten {
            self.reset("rewritten");
        }

        if self.file.is_none() {
            debug!(path = ?self.path, "Tail: opening file");
            self.file = Some(File::open(&self.path).await?);
            self.inode = Some(meta.ino());
        }
        Ok(())
    }

    /// Read every complete line past the offset, passing each to `sink`
    ///
    /// The newline is stripped. Returns the number of lines consumed.
    pub async fn poll(&mut self, sink: &mut (dyn FnMut(&[u8]) + Send)) -> std::io::Result<usize> {
        self.check_rotation().await?;
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut carry: Vec<u8> = Vec::new();
        let mut consumed = 0;
        loop {
            let n = file.read(&mut self.chunk).await?;
            if n == 0 {
                break;
            }
            carry.extend_from_slice(&self.chunk[..n]);

            let mut start = 0;
            while let Some(pos) = carry[start..].iter().position(|b| *b == b'\n') {
                let end = start + pos;
                sink(&carry[start..end]);
                consumed += 1;
                start = end + 1;
            }
            self.offset += start as u64;
            carry.drain(..start);
        }

        if self.head.len() < HEAD_LEN && self.offset > self.head.len() as u64 {
            let want = HEAD_LEN.min(usize::try_from(self.offset).unwrap_or(HEAD_LEN));
            self.head = read_head(file, want).await?;
        }

        if !carry.is_empty() {
            debug!(pending = carry.len(), "Tail: partial line left for next poll");
        }
        Ok(consumed)
    }
}

async fn read_head(file: &mut File, len: usize) -> std::io::Result<Vec<u8>> {
    let mut head = vec![0; len];
    file.seek(SeekFrom::Start(0)).await?;
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(head)
}
