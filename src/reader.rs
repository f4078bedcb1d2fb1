//! Everything related to reading new bytes of a file from a remembered
//! offset and scanning them for trigger strings.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, trace, warn};

use crate::dispatch::{self, Dispatcher};
use crate::epoch::Epoch;
use crate::events::{EventSender, WatchEvent};
use crate::registry::{FileRegistry, FileState};
use crate::ScanConfig;

/// Timing of a tailer's waits on a file that is still being written.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TailOptions {
    /// Pause between polls of a file with no new data, or after a failed read.
    pub retry_delay: Duration,
    /// Polls without new data before the tail gives up and waits for the next
    /// change event instead.
    pub max_idle_polls: u32,
}

impl Default for TailOptions {
    fn default() -> Self {
        TailOptions {
            retry_delay: Duration::from_millis(500),
            max_idle_polls: 120,
        }
    }
}

/// Whether another process holds a file open for writing.
#[derive(Debug)]
pub enum WriterProbe {
    Unlocked,
    Locked,
    Error(io::Error),
}

impl WriterProbe {
    pub fn is_locked(&self) -> bool {
        matches!(self, WriterProbe::Locked)
    }
}

/// Tries to open `path` for exclusive writing and interprets a refusal as a
/// writer being present.
pub fn probe_writer(path: &Path) -> WriterProbe {
    let file = match OpenOptions::new().append(true).open(path) {
        Ok(file) => file,
        Err(e) if is_sharing_violation(&e) => return WriterProbe::Locked,
        Err(e) => return WriterProbe::Error(e),
    };

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            WriterProbe::Unlocked
        }
        Err(e) if is_contended(&e) => WriterProbe::Locked,
        Err(e) => WriterProbe::Error(e),
    }
}

/// Runs [`probe_writer`] off the async worker threads.
async fn probe(path: &Path) -> WriterProbe {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || probe_writer(&path))
        .await
        .unwrap_or_else(|e| WriterProbe::Error(io::Error::new(io::ErrorKind::Other, e)))
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(windows)]
fn is_sharing_violation(e: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    matches!(e.raw_os_error(), Some(32) | Some(33))
}

#[cfg(not(windows))]
fn is_sharing_violation(_e: &io::Error) -> bool {
    false
}

/// The complete-line part of one read, decoded as text.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    /// Text handed to matching.
    pub text: String,
    /// Bytes the read offset advances by.
    pub consumed: u64,
}

impl Chunk {
    /// Splits a raw read at its last line terminator.
    ///
    /// Only complete lines are consumed; the partial line after the last
    /// `\n` is read again next time. A read without any `\n` is consumed
    /// whole, so a trigger split across two such reads is never seen.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes.iter().rposition(|&b| b == b'\n') {
            Some(pos) => Chunk {
                text: decode(&bytes[..pos]),
                consumed: pos as u64 + 1,
            },
            None => Chunk {
                text: decode(bytes),
                consumed: bytes.len() as u64,
            },
        }
    }
}

/// Single-byte decoding: every byte maps to the char with the same value.
fn decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Reads up to `limit` bytes at `offset`, or `None` if the file has no bytes
/// past `offset`.
async fn read_at(path: &Path, offset: u64, limit: usize) -> io::Result<Option<Vec<u8>>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    if offset >= len {
        return Ok(None);
    }

    file.seek(io::SeekFrom::Start(offset)).await?;

    let mut buf = Vec::with_capacity(limit);
    file.take(limit as u64).read_to_end(&mut buf).await?;

    if buf.is_empty() {
        Ok(None)
    } else {
        Ok(Some(buf))
    }
}

#[derive(Debug)]
enum ChunkRead {
    Chunk(Chunk),
    EndOfData,
    Cancelled,
}

/// Exclusive hold on a registry entry. Dropping it writes the final state
/// back as inactive, on every exit path.
#[derive(Debug)]
pub struct Lease {
    registry: FileRegistry,
    state: FileState,
    released: bool,
    rescan: Option<EventSender>,
}

impl Lease {
    /// Wraps a state whose entry the caller already activated.
    pub fn new(registry: FileRegistry, state: FileState) -> Self {
        Lease {
            registry,
            state,
            released: false,
            rescan: None,
        }
    }

    /// Sends [`WatchEvent::Rescan`] to `tx` if the lease is dropped while a
    /// change is still flagged, so the unread data gets a new tail.
    pub fn with_rescan(mut self, tx: EventSender) -> Self {
        self.rescan = Some(tx);
        self
    }

    pub fn state(&self) -> &FileState {
        &self.state
    }

    fn persist(&self) {
        let mut progress = self.state.clone();
        progress.is_active = true;
        if !self.registry.update(&progress) {
            debug!(file = %self.state.file_name, "Entry was removed while scanning");
        }
    }

    /// Releases the entry unless a change was flagged meanwhile.
    fn try_release(&mut self) -> bool {
        self.state.is_active = false;
        self.released = self.registry.try_release(&self.state);
        self.released
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.state.is_active = false;
            if self.registry.release(&self.state) {
                debug!(file = %self.state.file_name, "File changed while the scan was stopping");
                if let Some(tx) = &self.rescan {
                    let _ = tx.send(WatchEvent::Rescan(self.state.file_path.clone()));
                }
            }
        }
        info!(
            file = %self.state.file_name,
            offset = self.state.read_offset,
            "Released file"
        );
    }
}

/// One tail attempt over one file.
pub struct Tailer {
    config: Arc<ScanConfig>,
    lease: Lease,
    epoch: Epoch,
    dispatcher: Arc<Dispatcher>,
    options: TailOptions,
}

impl Tailer {
    pub fn new(
        config: Arc<ScanConfig>,
        lease: Lease,
        epoch: Epoch,
        dispatcher: Arc<Dispatcher>,
        options: TailOptions,
    ) -> Self {
        Tailer {
            config,
            lease,
            epoch,
            dispatcher,
            options,
        }
    }

    /// Reads and scans until every trigger for the file was found, the data
    /// runs out with no writer present, or the epoch is cancelled.
    pub async fn run(mut self) {
        let file = self.lease.state.file_path.clone();

        let mut pending: Vec<String> =
            dispatch::triggers_for(&self.config, &self.lease.state.file_name)
                .into_iter()
                .filter(|t| !self.lease.state.triggers_found.contains(*t))
                .map(str::to_string)
                .collect();

        if pending.is_empty() {
            info!(file = %file.display(), "No triggers left to search for");
            return;
        }

        info!(
            file = %file.display(),
            offset = self.lease.state.read_offset,
            generation = self.epoch.generation(),
            "Begin scanning"
        );

        loop {
            let chunk = match self.read_chunk().await {
                ChunkRead::Chunk(chunk) => chunk,
                ChunkRead::Cancelled => {
                    warn!(file = %file.display(), "Scan cancelled");
                    break;
                }
                ChunkRead::EndOfData => {
                    if self.lease.try_release() {
                        info!(file = %file.display(), "Reached end of file");
                        break;
                    }
                    debug!(file = %file.display(), "File changed during scan, reading on");
                    continue;
                }
            };

            trace!(
                file = %file.display(),
                offset = self.lease.state.read_offset,
                consumed = chunk.consumed,
                "Read chunk"
            );
            self.lease.state.read_offset += chunk.consumed;

            let found = dispatch::find_matches(&chunk.text, &pending);
            for trigger in pending.iter().filter(|t| found.contains(*t)) {
                info!(trigger = %trigger, file = %file.display(), "Trigger found");
                self.lease.state.triggers_found.insert(trigger.clone());

                if let Err(e) = self.dispatcher.dispatch(&self.config, trigger, &file).await {
                    error!(error = %e, "Could not dispatch actions");
                }
            }
            pending.retain(|t| !found.contains(t));

            self.lease.persist();

            if pending.is_empty() {
                info!(file = %file.display(), "Exhausted triggers for file");
                break;
            }
        }
    }

    async fn read_chunk(&self) -> ChunkRead {
        let path = self.lease.state.file_path.as_path();
        let offset = self.lease.state.read_offset;
        let mut idle_polls = 0;

        loop {
            if self.epoch.is_cancelled() {
                return ChunkRead::Cancelled;
            }

            match read_at(path, offset, self.config.chunk_size).await {
                Ok(Some(bytes)) => return ChunkRead::Chunk(Chunk::from_bytes(&bytes)),
                Ok(None) => match probe(path).await {
                    WriterProbe::Locked => {
                        trace!(file = %path.display(), "No new data, writer still present")
                    }
                    WriterProbe::Unlocked => return ChunkRead::EndOfData,
                    WriterProbe::Error(e) => {
                        debug!(file = %path.display(), error = %e, "Writer probe failed");
                        return ChunkRead::EndOfData;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    info!(file = %path.display(), "File is gone");
                    return ChunkRead::EndOfData;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to read file"),
            }

            idle_polls += 1;
            if idle_polls >= self.options.max_idle_polls {
                info!(file = %path.display(), idle_polls, "Gave up waiting for data");
                return ChunkRead::EndOfData;
            }

            tokio::select! {
                _ = self.epoch.cancelled() => return ChunkRead::Cancelled,
                _ = tokio::time::sleep(self.options.retry_delay) => {}
            }
        }
    }
}
