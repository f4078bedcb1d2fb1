//! Everything related to watching directories for creations, modifications
//! and deletions, and turning `notify` events into what the engine acts on.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What a watched directory reported.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchEvent {
    /// A file was created, written to, or renamed into place.
    Changed(PathBuf),
    /// A file was deleted or renamed away.
    Removed(PathBuf),
    /// A file was left with data no tail has scanned. Unlike `Changed`, this
    /// is not suppressed when the modification time is unchanged.
    Rescan(PathBuf),
    /// The configuration file changed.
    ConfigChanged(PathBuf),
    /// The watcher for this directory lost events.
    Overflow(PathBuf),
    /// The watcher for this directory failed.
    Failed { dir: PathBuf, reason: String },
}

pub type EventSender = mpsc::UnboundedSender<WatchEvent>;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("Failed to watch {path}: {source}")]
    AddFailure {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("Error resolving path: {0}")]
    Path(#[from] io::Error),
}

/// A `notify` watcher for one directory whose events can be switched off
/// without tearing the watch down.
pub struct DirWatch {
    _inner: notify::RecommendedWatcher,
    dir: PathBuf,
    enabled: Arc<AtomicBool>,
}

impl Debug for DirWatch {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("DirWatch")
            .field("dir", &self.dir)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl DirWatch {
    /// Watches a log directory and everything below it.
    pub fn logs(dir: impl AsRef<Path>, tx: EventSender) -> Result<Self, WatchError> {
        let dir = absolutify(dir.as_ref(), false)?;
        if !dir.is_dir() {
            return Err(WatchError::MissingDirectory(dir));
        }

        let root = dir.clone();
        Self::start(dir, RecursiveMode::Recursive, move |res| match res {
            Ok(event) => {
                for ev in translate(event, &root) {
                    // `send` only fails once the engine dropped the receiver
                    let _ = tx.send(ev);
                }
            }
            Err(e) => {
                let _ = tx.send(WatchEvent::Failed {
                    dir: root.clone(),
                    reason: e.to_string(),
                });
            }
        })
    }

    /// Watches the directory holding `file` and reports changes to `file`
    /// only.
    pub fn config_file(file: impl AsRef<Path>, tx: EventSender) -> Result<Self, WatchError> {
        let file = absolutify(file.as_ref(), true)?;
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WatchError::MissingDirectory(file.clone()))?;
        if !dir.is_dir() {
            return Err(WatchError::MissingDirectory(dir));
        }

        Self::start(dir, RecursiveMode::NonRecursive, move |res| {
            let Ok(event) = res else {
                return;
            };
            let touches_config = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event.paths.iter().any(|p| p.file_name() == file.file_name());
            if touches_config {
                let _ = tx.send(WatchEvent::ConfigChanged(file.clone()));
            }
        })
    }

    fn start<F>(dir: PathBuf, mode: RecursiveMode, mut handler: F) -> Result<Self, WatchError>
    where
        F: FnMut(notify::Result<notify::Event>) + Send + 'static,
    {
        let enabled = Arc::new(AtomicBool::new(true));
        let gate = Arc::clone(&enabled);

        let mut inner = notify::recommended_watcher(move |res| {
            if gate.load(Ordering::Acquire) {
                handler(res);
            }
        })
        .map_err(|source| WatchError::AddFailure {
            path: dir.clone(),
            source,
        })?;

        inner
            .watch(&dir, mode)
            .map_err(|source| WatchError::AddFailure {
                path: dir.clone(),
                source,
            })?;

        Ok(DirWatch {
            _inner: inner,
            dir,
            enabled,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Maps one `notify` event onto engine events. Directory-only and access
/// events are dropped.
pub(crate) fn translate(event: notify::Event, root: &Path) -> Vec<WatchEvent> {
    if event.need_rescan() {
        return vec![WatchEvent::Overflow(root.to_path_buf())];
    }

    let make: fn(PathBuf) -> WatchEvent = match &event.kind {
        // Windows returns `Any` for file creation and modification, so handle that
        EventKind::Create(CreateKind::File | CreateKind::Any) => WatchEvent::Changed,
        EventKind::Modify(
            ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Name(RenameMode::To),
        ) => WatchEvent::Changed,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths are [from, to]
            let mut paths = event.paths.into_iter();
            return paths
                .next()
                .map(WatchEvent::Removed)
                .into_iter()
                .chain(paths.next().map(WatchEvent::Changed))
                .collect();
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => WatchEvent::Removed,
        EventKind::Remove(_) => WatchEvent::Removed,
        _ => return Vec::new(),
    };

    event.paths.into_iter().map(make).collect()
}

/// The config watcher plus one watcher per log directory, all feeding one
/// channel. Dropping the set releases every watch.
#[derive(Debug)]
pub struct WatchSet {
    tx: EventSender,
    config: Option<DirWatch>,
    logs: Vec<DirWatch>,
}

impl WatchSet {
    pub fn new(tx: EventSender) -> Self {
        WatchSet {
            tx,
            config: None,
            logs: Vec::new(),
        }
    }

    /// Starts watching the configuration file. Failure only costs live
    /// reloads, so it is logged rather than returned.
    pub fn watch_config(&mut self, file: &Path) {
        info!(file = %file.display(), "Creating configuration watcher");
        match DirWatch::config_file(file, self.tx.clone()) {
            Ok(watch) => self.config = Some(watch),
            Err(e) => warn!(
                error = %e,
                "Failed to watch configuration; changes will require a restart"
            ),
        }
    }

    /// Replaces the log directory watchers. Returns how many directories are
    /// now watched; each failure is logged.
    pub fn watch_logs(&mut self, dirs: &[PathBuf]) -> usize {
        self.logs.clear();

        for dir in dirs {
            info!(dir = %dir.display(), "Creating log directory watcher");
            match DirWatch::logs(dir, self.tx.clone()) {
                Ok(watch) => self.logs.push(watch),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Log directory is not monitored"),
            }
        }

        self.logs.len()
    }

    /// Another handle on the channel the watchers feed.
    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        info!(
            enabled,
            log_watchers = self.logs.len(),
            config_watcher = self.config.is_some(),
            "Switching watchers"
        );
        for watch in self.config.iter().chain(self.logs.iter()) {
            watch.set_enabled(enabled);
        }
    }

    pub fn log_dirs(&self) -> Vec<PathBuf> {
        self.logs.iter().map(|w| w.dir().to_path_buf()).collect()
    }
}

pub(crate) fn absolutify(path: impl Into<PathBuf>, is_file: bool) -> io::Result<PathBuf> {
    let path = path.into();

    let (dir, maybe_filename) = if is_file {
        let parent = match path.parent() {
            None => std::env::current_dir()?,
            Some(path) => {
                if path == Path::new("") {
                    std::env::current_dir()?
                } else {
                    path.to_path_buf()
                }
            }
        };
        let filename = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?
            .to_os_string();

        (parent, Some(filename))
    } else {
        (path, None)
    };

    let dir = if let Ok(abs_dir) = dir.canonicalize() {
        abs_dir
    } else {
        dir
    };

    let path = if let Some(filename) = maybe_filename {
        dir.join(filename)
    } else {
        dir
    };

    Ok(path)
}
