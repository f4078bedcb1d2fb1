//! The watch manager: owns the directory watchers, turns change events into
//! tails, and swaps configuration generations at runtime.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{contains_ignore_case, ConfigSource, ScanConfig};
use crate::dispatch::{base_name, Dispatcher};
use crate::epoch::Epoch;
use crate::events::{absolutify, WatchEvent, WatchSet};
use crate::reader::{Lease, TailOptions, Tailer};
use crate::registry::FileRegistry;

/// Times a change event retries claiming a file whose tail is finishing.
const CLAIM_ATTEMPTS: usize = 3;

/// Lifecycle of the engine as seen by its host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineState {
    Stopped,
    Running,
    ReloadPending,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineOptions {
    /// Pause between cancelling in-flight tails and installing a reloaded
    /// configuration.
    pub reload_grace: Duration,
    pub tail: TailOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            reload_grace: Duration::from_millis(50),
            tail: TailOptions::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is already running")]
    AlreadyRunning,
    #[error("None of the configured log directories exist")]
    NoLogDirectories,
    #[error("Failed to watch any of the configured log directories")]
    NoWatchers,
}

struct Session {
    watchers: WatchSet,
    stop: CancellationToken,
    config_modified: Option<SystemTime>,
}

struct Shared {
    source: Arc<dyn ConfigSource>,
    registry: FileRegistry,
    dispatcher: Arc<Dispatcher>,
    options: EngineOptions,
    config: RwLock<Option<Arc<ScanConfig>>>,
    epoch: RwLock<Epoch>,
    session: Mutex<Option<Session>>,
    reload: tokio::sync::Mutex<()>,
    state: watch::Sender<EngineState>,
}

/// Watches every configured log directory and the configuration file,
/// starting one tail per changed file.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct WatchManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchManager")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("files", &self.shared.registry.len())
            .finish()
    }
}

impl WatchManager {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        dispatcher: Arc<Dispatcher>,
        registry: FileRegistry,
        options: EngineOptions,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Stopped);

        WatchManager {
            shared: Arc::new(Shared {
                source,
                registry,
                dispatcher,
                options,
                config: RwLock::new(None),
                epoch: RwLock::new(Epoch::new()),
                session: Mutex::new(None),
                reload: tokio::sync::Mutex::new(()),
                state,
            }),
        }
    }

    /// Starts watching with `config`. Must be called from within a Tokio
    /// runtime.
    ///
    /// Succeeds as long as at least one log directory could be watched;
    /// directories that could not are logged and left unmonitored.
    pub fn start(&self, config: ScanConfig) -> Result<(), EngineError> {
        let mut session = self.shared.session.lock();
        if session.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        info!("Starting log scanner");

        let dirs = config.log_directories();
        if !dirs.iter().any(|dir| dir.is_dir()) {
            error!(dirs = ?dirs, "None of the configured log directories exist");
            return Err(EngineError::NoLogDirectories);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watchers = WatchSet::new(tx);

        let config_path = self.shared.source.watch_path().map(Path::to_path_buf);
        if let Some(path) = &config_path {
            watchers.watch_config(path);
        }

        let watched = watchers.watch_logs(&dirs);
        if watched == 0 {
            error!("Failed to create a watcher for any configured log directory");
            return Err(EngineError::NoWatchers);
        }
        if watched < dirs.len() {
            warn!(
                watched,
                configured = dirs.len(),
                "Running with some log directories unmonitored"
            );
        }

        *self.shared.config.write() = Some(Arc::new(config));
        {
            let mut epoch = self.shared.epoch.write();
            if epoch.is_cancelled() {
                *epoch = epoch.next();
            }
        }

        let stop = CancellationToken::new();
        *session = Some(Session {
            watchers,
            stop: stop.clone(),
            config_modified: config_path.as_deref().and_then(modified),
        });
        drop(session);

        self.set_state(EngineState::Running);
        info!(directories = watched, "Log scanner started");

        tokio::spawn(self.clone().run_events(rx, stop));

        Ok(())
    }

    /// Releases every watcher and cancels all running tails. The registry is
    /// kept, so a later start resumes from the remembered offsets.
    pub fn stop(&self) {
        let session = self.shared.session.lock().take();
        if let Some(session) = session {
            session.stop.cancel();
            drop(session.watchers);
            info!("Released all watchers");
        }

        let epoch = self.shared.epoch.read().clone();
        info!(generation = epoch.generation(), "Cancelling running scans");
        epoch.cancel();

        self.set_state(EngineState::Stopped);
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    /// Receives every state transition, including the stop that follows an
    /// invalid configuration reload.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> Option<Arc<ScanConfig>> {
        self.shared.config.read().clone()
    }

    /// Generation of the epoch new tails are spawned under.
    pub fn generation(&self) -> u64 {
        self.shared.epoch.read().generation()
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Engine state changed");
        }
    }

    async fn run_events(self, mut rx: mpsc::UnboundedReceiver<WatchEvent>, stop: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                WatchEvent::Changed(path) => self.on_changed(&path, false).await,
                WatchEvent::Rescan(path) => self.on_changed(&path, true).await,
                WatchEvent::Removed(path) => self.on_removed(&path),
                WatchEvent::ConfigChanged(path) => self.on_config_changed(&path).await,
                WatchEvent::Overflow(dir) => error!(
                    dir = %dir.display(),
                    "Watcher buffer overflowed, some file changes were missed"
                ),
                WatchEvent::Failed { dir, reason } => {
                    error!(dir = %dir.display(), reason = %reason, "Watcher reported an error")
                }
            }
        }

        debug!("Event loop finished");
    }

    /// Starts a tail for `path` or flags its running one. `force` skips the
    /// duplicate check on the modification time.
    async fn on_changed(&self, path: &Path, force: bool) {
        let Some(config) = self.config() else {
            return;
        };
        let epoch = self.shared.epoch.read().clone();
        if epoch.is_cancelled() {
            trace!(file = %path.display(), "Ignoring change while configuration is swapped");
            return;
        }

        let file_name = base_name(path);
        if file_name.is_empty() {
            return;
        }

        let modified = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.modified().ok(),
            Ok(_) => return,
            Err(e) => {
                trace!(file = %path.display(), error = %e, "Changed file is gone");
                return;
            }
        };

        let registry = &self.shared.registry;
        match registry.get(&file_name) {
            Some(state) => {
                if !force && modified.is_some() && state.last_write_observed == modified {
                    trace!(file = %file_name, "Duplicate change event");
                    return;
                }
                debug!(file = %file_name, offset = state.read_offset, "Known file changed");
            }
            None => {
                let patterns = patterns_for(&config, path);
                if !patterns.iter().any(|p| contains_ignore_case(&file_name, p)) {
                    trace!(file = %file_name, "Not in the list of files to scan");
                    return;
                }
                info!(file = %file_name, path = %path.display(), "Found a new file to scan");
                registry.get_or_create(&file_name, path);
            }
        }

        for _ in 0..CLAIM_ATTEMPTS {
            if registry.try_activate(&file_name) {
                self.spawn_tail(config, epoch, &file_name, path, modified).await;
                return;
            }
            if registry.flag_change(&file_name) {
                info!(file = %file_name, "There is already an active scan for this file");
                return;
            }
        }
        warn!(file = %file_name, "Could not claim file for scanning");
    }

    async fn spawn_tail(
        &self,
        config: Arc<ScanConfig>,
        epoch: Epoch,
        file_name: &str,
        path: &Path,
        modified: Option<SystemTime>,
    ) {
        let registry = &self.shared.registry;
        let Some(mut state) = registry.get(file_name) else {
            return;
        };

        state.file_path = path.to_path_buf();
        state.last_write_observed = modified;
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.len() < state.read_offset {
                info!(
                    file = %file_name,
                    len = meta.len(),
                    offset = state.read_offset,
                    "File shrank, scanning it from the start"
                );
                state.read_offset = 0;
            }
        }
        registry.update(&state);

        info!(file = %file_name, offset = state.read_offset, "Starting scan task");

        let rescan = self.shared.session.lock().as_ref().map(|s| s.watchers.sender());
        let mut lease = Lease::new(registry.clone(), state);
        if let Some(tx) = rescan {
            lease = lease.with_rescan(tx);
        }

        let tailer = Tailer::new(
            config,
            lease,
            epoch,
            Arc::clone(&self.shared.dispatcher),
            self.shared.options.tail,
        );
        tokio::spawn(tailer.run());
    }

    fn on_removed(&self, path: &Path) {
        let file_name = base_name(path);
        if self.shared.registry.remove(&file_name).is_some() {
            info!(file = %file_name, "Removed deleted file from the file map");
        }
    }

    async fn on_config_changed(&self, path: &Path) {
        let now = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .ok();
        {
            let mut session = self.shared.session.lock();
            let Some(session) = session.as_mut() else {
                return;
            };
            if now.is_some() && session.config_modified == now {
                trace!("Duplicate configuration change event");
                return;
            }
            session.config_modified = now;
        }

        self.reload().await;
    }

    /// Cancels every running tail and installs a freshly loaded
    /// configuration. An invalid configuration stops the engine.
    pub async fn reload(&self) {
        let _reloading = self.shared.reload.lock().await;
        info!("New configuration detected");

        let config = match self.shared.source.load_validated() {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Configuration could not be updated, stopping");
                self.stop();
                return;
            }
        };

        if !self.switch_watchers(false) {
            return;
        }
        self.set_state(EngineState::ReloadPending);

        let old = self.shared.epoch.read().clone();
        warn!(
            generation = old.generation(),
            "Cancelling running scans to update configuration"
        );
        old.cancel();

        tokio::time::sleep(self.shared.options.reload_grace).await;

        let dirs = config.log_directories();
        let dirs_changed = self
            .config()
            .map(|current| !same_directories(&current.log_directories(), &dirs))
            .unwrap_or(true);

        *self.shared.config.write() = Some(Arc::new(config));
        info!("Configuration has been updated");

        let next = old.next();
        info!(generation = next.generation(), "New scans will run under a fresh token");
        *self.shared.epoch.write() = next;

        if dirs_changed {
            let watched = {
                let mut session = self.shared.session.lock();
                let Some(session) = session.as_mut() else {
                    return;
                };
                session.watchers.watch_logs(&dirs)
            };
            if watched == 0 {
                error!("None of the reconfigured log directories can be watched, stopping");
                self.stop();
                return;
            }
        }

        if !self.switch_watchers(true) {
            return;
        }
        self.set_state(EngineState::Running);

        // Tails cancelled above may have left changes nobody has read
        for state in self.shared.registry.unscanned() {
            info!(file = %state.file_name, "Rescanning file changed during the reload");
            self.on_changed(&state.file_path, true).await;
        }
    }

    /// Returns `false` if the engine was stopped meanwhile.
    fn switch_watchers(&self, enabled: bool) -> bool {
        match self.shared.session.lock().as_ref() {
            Some(session) => {
                session.watchers.set_enabled(enabled);
                true
            }
            None => false,
        }
    }
}

/// File-name patterns of the profiles whose log directory holds `path`.
/// Directories compare case-insensitively, whole components only.
fn patterns_for<'a>(config: &'a ScanConfig, path: &Path) -> Vec<&'a str> {
    let lower = |p: &Path| PathBuf::from(p.to_string_lossy().to_lowercase());
    let path = lower(path);
    let mut patterns = Vec::new();

    for profile in &config.profiles {
        let raw = lower(&profile.log_directory);
        let resolved = absolutify(&profile.log_directory, false)
            .map(|dir| lower(&dir))
            .unwrap_or_else(|_| raw.clone());

        let holds = path.starts_with(&raw) || path.starts_with(&resolved);
        if holds && !patterns.contains(&profile.file_name_pattern.as_str()) {
            patterns.push(profile.file_name_pattern.as_str());
        }
    }

    patterns
}

fn same_directories(a: &[PathBuf], b: &[PathBuf]) -> bool {
    let key = |dirs: &[PathBuf]| {
        let mut keys: Vec<String> = dirs
            .iter()
            .map(|d| d.to_string_lossy().to_lowercase())
            .collect();
        keys.sort();
        keys
    };
    key(a) == key(b)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
