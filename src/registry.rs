//! Per-file scan state shared between the watch manager and the tailers.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

/// Scan progress for one log file, keyed by its base name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileState {
    pub file_name: String,
    pub file_path: PathBuf,
    /// Set while a tailer owns this entry.
    pub is_active: bool,
    /// Byte offset of the next unread byte.
    pub read_offset: u64,
    /// Modification time seen on the event that last started a tail.
    pub last_write_observed: Option<SystemTime>,
    /// Trigger strings already detected in this file. Never shrinks.
    pub triggers_found: BTreeSet<String>,
    /// A change was reported while a tailer was active.
    pub change_pending: bool,
}

impl FileState {
    pub fn new(file_name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        FileState {
            file_name: file_name.into(),
            file_path: file_path.into(),
            is_active: false,
            read_offset: 0,
            last_write_observed: None,
            triggers_found: BTreeSet::new(),
            change_pending: false,
        }
    }
}

/// Concurrent map of [`FileState`], cheap to clone.
///
/// [`FileRegistry::try_activate`] is the only way to take ownership of an
/// entry, so at most one tailer holds a given file name at a time. Only the
/// owner writes the entry back through [`FileRegistry::update`] or the release
/// methods.
#[derive(Clone, Debug, Default)]
pub struct FileRegistry {
    files: Arc<Mutex<HashMap<String, FileState>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `file_name`, creating an inactive one at offset
    /// zero if there is none.
    pub fn get_or_create(&self, file_name: &str, file_path: &Path) -> FileState {
        self.files
            .lock()
            .entry(file_name.to_string())
            .or_insert_with(|| FileState::new(file_name, file_path))
            .clone()
    }

    pub fn get(&self, file_name: &str) -> Option<FileState> {
        self.files.lock().get(file_name).cloned()
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.files.lock().contains_key(file_name)
    }

    /// Atomically marks the entry active. Returns `false` if it is already
    /// active or does not exist.
    pub fn try_activate(&self, file_name: &str) -> bool {
        match self.files.lock().get_mut(file_name) {
            Some(state) if !state.is_active => {
                state.is_active = true;
                state.change_pending = false;
                true
            }
            _ => false,
        }
    }

    /// Records that the file changed while its tailer is running. Returns
    /// `false` if the entry is not active (anymore), in which case the caller
    /// should try to activate it instead.
    pub fn flag_change(&self, file_name: &str) -> bool {
        match self.files.lock().get_mut(file_name) {
            Some(state) if state.is_active => {
                state.change_pending = true;
                true
            }
            _ => false,
        }
    }

    /// Overwrites an existing entry, keeping its `change_pending` flag. An
    /// entry removed in the meantime stays removed, and `false` is returned.
    pub fn update(&self, state: &FileState) -> bool {
        match self.files.lock().get_mut(&state.file_name) {
            Some(slot) => {
                let change_pending = slot.change_pending;
                *slot = state.clone();
                slot.change_pending = change_pending;
                true
            }
            None => false,
        }
    }

    /// Stores `state` as inactive unless a change was flagged since the last
    /// check, in which case the flag is cleared, the entry stays active and
    /// `false` is returned.
    pub fn try_release(&self, state: &FileState) -> bool {
        let mut files = self.files.lock();
        let Some(slot) = files.get_mut(&state.file_name) else {
            return true;
        };

        if slot.change_pending {
            let mut kept = state.clone();
            kept.is_active = true;
            kept.change_pending = false;
            *slot = kept;
            return false;
        }

        let mut released = state.clone();
        released.is_active = false;
        *slot = released;
        true
    }

    /// Stores `state` as inactive regardless of pending changes.
    ///
    /// A flagged change stays flagged on the inactive entry until the next
    /// activation. Returns `true` if one was flagged, meaning the file holds
    /// data no tail has looked at yet.
    pub fn release(&self, state: &FileState) -> bool {
        let mut files = self.files.lock();
        let Some(slot) = files.get_mut(&state.file_name) else {
            return false;
        };

        let change_pending = slot.change_pending;
        let mut released = state.clone();
        released.is_active = false;
        released.change_pending = change_pending;
        *slot = released;
        change_pending
    }

    /// Inactive entries that were released with a change still flagged.
    pub fn unscanned(&self) -> Vec<FileState> {
        self.files
            .lock()
            .values()
            .filter(|state| !state.is_active && state.change_pending)
            .cloned()
            .collect()
    }

    pub fn remove(&self, file_name: &str) -> Option<FileState> {
        self.files.lock().remove(file_name)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }

    /// Snapshot of every entry.
    pub fn snapshot(&self) -> Vec<FileState> {
        self.files.lock().values().cloned().collect()
    }
}
