//! A library and daemon that tails log directories and fires actions the first
//! time configured trigger strings show up in a file.
//!
//! Change events from [`notify`](https://crates.io/crates/notify) start at most
//! one tail per file. Each tail reads newly written bytes in chunks from a
//! remembered offset, consumes only complete lines, and hands them to matching.
//! A match dispatches the owning profile's actions (a notification and/or an
//! external command), serialized across the whole process. Each trigger fires
//! at most once per file for the lifetime of the process.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use linetrip::{
//!     ConfigFile, ConfigSource, Dispatcher, EngineOptions, FileRegistry, MailNotifier,
//!     ProcessRunner, WatchManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(ConfigFile::new("linetrip.toml"));
//!     let config = source.load_validated()?;
//!
//!     let dispatcher = Dispatcher::new(
//!         Arc::new(MailNotifier::new()),
//!         Arc::new(ProcessRunner::new("commands")),
//!     );
//!     let manager = WatchManager::new(
//!         source,
//!         Arc::new(dispatcher),
//!         FileRegistry::new(),
//!         EngineOptions::default(),
//!     );
//!
//!     manager.start(config)?;
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! File state is keyed by base name, so two watched files with the same name in
//! different directories share one entry. Offsets live in memory only; a
//! restarted process scans every file it sees from the start.

mod actions;
mod config;
mod dispatch;
mod epoch;
mod events;
mod manager;
mod reader;
mod registry;

pub use actions::{
    host_name, ActionError, CommandRunner, MailNotifier, Message, Notifier, ProcessRunner,
    SendmailNotifier, SmtpNotifier,
};
pub use config::{
    Action, ConfigError, ConfigFile, ConfigSource, NotificationSettings, NotificationTarget,
    Profile, ScanConfig, DEFAULT_CHUNK_SIZE, DEFAULT_SMTP_PORT,
};
pub use dispatch::{find_matches, resolve_profile, triggers_for, DispatchError, Dispatcher};
pub use epoch::Epoch;
pub use events::{DirWatch, EventSender, WatchError, WatchEvent, WatchSet};
pub use manager::{EngineError, EngineOptions, EngineState, WatchManager};
pub use notify::event;
pub use reader::{probe_writer, Chunk, Lease, TailOptions, Tailer, WriterProbe};
pub use registry::{FileRegistry, FileState};
