//! Trigger matching and serialized action dispatch.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use futures_util::future;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::actions::{self, CommandRunner, Message, Notifier};
use crate::config::{contains_ignore_case, Profile, ScanConfig};

#[derive(Debug, Error, Eq, PartialEq)]
pub enum DispatchError {
    #[error("No profile is configured for trigger {trigger:?}")]
    UnknownTrigger { trigger: String },
    #[error("No profile for trigger {trigger:?} matches file {file_name}")]
    NoMatchingPattern { trigger: String, file_name: String },
}

/// Returns the pending triggers contained in `text`, ignoring case.
pub fn find_matches(text: &str, pending: &[String]) -> HashSet<String> {
    let haystack = text.to_lowercase();

    pending
        .iter()
        .filter(|trigger| haystack.contains(&trigger.to_lowercase()))
        .cloned()
        .collect()
}

/// Distinct trigger strings of every profile whose pattern matches
/// `file_name`, in configuration order.
pub fn triggers_for<'a>(config: &'a ScanConfig, file_name: &str) -> Vec<&'a str> {
    let mut triggers = Vec::new();
    for profile in &config.profiles {
        if profile.matches_file_name(file_name) && !triggers.contains(&profile.trigger.as_str()) {
            triggers.push(profile.trigger.as_str());
        }
    }
    triggers
}

/// Picks the profile that owns a match of `trigger` in `file_path`.
///
/// A trigger configured once resolves to that profile. When several profiles
/// share it, the first whose pattern is contained in the file's base name
/// wins.
pub fn resolve_profile<'a>(
    config: &'a ScanConfig,
    trigger: &str,
    file_path: &Path,
) -> Result<&'a Profile, DispatchError> {
    let candidates: Vec<&Profile> = config
        .profiles
        .iter()
        .filter(|p| p.trigger == trigger)
        .collect();

    match candidates.as_slice() {
        [] => Err(DispatchError::UnknownTrigger {
            trigger: trigger.to_string(),
        }),
        [only] => Ok(*only),
        many => {
            let file_name = base_name(file_path);
            many.iter()
                .copied()
                .find(|p| contains_ignore_case(&file_name, &p.file_name_pattern))
                .ok_or(DispatchError::NoMatchingPattern {
                    trigger: trigger.to_string(),
                    file_name,
                })
        }
    }
}

pub(crate) fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Runs the configured actions for a match, one dispatch at a time across
/// the whole process.
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    runner: Arc<dyn CommandRunner>,
    host: String,
    gate: Mutex<()>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("host", &self.host)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, runner: Arc<dyn CommandRunner>) -> Self {
        Dispatcher {
            notifier,
            runner,
            host: actions::host_name(),
            gate: Mutex::new(()),
        }
    }

    /// Overrides the host name reported in notification bodies.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Fires the actions of the profile owning `trigger` for `file_path`.
    ///
    /// Action failures are logged and swallowed. Only a failure to resolve the
    /// profile is returned, in which case nothing was fired.
    pub async fn dispatch(
        &self,
        config: &ScanConfig,
        trigger: &str,
        file_path: &Path,
    ) -> Result<(), DispatchError> {
        let _serialized = self.gate.lock().await;

        let profile = resolve_profile(config, trigger, file_path)?;
        let file_name = base_name(file_path);

        info!(
            trigger,
            file = %file_path.display(),
            pattern = %profile.file_name_pattern,
            "Dispatching actions"
        );

        let notify = async {
            if !profile.action.send_notification {
                return;
            }
            let message = Message {
                subject: profile.notification.subject.clone(),
                recipients: profile.notification.recipients.clone(),
                body: format!(
                    "The string \"{}\" was detected.\nserver: {}\nfile: {}",
                    trigger, self.host, file_name
                ),
            };
            match self.notifier.send(&config.notification, &message).await {
                Ok(()) => info!(subject = %message.subject, "Notification sent"),
                Err(e) => error!(error = %e, "Notification failed to send"),
            }
        };

        let command = async {
            if !profile.action.run_command {
                return;
            }
            if let Err(e) = self.runner.run(&profile.action.command).await {
                error!(command = %profile.action.command, error = %e, "Failed to start command");
            }
        };

        future::join(notify, command).await;

        Ok(())
    }
}
