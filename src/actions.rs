//! Side-effecting actions fired on a match: notifications and external
//! commands.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use futures_util::future::{BoxFuture, FutureExt};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::NotificationSettings;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error talking to {program}: {source}")]
    Io {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}")]
    Exit { program: PathBuf, status: ExitStatus },
    #[error("Invalid mail address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("Failed to compose message: {0}")]
    Compose(#[from] lettre::error::Error),
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("No SMTP host configured")]
    NoSmtpHost,
}

/// A notification ready to be delivered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub subject: String,
    pub recipients: Vec<String>,
    pub body: String,
}

/// Delivers notifications.
pub trait Notifier: Send + Sync {
    fn send<'a>(
        &'a self,
        settings: &'a NotificationSettings,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), ActionError>>;
}

/// Launches external commands by name.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<(), ActionError>>;
}

/// Hands messages to a sendmail-compatible program.
#[derive(Clone, Debug, Default)]
pub struct SendmailNotifier;

impl SendmailNotifier {
    pub fn new() -> Self {
        SendmailNotifier
    }

    async fn deliver(
        &self,
        settings: &NotificationSettings,
        message: &Message,
    ) -> Result<(), ActionError> {
        let program = settings.sendmail.clone();
        let mut child = Command::new(&program)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ActionError::Spawn {
                program: program.clone(),
                source,
            })?;

        let text = render_message(&settings.from, message);
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|source| ActionError::Io {
                    program: program.clone(),
                    source,
                })?;
            // Dropping stdin closes the pipe so sendmail sees end of message
        }

        let status = child.wait().await.map_err(|source| ActionError::Io {
            program: program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(ActionError::Exit { program, status });
        }

        Ok(())
    }
}

impl Notifier for SendmailNotifier {
    fn send<'a>(
        &'a self,
        settings: &'a NotificationSettings,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), ActionError>> {
        info!(
            from = %settings.from,
            to = ?message.recipients,
            subject = %message.subject,
            "Sending notification"
        );
        self.deliver(settings, message).boxed()
    }
}

/// Delivers notifications to the configured SMTP relay.
#[derive(Clone, Debug, Default)]
pub struct SmtpNotifier;

impl SmtpNotifier {
    pub fn new() -> Self {
        SmtpNotifier
    }

    async fn deliver(
        &self,
        settings: &NotificationSettings,
        message: &Message,
    ) -> Result<(), ActionError> {
        let host = settings.host.as_deref().ok_or(ActionError::NoSmtpHost)?;
        let email = compose(&settings.from, message)?;

        let builder = if settings.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let mut builder = builder.port(settings.port);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let response = builder.build().send(email).await?;
        debug!(code = %response.code(), "SMTP relay accepted message");

        Ok(())
    }
}

impl Notifier for SmtpNotifier {
    fn send<'a>(
        &'a self,
        settings: &'a NotificationSettings,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), ActionError>> {
        info!(
            host = ?settings.host,
            port = settings.port,
            from = %settings.from,
            to = ?message.recipients,
            subject = %message.subject,
            "Sending notification"
        );
        self.deliver(settings, message).boxed()
    }
}

/// Sends through [`SmtpNotifier`] when a relay host is configured and through
/// [`SendmailNotifier`] otherwise, deciding per message so a reload can
/// switch transports.
#[derive(Clone, Debug, Default)]
pub struct MailNotifier {
    smtp: SmtpNotifier,
    sendmail: SendmailNotifier,
}

impl MailNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Notifier for MailNotifier {
    fn send<'a>(
        &'a self,
        settings: &'a NotificationSettings,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), ActionError>> {
        if settings.uses_smtp() {
            self.smtp.send(settings, message)
        } else {
            self.sendmail.send(settings, message)
        }
    }
}

fn compose(from: &str, message: &Message) -> Result<lettre::Message, ActionError> {
    let mut builder = lettre::Message::builder()
        .from(mailbox(from)?)
        .subject(message.subject.as_str());
    for recipient in &message.recipients {
        builder = builder.to(mailbox(recipient)?);
    }

    Ok(builder
        .header(ContentType::TEXT_PLAIN)
        .body(message.body.clone())?)
}

fn mailbox(address: &str) -> Result<Mailbox, ActionError> {
    address.parse().map_err(|source| ActionError::Address {
        address: address.to_string(),
        source,
    })
}

fn render_message(from: &str, message: &Message) -> String {
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n{}\r\n",
        from,
        message.recipients.join(", "),
        message.subject,
        message.body.replace('\n', "\r\n"),
    )
}

/// Starts commands found in a fixed directory, without waiting for them.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    working_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        ProcessRunner {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn start(&self, command: &str) -> Result<(), ActionError> {
        let program = self.working_dir.join(command);
        info!(command = %program.display(), "Starting command");

        let mut child = Command::new(&program)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ActionError::Spawn {
                program: program.clone(),
                source,
            })?;

        debug!(command = %program.display(), pid = ?child.id(), "Command started");

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(command = %program.display(), "Command finished")
                }
                Ok(status) => warn!(command = %program.display(), %status, "Command failed"),
                Err(e) => warn!(command = %program.display(), error = %e, "Lost track of command"),
            }
        });

        Ok(())
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<(), ActionError>> {
        async move { self.start(command) }.boxed()
    }
}

/// Name used in notification bodies to identify this machine.
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
