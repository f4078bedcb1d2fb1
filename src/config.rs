//! Scan configuration: profiles, the notification transport, and the
//! provider that loads and validates them.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Chunk size used when the configuration leaves it out or sets it to zero.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// SMTP port used when the configuration leaves it out or sets it to zero.
pub const DEFAULT_SMTP_PORT: u16 = 25;

/// What to do when a profile's trigger string is seen.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Action {
    pub send_notification: bool,
    pub run_command: bool,
    /// File name of the command to run, relative to the command directory.
    pub command: String,
}

/// Who gets notified, and under which subject.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct NotificationTarget {
    pub subject: String,
    pub recipients: Vec<String>,
}

/// Binds a directory, a file-name pattern and a trigger string to an action.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Profile {
    /// Matched case-insensitively as a substring of a log file's base name.
    pub file_name_pattern: String,
    pub log_directory: PathBuf,
    /// Matched case-insensitively as a substring of the file's content.
    pub trigger: String,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub notification: NotificationTarget,
}

impl Profile {
    /// Returns `true` if `file_name` contains this profile's pattern,
    /// ignoring case.
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        contains_ignore_case(file_name, &self.file_name_pattern)
    }
}

/// Transport settings shared by every notifying profile.
///
/// Mail goes to the SMTP relay at `host` when one is set, and to the
/// `sendmail` program otherwise.
#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct NotificationSettings {
    /// Sender address.
    pub from: String,
    pub host: Option<String>,
    pub port: u16,
    /// Upgrade the SMTP connection with STARTTLS.
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Path to a sendmail-compatible program.
    pub sendmail: PathBuf,
}

impl NotificationSettings {
    pub fn uses_smtp(&self) -> bool {
        self.host.is_some()
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        NotificationSettings {
            from: String::new(),
            host: None,
            port: DEFAULT_SMTP_PORT,
            tls: false,
            username: None,
            password: None,
            sendmail: PathBuf::from("sendmail"),
        }
    }
}

impl fmt::Debug for NotificationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSettings")
            .field("from", &self.from)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("sendmail", &self.sendmail)
            .finish()
    }
}

/// A complete, validated configuration generation.
///
/// A `ScanConfig` is never mutated once handed to the engine; a reload
/// replaces it as a whole.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ScanConfig {
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub notification: NotificationSettings,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("No profiles configured")]
    NoProfiles,
    #[error("Profile {index} is missing a {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("Profile for {pattern} does not have an action configured")]
    NoAction { pattern: String },
    #[error("Profile for {pattern} sends notifications but no sender address is configured")]
    MissingSender { pattern: String },
    #[error("SMTP host is empty")]
    EmptySmtpHost,
    #[error("SMTP username and password must be set together")]
    PartialCredentials,
}

impl ScanConfig {
    /// Parses a TOML document without validating it.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Checks every profile for the fields its actions need and normalizes
    /// the chunk size.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfiles);
        }

        for (index, profile) in self.profiles.iter().enumerate() {
            let missing = |field| ConfigError::MissingField { index, field };

            if profile.file_name_pattern.is_empty() {
                return Err(missing("file_name_pattern"));
            }
            if profile.log_directory.as_os_str().is_empty() {
                return Err(missing("log_directory"));
            }
            if profile.trigger.is_empty() {
                return Err(missing("trigger"));
            }

            let action = &profile.action;
            if !action.send_notification && !action.run_command {
                return Err(ConfigError::NoAction {
                    pattern: profile.file_name_pattern.clone(),
                });
            }
            if action.send_notification {
                if profile.notification.subject.is_empty() {
                    return Err(missing("notification subject"));
                }
                if profile.notification.recipients.is_empty() {
                    return Err(missing("notification recipient"));
                }
                if self.notification.from.is_empty() {
                    return Err(ConfigError::MissingSender {
                        pattern: profile.file_name_pattern.clone(),
                    });
                }
            }
            if action.run_command && action.command.is_empty() {
                return Err(missing("command"));
            }
        }

        self.validate_transport()?;

        if self.chunk_size == 0 {
            warn!(
                default = DEFAULT_CHUNK_SIZE,
                "No usable chunk size configured, using default"
            );
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }

        self.log_summary();

        Ok(self)
    }

    fn validate_transport(&mut self) -> Result<(), ConfigError> {
        let smtp = &mut self.notification;

        if smtp.host.as_deref().map_or(false, |host| host.trim().is_empty()) {
            return Err(ConfigError::EmptySmtpHost);
        }
        if smtp.username.is_some() != smtp.password.is_some() {
            return Err(ConfigError::PartialCredentials);
        }
        if smtp.port == 0 {
            warn!(default = DEFAULT_SMTP_PORT, "No SMTP port configured, using default");
            smtp.port = DEFAULT_SMTP_PORT;
        }

        Ok(())
    }

    /// Unique log directories across all profiles, compared case-insensitively,
    /// in configuration order.
    pub fn log_directories(&self) -> Vec<PathBuf> {
        let mut seen = Vec::<String>::new();
        let mut dirs = Vec::new();

        for profile in &self.profiles {
            let key = profile.log_directory.to_string_lossy().to_lowercase();
            if !seen.contains(&key) {
                seen.push(key);
                dirs.push(profile.log_directory.clone());
            }
        }

        dirs
    }

    fn log_summary(&self) {
        for (index, p) in self.profiles.iter().enumerate() {
            debug!(
                profile = index + 1,
                pattern = %p.file_name_pattern,
                directory = %p.log_directory.display(),
                trigger = %p.trigger,
                notify = p.action.send_notification,
                run_command = p.action.run_command,
                command = %p.action.command,
                subject = %p.notification.subject,
                recipients = ?p.notification.recipients,
                "Validated profile"
            );
        }
        let mail = &self.notification;
        debug!(
            from = %mail.from,
            host = ?mail.host,
            port = mail.port,
            tls = mail.tls,
            username = ?mail.username,
            sendmail = %mail.sendmail.display(),
            chunk_size = self.chunk_size,
            "Validated global settings"
        );
    }
}

/// Supplies validated configuration generations to the engine.
pub trait ConfigSource: Send + Sync {
    /// Loads and validates the current configuration.
    fn load_validated(&self) -> Result<ScanConfig, ConfigError>;

    /// File to watch for configuration changes, if there is one.
    fn watch_path(&self) -> Option<&Path> {
        None
    }
}

/// A TOML configuration file on disk.
#[derive(Clone, Debug)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for ConfigFile {
    fn load_validated(&self) -> Result<ScanConfig, ConfigError> {
        debug!(path = %self.path.display(), "Reading configuration");

        let text = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;

        ScanConfig::from_toml(&text)?.validate()
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        chunk_size = 1024

        [notification]
        from = "scanner@example.com"

        [[profiles]]
        file_name_pattern = "app"
        log_directory = "/var/log/app"
        trigger = "FATAL"

        [profiles.action]
        send_notification = true
        run_command = true
        command = "restart.sh"

        [profiles.notification]
        subject = "FATAL seen"
        recipients = ["ops@example.com"]

        [[profiles]]
        file_name_pattern = "db"
        log_directory = "/VAR/LOG/APP"
        trigger = "deadlock"

        [profiles.action]
        run_command = true
        command = "dump.sh"
    "#;

    #[test]
    fn test_parse_and_validate() {
        let config = ScanConfig::from_toml(VALID).unwrap().validate().unwrap();

        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.profiles[0].action.command, "restart.sh");
        assert_eq!(
            config.profiles[0].notification.recipients,
            vec!["ops@example.com".to_string()]
        );
        assert_eq!(config.notification.sendmail, PathBuf::from("sendmail"));
        assert!(!config.profiles[1].action.send_notification);
    }

    #[test]
    fn test_unique_directories_ignore_case() {
        let config = ScanConfig::from_toml(VALID).unwrap();

        assert_eq!(config.log_directories(), vec![PathBuf::from("/var/log/app")]);
    }

    #[test]
    fn test_chunk_size_defaults() {
        let text = VALID.replace("chunk_size = 1024", "");
        let config = ScanConfig::from_toml(&text).unwrap().validate().unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);

        let text = VALID.replace("chunk_size = 1024", "chunk_size = 0");
        let config = ScanConfig::from_toml(&text).unwrap().validate().unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_no_profiles() {
        let config = ScanConfig::from_toml("chunk_size = 10").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoProfiles)));
    }

    #[test]
    fn test_profile_without_action() {
        let text = r#"
            [[profiles]]
            file_name_pattern = "app"
            log_directory = "/var/log"
            trigger = "x"
        "#;
        let config = ScanConfig::from_toml(text).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoAction { .. })));
    }

    #[test]
    fn test_notification_requirements() {
        let no_sender = VALID.replace("from = \"scanner@example.com\"", "");
        let config = ScanConfig::from_toml(&no_sender).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingSender { .. })
        ));

        let no_recipients = VALID.replace("recipients = [\"ops@example.com\"]", "");
        let config = ScanConfig::from_toml(&no_recipients).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField {
                index: 0,
                field: "notification recipient"
            })
        ));
    }

    #[test]
    fn test_command_requires_name() {
        let text = VALID.replace("command = \"dump.sh\"", "");
        let config = ScanConfig::from_toml(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField {
                index: 1,
                field: "command"
            })
        ));
    }

    #[test]
    fn test_config_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linetrip.toml");
        fs::write(&path, VALID).unwrap();

        let source = ConfigFile::new(&path);
        assert_eq!(source.watch_path(), Some(path.as_path()));
        assert_eq!(source.load_validated().unwrap().profiles.len(), 2);

        let missing = ConfigFile::new(dir.path().join("missing.toml"));
        assert!(matches!(
            missing.load_validated(),
            Err(ConfigError::Read { .. })
        ));

        fs::write(&path, "profiles = 3").unwrap();
        assert!(matches!(source.load_validated(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_smtp_settings() {
        let text = VALID.replace(
            "from = \"scanner@example.com\"",
            r#"from = "scanner@example.com"
            host = "smtp.example.com"
            port = 587
            tls = true
            username = "scanner"
            password = "secret""#,
        );
        let config = ScanConfig::from_toml(&text).unwrap().validate().unwrap();
        let mail = &config.notification;

        assert!(mail.uses_smtp());
        assert_eq!(mail.host.as_deref(), Some("smtp.example.com"));
        assert_eq!(mail.port, 587);
        assert!(mail.tls);
        assert_eq!(mail.username.as_deref(), Some("scanner"));
        assert!(!format!("{:?}", mail).contains("secret"));

        let plain = ScanConfig::from_toml(VALID).unwrap().validate().unwrap();
        assert!(!plain.notification.uses_smtp());
        assert_eq!(plain.notification.port, DEFAULT_SMTP_PORT);
    }

    #[test]
    fn test_smtp_validation() {
        let with = |extra: &str| {
            let text = VALID.replace(
                "from = \"scanner@example.com\"",
                &format!("from = \"scanner@example.com\"\n{}", extra),
            );
            ScanConfig::from_toml(&text).unwrap().validate()
        };

        assert!(matches!(
            with("host = \"  \""),
            Err(ConfigError::EmptySmtpHost)
        ));
        assert!(matches!(
            with("host = \"smtp.example.com\"\nusername = \"scanner\""),
            Err(ConfigError::PartialCredentials)
        ));

        let config = with("host = \"smtp.example.com\"\nport = 0").unwrap();
        assert_eq!(config.notification.port, DEFAULT_SMTP_PORT);
    }

    #[test]
    fn test_pattern_matching() {
        let config = ScanConfig::from_toml(VALID).unwrap();
        assert!(config.profiles[0].matches_file_name("MyApp-2024.log"));
        assert!(!config.profiles[0].matches_file_name("db.log"));
    }
}
