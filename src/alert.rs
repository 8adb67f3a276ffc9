use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Key/value details attached to an alert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertContext {
    fields: BTreeMap<String, String>,
}

impl AlertContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for AlertContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Receives failure notifications.
///
/// Delivery is fire-and-forget: implementations never return errors and are
/// never retried by the caller.
pub trait AlertSink: Send + Sync {
    fn notify_failure(&self, reason: &str, context: &AlertContext);
}

/// Logs alerts and appends them to a local file.
///
/// Each alert becomes one line: `[YYYY-MM-DD HH:MM:SS] reason | key=value ...`.
/// A file that cannot be written is reported through the log and otherwise
/// ignored.
#[derive(Debug, Clone)]
pub struct LogAlertSink {
    log_path: PathBuf,
    recipient: Option<String>,
}

impl LogAlertSink {
    pub fn new(log_path: impl Into<PathBuf>, recipient: Option<String>) -> Self {
        Self {
            log_path: log_path.into(),
            recipient,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{line}")
    }
}

impl AlertSink for LogAlertSink {
    fn notify_failure(&self, reason: &str, context: &AlertContext) {
        let context = match &self.recipient {
            Some(recipient) => context.clone().with("recipient", recipient),
            None => context.clone(),
        };
        error!(reason, context = %context, "pipeline alert");

        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let line = if context.is_empty() {
            format!("[{stamp}] {reason}")
        } else {
            format!("[{stamp}] {reason} | {context}")
        };

        if let Err(e) = self.append(&line) {
            warn!(path = %self.log_path.display(), error = %e, "could not write alert log");
        }
    }
}
