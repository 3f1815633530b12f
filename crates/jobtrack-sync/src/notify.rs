//! Best-effort notification channels.
//!
//! Every channel gets exactly one attempt per run. Failures are logged and
//! reported back to the caller, never propagated: the summary artifact on disk
//! remains the durable record and the next run is the retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(20);
const NOTIFICATION_TITLE: &str = "Jobs tracker";

/// What a run wants to tell the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    /// Single-line counts, for channels with little room.
    pub headline: String,
    /// Full summary text.
    pub body: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Exit { program: String, status: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("building email: {0}")]
    Message(String),
    #[error("smtp: {0}")]
    Smtp(String),
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub channel: &'static str,
    pub outcome: DeliveryOutcome,
}

/// Fans a notification out to every configured channel independently.
#[derive(Default)]
pub struct NotificationDispatcher {
    channels: Vec<Box<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: impl NotificationChannel + 'static) -> Self {
        self.channels.push(Box::new(channel));
        self
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub async fn dispatch(&self, notification: &Notification) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let outcome = match channel.deliver(notification).await {
                Ok(()) => {
                    info!(channel = channel.name(), "notification delivered");
                    DeliveryOutcome::Delivered
                }
                Err(err) => {
                    warn!(channel = channel.name(), error = %err, "notification delivery failed");
                    DeliveryOutcome::Failed(err.to_string())
                }
            };
            reports.push(DeliveryReport {
                channel: channel.name(),
                outcome,
            });
        }
        reports
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalFlavor {
    Termux,
    NotifySend,
}

/// Desktop/phone notification through whichever notifier binary is on `PATH`.
#[derive(Debug, Clone)]
pub struct LocalNotifier {
    program: PathBuf,
    flavor: LocalFlavor,
}

impl LocalNotifier {
    /// `termux-notification` first, then `notify-send`; `None` when neither is installed.
    pub fn detect() -> Option<Self> {
        let path = std::env::var_os("PATH")?;
        let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
        Self::detect_in(dirs.into_iter())
    }

    fn detect_in(dirs: impl Iterator<Item = PathBuf> + Clone) -> Option<Self> {
        [
            ("termux-notification", LocalFlavor::Termux),
            ("notify-send", LocalFlavor::NotifySend),
        ]
        .into_iter()
        .find_map(|(binary, flavor)| {
            dirs.clone()
                .map(|dir| dir.join(binary))
                .find(|candidate| candidate.is_file())
                .map(|program| Self { program, flavor })
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, notification: &Notification) -> Command {
        let mut cmd = Command::new(&self.program);
        match self.flavor {
            LocalFlavor::Termux => {
                cmd.args(["--title", NOTIFICATION_TITLE])
                    .args(["--content", notification.headline.as_str()])
                    .args(["--priority", "high"]);
            }
            LocalFlavor::NotifySend => {
                cmd.arg(NOTIFICATION_TITLE).arg(&notification.headline);
            }
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl NotificationChannel for LocalNotifier {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let program = self.program.display().to_string();
        let mut cmd = self.command(notification);
        let status = tokio::time::timeout(DELIVERY_TIMEOUT, cmd.status())
            .await
            .map_err(|_| NotifyError::Timeout(DELIVERY_TIMEOUT))?
            .map_err(|source| NotifyError::Spawn {
                program: program.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(NotifyError::Exit {
                program,
                status: status.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub to: String,
    pub from: String,
    pub starttls: bool,
}

impl EmailConfig {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `None` unless host, user, password and recipient are all set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let host = get("JOBTRACK_SMTP_HOST")?;
        let user = get("JOBTRACK_SMTP_USER")?;
        let password = get("JOBTRACK_SMTP_PASS")?;
        let to = get("JOBTRACK_SMTP_TO")?;
        Some(Self {
            port: get("JOBTRACK_SMTP_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(587),
            from: get("JOBTRACK_SMTP_FROM").unwrap_or_else(|| user.clone()),
            starttls: get("JOBTRACK_SMTP_TLS").map(|v| v != "0").unwrap_or(true),
            host,
            user,
            password,
            to,
        })
    }
}

/// Summary mail over authenticated SMTP.
#[derive(Debug, Clone)]
pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NotificationChannel for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        use lettre::message::{header::ContentType, Mailbox};
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

        let from: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|e| NotifyError::Message(format!("invalid from: {e}")))?;
        let to: Mailbox = self
            .config
            .to
            .parse()
            .map_err(|e| NotifyError::Message(format!("invalid to: {e}")))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| NotifyError::Message(e.to_string()))?;

        let builder = if self.config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
                .map_err(|e| NotifyError::Smtp(format!("relay: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
        };
        let mailer = builder
            .port(self.config.port)
            .credentials(Credentials::new(
                self.config.user.clone(),
                self.config.password.clone(),
            ))
            .timeout(Some(DELIVERY_TIMEOUT))
            .build();

        mailer
            .send(email)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;
        Ok(())
    }
}
