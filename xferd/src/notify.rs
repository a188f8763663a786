use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use xferd_protocol::Notification;

/// Hands job results to whatever delivers them to the server.
pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<()>;
}

/// Appends each notification as one JSON line to an outbox file.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    path: PathBuf,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Notifier for OutboxNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        let mut line = serde_json::to_vec(notification).context("Failed to encode notification")?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open outbox: {:?}", self.path))?;
        file.write_all(&line)
            .with_context(|| format!("Failed to append to outbox: {:?}", self.path))?;

        info!(
            "Notified {} key={} success={} code={} ({})",
            notification.service_id,
            notification.async_key,
            notification.result.success,
            notification.result.code,
            notification.result.message
        );
        Ok(())
    }
}
