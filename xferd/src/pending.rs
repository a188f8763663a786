use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use xferd_protocol::{FileResult, Notification};

/// Key under which a config-apply result waits for the next startup.
pub const PENDING_APPLY_KEY: &str = "ConfigResult";

/// Result of a config download that is reported after the device reboots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApply {
    pub service_id: String,
    pub async_key: String,
    pub model_name: String,
    pub result: FileResult,
    pub created_at: DateTime<Utc>,
}

impl PendingApply {
    pub fn into_notification(self) -> Notification {
        Notification {
            service_id: self.service_id,
            async_key: self.async_key,
            model_name: self.model_name,
            result: self.result,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingStore {
    dir: PathBuf,
}

impl PendingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", PENDING_APPLY_KEY))
    }

    /// Durably writes the record; it is visible only once fully synced.
    pub async fn save(&self, record: &PendingApply) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create pending directory: {:?}", self.dir))?;

        let record_file = self.record_path();
        let staging_file = self.dir.join(format!(".{}.json.tmp", PENDING_APPLY_KEY));

        let json_data = serde_json::to_string_pretty(record)
            .with_context(|| "Failed to serialize pending apply record")?;

        let mut file = fs::File::create(&staging_file)
            .await
            .with_context(|| format!("Failed to create pending record: {:?}", staging_file))?;
        file.write_all(json_data.as_bytes())
            .await
            .with_context(|| "Failed to write pending record")?;
        file.sync_all()
            .await
            .with_context(|| "Failed to sync pending record")?;

        fs::rename(&staging_file, &record_file)
            .await
            .with_context(|| format!("Failed to publish pending record: {:?}", record_file))?;
        sync_dir(&self.dir).await;

        debug!("Saved pending apply result for {}", record.async_key);
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<PendingApply>> {
        let record_file = self.record_path();

        let contents = match fs::read_to_string(&record_file).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read pending record: {:?}", record_file))
            }
        };

        let record: PendingApply = serde_json::from_str(&contents)
            .with_context(|| "Failed to deserialize pending apply record")?;

        info!("Found pending apply result for {}", record.async_key);
        Ok(Some(record))
    }

    pub async fn remove(&self) -> Result<()> {
        let record_file = self.record_path();

        match fs::remove_file(&record_file).await {
            Ok(()) => {
                info!("Deleted pending apply record {:?}", record_file);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to delete pending record: {:?}", record_file)),
        }
    }
}

async fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}
