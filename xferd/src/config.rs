use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: PathBuf,
    pub app_id: String,
    pub filesystem_config: PathBuf,
    pub scratch_dir: PathBuf,
    pub pending_dir: PathBuf,
    pub outbox_path: PathBuf,
    pub poll_interval_ms: u64,
    pub max_redirects: u32,
    pub recent_results: usize,
    pub storage: StorageConfig,
    pub device: DeviceConfig,
    pub syslog: SyslogConfig,
}

/// How destination areas are classified and made durable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub union_prefixes: Vec<PathBuf>,
    pub union_exclusions: Vec<PathBuf>,
    pub manifest_path: PathBuf,
    pub remount_rw_command: String,
    pub remount_ro_command: String,
    pub apply_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub config_file: PathBuf,
    pub reboot_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyslogConfig {
    pub log_path: PathBuf,
    pub packed_path: PathBuf,
    pub marker: String,
    pub max_generations: i32,
    /// Append the resume marker to this file instead of the system log.
    pub marker_sink: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/xferd/xferd.sock"),
            app_id: "xferd".to_string(),
            filesystem_config: PathBuf::from("/etc/xferd/filesystem.conf"),
            scratch_dir: PathBuf::from("/tmp"),
            pending_dir: PathBuf::from("/var/lib/xferd/pending"),
            outbox_path: PathBuf::from("/var/lib/xferd/notifications.jsonl"),
            poll_interval_ms: 20,
            max_redirects: 5,
            recent_results: 64,
            storage: StorageConfig::default(),
            device: DeviceConfig::default(),
            syslog: SyslogConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            union_prefixes: ["/etc", "/var", "/media", "/tmp"].iter().map(PathBuf::from).collect(),
            union_exclusions: vec![PathBuf::from("/var/log")],
            manifest_path: PathBuf::from("/etc/config.list"),
            remount_rw_command: "mount -o remount,rw /".to_string(),
            remount_ro_command: "mount -o remount,ro /".to_string(),
            apply_command: "config save".to_string(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("/etc/config.xml"),
            reboot_command: "reboot".to_string(),
        }
    }
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("/var/log/messages"),
            packed_path: PathBuf::from("/tmp/logtemp"),
            marker: "SERVICESYNC_PKG_FILE_SYSLOGMARKER".to_string(),
            max_generations: crate::syslog::MAX_GENERATIONS,
            marker_sink: None,
        }
    }
}

impl Config {
    pub async fn load() -> Result<Self> {
        let config_path = std::env::var("XFERD_CONFIG_PATH")
            .unwrap_or_else(|_| "/etc/xferd/config.toml".to_string());

        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("Failed to parse configuration at {}", config_path)),
            Err(_) => {
                // If config file doesn't exist or fails to load, use defaults
                warn!("Configuration file not found at {}. Using default settings.", config_path);
                Ok(Config::default())
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() {
            anyhow::bail!("app_id must not be empty");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }
        if !(1..=crate::syslog::MAX_GENERATIONS).contains(&self.syslog.max_generations) {
            anyhow::bail!(
                "syslog.max_generations must be within 1..={}",
                crate::syslog::MAX_GENERATIONS
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub async fn ensure_directories(&self) -> Result<()> {
        let dirs = [
            self.socket_path.parent(),
            Some(self.pending_dir.as_path()),
            self.outbox_path.parent(),
        ];
        for dir in dirs
            .into_iter()
            .flatten()
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            create_dir(dir).await?;
        }
        Ok(())
    }
}

async fn create_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory: {:?}", dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_device_layout() {
        let config = Config::default();
        assert_eq!(config.storage.manifest_path, PathBuf::from("/etc/config.list"));
        assert_eq!(config.device.config_file, PathBuf::from("/etc/config.xml"));
        assert_eq!(config.syslog.max_generations, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            app_id = "device-agent"
            max_redirects = 2

            [storage]
            union_exclusions = ["/var/log", "/var/run"]
            "#,
        )
        .unwrap();
        assert_eq!(config.app_id, "device-agent");
        assert_eq!(config.max_redirects, 2);
        assert_eq!(config.storage.union_exclusions.len(), 2);
        assert_eq!(config.storage.apply_command, "config save");
        assert_eq!(config.scratch_dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_rejects_out_of_range_generations() {
        let err = Config::from_toml("[syslog]\nmax_generations = 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("max_generations"));
    }

    #[tokio::test]
    async fn test_ensure_directories() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            socket_path: temp_dir.path().join("run/xferd.sock"),
            pending_dir: temp_dir.path().join("lib/pending"),
            outbox_path: temp_dir.path().join("lib/outbox.jsonl"),
            ..Config::default()
        };
        config.ensure_directories().await.unwrap();
        assert!(temp_dir.path().join("run").is_dir());
        assert!(temp_dir.path().join("lib/pending").is_dir());
    }
}
