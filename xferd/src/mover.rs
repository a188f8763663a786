use crate::config::StorageConfig;
use crate::error::{XferError, XferResult};
use crate::manifest::Manifest;
use crate::probe::{FsProbe, Writability};
use crate::shell::Shell;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const COPY_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveStrategy {
    /// Destination is on a read-only mount: remount, copy, remount back.
    Remount,
    /// Destination is on a union mount: copy, register, apply.
    Union,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveReport {
    pub strategy: MoveStrategy,
    pub bytes: u64,
    pub manifest_appended: bool,
}

/// Lands a completed temporary file at its final destination.
pub struct FileMover {
    probe: Arc<dyn FsProbe>,
    shell: Arc<dyn Shell>,
    manifest: Manifest,
    remount_rw_command: String,
    remount_ro_command: String,
    apply_command: String,
}

impl FileMover {
    pub fn new(storage: &StorageConfig, probe: Arc<dyn FsProbe>, shell: Arc<dyn Shell>) -> Self {
        Self {
            probe,
            shell,
            manifest: Manifest::new(&storage.manifest_path),
            remount_rw_command: storage.remount_rw_command.clone(),
            remount_ro_command: storage.remount_ro_command.clone(),
            apply_command: storage.apply_command.clone(),
        }
    }

    pub fn strategy_for(&self, destination: &Path) -> XferResult<MoveStrategy> {
        if self.probe.classify_writability(destination)? == Writability::ReadOnly {
            Ok(MoveStrategy::Remount)
        } else if self.probe.is_union(destination) {
            Ok(MoveStrategy::Union)
        } else {
            Ok(MoveStrategy::Plain)
        }
    }

    /// Moves `temp` to `destination`. `temp` is removed whatever the outcome.
    pub async fn move_file(&self, temp: &Path, destination: &Path) -> XferResult<MoveReport> {
        let result = self.land(temp, destination).await;

        match fs::remove_file(temp).await {
            Ok(()) => debug!("Removed temporary file {:?}", temp),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temporary file {:?}: {}", temp, e),
        }

        result
    }

    async fn land(&self, temp: &Path, destination: &Path) -> XferResult<MoveReport> {
        let strategy = self.strategy_for(destination)?;
        info!("Moving {:?} to {:?} ({:?})", temp, destination, strategy);

        match strategy {
            MoveStrategy::Remount => {
                self.shell.run(&self.remount_rw_command)?;
                let copied = copy_landing(temp, destination).await;
                if let Err(e) = self.shell.run(&self.remount_ro_command) {
                    warn!(
                        "Failed to restore read-only mount after writing {:?}: {}",
                        destination, e
                    );
                }
                Ok(MoveReport {
                    strategy,
                    bytes: copied?,
                    manifest_appended: false,
                })
            }
            MoveStrategy::Union => {
                let bytes = copy_landing(temp, destination).await?;
                let manifest_appended = self
                    .manifest
                    .ensure_entry(&destination.to_string_lossy())
                    .await?;
                self.shell.run(&self.apply_command)?;
                Ok(MoveReport {
                    strategy,
                    bytes,
                    manifest_appended,
                })
            }
            MoveStrategy::Plain => Ok(MoveReport {
                strategy,
                bytes: copy_landing(temp, destination).await?,
                manifest_appended: false,
            }),
        }
    }
}

async fn copy_landing(temp: &Path, destination: &Path) -> XferResult<u64> {
    copy_file(temp, destination)
        .await
        .map_err(|source| XferError::MoveFailed {
            from: temp.to_path_buf(),
            to: destination.to_path_buf(),
            source,
        })
}

/// Streamed byte copy; creates the destination directory and retries once
/// when it does not exist.
pub async fn copy_file(source: &Path, destination: &Path) -> io::Result<u64> {
    let start_time = Instant::now();
    let mut source_file = File::open(source).await?;

    let mut dest_file = match File::create(destination).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).await?;
            }
            File::create(destination).await?
        }
        Err(e) => return Err(e),
    };

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total_bytes = 0u64;
    loop {
        let bytes_read = source_file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        dest_file.write_all(&buffer[..bytes_read]).await?;
        total_bytes += bytes_read as u64;
    }

    dest_file.flush().await?;
    dest_file.sync_all().await?;

    debug!(
        "Copied {} bytes from {:?} to {:?} in {:.3}s",
        total_bytes,
        source,
        destination,
        start_time.elapsed().as_secs_f64()
    );
    Ok(total_bytes)
}
