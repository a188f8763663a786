use crate::error::{ToXferError, XferResult};
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Line-based list of paths that the union layer must persist.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> XferResult<Vec<u8>> {
        match fs::read(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).at_path(&self.path),
        }
    }

    pub async fn entries(&self) -> XferResult<Vec<String>> {
        let content = self.read().await?;
        Ok(lines(&content)
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect())
    }

    pub async fn contains(&self, entry: &str) -> XferResult<bool> {
        let content = self.read().await?;
        let found = lines(&content).any(|line| line == entry.as_bytes());
        Ok(found)
    }

    /// Appends `entry` unless an identical line exists. Returns whether a
    /// line was added.
    pub async fn ensure_entry(&self, entry: &str) -> XferResult<bool> {
        let content = self.read().await?;
        if lines(&content).any(|line| line == entry.as_bytes()) {
            debug!("{} already listed in {:?}", entry, self.path);
            return Ok(false);
        }

        let mut record = Vec::with_capacity(entry.len() + 2);
        if content.last().is_some_and(|last| *last != b'\n') {
            record.push(b'\n');
        }
        record.extend_from_slice(entry.as_bytes());
        record.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .at_path(&self.path)?;
        file.write_all(&record).await.at_path(&self.path)?;
        file.sync_all().await.at_path(&self.path)?;

        info!("Registered {} in {:?}", entry, self.path);
        Ok(true)
    }
}

fn lines(content: &[u8]) -> impl Iterator<Item = &[u8]> {
    content
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}
