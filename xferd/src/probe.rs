use crate::config::StorageConfig;
use crate::error::{XferError, XferResult};
use nix::errno::Errno;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writability {
    ReadOnly,
    Writable,
}

/// Storage classification used by the mover to pick a write strategy.
pub trait FsProbe: Send + Sync {
    fn classify_writability(&self, path: &Path) -> XferResult<Writability>;
    fn is_union(&self, path: &Path) -> bool;
}

/// Probes the real filesystem; union layout comes from static configuration.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    union_prefixes: Vec<PathBuf>,
    union_exclusions: Vec<PathBuf>,
}

impl SystemProbe {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            union_prefixes: storage.union_prefixes.clone(),
            union_exclusions: storage.union_exclusions.clone(),
        }
    }
}

impl FsProbe for SystemProbe {
    fn classify_writability(&self, path: &Path) -> XferResult<Writability> {
        let dir = parent_dir(path);
        let marker = dir.join(format!(".xferd-writable-{}", Uuid::new_v4().simple()));

        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {
                if let Err(e) = std::fs::remove_file(&marker) {
                    debug!("Failed to remove writability marker {:?}: {}", marker, e);
                }
                Ok(Writability::Writable)
            }
            Err(e) if is_read_only(&e) => {
                debug!("{:?} is on a read-only filesystem", dir);
                Ok(Writability::ReadOnly)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => match std::fs::create_dir_all(dir) {
                Ok(()) => Ok(Writability::Writable),
                Err(e) if is_read_only(&e) => Ok(Writability::ReadOnly),
                Err(source) => Err(XferError::Filesystem {
                    path: dir.to_path_buf(),
                    source,
                }),
            },
            Err(source) => Err(XferError::Filesystem {
                path: marker,
                source,
            }),
        }
    }

    fn is_union(&self, path: &Path) -> bool {
        self.union_prefixes.iter().any(|prefix| path.starts_with(prefix))
            && !self.union_exclusions.iter().any(|excluded| path.starts_with(excluded))
    }
}

pub fn is_read_only(err: &io::Error) -> bool {
    err.raw_os_error().map(Errno::from_i32) == Some(Errno::EROFS)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
