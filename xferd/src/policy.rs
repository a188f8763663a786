use crate::error::XferResult;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Storage class of a configured path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesysKind {
    Ramdisk,
    Nvram,
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for FilesysKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FilesysKind::Ramdisk => "ramdisk",
            FilesysKind::Nvram => "nvram",
            FilesysKind::ReadOnly => "ro",
            FilesysKind::ReadWrite => "rw",
        };
        f.write_str(name)
    }
}

impl FromStr for FilesysKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ramdisk" => Ok(FilesysKind::Ramdisk),
            "nvram" => Ok(FilesysKind::Nvram),
            "ro" => Ok(FilesysKind::ReadOnly),
            "rw" => Ok(FilesysKind::ReadWrite),
            _ => Err(anyhow::anyhow!("Invalid filesystem type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesysInfoEntry {
    pub path_prefix: String,
    pub kind: Option<FilesysKind>,
    pub pre_action: Option<String>,
    pub post_action: Option<String>,
    pub temp_dir: Option<PathBuf>,
}

impl FilesysInfoEntry {
    pub fn new(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            kind: None,
            pre_action: None,
            post_action: None,
            temp_dir: None,
        }
    }

    pub fn with_kind(mut self, kind: FilesysKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_pre_action(mut self, command: impl Into<String>) -> Self {
        self.pre_action = Some(command.into());
        self
    }

    pub fn with_post_action(mut self, command: impl Into<String>) -> Self {
        self.post_action = Some(command.into());
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
}

/// On-disk shape of one entry in the policy file.
#[derive(Debug, Default, Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    kind: Option<String>,
    preaction: Option<String>,
    postaction: Option<String>,
    tmpdir: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Path-prefix keyed filesystem policies, immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    entries: BTreeMap<String, FilesysInfoEntry>,
}

impl PolicyTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = FilesysInfoEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (normalize_path(&entry.path_prefix), entry))
            .collect();
        Self { entries }
    }

    pub fn from_json(json: &str) -> XferResult<Self> {
        let raw: HashMap<String, RawEntry> = serde_json::from_str(json)?;

        let entries = raw.into_iter().map(|(prefix, raw)| {
            let kind = non_empty(raw.kind).and_then(|kind| match kind.parse() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!("Ignoring filesystem type for {}: {}", prefix, e);
                    None
                }
            });
            FilesysInfoEntry {
                path_prefix: prefix,
                kind,
                pre_action: non_empty(raw.preaction),
                post_action: non_empty(raw.postaction),
                temp_dir: non_empty(raw.tmpdir).map(PathBuf::from),
            }
        });

        Ok(Self::from_entries(entries))
    }

    /// Load the table; any failure leaves the table empty.
    pub async fn load(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Filesystem policy file {:?} not loaded: {}. No policies apply.", path, e);
                return Self::empty();
            }
        };

        match Self::from_json(&content) {
            Ok(table) => {
                info!("Loaded {} filesystem policies from {:?}", table.len(), path);
                table
            }
            Err(e) => {
                warn!("Filesystem policy file {:?} is malformed: {}. No policies apply.", path, e);
                Self::empty()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest configured prefix of `path`, found by truncating at `/`
    /// boundaries from the full path toward the root.
    pub fn resolve(&self, path: &str) -> Option<&FilesysInfoEntry> {
        let mut prefix = normalize_path(path);

        loop {
            let key = if prefix.is_empty() { "/" } else { prefix.as_str() };
            if let Some(entry) = self.entries.get(key) {
                debug!("Policy {:?} applies to {}", entry.path_prefix, path);
                return Some(entry);
            }

            match prefix.rfind('/') {
                Some(idx) => prefix.truncate(idx),
                None => return None,
            }
        }
    }
}

/// Collapse repeated separators and drop a trailing one; the root stays `/`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && normalized.ends_with('/') {
            continue;
        }
        normalized.push(c);
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}
