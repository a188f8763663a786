use crate::error::{ToXferError, XferError, XferResult};
use std::ffi::CString;
use std::io;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

pub const MAX_GENERATIONS: i32 = 128;
pub const READ_BUFFER_SIZE: usize = 4096;

const SYSLOG_FORMAT: &[u8] = b"%s\0";

/// One rotated generation of the log and where its unread part begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlogFileInfo {
    pub file_name: PathBuf,
    pub size_bytes: u64,
    /// Offset just past the last marker line; 0 means the whole file.
    pub resume_position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectSummary {
    /// Generations that were packed, oldest first.
    pub files: Vec<SlogFileInfo>,
    pub bytes_written: u64,
}

/// `base`, `base.0`, `base.1`, ... for `generation_count` names in total.
pub fn candidate_names(base: &Path, generation_count: usize) -> Vec<PathBuf> {
    (0..generation_count)
        .map(|idx| {
            if idx == 0 {
                base.to_path_buf()
            } else {
                let mut name = base.as_os_str().to_owned();
                name.push(format!(".{}", idx - 1));
                PathBuf::from(name)
            }
        })
        .collect()
}

/// Packs everything logged since the last marker into `output`.
pub async fn collect(
    base: &Path,
    generation_count: i32,
    marker: &str,
    output: &Path,
) -> XferResult<CollectSummary> {
    if !(1..=MAX_GENERATIONS).contains(&generation_count) {
        return Err(XferError::invalid_argument(
            "maxLogs",
            format!("{} is outside 1..={}", generation_count, MAX_GENERATIONS),
        ));
    }
    if marker.is_empty() {
        return Err(XferError::invalid_argument("marker", "must not be empty"));
    }

    let mut files = Vec::new();
    for name in candidate_names(base, generation_count as usize) {
        match scan_for_marker(&name, marker).await {
            Ok((size_bytes, marker_end)) => {
                debug!("{:?}: {} bytes, marker end {:?}", name, size_bytes, marker_end);
                files.push(SlogFileInfo {
                    file_name: name,
                    size_bytes,
                    resume_position: marker_end.unwrap_or(0),
                });
                if marker_end.is_some() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{:?} does not exist, skipping", name);
            }
            Err(e) => return Err(e).at_path(&name),
        }
    }

    if files.is_empty() {
        return Err(XferError::Filesystem {
            path: base.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "no log generation exists"),
        });
    }

    files.reverse();
    let bytes_written = pack(&files, output).await?;

    info!(
        "Packed {} bytes from {} log generation(s) into {:?}",
        bytes_written,
        files.len(),
        output
    );
    Ok(CollectSummary { files, bytes_written })
}

/// Returns the file size and the offset after the last line holding `marker`.
async fn scan_for_marker(path: &Path, marker: &str) -> io::Result<(u64, Option<u64>)> {
    let file = File::open(path).await?;
    let size_bytes = file.metadata().await?.len();
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

    let needle = marker.as_bytes();
    let mut line = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut offset = 0u64;
    let mut marker_end = None;
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            break;
        }
        offset += read as u64;
        if line.windows(needle.len()).any(|window| window == needle) {
            marker_end = Some(offset);
        }
    }

    Ok((size_bytes, marker_end))
}

async fn pack(files: &[SlogFileInfo], output: &Path) -> XferResult<u64> {
    let mut out = match File::create(output).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).await.at_path(parent)?;
            }
            File::create(output).await.at_path(output)?
        }
        Err(e) => return Err(e).at_path(output),
    };

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    for info in files {
        let mut file = match File::open(&info.file_name).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{:?} vanished before packing, skipping", info.file_name);
                continue;
            }
            Err(e) => return Err(e).at_path(&info.file_name),
        };
        file.seek(SeekFrom::Start(info.resume_position))
            .await
            .at_path(&info.file_name)?;

        loop {
            let read = file.read(&mut buffer).await.at_path(&info.file_name)?;
            if read == 0 {
                break;
            }
            out.write_all(&buffer[..read]).await.at_path(output)?;
            total += read as u64;
        }
    }

    out.flush().await.at_path(output)?;
    out.sync_all().await.at_path(output)?;
    Ok(total)
}

/// Records the resume marker once a collected bundle has been uploaded.
pub trait MarkerWriter: Send + Sync {
    fn write_marker(&self, ident: &str, marker: &str) -> XferResult<()>;
}

/// Writes the marker to the system log as `LOG_USER | LOG_NOTICE`.
#[derive(Debug, Clone, Default)]
pub struct SyslogMarkerWriter;

impl MarkerWriter for SyslogMarkerWriter {
    fn write_marker(&self, ident: &str, marker: &str) -> XferResult<()> {
        let ident = CString::new(ident)
            .map_err(|_| XferError::invalid_argument("ident", "contains a NUL byte"))?;
        let message = CString::new(marker)
            .map_err(|_| XferError::invalid_argument("marker", "contains a NUL byte"))?;

        // SAFETY: both strings outlive the openlog/closelog pair and the
        // format string consumes exactly one C string argument.
        unsafe {
            libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_USER);
            libc::syslog(
                libc::LOG_USER | libc::LOG_NOTICE,
                SYSLOG_FORMAT.as_ptr().cast::<libc::c_char>(),
                message.as_ptr(),
            );
            libc::closelog();
        }
        Ok(())
    }
}

/// Appends the marker line directly to a log file.
#[derive(Debug, Clone)]
pub struct FileMarkerWriter {
    path: PathBuf,
}

impl FileMarkerWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MarkerWriter for FileMarkerWriter {
    fn write_marker(&self, ident: &str, marker: &str) -> XferResult<()> {
        use std::io::Write;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .at_path(&self.path)?;
        writeln!(file, "{}: {}", ident, marker).at_path(&self.path)
    }
}
