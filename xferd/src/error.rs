use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use xferd_protocol::ResultKind;

/// Error types for xferd operations
#[derive(Error, Debug)]
pub enum XferError {
    #[error("Invalid argument: {field} - {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Download from {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Upload to {url} failed: {reason}")]
    UploadFailed { url: String, reason: String },

    #[error("Redirect limit of {limit} exceeded")]
    TooManyRedirects { limit: u32 },

    #[error("Failed to move {from:?} to {to:?}: {source}")]
    MoveFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Filesystem error on path {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl XferError {
    /// The stable result kind reported to the notification boundary.
    pub fn kind(&self) -> ResultKind {
        match self {
            XferError::InvalidArgument { .. } => ResultKind::InvalidArgument,
            XferError::InvalidConfiguration { .. } | XferError::Json(_) => {
                ResultKind::InvalidConfiguration
            }
            XferError::CommandFailed { .. } => ResultKind::ExecuteCommandFailure,
            XferError::DownloadFailed { .. } => ResultKind::DownloadFailure,
            XferError::UploadFailed { .. } => ResultKind::UploadFailure,
            XferError::TooManyRedirects { .. } => ResultKind::TooManyRedirects,
            XferError::MoveFailed { source, .. } => {
                io_result_kind(source).unwrap_or(ResultKind::RenameFailure)
            }
            XferError::Filesystem { source, .. } | XferError::Io(source) => {
                io_result_kind(source).unwrap_or(ResultKind::InvalidArgument)
            }
        }
    }

    pub fn command(command: &str, reason: impl Into<String>) -> Self {
        XferError::CommandFailed {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(field: &str, reason: impl Into<String>) -> Self {
        XferError::InvalidArgument {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for xferd operations
pub type XferResult<T> = Result<T, XferError>;

/// Map the io errors that have a dedicated result kind.
pub fn io_result_kind(err: &io::Error) -> Option<ResultKind> {
    match err.kind() {
        io::ErrorKind::NotFound => Some(ResultKind::NoSuchFileOrDirectory),
        io::ErrorKind::PermissionDenied => Some(ResultKind::PermissionDenied),
        io::ErrorKind::OutOfMemory => Some(ResultKind::OutOfMemory),
        _ if err.raw_os_error() == Some(libc::ENOMEM) => Some(ResultKind::OutOfMemory),
        _ => None,
    }
}

/// Helper trait for attaching the offending path to io errors
pub trait ToXferError<T> {
    fn at_path(self, path: &Path) -> XferResult<T>;
}

impl<T> ToXferError<T> for io::Result<T> {
    fn at_path(self, path: &Path) -> XferResult<T> {
        self.map_err(|source| XferError::Filesystem {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_to_kinds() {
        let missing: io::Result<()> = Err(io::Error::from(io::ErrorKind::NotFound));
        let err = missing.at_path(Path::new("/nope")).unwrap_err();
        assert_eq!(err.kind(), ResultKind::NoSuchFileOrDirectory);
        assert!(format!("{}", err).contains("/nope"));

        let denied = XferError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind(), ResultKind::PermissionDenied);

        let nomem = XferError::Io(io::Error::from_raw_os_error(libc::ENOMEM));
        assert_eq!(nomem.kind(), ResultKind::OutOfMemory);
    }

    #[test]
    fn test_move_failure_falls_back_to_rename() {
        let err = XferError::MoveFailed {
            from: PathBuf::from("/tmp/a.part"),
            to: PathBuf::from("/data/a"),
            source: io::Error::new(io::ErrorKind::Other, "disk on fire"),
        };
        assert_eq!(err.kind(), ResultKind::RenameFailure);

        let err = XferError::MoveFailed {
            from: PathBuf::from("/tmp/a.part"),
            to: PathBuf::from("/data/a"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(err.kind(), ResultKind::PermissionDenied);
    }

    #[test]
    fn test_command_and_redirect_kinds() {
        assert_eq!(
            XferError::command("reboot", "exit status 1").kind(),
            ResultKind::ExecuteCommandFailure
        );
        assert_eq!(
            XferError::TooManyRedirects { limit: 5 }.kind(),
            ResultKind::TooManyRedirects
        );
        assert_eq!(
            XferError::invalid_argument("maxLogs", "must be positive").kind(),
            ResultKind::InvalidArgument
        );
    }
}
