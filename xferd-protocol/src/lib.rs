use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length-prefixed message frame format:
/// [4 bytes length][JSON bytes]
pub struct MessageFramer;

impl MessageFramer {
    pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

    pub async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let buf = serde_json::to_vec(message).context("Failed to encode message")?;

        let len = buf.len() as u32;
        writer.write_all(&len.to_le_bytes()).await.context("Failed to write length")?;
        writer.write_all(&buf).await.context("Failed to write message")?;
        writer.flush().await.context("Failed to flush writer")?;

        Ok(())
    }

    pub async fn receive_message<R, T>(reader: &mut R) -> Result<T>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        // Read the length prefix
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.context("Failed to read length")?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > Self::MAX_MESSAGE_LEN {
            anyhow::bail!("Message too large: {} bytes", len);
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.context("Failed to read message")?;

        serde_json::from_slice(&buf).context("Failed to decode message")
    }
}

pub async fn send_request<W: AsyncWrite + Unpin>(writer: &mut W, request: &Request) -> Result<()> {
    MessageFramer::send_message(writer, request).await
}

pub async fn receive_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Request> {
    MessageFramer::receive_message(reader).await
}

pub async fn send_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<()> {
    MessageFramer::send_message(writer, response).await
}

pub async fn receive_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Response> {
    MessageFramer::receive_message(reader).await
}

pub const SUCCESS_MESSAGE: &str = "operation complete.";
pub const FAILURE_MESSAGE: &str = "operation failed";

/// Stable, string-coded outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    #[serde(rename = "Success")]
    Success,
    #[serde(rename = "Error.File.InvalidArgument")]
    InvalidArgument,
    #[serde(rename = "Error.File.OutOfMemory")]
    OutOfMemory,
    #[serde(rename = "Error.File.PermissionDenied")]
    PermissionDenied,
    #[serde(rename = "Error.File.NoSuchFileOrDirectory")]
    NoSuchFileOrDirectory,
    #[serde(rename = "Error.File.InvalidConfiguration")]
    InvalidConfiguration,
    #[serde(rename = "Error.File.ExecuteCommandFailure")]
    ExecuteCommandFailure,
    #[serde(rename = "Error.File.DownloadFailure")]
    DownloadFailure,
    #[serde(rename = "Error.File.UploadFailure")]
    UploadFailure,
    #[serde(rename = "Error.File.RenameFailure")]
    RenameFailure,
    #[serde(rename = "Error.File.TooManyRedirects")]
    TooManyRedirects,
}

impl ResultKind {
    pub const ALL: [ResultKind; 11] = [
        ResultKind::Success,
        ResultKind::InvalidArgument,
        ResultKind::OutOfMemory,
        ResultKind::PermissionDenied,
        ResultKind::NoSuchFileOrDirectory,
        ResultKind::InvalidConfiguration,
        ResultKind::ExecuteCommandFailure,
        ResultKind::DownloadFailure,
        ResultKind::UploadFailure,
        ResultKind::RenameFailure,
        ResultKind::TooManyRedirects,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Success => "Success",
            ResultKind::InvalidArgument => "Error.File.InvalidArgument",
            ResultKind::OutOfMemory => "Error.File.OutOfMemory",
            ResultKind::PermissionDenied => "Error.File.PermissionDenied",
            ResultKind::NoSuchFileOrDirectory => "Error.File.NoSuchFileOrDirectory",
            ResultKind::InvalidConfiguration => "Error.File.InvalidConfiguration",
            ResultKind::ExecuteCommandFailure => "Error.File.ExecuteCommandFailure",
            ResultKind::DownloadFailure => "Error.File.DownloadFailure",
            ResultKind::UploadFailure => "Error.File.UploadFailure",
            ResultKind::RenameFailure => "Error.File.RenameFailure",
            ResultKind::TooManyRedirects => "Error.File.TooManyRedirects",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultKind::Success)
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResultKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Invalid result kind: {}", s))
    }
}

/// Which device model a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelName {
    ContentInfo,
    ConfigurationInfo,
    SyslogInfo,
}

impl ModelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::ContentInfo => "ContentInfo",
            ModelName::ConfigurationInfo => "ConfigurationInfo",
            ModelName::SyslogInfo => "SyslogInfo",
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a command; locator fields stay optional so that a missing
/// mandatory field is reported through the job result rather than rejected
/// at the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Download {
        delivery_url: Option<String>,
        destination_path: Option<String>,
    },
    Upload {
        upload_url: Option<String>,
        source_path: Option<String>,
    },
    DownloadAndApply {
        delivery_url: Option<String>,
    },
    UploadConfig {
        upload_url: Option<String>,
    },
    SyslogUpload {
        upload_url: Option<String>,
        max_logs: Option<i32>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Download { .. } => "download",
            Command::Upload { .. } => "upload",
            Command::DownloadAndApply { .. } => "downloadAndApply",
            Command::UploadConfig { .. } => "uploadConfig",
            Command::SyslogUpload { .. } => "syslogUpload",
        }
    }

    pub fn model(&self) -> ModelName {
        match self {
            Command::Download { .. } | Command::Upload { .. } => ModelName::ContentInfo,
            Command::DownloadAndApply { .. } | Command::UploadConfig { .. } => {
                ModelName::ConfigurationInfo
            }
            Command::SyslogUpload { .. } => ModelName::SyslogInfo,
        }
    }

    /// Notification service the result of this command is reported on.
    pub fn result_service(&self) -> &'static str {
        match self {
            Command::Download { .. } => "deliver-file-result",
            Command::Upload { .. } => "fetch-file-result",
            Command::DownloadAndApply { .. } => "deliver-config-result",
            Command::UploadConfig { .. } => "fetch-config-result",
            Command::SyslogUpload { .. } => "fetch-syslogs-result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub uid: String,
    pub async_key: String,
    #[serde(flatten)]
    pub command: Command,
}

pub fn service_id(app_id: &str, service: &str) -> String {
    format!("urn:moat:{}:{}:1.0", app_id, service)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    pub code: i32,
    pub success: bool,
    pub message: String,
    pub kind: ResultKind,
}

impl FileResult {
    pub fn success(status_code: u16) -> Self {
        Self {
            code: i32::from(status_code),
            success: true,
            message: SUCCESS_MESSAGE.to_string(),
            kind: ResultKind::Success,
        }
    }

    pub fn failure(kind: ResultKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code: -1,
            success: false,
            message: if message.is_empty() { FAILURE_MESSAGE.to_string() } else { message },
            kind,
        }
    }
}

/// One terminal result, addressed to the notification sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "urn")]
    pub service_id: String,
    #[serde(rename = "key")]
    pub async_key: String,
    #[serde(rename = "modelname")]
    pub model_name: String,
    pub result: FileResult,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Submit(CommandRequest),
    Results { limit: usize },
    Stats,
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    InProgress { async_key: String },
    Rejected { error: String },
    Results { notifications: Vec<Notification> },
    Stats { active_jobs: usize, metrics: String },
    Health { healthy: bool, version: String, uptime_secs: u64 },
}
