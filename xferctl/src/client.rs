use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tokio::net::UnixStream;
use tracing::debug;
use xferd_protocol::*;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub active_jobs: usize,
    pub metrics: String,
}

pub struct XferClient {
    socket_path: std::path::PathBuf,
}

impl XferClient {
    pub async fn new(socket_path: impl AsRef<Path>) -> Result<Self> {
        let client = Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        };

        // Send a health check to verify the daemon is working
        let health = client.health_check().await?;
        if !health.healthy {
            anyhow::bail!("Daemon reports unhealthy status");
        }
        debug!("Connected to daemon version {}", health.version);

        Ok(client)
    }

    async fn send_request(&self, request: Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Failed to connect to daemon at {:?}", self.socket_path))?;

        send_request(&mut stream, &request).await?;
        let response = receive_response(&mut stream).await?;

        if let Response::Rejected { error } = response {
            anyhow::bail!("Daemon rejected the request: {}", error);
        }
        Ok(response)
    }

    /// Submits a command and returns the async key its result will carry.
    pub async fn submit(&self, request: CommandRequest) -> Result<String> {
        match self.send_request(Request::Submit(request)).await? {
            Response::InProgress { async_key } => Ok(async_key),
            other => anyhow::bail!("Unexpected response type: {:?}", other),
        }
    }

    pub async fn recent_results(&self, limit: usize) -> Result<Vec<Notification>> {
        match self.send_request(Request::Results { limit }).await? {
            Response::Results { notifications } => Ok(notifications),
            other => anyhow::bail!("Unexpected response type: {:?}", other),
        }
    }

    /// Looks for the result reported under `async_key`.
    pub async fn find_result(&self, async_key: &str) -> Result<Option<Notification>> {
        let results = self.recent_results(usize::MAX).await?;
        Ok(results.into_iter().rev().find(|n| n.async_key == async_key))
    }

    pub async fn get_stats(&self) -> Result<StatsReport> {
        match self.send_request(Request::Stats).await? {
            Response::Stats { active_jobs, metrics } => Ok(StatsReport { active_jobs, metrics }),
            other => anyhow::bail!("Unexpected response type: {:?}", other),
        }
    }

    pub async fn health_check(&self) -> Result<HealthReport> {
        match self.send_request(Request::Health).await? {
            Response::Health { healthy, version, uptime_secs } => Ok(HealthReport {
                healthy,
                version,
                uptime_secs,
            }),
            other => anyhow::bail!("Unexpected response type: {:?}", other),
        }
    }
}
