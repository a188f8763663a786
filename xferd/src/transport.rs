use crate::error::{XferError, XferResult};
use anyhow::Context;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const REDIRECT_STATUSES: [u16; 4] = [301, 302, 303, 307];

pub fn is_redirect(status: u16) -> bool {
    REDIRECT_STATUSES.contains(&status)
}

pub fn is_success(status: u16) -> bool {
    status == 200 || status == 201
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Sending,
    Receiving,
    Received,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Complete,
    Retry,
}

/// Step-driven HTTP transfer. Every call returns without blocking; the job
/// calls the step functions again on the next readiness tick.
pub trait Transport: Send {
    fn state(&self) -> TransportState;
    /// Issues a GET whose body is written to `sink`.
    fn start_download(&mut self, url: &str, sink: &Path) -> XferResult<()>;
    /// Issues a PUT whose body is read from `source`.
    fn start_upload(&mut self, url: &str, source: &Path) -> XferResult<()>;
    fn do_send(&mut self) -> XferResult<Step>;
    fn recv_response(&mut self) -> XferResult<()>;
    fn do_recv(&mut self) -> XferResult<Step>;
    fn status_code(&self) -> Option<u16>;
    fn redirect_target(&self) -> Option<String>;
    fn reset(&mut self);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Download,
    Upload,
}

#[derive(Debug)]
enum WireEvent {
    Headers { status: u16, location: Option<String> },
    Finished,
    Failed(String),
}

/// `reqwest` backed transport. The request runs on a spawned task and reports
/// progress through a channel that the step functions drain.
pub struct HttpTransport {
    client: reqwest::Client,
    state: TransportState,
    direction: Direction,
    url: String,
    events: Option<mpsc::UnboundedReceiver<WireEvent>>,
    task: Option<JoinHandle<()>>,
    status: Option<u16>,
    location: Option<String>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            state: TransportState::Idle,
            direction: Direction::Download,
            url: String::new(),
            events: None,
            task: None,
            status: None,
            location: None,
        }
    }

    fn failure(&self, reason: impl Into<String>) -> XferError {
        match self.direction {
            Direction::Download => XferError::DownloadFailed {
                url: self.url.clone(),
                reason: reason.into(),
            },
            Direction::Upload => XferError::UploadFailed {
                url: self.url.clone(),
                reason: reason.into(),
            },
        }
    }

    fn launch<F>(&mut self, direction: Direction, url: &str, work: F) -> XferResult<()>
    where
        F: FnOnce(mpsc::UnboundedSender<WireEvent>) -> JoinHandle<()>,
    {
        self.reset();
        self.direction = direction;
        self.url = url.to_string();

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(self.failure("no async runtime available"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.task = Some(work(tx));
        self.events = Some(rx);
        self.state = TransportState::Sending;
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<WireEvent>, XferError> {
        let Some(events) = self.events.as_mut() else {
            return Err(self.failure("no request in flight"));
        };
        match events.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.state = TransportState::Canceled;
                Err(self.failure("transfer canceled"))
            }
        }
    }
}

impl Transport for HttpTransport {
    fn state(&self) -> TransportState {
        self.state
    }

    fn start_download(&mut self, url: &str, sink: &Path) -> XferResult<()> {
        info!("GET {} -> {:?}", url, sink);
        let request = self.client.get(url);
        let sink = sink.to_path_buf();
        self.launch(Direction::Download, url, move |tx| {
            tokio::spawn(async move {
                let event = match download(request, &sink, &tx).await {
                    Ok(()) => WireEvent::Finished,
                    Err(e) => WireEvent::Failed(format!("{:#}", e)),
                };
                let _ = tx.send(event);
            })
        })
    }

    fn start_upload(&mut self, url: &str, source: &Path) -> XferResult<()> {
        info!("PUT {:?} -> {}", source, url);
        let request = self.client.put(url).header(CONTENT_TYPE, "application/octet-stream");
        let source = source.to_path_buf();
        self.launch(Direction::Upload, url, move |tx| {
            tokio::spawn(async move {
                let event = match upload(request, &source, &tx).await {
                    Ok(()) => WireEvent::Finished,
                    Err(e) => WireEvent::Failed(format!("{:#}", e)),
                };
                let _ = tx.send(event);
            })
        })
    }

    fn do_send(&mut self) -> XferResult<Step> {
        match self.next_event()? {
            Some(WireEvent::Headers { status, location }) => {
                debug!("{} answered {}", self.url, status);
                self.status = Some(status);
                self.location = location;
                self.state = TransportState::Receiving;
                Ok(Step::Complete)
            }
            Some(WireEvent::Failed(reason)) => {
                self.state = TransportState::Idle;
                Err(self.failure(reason))
            }
            Some(WireEvent::Finished) => {
                self.state = TransportState::Idle;
                Err(self.failure("request finished without a response"))
            }
            None => Ok(Step::Retry),
        }
    }

    fn recv_response(&mut self) -> XferResult<()> {
        match self.state {
            TransportState::Receiving | TransportState::Received => Ok(()),
            _ => Err(self.failure("no response headers received")),
        }
    }

    fn do_recv(&mut self) -> XferResult<Step> {
        if self.state == TransportState::Received {
            return Ok(Step::Complete);
        }
        match self.next_event()? {
            Some(WireEvent::Finished) => {
                self.state = TransportState::Received;
                self.task = None;
                Ok(Step::Complete)
            }
            Some(WireEvent::Failed(reason)) => {
                self.state = TransportState::Idle;
                Err(self.failure(reason))
            }
            Some(WireEvent::Headers { .. }) | None => Ok(Step::Retry),
        }
    }

    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn redirect_target(&self) -> Option<String> {
        self.location.clone()
    }

    fn reset(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events = None;
        self.status = None;
        self.location = None;
        self.state = TransportState::Idle;
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn download(
    request: reqwest::RequestBuilder,
    sink: &Path,
    tx: &mpsc::UnboundedSender<WireEvent>,
) -> anyhow::Result<()> {
    let mut response = request.send().await.context("request failed")?;
    let status = response.status().as_u16();
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| response.url().join(value).ok())
        .map(|url| url.to_string());
    let _ = tx.send(WireEvent::Headers { status, location });

    // Only a successful body is worth keeping.
    if !is_success(status) {
        return Ok(());
    }

    let mut file = tokio::fs::File::create(sink)
        .await
        .with_context(|| format!("Failed to create download sink: {:?}", sink))?;
    while let Some(chunk) = response.chunk().await.context("body read failed")? {
        file.write_all(&chunk).await.context("Failed to write download sink")?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

async fn upload(
    request: reqwest::RequestBuilder,
    source: &Path,
    tx: &mpsc::UnboundedSender<WireEvent>,
) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("Failed to open upload source: {:?}", source))?;
    let length = file
        .metadata()
        .await
        .with_context(|| format!("Failed to stat upload source: {:?}", source))?
        .len();
    let response = request
        .header(CONTENT_LENGTH, length)
        .body(reqwest::Body::from(file))
        .send()
        .await
        .context("request failed")?;
    let status = response.status().as_u16();
    let _ = tx.send(WireEvent::Headers { status, location: None });
    Ok(())
}

/// Creates one `HttpTransport` per job from a shared client.
#[derive(Clone)]
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("xferd/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(HttpTransport::new(self.client.clone()))
    }
}
