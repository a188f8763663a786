//! Collaborator doubles shared by the unit tests.

use crate::error::{XferError, XferResult};
use crate::notify::Notifier;
use crate::probe::{FsProbe, Writability};
use crate::shell::Shell;
use crate::syslog::MarkerWriter;
use crate::transport::{Step, Transport, TransportFactory, TransportState};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use xferd_protocol::Notification;

#[derive(Default)]
pub struct RecordingShell {
    commands: Mutex<Vec<String>>,
    failing: HashSet<String>,
}

impl RecordingShell {
    pub fn failing(commands: &[&str]) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            failing: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Shell for RecordingShell {
    fn run(&self, command: &str) -> XferResult<()> {
        self.commands.lock().unwrap().push(command.to_string());
        if self.failing.contains(command) {
            Err(XferError::command(command, "exit status: 1"))
        } else {
            Ok(())
        }
    }
}

pub struct StaticProbe {
    writability: Writability,
    union: bool,
}

impl StaticProbe {
    pub fn writable() -> Self {
        Self { writability: Writability::Writable, union: false }
    }

    pub fn read_only() -> Self {
        Self { writability: Writability::ReadOnly, union: false }
    }

    pub fn union() -> Self {
        Self { writability: Writability::Writable, union: true }
    }
}

impl FsProbe for StaticProbe {
    fn classify_writability(&self, _path: &Path) -> XferResult<Writability> {
        Ok(self.writability)
    }

    fn is_union(&self, _path: &Path) -> bool {
        self.union
    }
}

/// One canned server reaction, consumed per request in order.
#[derive(Debug, Clone)]
pub enum Reply {
    Status { status: u16, location: Option<String>, body: Vec<u8> },
    Fail(String),
    /// 200 whose body breaks off after `body` reached the sink.
    BrokenBody(Vec<u8>),
    Cancel,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Reply::Status { status: 200, location: None, body: body.as_bytes().to_vec() }
    }

    pub fn status(status: u16) -> Self {
        Reply::Status { status, location: None, body: Vec::new() }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Reply::Status { status, location: Some(location.to_string()), body: Vec::new() }
    }

    pub fn broken_body(partial: &str) -> Self {
        Reply::BrokenBody(partial.as_bytes().to_vec())
    }
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    requests: Vec<String>,
}

/// Hands out transports that answer from a shared script and log every
/// request as `GET <url>` or `PUT <url>`.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        let factory = Self::default();
        factory.script.lock().unwrap().replies.extend(replies);
        factory
    }

    pub fn requests(&self) -> Vec<String> {
        self.script.lock().unwrap().requests.clone()
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(ScriptedTransport {
            script: self.script.clone(),
            state: TransportState::Idle,
            reply: None,
            sink: None,
            status: None,
            location: None,
            waited: false,
        })
    }
}

struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    state: TransportState,
    reply: Option<Reply>,
    sink: Option<PathBuf>,
    status: Option<u16>,
    location: Option<String>,
    waited: bool,
}

impl ScriptedTransport {
    fn begin(&mut self, request: String, sink: Option<PathBuf>) {
        let mut script = self.script.lock().unwrap();
        script.requests.push(request);
        self.reply = script.replies.pop_front();
        self.sink = sink;
        self.state = TransportState::Sending;
        self.waited = false;
    }
}

impl Transport for ScriptedTransport {
    fn state(&self) -> TransportState {
        self.state
    }

    fn start_download(&mut self, url: &str, sink: &Path) -> XferResult<()> {
        self.begin(format!("GET {}", url), Some(sink.to_path_buf()));
        Ok(())
    }

    fn start_upload(&mut self, url: &str, _source: &Path) -> XferResult<()> {
        self.begin(format!("PUT {}", url), None);
        Ok(())
    }

    fn do_send(&mut self) -> XferResult<Step> {
        // Every request needs one extra readiness tick.
        if !self.waited {
            self.waited = true;
            return Ok(Step::Retry);
        }
        match self.reply.clone() {
            Some(Reply::Status { status, location, .. }) => {
                self.status = Some(status);
                self.location = location;
                self.state = TransportState::Receiving;
                Ok(Step::Complete)
            }
            Some(Reply::BrokenBody(_)) => {
                self.status = Some(200);
                self.state = TransportState::Receiving;
                Ok(Step::Complete)
            }
            Some(Reply::Fail(reason)) => {
                self.state = TransportState::Idle;
                Err(XferError::DownloadFailed { url: "scripted".to_string(), reason })
            }
            Some(Reply::Cancel) | None => {
                self.state = TransportState::Canceled;
                Err(XferError::DownloadFailed {
                    url: "scripted".to_string(),
                    reason: "transfer canceled".to_string(),
                })
            }
        }
    }

    fn recv_response(&mut self) -> XferResult<()> {
        Ok(())
    }

    fn do_recv(&mut self) -> XferResult<Step> {
        if let (Some(Reply::BrokenBody(partial)), Some(sink)) = (&self.reply, &self.sink) {
            std::fs::write(sink, partial).map_err(XferError::Io)?;
            self.state = TransportState::Idle;
            return Err(XferError::DownloadFailed {
                url: "scripted".to_string(),
                reason: "body read failed".to_string(),
            });
        }
        if let (Some(Reply::Status { status, body, .. }), Some(sink)) = (&self.reply, &self.sink) {
            if *status == 200 || *status == 201 {
                std::fs::write(sink, body).map_err(XferError::Io)?;
            }
        }
        self.state = TransportState::Received;
        Ok(Step::Complete)
    }

    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn redirect_target(&self) -> Option<String> {
        self.location.clone()
    }

    fn reset(&mut self) {
        self.state = TransportState::Idle;
        self.reply = None;
        self.status = None;
        self.location = None;
    }
}

#[derive(Default)]
pub struct RecordingMarker {
    markers: Mutex<Vec<(String, String)>>,
}

impl RecordingMarker {
    pub fn markers(&self) -> Vec<(String, String)> {
        self.markers.lock().unwrap().clone()
    }
}

impl MarkerWriter for RecordingMarker {
    fn write_marker(&self, ident: &str, marker: &str) -> XferResult<()> {
        self.markers.lock().unwrap().push((ident.to_string(), marker.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for CollectingNotifier {
    fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
