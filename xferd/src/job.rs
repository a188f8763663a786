use crate::action::{ActionOutcome, ActionPhase, ActionRunner, ActionTrace};
use crate::error::{XferError, XferResult};
use crate::mover::FileMover;
use crate::pending::{PendingApply, PendingStore};
use crate::policy::FilesysInfoEntry;
use crate::reactor::{JobId, Reactor};
use crate::result::ResultCodeTracker;
use crate::shell::Shell;
use crate::syslog::MarkerWriter;
use crate::transport::{is_redirect, is_success, Step, Transport, TransportState};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};
use xferd_protocol::{ModelName, Notification, ResultKind, SUCCESS_MESSAGE};

pub const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    RunningPreAction,
    Transferring,
    /// Download only: the transport is being pointed at a redirect target.
    Redirecting,
    /// Download only: the temporary file is being landed.
    Copying,
    RunningPostAction,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Extra work a successful job performs before it reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    ApplyConfig,
    LeaveSyslogMarker,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub async_key: String,
    pub uid: String,
    pub service_id: String,
    pub model_name: ModelName,
    pub direction: Direction,
    /// Delivery URL for downloads, upload URL for uploads.
    pub remote: Option<String>,
    /// Final destination for downloads, source file for uploads.
    pub local: Option<PathBuf>,
    pub follow_up: FollowUp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Notify(Notification),
    /// The result was persisted and is reported after the next startup.
    Deferred,
}

/// Collaborators shared by every job the agent drives.
pub struct JobEnv {
    pub actions: ActionRunner,
    pub mover: FileMover,
    pub shell: Arc<dyn Shell>,
    pub pending: PendingStore,
    pub marker: Arc<dyn MarkerWriter>,
    pub scratch_dir: PathBuf,
    pub max_redirects: u32,
    pub apply_command: String,
    pub reboot_command: String,
    pub syslog_marker: String,
}

/// One download or upload, from request to its single terminal outcome.
pub struct TransferJob {
    id: JobId,
    spec: JobSpec,
    policy: Option<FilesysInfoEntry>,
    transport: Box<dyn Transport>,
    state: JobState,
    history: Vec<JobState>,
    current_url: String,
    temp_path: Option<PathBuf>,
    result: ResultCodeTracker,
    status_code: Option<u16>,
    redirects: u32,
    bytes_landed: u64,
    outcome: Option<JobOutcome>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    pub fn new(
        id: JobId,
        spec: JobSpec,
        policy: Option<FilesysInfoEntry>,
        transport: Box<dyn Transport>,
    ) -> Self {
        let current_url = spec.remote.clone().unwrap_or_default();
        Self {
            id,
            spec,
            policy,
            transport,
            state: JobState::Created,
            history: vec![JobState::Created],
            current_url,
            temp_path: None,
            result: ResultCodeTracker::new(),
            status_code: None,
            redirects: 0,
            bytes_landed: 0,
            outcome: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn async_key(&self) -> &str {
        &self.spec.async_key
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state the job has entered, in order.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn result(&self) -> &ResultCodeTracker {
        &self.result
    }

    pub fn redirects(&self) -> u32 {
        self.redirects
    }

    pub fn bytes_landed(&self) -> u64 {
        self.bytes_landed
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Hands out the terminal outcome exactly once.
    pub fn take_outcome(&mut self) -> Option<JobOutcome> {
        self.outcome.take()
    }

    fn transition(&mut self, next: JobState) {
        debug!("[{}] {:?} -> {:?}", self.spec.async_key, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Runs the pre-action and issues the first request.
    pub async fn start(&mut self, env: &JobEnv, reactor: &mut Reactor) {
        if self.state != JobState::Created {
            warn!("[{}] start called in state {:?}", self.spec.async_key, self.state);
            return;
        }
        info!(
            "[{}] {:?} {} <-> {:?} (policy: {})",
            self.spec.async_key,
            self.spec.direction,
            self.current_url,
            self.spec.local,
            self.policy.as_ref().map_or("none", |p| p.path_prefix.as_str())
        );

        if let Err(e) = self.validate() {
            self.result.record_error(&e);
            self.run_post_action(env).await;
            self.finish(env, reactor).await;
            return;
        }

        if let Some(command) = self.policy.as_ref().and_then(|p| p.pre_action.clone()) {
            self.transition(JobState::RunningPreAction);
            if let ActionOutcome::Failed { message, .. } =
                run_action(env, &self.spec.async_key, ActionPhase::Pre, &command).await
            {
                error!("[{}] {}", self.spec.async_key, message);
                self.result.store(ResultKind::ExecuteCommandFailure, message, false);
                self.finish(env, reactor).await;
                return;
            }
        }

        self.transition(JobState::Transferring);
        match self.begin_transfer(env) {
            Ok(()) => {
                reactor.subscribe(self.id);
            }
            Err(e) => {
                error!("[{}] {}", self.spec.async_key, e);
                self.result.record_error(&e);
                self.discard_temp().await;
                self.run_post_action(env).await;
                self.finish(env, reactor).await;
            }
        }
    }

    /// Advances the transport; a no-op unless a transfer is in flight.
    pub async fn on_io_ready(&mut self, env: &JobEnv, reactor: &mut Reactor) {
        if self.state != JobState::Transferring {
            debug!("[{}] Ignoring readiness in state {:?}", self.spec.async_key, self.state);
            return;
        }

        let status = match self.poll_transport() {
            Ok(None) => return,
            Ok(Some(status)) => status,
            Err(e) => {
                reactor.unsubscribe(self.id);
                self.record_transport_error(&e);
                self.discard_temp().await;
                self.run_post_action(env).await;
                self.finish(env, reactor).await;
                return;
            }
        };

        reactor.unsubscribe(self.id);
        self.status_code = Some(status);
        debug!("[{}] {} answered {}", self.spec.async_key, self.current_url, status);

        let direction = self.spec.direction;
        match direction {
            Direction::Download if is_redirect(status) => {
                self.transition(JobState::Redirecting);
                match self.follow_redirect(env) {
                    Ok(()) => {
                        self.transition(JobState::Transferring);
                        reactor.subscribe(self.id);
                        return;
                    }
                    Err(e) => {
                        error!("[{}] {}", self.spec.async_key, e);
                        self.result.record_error(&e);
                        self.discard_temp().await;
                    }
                }
            }
            Direction::Download if is_success(status) => {
                self.transition(JobState::Copying);
                self.land(env).await;
            }
            Direction::Download => {
                self.result.record_error(&XferError::DownloadFailed {
                    url: self.current_url.clone(),
                    reason: format!("server answered {}", status),
                });
                self.discard_temp().await;
            }
            Direction::Upload if is_success(status) => {
                info!("[{}] Uploaded to {}", self.spec.async_key, self.current_url);
            }
            Direction::Upload => {
                self.result.record_error(&XferError::UploadFailed {
                    url: self.current_url.clone(),
                    reason: format!("server answered {}", status),
                });
            }
        }

        self.run_post_action(env).await;
        self.finish(env, reactor).await;
    }

    fn validate(&self) -> XferResult<()> {
        let (url_field, path_field) = match self.spec.direction {
            Direction::Download => ("deliveryUrl", "destinationPath"),
            Direction::Upload => ("uploadUrl", "sourcePath"),
        };
        if self.spec.remote.as_deref().map_or(true, str::is_empty) {
            return Err(XferError::invalid_argument(url_field, "is required"));
        }
        if self.spec.local.as_deref().map_or(true, |p| p.as_os_str().is_empty()) {
            return Err(XferError::invalid_argument(path_field, "is required"));
        }
        Ok(())
    }

    fn begin_transfer(&mut self, env: &JobEnv) -> XferResult<()> {
        let local = self
            .spec
            .local
            .clone()
            .ok_or_else(|| XferError::invalid_argument("path", "is required"))?;
        let url = self.current_url.clone();

        match self.spec.direction {
            Direction::Download => {
                let temp = temp_path_for(&local, self.id, self.policy.as_ref(), &env.scratch_dir)?;
                debug!("[{}] Receiving into {:?}", self.spec.async_key, temp);
                self.temp_path = Some(temp.clone());
                self.transport.start_download(&url, &temp)
            }
            Direction::Upload => {
                check_upload_source(&local)?;
                self.transport.start_upload(&url, &local)
            }
        }
    }

    /// `Some(status)` once a full response is in, `None` to wait for the
    /// next readiness tick.
    fn poll_transport(&mut self) -> XferResult<Option<u16>> {
        loop {
            match self.transport.state() {
                TransportState::Connecting | TransportState::Sending => {
                    if self.transport.do_send()? == Step::Retry {
                        return Ok(None);
                    }
                    self.transport.recv_response()?;
                }
                TransportState::Receiving => {
                    if self.transport.do_recv()? == Step::Retry {
                        return Ok(None);
                    }
                }
                TransportState::Received => {
                    return self.transport.status_code().map(Some).ok_or_else(|| {
                        self.transfer_error("response carried no status code".to_string())
                    });
                }
                TransportState::Canceled => {
                    return Err(self.transfer_error("transfer canceled".to_string()));
                }
                TransportState::Idle => {
                    return Err(self.transfer_error("no request in flight".to_string()));
                }
            }
        }
    }

    fn transfer_error(&self, reason: String) -> XferError {
        let url = self.current_url.clone();
        match self.spec.direction {
            Direction::Download => XferError::DownloadFailed { url, reason },
            Direction::Upload => XferError::UploadFailed { url, reason },
        }
    }

    fn record_transport_error(&mut self, err: &XferError) {
        if self.transport.state() != TransportState::Canceled {
            error!("[{}] {}", self.spec.async_key, err);
            self.result.record_error(err);
            return;
        }
        let (kind, message) = match self.spec.direction {
            Direction::Download => {
                (ResultKind::DownloadFailure, "File download has been canceled.")
            }
            Direction::Upload => (ResultKind::UploadFailure, "File upload has been canceled."),
        };
        warn!("[{}] {}", self.spec.async_key, message);
        self.result.store(kind, message, false);
    }

    fn follow_redirect(&mut self, env: &JobEnv) -> XferResult<()> {
        if self.redirects >= env.max_redirects {
            return Err(XferError::TooManyRedirects { limit: env.max_redirects });
        }
        let target = self.transport.redirect_target().ok_or_else(|| XferError::DownloadFailed {
            url: self.current_url.clone(),
            reason: "redirect without a target".to_string(),
        })?;
        let temp = self
            .temp_path
            .clone()
            .ok_or_else(|| self.transfer_error("no temporary file to resume into".to_string()))?;

        self.redirects += 1;
        info!(
            "[{}] Redirect {}/{}: {} -> {}",
            self.spec.async_key, self.redirects, env.max_redirects, self.current_url, target
        );
        self.transport.reset();
        self.current_url = target;
        self.transport.start_download(&self.current_url, &temp)
    }

    async fn land(&mut self, env: &JobEnv) {
        let temp = self.temp_path.take();
        let (Some(temp), Some(destination)) = (temp, self.spec.local.clone()) else {
            self.result.store(ResultKind::RenameFailure, "nothing to land", false);
            return;
        };

        match env.mover.move_file(&temp, &destination).await {
            Ok(report) => {
                self.bytes_landed = report.bytes;
                info!(
                    "[{}] Landed {} bytes at {:?} ({:?})",
                    self.spec.async_key, report.bytes, destination, report.strategy
                );
            }
            Err(e) => {
                error!("[{}] {}", self.spec.async_key, e);
                self.result.store(landing_failure_kind(&e), e.to_string(), false);
            }
        }
    }

    async fn run_post_action(&mut self, env: &JobEnv) {
        let Some(command) = self.policy.as_ref().and_then(|p| p.post_action.clone()) else {
            return;
        };
        self.transition(JobState::RunningPostAction);
        if let ActionOutcome::Failed { message, .. } =
            run_action(env, &self.spec.async_key, ActionPhase::Post, &command).await
        {
            error!("[{}] {}", self.spec.async_key, message);
            self.result.store(ResultKind::ExecuteCommandFailure, message, false);
        }
    }

    async fn finish(&mut self, env: &JobEnv, reactor: &mut Reactor) {
        reactor.unsubscribe(self.id);

        let succeeded = !self.result.is_failure();
        let deferred = match self.spec.follow_up {
            FollowUp::ApplyConfig if succeeded => self.apply_config(env).await,
            FollowUp::LeaveSyslogMarker if succeeded => {
                let ident = self.spec.model_name.as_str();
                if let Err(e) = env.marker.write_marker(ident, &env.syslog_marker) {
                    warn!("[{}] Failed to leave syslog marker: {}", self.spec.async_key, e);
                }
                false
            }
            _ => false,
        };

        self.transition(JobState::Done);
        self.completed_at = Some(Utc::now());

        let resolved = self.result.resolved();
        info!(
            "[{}] Done: {} ({})",
            self.spec.async_key, resolved.kind, resolved.message
        );
        self.outcome = Some(if deferred {
            JobOutcome::Deferred
        } else {
            JobOutcome::Notify(self.notification())
        });
    }

    /// Persists the result, then applies and reboots. Returns whether the
    /// notification is deferred to the next startup.
    async fn apply_config(&mut self, env: &JobEnv) -> bool {
        self.result.store(ResultKind::Success, SUCCESS_MESSAGE, false);
        let record = PendingApply {
            service_id: self.spec.service_id.clone(),
            async_key: self.spec.async_key.clone(),
            model_name: self.spec.model_name.as_str().to_string(),
            result: self.result.to_file_result(self.status_code),
            created_at: Utc::now(),
        };

        if let Err(e) = env.pending.save(&record).await {
            error!("[{}] Not rebooting: {:#}", self.spec.async_key, e);
            self.result.store(
                ResultKind::ExecuteCommandFailure,
                format!("Failed to persist pending result: {:#}", e),
                true,
            );
            return false;
        }

        for command in [&env.apply_command, &env.reboot_command] {
            info!("[{}] Running {}", self.spec.async_key, command);
            if let Err(e) = env.shell.run(command) {
                error!("[{}] {}", self.spec.async_key, e);
                if let Err(e) = env.pending.remove().await {
                    warn!("[{}] {:#}", self.spec.async_key, e);
                }
                self.result.store(e.kind(), e.to_string(), true);
                return false;
            }
        }

        info!("[{}] Result deferred until restart", self.spec.async_key);
        true
    }

    fn notification(&self) -> Notification {
        Notification {
            service_id: self.spec.service_id.clone(),
            async_key: self.spec.async_key.clone(),
            model_name: self.spec.model_name.as_str().to_string(),
            result: self.result.to_file_result(self.status_code),
            timestamp: Utc::now(),
        }
    }

    async fn discard_temp(&mut self) {
        let Some(temp) = self.temp_path.take() else {
            return;
        };
        match fs::remove_file(&temp).await {
            Ok(()) => debug!("[{}] Removed {:?}", self.spec.async_key, temp),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("[{}] Failed to remove {:?}: {}", self.spec.async_key, temp, e),
        }
    }
}

async fn run_action(
    env: &JobEnv,
    job_key: &str,
    phase: ActionPhase,
    command: &str,
) -> ActionOutcome {
    info!("[{}] Running {}: {}", job_key, phase, command);
    let mut trace = ActionTrace::new(job_key, phase);
    env.actions.run(command, &mut trace).await;
    trace.outcome()
}

/// `{dir}/{basename}.{job}.part`, where `dir` is the policy's temporary
/// directory when it exists and the scratch directory otherwise. The job id
/// keeps concurrent downloads of equally named files apart.
pub fn temp_path_for(
    destination: &Path,
    job: JobId,
    policy: Option<&FilesysInfoEntry>,
    scratch_dir: &Path,
) -> XferResult<PathBuf> {
    let name = destination
        .file_name()
        .ok_or_else(|| XferError::invalid_argument("destinationPath", "has no file name"))?;
    let dir = policy
        .and_then(|p| p.temp_dir.as_deref())
        .filter(|dir| dir.is_dir())
        .unwrap_or(scratch_dir);

    let mut file_name = name.to_os_string();
    file_name.push(format!(".{}{}", job, PARTIAL_SUFFIX));
    Ok(dir.join(file_name))
}

fn check_upload_source(path: &Path) -> XferResult<()> {
    let metadata = std::fs::metadata(path).map_err(|source| XferError::Filesystem {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.is_file() {
        return Err(XferError::invalid_argument(
            "sourcePath",
            format!("{:?} is not a regular file", path),
        ));
    }
    Ok(())
}

/// Landing keeps the io kinds callers can act on; anything else is a rename
/// failure.
fn landing_failure_kind(err: &XferError) -> ResultKind {
    match err.kind() {
        kind @ (ResultKind::PermissionDenied
        | ResultKind::NoSuchFileOrDirectory
        | ResultKind::OutOfMemory) => kind,
        _ => ResultKind::RenameFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::probe::FsProbe;
    use crate::test_support::{
        RecordingMarker, RecordingShell, Reply, ScriptedFactory, StaticProbe,
    };
    use crate::transport::TransportFactory;
    use tempfile::TempDir;

    const JOB_ID: JobId = 7;

    struct Fixture {
        dir: TempDir,
        shell: Arc<RecordingShell>,
        marker: Arc<RecordingMarker>,
        env: JobEnv,
        reactor: Reactor,
    }

    impl Fixture {
        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn partial(&self, name: &str) -> PathBuf {
            self.env.scratch_dir.join(format!("{}.{}{}", name, JOB_ID, PARTIAL_SUFFIX))
        }
    }

    fn fixture(shell: RecordingShell, probe: StaticProbe) -> Fixture {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();

        let storage = StorageConfig {
            manifest_path: dir.path().join("config.list"),
            remount_rw_command: "remount-rw".to_string(),
            remount_ro_command: "remount-ro".to_string(),
            apply_command: "apply".to_string(),
            ..StorageConfig::default()
        };
        let shell = Arc::new(shell);
        let marker = Arc::new(RecordingMarker::default());
        let probe: Arc<dyn FsProbe> = Arc::new(probe);

        let env = JobEnv {
            actions: ActionRunner::default(),
            mover: FileMover::new(&storage, probe, shell.clone()),
            shell: shell.clone(),
            pending: PendingStore::new(dir.path().join("pending")),
            marker: marker.clone(),
            scratch_dir: scratch,
            max_redirects: 5,
            apply_command: "apply".to_string(),
            reboot_command: "reboot".to_string(),
            syslog_marker: "MARKER".to_string(),
        };
        Fixture { dir, shell, marker, env, reactor: Reactor::new() }
    }

    fn download_spec(url: &str, destination: PathBuf) -> JobSpec {
        JobSpec {
            async_key: "key-1".to_string(),
            uid: "uid-1".to_string(),
            service_id: "urn:moat:xferd:deliver-file-result:1.0".to_string(),
            model_name: ModelName::ContentInfo,
            direction: Direction::Download,
            remote: Some(url.to_string()),
            local: Some(destination),
            follow_up: FollowUp::None,
        }
    }

    fn upload_spec(url: &str, source: PathBuf) -> JobSpec {
        JobSpec {
            direction: Direction::Upload,
            service_id: "urn:moat:xferd:fetch-file-result:1.0".to_string(),
            ..download_spec(url, source)
        }
    }

    async fn run(
        fx: &mut Fixture,
        factory: &ScriptedFactory,
        spec: JobSpec,
        policy: Option<FilesysInfoEntry>,
    ) -> TransferJob {
        let mut job = TransferJob::new(JOB_ID, spec, policy, factory.create());
        job.start(&fx.env, &mut fx.reactor).await;
        for _ in 0..64 {
            if job.is_done() {
                break;
            }
            if fx.reactor.ready().contains(&job.id()) {
                job.on_io_ready(&fx.env, &mut fx.reactor).await;
            }
        }
        assert!(job.is_done(), "job stuck in {:?}", job.state());
        job
    }

    fn notified(job: &mut TransferJob) -> Notification {
        match job.take_outcome() {
            Some(JobOutcome::Notify(notification)) => notification,
            other => panic!("expected a notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_follows_redirect_once() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([
            Reply::redirect(302, "http://mirror/file.bin"),
            Reply::ok("payload"),
        ]);
        let destination = fx.path("out/file.bin");
        let spec = download_spec("http://origin/file.bin", destination.clone());

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert_eq!(
            factory.requests(),
            ["GET http://origin/file.bin", "GET http://mirror/file.bin"]
        );
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "payload");
        assert_eq!(job.redirects(), 1);
        assert_eq!(job.bytes_landed(), 7);
        assert!(job.history().contains(&JobState::Redirecting));
        assert!(job.history().contains(&JobState::Copying));
        assert!(!fx.reactor.is_subscribed(job.id()));
        assert!(fx.reactor.is_empty());
        assert!(!fx.partial("file.bin").exists());

        let notification = notified(&mut job);
        assert!(notification.result.success);
        assert_eq!(notification.result.code, 200);
        assert_eq!(notification.result.message, SUCCESS_MESSAGE);
        assert!(job.take_outcome().is_none());
    }

    #[tokio::test]
    async fn test_pre_action_failure_skips_transport() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::ok("never")]);
        let destination = fx.path("file.bin");
        let policy = FilesysInfoEntry::new(fx.dir.path().to_string_lossy())
            .with_pre_action("exit 3");
        let spec = download_spec("http://origin/file.bin", destination.clone());

        let mut job = run(&mut fx, &factory, spec, Some(policy)).await;

        assert!(factory.requests().is_empty());
        assert!(!destination.exists());
        assert!(!job.history().contains(&JobState::Transferring));
        let notification = notified(&mut job);
        assert!(!notification.result.success);
        assert_eq!(notification.result.code, -1);
        assert_eq!(notification.result.kind, ResultKind::ExecuteCommandFailure);
    }

    #[tokio::test]
    async fn test_redirect_limit() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        fx.env.max_redirects = 2;
        let factory = ScriptedFactory::new([
            Reply::redirect(301, "http://a/f"),
            Reply::redirect(307, "http://b/f"),
            Reply::redirect(303, "http://c/f"),
        ]);
        let spec = download_spec("http://origin/f", fx.path("f"));

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert_eq!(factory.requests().len(), 3);
        assert_eq!(notified(&mut job).result.kind, ResultKind::TooManyRedirects);
        assert!(fx.reactor.is_empty());
    }

    #[tokio::test]
    async fn test_redirect_without_target_fails_download() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::status(302)]);
        let spec = download_spec("http://origin/f", fx.path("f"));

        let mut job = run(&mut fx, &factory, spec, None).await;
        assert_eq!(notified(&mut job).result.kind, ResultKind::DownloadFailure);
    }

    #[tokio::test]
    async fn test_missing_arguments_still_run_post_action() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::default();
        let marker = fx.path("post-ran");
        let policy = FilesysInfoEntry::new("/")
            .with_post_action(format!("touch {}", marker.display()));
        let mut spec = download_spec("", fx.path("f"));
        spec.remote = None;

        let mut job = run(&mut fx, &factory, spec, Some(policy)).await;

        assert!(factory.requests().is_empty());
        assert!(marker.exists());
        assert_eq!(notified(&mut job).result.kind, ResultKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_post_action_keeps_first_failure() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::status(404)]);
        let policy = FilesysInfoEntry::new("/").with_post_action("exit 1");
        let spec = download_spec("http://origin/f", fx.path("f"));

        let mut job = run(&mut fx, &factory, spec, Some(policy)).await;

        assert!(job.history().contains(&JobState::RunningPostAction));
        let notification = notified(&mut job);
        assert_eq!(notification.result.kind, ResultKind::DownloadFailure);
        assert!(notification.result.message.contains("404"));
    }

    #[tokio::test]
    async fn test_post_action_failure_after_landing() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::ok("data")]);
        let destination = fx.path("f");
        let policy = FilesysInfoEntry::new("/").with_post_action("exit 1");
        let spec = download_spec("http://origin/f", destination.clone());

        let mut job = run(&mut fx, &factory, spec, Some(policy)).await;

        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "data");
        assert_eq!(notified(&mut job).result.kind, ResultKind::ExecuteCommandFailure);
    }

    #[tokio::test]
    async fn test_broken_body_removes_partial_file() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::broken_body("half of it")]);
        let destination = fx.path("f.bin");
        let spec = download_spec("http://origin/f.bin", destination.clone());

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert!(!fx.partial("f.bin").exists());
        assert!(!destination.exists());
        assert!(!job.history().contains(&JobState::Copying));
        assert_eq!(notified(&mut job).result.kind, ResultKind::DownloadFailure);
    }

    #[tokio::test]
    async fn test_failed_landing_removes_partial_file() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        std::fs::write(fx.path("blocker"), "not a directory").unwrap();
        let factory = ScriptedFactory::new([Reply::ok("payload")]);
        let spec = download_spec("http://origin/f.bin", fx.path("blocker/f.bin"));

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert!(job.history().contains(&JobState::Copying));
        assert!(!fx.partial("f.bin").exists());
        assert_eq!(notified(&mut job).result.kind, ResultKind::RenameFailure);
    }

    #[test]
    fn test_partial_file_location() {
        let dir = TempDir::new().unwrap();
        let policy = FilesysInfoEntry::new("/data").with_temp_dir(dir.path());
        let temp = temp_path_for(Path::new("/data/a.bin"), 3, Some(&policy), Path::new("/tmp"));
        assert_eq!(temp.unwrap(), dir.path().join("a.bin.3.part"));

        let missing = FilesysInfoEntry::new("/data").with_temp_dir("/does/not/exist");
        let temp = temp_path_for(Path::new("/data/a.bin"), 3, Some(&missing), Path::new("/tmp"));
        assert_eq!(temp.unwrap(), PathBuf::from("/tmp/a.bin.3.part"));
    }

    #[test]
    fn test_same_file_name_gets_private_partial_per_job() {
        let scratch = Path::new("/tmp");
        let first = temp_path_for(Path::new("/a/f.bin"), 1, None, scratch).unwrap();
        let second = temp_path_for(Path::new("/b/f.bin"), 2, None, scratch).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_read_only_destination_is_remounted() {
        let mut fx = fixture(RecordingShell::failing(&["remount-ro"]), StaticProbe::read_only());
        let factory = ScriptedFactory::new([Reply::ok("ro")]);
        let spec = download_spec("http://origin/f", fx.path("f"));

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert_eq!(fx.shell.commands(), ["remount-rw", "remount-ro"]);
        assert!(notified(&mut job).result.success);
    }

    #[tokio::test]
    async fn test_canceled_upload_runs_post_action() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let source = fx.path("report.txt");
        std::fs::write(&source, "report").unwrap();
        let factory = ScriptedFactory::new([Reply::Cancel]);
        let policy = FilesysInfoEntry::new("/").with_post_action("true");
        let spec = upload_spec("http://server/up", source);

        let mut job = run(&mut fx, &factory, spec, Some(policy)).await;

        assert_eq!(factory.requests(), ["PUT http://server/up"]);
        assert!(job.history().contains(&JobState::RunningPostAction));
        let notification = notified(&mut job);
        assert_eq!(notification.result.kind, ResultKind::UploadFailure);
        assert_eq!(notification.result.message, "File upload has been canceled.");
    }

    #[tokio::test]
    async fn test_upload_missing_source() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::status(200)]);
        let spec = upload_spec("http://server/up", fx.path("nope"));

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert!(factory.requests().is_empty());
        assert_eq!(notified(&mut job).result.kind, ResultKind::NoSuchFileOrDirectory);
    }

    #[tokio::test]
    async fn test_upload_source_must_be_regular_file() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::status(200)]);
        let spec = upload_spec("http://server/up", fx.env.scratch_dir.clone());

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert!(factory.requests().is_empty());
        assert_eq!(notified(&mut job).result.kind, ResultKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_upload_success_leaves_syslog_marker() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let source = fx.path("logtemp");
        std::fs::write(&source, "log").unwrap();
        let factory = ScriptedFactory::new([Reply::status(201)]);
        let mut spec = upload_spec("http://server/logs", source);
        spec.model_name = ModelName::SyslogInfo;
        spec.follow_up = FollowUp::LeaveSyslogMarker;

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert_eq!(notified(&mut job).result.code, 201);
        assert_eq!(
            fx.marker.markers(),
            [("SyslogInfo".to_string(), "MARKER".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_marker() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let source = fx.path("logtemp");
        std::fs::write(&source, "log").unwrap();
        let factory = ScriptedFactory::new([Reply::status(500)]);
        let mut spec = upload_spec("http://server/logs", source);
        spec.follow_up = FollowUp::LeaveSyslogMarker;

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert_eq!(notified(&mut job).result.kind, ResultKind::UploadFailure);
        assert!(fx.marker.markers().is_empty());
    }

    fn apply_spec(destination: PathBuf) -> JobSpec {
        JobSpec {
            service_id: "urn:moat:xferd:deliver-config-result:1.0".to_string(),
            model_name: ModelName::ConfigurationInfo,
            follow_up: FollowUp::ApplyConfig,
            ..download_spec("http://origin/config.xml", destination)
        }
    }

    #[tokio::test]
    async fn test_config_apply_is_deferred() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::ok("<config/>")]);
        let spec = apply_spec(fx.path("config.xml"));

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert_eq!(job.take_outcome(), Some(JobOutcome::Deferred));
        assert_eq!(fx.shell.commands(), ["apply", "reboot"]);
        let record = fx.env.pending.load().await.unwrap().unwrap();
        assert_eq!(record.async_key, "key-1");
        assert_eq!(record.model_name, "ConfigurationInfo");
        assert!(record.result.success);
        assert_eq!(record.result.code, 200);
    }

    #[tokio::test]
    async fn test_reboot_failure_reports_now() {
        let mut fx = fixture(RecordingShell::failing(&["reboot"]), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::ok("<config/>")]);
        let spec = apply_spec(fx.path("config.xml"));

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert_eq!(notified(&mut job).result.kind, ResultKind::ExecuteCommandFailure);
        assert!(fx.env.pending.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_aborts_reboot() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let blocker = fx.path("blocker");
        std::fs::write(&blocker, "").unwrap();
        fx.env.pending = PendingStore::new(blocker.join("pending"));
        let factory = ScriptedFactory::new([Reply::ok("<config/>")]);
        let spec = apply_spec(fx.path("config.xml"));

        let mut job = run(&mut fx, &factory, spec, None).await;

        assert!(fx.shell.commands().is_empty());
        assert_eq!(notified(&mut job).result.kind, ResultKind::ExecuteCommandFailure);
    }

    #[tokio::test]
    async fn test_readiness_after_done_is_ignored() {
        let mut fx = fixture(RecordingShell::default(), StaticProbe::writable());
        let factory = ScriptedFactory::new([Reply::ok("x")]);
        let spec = download_spec("http://origin/f", fx.path("f"));

        let mut job = run(&mut fx, &factory, spec, None).await;
        let history = job.history().to_vec();

        job.on_io_ready(&fx.env, &mut fx.reactor).await;
        assert_eq!(job.history(), history.as_slice());
        assert!(fx.reactor.is_empty());
        assert!(job.take_outcome().is_some());
    }

    #[test]
    fn test_landing_failure_kinds() {
        let denied = XferError::MoveFailed {
            from: PathBuf::from("/tmp/a.part"),
            to: PathBuf::from("/etc/a"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(landing_failure_kind(&denied), ResultKind::PermissionDenied);

        let remount = XferError::command("remount-rw", "exit status: 1");
        assert_eq!(landing_failure_kind(&remount), ResultKind::RenameFailure);
    }
}
