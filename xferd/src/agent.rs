use crate::action::ActionRunner;
use crate::config::{Config, SyslogConfig};
use crate::error::XferError;
use crate::job::{Direction, FollowUp, JobEnv, JobOutcome, JobSpec, TransferJob};
use crate::metrics::Metrics;
use crate::mover::FileMover;
use crate::notify::{Notifier, OutboxNotifier};
use crate::pending::PendingStore;
use crate::policy::PolicyTable;
use crate::probe::{FsProbe, SystemProbe};
use crate::reactor::{JobId, Reactor};
use crate::shell::{Shell, SystemShell};
use crate::syslog::{self, FileMarkerWriter, MarkerWriter, SyslogMarkerWriter};
use crate::transport::{HttpTransportFactory, TransportFactory};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use xferd_protocol::{service_id, Command, CommandRequest, FileResult, Notification};

/// External collaborators the agent drives jobs through.
pub struct Collaborators {
    pub shell: Arc<dyn Shell>,
    pub probe: Arc<dyn FsProbe>,
    pub transports: Arc<dyn TransportFactory>,
    pub notifier: Arc<dyn Notifier>,
    pub marker: Arc<dyn MarkerWriter>,
    pub actions: ActionRunner,
}

impl Collaborators {
    /// The real system: `sh`, mount probing, HTTP, the outbox and syslog.
    pub fn system(config: &Config) -> Result<Self> {
        let marker: Arc<dyn MarkerWriter> = match &config.syslog.marker_sink {
            Some(path) => Arc::new(FileMarkerWriter::new(path)),
            None => Arc::new(SyslogMarkerWriter),
        };
        Ok(Self {
            shell: Arc::new(SystemShell),
            probe: Arc::new(SystemProbe::new(&config.storage)),
            transports: Arc::new(HttpTransportFactory::new()?),
            notifier: Arc::new(OutboxNotifier::new(&config.outbox_path)),
            marker,
            actions: ActionRunner::default(),
        })
    }
}

/// Owns every in-flight job together with the reactor and policy table.
/// Only the daemon's single control loop touches it.
pub struct Agent {
    config: Config,
    env: JobEnv,
    policy: PolicyTable,
    transports: Arc<dyn TransportFactory>,
    notifier: Arc<dyn Notifier>,
    reactor: Reactor,
    jobs: BTreeMap<JobId, TransferJob>,
    next_id: JobId,
    recent: VecDeque<Notification>,
    metrics: Metrics,
}

impl Agent {
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        let policy = PolicyTable::load(&config.filesystem_config).await;
        Self::with_policy(config, policy, collaborators)
    }

    pub fn with_policy(
        config: Config,
        policy: PolicyTable,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let Collaborators { shell, probe, transports, notifier, marker, actions } = collaborators;

        let env = JobEnv {
            actions,
            mover: FileMover::new(&config.storage, probe, shell.clone()),
            shell,
            pending: PendingStore::new(&config.pending_dir),
            marker,
            scratch_dir: config.scratch_dir.clone(),
            max_redirects: config.max_redirects,
            apply_command: config.storage.apply_command.clone(),
            reboot_command: config.device.reboot_command.clone(),
            syslog_marker: config.syslog.marker.clone(),
        };

        Ok(Self {
            config,
            env,
            policy,
            transports,
            notifier,
            reactor: Reactor::new(),
            jobs: BTreeMap::new(),
            next_id: 1,
            recent: VecDeque::new(),
            metrics: Metrics::new().context("Failed to register metrics")?,
        })
    }

    /// Accepts a command and starts its job. Returns the async key the
    /// result will be reported under; an error means the request was
    /// rejected outright and no notification will follow.
    pub async fn submit(&mut self, request: CommandRequest) -> Result<String> {
        let CommandRequest { uid, async_key, command } = request;

        if async_key.is_empty() {
            anyhow::bail!("asyncKey is required");
        }
        if self.jobs.values().any(|job| job.async_key() == async_key) {
            anyhow::bail!("A job with asyncKey {} is already running", async_key);
        }

        let service_id = service_id(&self.config.app_id, command.result_service());
        let model_name = command.model();
        info!("[{}] {} requested by {}", async_key, command.name(), uid);

        let (direction, remote, local, follow_up) = match command {
            Command::Download { delivery_url, destination_path } => (
                Direction::Download,
                delivery_url,
                destination_path.map(PathBuf::from),
                FollowUp::None,
            ),
            Command::Upload { upload_url, source_path } => (
                Direction::Upload,
                upload_url,
                source_path.map(PathBuf::from),
                FollowUp::None,
            ),
            Command::DownloadAndApply { delivery_url } => (
                Direction::Download,
                delivery_url,
                Some(self.config.device.config_file.clone()),
                FollowUp::ApplyConfig,
            ),
            Command::UploadConfig { upload_url } => (
                Direction::Upload,
                upload_url,
                Some(self.config.device.config_file.clone()),
                FollowUp::None,
            ),
            Command::SyslogUpload { upload_url, max_logs } => {
                // Every collection rewrites the same packed file.
                let running = self.jobs.values().find(|job| job.spec().model_name == model_name);
                if let Some(job) = running {
                    anyhow::bail!(
                        "A syslog upload is already running under asyncKey {}",
                        job.async_key()
                    );
                }
                if upload_url.is_some() {
                    if let Err(e) = collect_syslog(&self.config.syslog, max_logs).await {
                        error!("[{}] Syslog collection failed: {}", async_key, e);
                        self.metrics.record_rejected();
                        self.emit(Notification {
                            service_id,
                            async_key: async_key.clone(),
                            model_name: model_name.as_str().to_string(),
                            result: FileResult::failure(e.kind(), e.to_string()),
                            timestamp: Utc::now(),
                        });
                        return Ok(async_key);
                    }
                }
                (
                    Direction::Upload,
                    upload_url,
                    Some(self.config.syslog.packed_path.clone()),
                    FollowUp::LeaveSyslogMarker,
                )
            }
        };

        let policy = local
            .as_deref()
            .and_then(|path| self.policy.resolve(&path.to_string_lossy()).cloned());

        let spec = JobSpec {
            async_key: async_key.clone(),
            uid,
            service_id,
            model_name,
            direction,
            remote,
            local,
            follow_up,
        };

        let id = self.next_id;
        self.next_id += 1;
        let mut job = TransferJob::new(id, spec, policy, self.transports.create());
        self.metrics.record_job_created();

        job.start(&self.env, &mut self.reactor).await;
        self.jobs.insert(id, job);
        self.reap();

        Ok(async_key)
    }

    /// Drives every job whose transport is waiting on readiness.
    pub async fn poll(&mut self) {
        for id in self.reactor.ready() {
            match self.jobs.get_mut(&id) {
                Some(job) => job.on_io_ready(&self.env, &mut self.reactor).await,
                None => {
                    warn!("Dropping readiness subscription of unknown job {}", id);
                    self.reactor.unsubscribe(id);
                }
            }
        }
        self.reap();
    }

    fn reap(&mut self) {
        let done: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.is_done())
            .map(|(id, _)| *id)
            .collect();

        for id in done {
            let Some(mut job) = self.jobs.remove(&id) else {
                continue;
            };
            match job.take_outcome() {
                Some(JobOutcome::Notify(notification)) => {
                    self.metrics.record_job_finished(
                        notification.result.success,
                        job.redirects(),
                        job.bytes_landed(),
                    );
                    self.emit(notification);
                }
                Some(JobOutcome::Deferred) => {
                    self.metrics.record_job_deferred(job.redirects(), job.bytes_landed());
                }
                None => warn!("[{}] Finished without an outcome", job.async_key()),
            }
        }
    }

    fn emit(&mut self, notification: Notification) {
        if let Err(e) = self.notifier.send(&notification) {
            error!("[{}] Failed to send notification: {:#}", notification.async_key, e);
        }
        self.recent.push_back(notification);
        while self.recent.len() > self.config.recent_results {
            self.recent.pop_front();
        }
    }

    /// Sends the result a config apply left behind before the last reboot.
    pub async fn deliver_pending_apply(&mut self) -> Result<bool> {
        let Some(record) = self.env.pending.load().await? else {
            return Ok(false);
        };

        let notification = record.into_notification();
        self.notifier
            .send(&notification)
            .with_context(|| {
                format!("Failed to deliver pending result {}", notification.async_key)
            })?;
        self.env.pending.remove().await?;

        info!("[{}] Delivered pending config result", notification.async_key);
        self.recent.push_back(notification);
        Ok(true)
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// The newest `limit` notifications, oldest first.
    pub fn recent_results(&self, limit: usize) -> Vec<Notification> {
        let skip = self.recent.len().saturating_sub(limit);
        self.recent.iter().skip(skip).cloned().collect()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }
}

/// Packs the unread log tail into the file the upload job sends.
async fn collect_syslog(syslog: &SyslogConfig, max_logs: Option<i32>) -> Result<(), XferError> {
    let count = max_logs.unwrap_or(syslog.max_generations);
    if count > syslog.max_generations {
        return Err(XferError::invalid_argument(
            "maxLogs",
            format!("{} exceeds the configured limit of {}", count, syslog.max_generations),
        ));
    }
    syslog::collect(&syslog.log_path, count, &syslog.marker, &syslog.packed_path).await?;
    Ok(())
}
