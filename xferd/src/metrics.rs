use anyhow::Result;
use prometheus::{Counter, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub jobs_total: Counter,
    pub jobs_active: Gauge,
    pub jobs_succeeded: Counter,
    pub jobs_failed: Counter,
    pub jobs_deferred: Counter,
    pub redirects_total: Counter,
    pub bytes_landed_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let jobs_total = Counter::new("xferd_jobs_total", "Total number of transfer jobs created")?;
        let jobs_active = Gauge::new("xferd_jobs_active", "Number of transfer jobs in flight")?;
        let jobs_succeeded =
            Counter::new("xferd_jobs_succeeded_total", "Jobs that reported success")?;
        let jobs_failed = Counter::new("xferd_jobs_failed_total", "Jobs that reported failure")?;
        let jobs_deferred = Counter::new(
            "xferd_jobs_deferred_total",
            "Config-apply jobs whose result is reported after reboot",
        )?;
        let redirects_total = Counter::new("xferd_redirects_total", "HTTP redirects followed")?;
        let bytes_landed_total =
            Counter::new("xferd_bytes_landed_total", "Bytes copied to final destinations")?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(jobs_active.clone()))?;
        registry.register(Box::new(jobs_succeeded.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(jobs_deferred.clone()))?;
        registry.register(Box::new(redirects_total.clone()))?;
        registry.register(Box::new(bytes_landed_total.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            jobs_active,
            jobs_succeeded,
            jobs_failed,
            jobs_deferred,
            redirects_total,
            bytes_landed_total,
        })
    }

    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_job_created(&self) {
        self.jobs_total.inc();
        self.jobs_active.inc();
    }

    pub fn record_job_finished(&self, success: bool, redirects: u32, bytes_landed: u64) {
        if success {
            self.jobs_succeeded.inc();
        } else {
            self.jobs_failed.inc();
        }
        self.jobs_active.dec();
        self.redirects_total.inc_by(f64::from(redirects));
        self.bytes_landed_total.inc_by(bytes_landed as f64);
    }

    pub fn record_job_deferred(&self, redirects: u32, bytes_landed: u64) {
        self.jobs_deferred.inc();
        self.jobs_active.dec();
        self.redirects_total.inc_by(f64::from(redirects));
        self.bytes_landed_total.inc_by(bytes_landed as f64);
    }

    /// Results that never had a job, e.g. a syslog collection that failed.
    pub fn record_rejected(&self) {
        self.jobs_total.inc();
        self.jobs_failed.inc();
    }
}
