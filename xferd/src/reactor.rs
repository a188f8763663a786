use std::collections::BTreeSet;
use tracing::debug;

pub type JobId = u64;

/// Readiness bus for in-flight transfers. A job is driven only while it is
/// subscribed; the owner of the event loop owns the reactor.
#[derive(Debug, Default)]
pub struct Reactor {
    subscribers: BTreeSet<JobId>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, job: JobId) -> bool {
        let added = self.subscribers.insert(job);
        if added {
            debug!("Job {} subscribed to I/O readiness", job);
        }
        added
    }

    pub fn unsubscribe(&mut self, job: JobId) -> bool {
        let removed = self.subscribers.remove(&job);
        if removed {
            debug!("Job {} unsubscribed from I/O readiness", job);
        }
        removed
    }

    pub fn is_subscribed(&self, job: JobId) -> bool {
        self.subscribers.contains(&job)
    }

    /// Snapshot of the jobs to notify on this tick.
    pub fn ready(&self) -> Vec<JobId> {
        self.subscribers.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
