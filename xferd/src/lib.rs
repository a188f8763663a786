pub mod action;
pub mod agent;
pub mod config;
pub mod daemon;
pub mod error;
pub mod job;
pub mod manifest;
pub mod metrics;
pub mod mover;
pub mod notify;
pub mod pending;
pub mod policy;
pub mod probe;
pub mod reactor;
pub mod result;
pub mod shell;
pub mod syslog;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use action::{ActionObserver, ActionRunner};
pub use agent::{Agent, Collaborators};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{XferError, XferResult};
pub use job::{JobOutcome, JobState, TransferJob};
pub use mover::FileMover;
pub use notify::Notifier;
pub use policy::{FilesysInfoEntry, FilesysKind, PolicyTable};
pub use probe::FsProbe;
pub use reactor::Reactor;
pub use result::ResultCodeTracker;
pub use shell::Shell;
pub use syslog::MarkerWriter;
pub use transport::{Transport, TransportFactory};

// Expose the protocol crate directly (e.g. xferd::protocol::CommandRequest)
pub use xferd_protocol as protocol;
