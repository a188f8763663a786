use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Receives the streamed output and the terminal outcome of one action.
pub trait ActionObserver {
    fn on_output_line(&mut self, line: &str);
    fn on_complete(&mut self, exit_code: i32);
    fn on_error(&mut self, code: i32, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Pre,
    Post,
}

impl fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ActionPhase::Pre => f.write_str("pre-action"),
            ActionPhase::Post => f.write_str("post-action"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    Failed { code: i32, message: String },
}

/// Observer owned by a job: logs every output line and keeps the outcome.
#[derive(Debug)]
pub struct ActionTrace {
    job_key: String,
    phase: ActionPhase,
    lines: Vec<String>,
    outcome: Option<ActionOutcome>,
}

impl ActionTrace {
    pub fn new(job_key: &str, phase: ActionPhase) -> Self {
        Self {
            job_key: job_key.to_string(),
            phase,
            lines: Vec::new(),
            outcome: None,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The recorded outcome; an action that never reported is a failure.
    pub fn outcome(&self) -> ActionOutcome {
        self.outcome.clone().unwrap_or(ActionOutcome::Failed {
            code: -1,
            message: format!("{} did not report completion", self.phase),
        })
    }
}

impl ActionObserver for ActionTrace {
    fn on_output_line(&mut self, line: &str) {
        info!("[{}] {}: {}", self.job_key, self.phase, line);
        self.lines.push(line.to_string());
    }

    fn on_complete(&mut self, exit_code: i32) {
        self.outcome = Some(if exit_code == 0 {
            ActionOutcome::Succeeded
        } else {
            ActionOutcome::Failed {
                code: exit_code,
                message: format!("{} exited with status {}", self.phase, exit_code),
            }
        });
    }

    fn on_error(&mut self, code: i32, message: &str) {
        self.outcome = Some(ActionOutcome::Failed {
            code,
            message: format!("{} could not be executed: {}", self.phase, message),
        });
    }
}

/// Runs configured pre/post action commands with streamed stdout.
#[derive(Debug, Clone)]
pub struct ActionRunner {
    shell: String,
}

impl Default for ActionRunner {
    fn default() -> Self {
        Self { shell: "sh".to_string() }
    }
}

impl ActionRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }

    /// Runs `command`, reporting exactly one of `on_complete` or `on_error`.
    pub async fn run<O>(&self, command: &str, observer: &mut O)
    where
        O: ActionObserver + ?Sized,
    {
        debug!("Spawning action: {}", command);

        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                observer.on_error(e.raw_os_error().unwrap_or(-1), &e.to_string());
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => observer.on_output_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read action output: {}", e);
                        break;
                    }
                }
            }
        }

        match child.wait().await {
            Ok(status) => match status.code() {
                Some(code) => observer.on_complete(code),
                None => observer.on_error(-1, "terminated by signal"),
            },
            Err(e) => observer.on_error(e.raw_os_error().unwrap_or(-1), &e.to_string()),
        }
    }
}
