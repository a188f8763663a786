use crate::error::{XferError, XferResult};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Synchronous command execution used for remount, apply and reboot.
pub trait Shell: Send + Sync {
    fn run(&self, command: &str) -> XferResult<()>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct SystemShell;

impl Shell for SystemShell {
    fn run(&self, command: &str) -> XferResult<()> {
        info!("Executing: {}", command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| XferError::command(command, e.to_string()))?;

        if !output.stdout.is_empty() {
            debug!("`{}` stdout: {}", command, String::from_utf8_lossy(&output.stdout).trim_end());
        }

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(XferError::command(
                command,
                format!("{} {}", output.status, stderr.trim_end()).trim_end().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xferd_protocol::ResultKind;

    #[test]
    fn test_zero_exit_is_success() {
        assert!(SystemShell.run("true").is_ok());
    }

    #[test]
    fn test_non_zero_exit_is_command_failure() {
        let err = SystemShell.run("echo oops >&2; exit 3").unwrap_err();
        assert_eq!(err.kind(), ResultKind::ExecuteCommandFailure);
        let message = err.to_string();
        assert!(message.contains("exit status: 3"), "{}", message);
        assert!(message.contains("oops"), "{}", message);
    }
}
