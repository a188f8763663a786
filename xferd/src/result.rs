use crate::error::XferError;
use tracing::debug;
use xferd_protocol::{FileResult, ResultKind, SUCCESS_MESSAGE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCode {
    pub kind: ResultKind,
    pub message: String,
}

/// First-write-wins record of a job's terminal result.
#[derive(Debug, Clone, Default)]
pub struct ResultCodeTracker {
    code: Option<ResultCode>,
}

impl ResultCodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `kind` unless a code is already present and `overwrite` is
    /// false. Returns whether the code was stored.
    pub fn store(&mut self, kind: ResultKind, message: impl Into<String>, overwrite: bool) -> bool {
        let message = message.into();
        if let Some(existing) = &self.code {
            if !overwrite {
                debug!(
                    "Keeping {} ({}); dropping {} ({})",
                    existing.kind, existing.message, kind, message
                );
                return false;
            }
        }
        self.code = Some(ResultCode { kind, message });
        true
    }

    pub fn record_error(&mut self, err: &XferError) -> bool {
        self.store(err.kind(), err.to_string(), false)
    }

    pub fn get(&self) -> Option<&ResultCode> {
        self.code.as_ref()
    }

    pub fn is_failure(&self) -> bool {
        self.code.as_ref().is_some_and(|code| !code.kind.is_success())
    }

    /// The outcome to report; an empty tracker means success.
    pub fn resolved(&self) -> ResultCode {
        self.code.clone().unwrap_or_else(|| ResultCode {
            kind: ResultKind::Success,
            message: SUCCESS_MESSAGE.to_string(),
        })
    }

    pub fn to_file_result(&self, status_code: Option<u16>) -> FileResult {
        let code = self.resolved();
        if code.kind.is_success() {
            FileResult::success(status_code.unwrap_or(200))
        } else {
            FileResult::failure(code.kind, code.message)
        }
    }
}
