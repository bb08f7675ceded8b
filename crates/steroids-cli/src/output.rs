//! Output modes and the exit-code contract.
//!
//! Exit codes: 0 success, 1 general error, 3 NOT_INITIALIZED (project
//! database missing), 6 RESOURCE_LOCKED. In `--json` mode every command
//! writes exactly one object to stdout:
//! `{"success":true,"data":...}` or
//! `{"success":false,"error":{"code":...,"message":...}}`.

use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("project at {0} is not initialized (run `steroids init --project {0}`)")]
    NotInitialized(String),
    #[error("resource locked: {0}")]
    ResourceLocked(String),
    #[error(transparent)]
    General(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotInitialized(_) => 3,
            Self::ResourceLocked(_) => 6,
            Self::General(_) => 1,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "NOT_INITIALIZED",
            Self::ResourceLocked(_) => "RESOURCE_LOCKED",
            Self::General(_) => "GENERAL_ERROR",
        }
    }
}

/// Print a command's successful result. `human` renders the plain-text
/// form; in `--json` mode only the data object is written.
pub fn emit_success(json_mode: bool, data: serde_json::Value, human: impl FnOnce()) {
    if json_mode {
        let envelope = json!({ "success": true, "data": data });
        println!("{envelope}");
    } else {
        human();
    }
}

/// Print a failure envelope (json mode) or a human error line, then
/// return the exit code to pass to `std::process::exit`.
pub fn emit_failure(json_mode: bool, error: &CliError) -> i32 {
    if json_mode {
        let envelope = json!({
            "success": false,
            "error": { "code": error.code(), "message": error.to_string() },
        });
        println!("{envelope}");
    } else {
        eprintln!("error: {error:#}");
    }
    error.exit_code()
}
