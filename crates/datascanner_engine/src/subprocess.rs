//! Dispatch to external conversion and mount programs.

use crate::error::{EngineError, Result};
use std::ffi::OsStr;
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// Runs `program` to completion and returns its output. A missing binary or
/// a non-zero exit status is reported as the resource being unavailable,
/// attributed to `what`.
pub fn run<I, S>(program: &str, args: I, what: &str) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!(program, what, "Running external program");

    let output = cmd.output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::unavailable(what, format!("'{}' is not installed", program))
        } else {
            EngineError::unavailable(what, format!("failed to spawn '{}': {}", program, e))
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::unavailable(
            what,
            format!("'{}' exited with {}: {}", program, output.status, stderr.trim()),
        ));
    }
    Ok(output)
}
