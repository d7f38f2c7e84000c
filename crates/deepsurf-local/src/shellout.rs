//! Bounded shellouts to local CLIs (`yt-dlp`, `node`).

use deepsurf_core::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub fn which(bin: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(bin);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|cand| cand.is_file())
}

pub fn has(bin: &str) -> bool {
    which(bin).is_some()
}

/// Run a command and capture at most `max_stdout_bytes` of stdout, killing it at `timeout`.
pub async fn run_stdout_bounded(
    mut cmd: tokio::process::Command,
    timeout: Duration,
    max_stdout_bytes: usize,
) -> Result<Vec<u8>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotConfigured(format!("tool not found: {e}"))
        } else {
            Error::Fetch(format!("spawn failed: {e}"))
        }
    })?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Fetch("missing stdout pipe".to_string()))?;

    let run = async {
        let mut out = Vec::new();
        (&mut stdout)
            .take(max_stdout_bytes as u64)
            .read_to_end(&mut out)
            .await
            .map_err(|e| Error::Fetch(format!("read failed: {e}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| Error::Fetch(format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(Error::Fetch(format!("exited with {status}")));
        }
        Ok(out)
    };
    match tokio::time::timeout(timeout, run).await {
        Ok(r) => r,
        Err(_) => Err(Error::Timeout(format!(
            "command exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binaries_are_not_found() {
        assert!(!has("deepsurf-definitely-not-a-real-binary"));
        assert!(which("/nonexistent/dir/tool").is_none());
    }

    #[tokio::test]
    async fn spawning_a_missing_tool_is_not_configured() {
        let cmd = tokio::process::Command::new("deepsurf-definitely-not-a-real-binary");
        let err = run_stdout_bounded(cmd, Duration::from_secs(1), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }
}
