//! Child-process capture shared by the emulator and physical runners.
//!
//! Both runners ultimately spawn a local program (`sh -c <template>` or
//! `ssh host <script>`) and need the same behaviour from it:
//!
//! - stdout and stderr merged into one line stream, forwarded to the
//!   execution's output callback as they arrive
//! - the whole process group killed when the kill token fires
//! - partial output drained for at most the grace period after a kill

use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

use super::{ExecContext, OutputCapture, OutputLine, ProviderError, ProviderResult};

/// What a finished (or killed) child process left behind.
#[derive(Debug)]
pub struct Captured {
    /// Exit code, or `None` if the process was killed.
    pub code: Option<i32>,
    pub output: OutputCapture,
    pub duration: Duration,
}

impl Captured {
    pub fn killed(&self) -> bool {
        self.code.is_none()
    }
}

/// Spawns `command` and captures its output until it exits or `ctx.kill` fires.
pub async fn run_captured(mut command: Command, ctx: &ExecContext) -> ProviderResult<Captured> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProviderError::ExecFailed("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProviderError::ExecFailed("stderr not captured".to_string()))?;

    let stdout_stream = SplitStream::new(BufReader::new(stdout).split(b'\n')).filter_map(|line| {
        futures::future::ready(line.ok().map(|l| OutputLine::Stdout(decode(l))))
    });
    let stderr_stream = SplitStream::new(BufReader::new(stderr).split(b'\n')).filter_map(|line| {
        futures::future::ready(line.ok().map(|l| OutputLine::Stderr(decode(l))))
    });
    let mut lines = Box::pin(stream::select(stdout_stream, stderr_stream));

    let mut output = OutputCapture::default();

    let mut killed = loop {
        tokio::select! {
            biased;
            _ = ctx.kill.cancelled() => break true,
            line = lines.next() => match line {
                Some(line) => {
                    ctx.emit(&line);
                    output.push(line);
                }
                None => break false,
            },
        }
    };

    let mut code = None;
    if !killed {
        tokio::select! {
            biased;
            _ = ctx.kill.cancelled() => killed = true,
            status = child.wait() => code = status?.code(),
        }
    }

    if killed {
        kill_group(&mut child).await;

        // keep whatever the dying process still flushes
        let drained = tokio::time::timeout(ctx.grace, async {
            while let Some(line) = lines.next().await {
                output.push(line);
            }
        })
        .await;
        if drained.is_err() {
            debug!("Output drain exceeded grace period");
        }
        if tokio::time::timeout(ctx.grace, child.wait()).await.is_err() {
            warn!(pid = ?child.id(), "Killed process did not exit within grace period");
        }
    }

    Ok(Captured {
        code,
        output,
        duration: start.elapsed(),
    })
}

/// Decodes one output line, replacing invalid UTF-8 rather than losing it.
fn decode(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Output of a short lifecycle command (launch, reset, health, destroy).
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a lifecycle command to completion, bounded by `timeout`.
pub async fn run_bounded(mut command: Command, timeout: Duration) -> ProviderResult<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| {
            ProviderError::Timeout(format!("Command timed out after {}s", timeout.as_secs()))
        })?
        .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Builds `shell -c script`.
pub fn shell(shell: &str, script: &str) -> Command {
    let mut command = Command::new(shell);
    command.arg("-c").arg(script);
    command
}

/// Kills the child's whole process group, falling back to the child alone.
async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let status = Command::new("kill")
                .args(["-KILL", "--", &format!("-{pid}")])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if matches!(status, Ok(s) if s.success()) {
                return;
            }
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to kill child process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let ctx = ExecContext::new(CancellationToken::new(), Duration::from_secs(1));
        let captured = run_captured(sh("echo out; echo err >&2; exit 3"), &ctx)
            .await
            .unwrap();

        assert_eq!(captured.code, Some(3));
        assert_eq!(captured.output.stdout, "out\n");
        assert_eq!(captured.output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_kill_keeps_partial_output() {
        let kill = CancellationToken::new();
        let ctx = ExecContext::new(kill.clone(), Duration::from_secs(1));

        let trigger = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let captured = run_captured(sh("echo started; sleep 30; echo never"), &ctx)
            .await
            .unwrap();

        assert!(captured.killed());
        assert!(captured.output.stdout.contains("started"));
        assert!(!captured.output.stdout.contains("never"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_callback_sees_lines() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = ExecContext::new(CancellationToken::new(), Duration::from_secs(1))
            .with_output(Arc::new(move |line: &OutputLine| {
                sink.lock().unwrap().push(line.text().to_string());
            }));

        run_captured(sh("echo a; echo b"), &ctx).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_lines_are_kept() {
        let ctx = ExecContext::new(CancellationToken::new(), Duration::from_secs(1));
        let captured = run_captured(sh("printf 'one\\n\\377\\376bad\\r\\ntwo\\n'"), &ctx)
            .await
            .unwrap();

        let lines: Vec<&str> = captured.output.stdout.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "one");
        assert_eq!(lines[1], "\u{FFFD}\u{FFFD}bad");
        assert_eq!(lines[2], "two");
    }

    #[tokio::test]
    async fn test_bounded_command_times_out() {
        let err = run_bounded(sh("sleep 5"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let ok = run_bounded(shell("sh", "echo ready"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "ready");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_exec_error() {
        let ctx = ExecContext::new(CancellationToken::new(), Duration::from_secs(1));
        let err = run_captured(Command::new("/definitely/not/here"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ExecFailed(_)));
    }
}
