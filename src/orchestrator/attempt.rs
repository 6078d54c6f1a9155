//! One attempt of one test, from allocation to release.
//!
//! ```text
//! allocating ──► select runner ──► running ──► execute under watchdog
//!                                                   │
//!                     classify ◄────────────────────┘
//!                        │
//!        record result (or retry) ──► cleanup ──► release
//! ```
//!
//! The terminal state is recorded before the environment is released, so a
//! second attempt can never be `running` on the same environment while this
//! one still is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Shared;
use super::retry::RetryPolicy;
use crate::model::{EnvironmentId, TestKey, TestResult, TestSpec, TestState};
use crate::pool::Environment;
use crate::provider::{
    ExecContext, Execution, ExitStatus, OutputCallback, OutputCapture, OutputLine, ProviderError,
    Runner, parse_progress,
};
use crate::queue::QueuedTest;
use crate::tracker::StatusDetails;

/// How a runner invocation ended, before classification.
///
/// When the runner produced no [`Execution`], the output it streamed before
/// failing is carried along so the result still shows it.
#[derive(Debug)]
pub(crate) enum Ended {
    Execution(Execution),
    Failed(ProviderError, OutputCapture),
    /// The runner did not return within the grace period after being killed.
    Unresponsive(OutputCapture),
}

impl Ended {
    fn stderr(&self) -> &str {
        match self {
            Ended::Execution(execution) => &execution.stderr,
            Ended::Failed(_, partial) | Ended::Unresponsive(partial) => &partial.stderr,
        }
    }
}

/// Terminal classification of an attempt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outcome {
    pub state: TestState,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub transient: bool,
}

impl Outcome {
    fn new(state: TestState, message: impl Into<String>) -> Self {
        Self {
            state,
            exit_code: None,
            message: Some(message.into()),
            transient: false,
        }
    }
}

/// Maps how the runner ended onto a terminal state.
///
/// An `error` outcome is transient when the runner says so or when a
/// configured pattern matches its message or the captured stderr.
pub(crate) fn classify(
    ended: &Ended,
    timed_out: bool,
    cancelled: bool,
    deadline: Duration,
    policy: &RetryPolicy,
) -> Outcome {
    let stderr = ended.stderr();
    let error = |message: String, transient: bool| {
        let transient = transient || policy.matches(&[message.as_str(), stderr]);
        Outcome {
            transient,
            ..Outcome::new(TestState::Error, message)
        }
    };
    let killed = |what: &str| {
        if timed_out {
            Outcome::new(
                TestState::Timeout,
                format!("deadline of {}s exceeded{what}", deadline.as_secs()),
            )
        } else if cancelled {
            Outcome::new(TestState::Cancelled, format!("cancelled while running{what}"))
        } else {
            error(format!("killed{what}"), false)
        }
    };

    match ended {
        Ended::Execution(execution) => match &execution.exit {
            ExitStatus::Exited(0) => Outcome {
                state: TestState::Completed,
                exit_code: Some(0),
                message: None,
                transient: false,
            },
            ExitStatus::Exited(code) => Outcome {
                state: TestState::Failed,
                exit_code: Some(*code),
                message: Some(format!("exited with status {code}")),
                transient: false,
            },
            ExitStatus::Killed => killed(""),
            ExitStatus::Disconnected(reason) => {
                error(format!("runner disconnected: {reason}"), true)
            }
        },
        Ended::Unresponsive(_) => killed("; runner did not stop"),
        Ended::Failed(e, _) => error(e.to_string(), e.is_transient()),
    }
}

fn build_result(
    key: &TestKey,
    attempt: u32,
    environment: &EnvironmentId,
    outcome: Outcome,
    ended: Ended,
    elapsed: Duration,
) -> TestResult {
    let (stdout, stderr, artifacts, usage, duration) = match ended {
        Ended::Execution(execution) => {
            let usage = execution.usage();
            (
                execution.stdout,
                execution.stderr,
                execution.artifacts,
                usage,
                execution.duration,
            )
        }
        Ended::Failed(_, partial) | Ended::Unresponsive(partial) => {
            let usage = crate::model::ResourceUsage {
                wall_clock_ms: elapsed.as_millis() as u64,
                stdout_bytes: partial.stdout.len() as u64,
                stderr_bytes: partial.stderr.len() as u64,
            };
            (partial.stdout, partial.stderr, Vec::new(), usage, elapsed)
        }
    };

    TestResult {
        key: key.clone(),
        attempt,
        environment: Some(environment.clone()),
        state: outcome.state,
        exit_code: outcome.exit_code,
        stdout,
        stderr,
        duration_ms: duration.as_millis() as u64,
        artifacts,
        usage,
        message: outcome.message,
        finished_at: Utc::now(),
    }
}

/// A result for an attempt that never reached a runner.
fn unstarted_result(
    queued: &QueuedTest,
    environment: Option<&EnvironmentId>,
    state: TestState,
    message: impl Into<String>,
) -> TestResult {
    TestResult {
        key: queued.key.clone(),
        attempt: queued.attempt,
        environment: environment.cloned(),
        state,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: 0,
        artifacts: Vec::new(),
        usage: Default::default(),
        message: Some(message.into()),
        finished_at: Utc::now(),
    }
}

/// Terminates a queued attempt that never got an environment.
pub(crate) fn abandon(shared: &Shared, queued: &QueuedTest, message: &str) {
    let details = StatusDetails::message(message);
    if let Err(e) = shared
        .tracker
        .update(&queued.key, queued.attempt, TestState::Allocating, details)
    {
        debug!(test = %queued.key, error = %e, "Not abandoning attempt");
        return;
    }
    let result = unstarted_result(queued, None, TestState::Error, message);
    if let Err(e) = shared.tracker.record_result(result) {
        error!(test = %queued.key, error = %e, "Failed to record result");
    }
    warn!(test = %queued.key, "{}", message);
}

fn release(shared: &Shared, environment: &EnvironmentId, clean: bool) {
    if let Err(e) = shared.resources.release(environment, clean) {
        error!(environment = %environment, error = %e, "Failed to release environment");
    }
}

/// Tracks progress markers, mirrors output when streaming is on, and keeps
/// a copy in `partial` for runners that fail before returning an execution.
fn output_callback(
    shared: &Arc<Shared>,
    key: &TestKey,
    attempt: u32,
    partial: Arc<Mutex<OutputCapture>>,
) -> OutputCallback {
    let shared = shared.clone();
    let key = key.clone();
    Arc::new(move |line: &OutputLine| {
        partial
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.clone());
        if let Some(progress) = parse_progress(line.text()) {
            let _ = shared.tracker.set_progress(&key, attempt, progress, None);
        }
        if shared.config.stream_output {
            match line {
                OutputLine::Stdout(s) => println!("[{}] {}", key, s),
                OutputLine::Stderr(s) => eprintln!("[{}] {}", key, s),
            }
        }
    })
}

/// Drives `queued` on `environment`, which the caller has already allocated.
pub(crate) async fn run(shared: Arc<Shared>, queued: QueuedTest, environment: Environment) {
    let key = queued.key.clone();
    let attempt = queued.attempt;

    let Some(spec) = shared.tracker.test_spec(&key) else {
        warn!(test = %key, "Claimed test has no spec, dropping");
        release(&shared, &environment.id, true);
        return;
    };

    if let Err(e) = shared.tracker.update(
        &key,
        attempt,
        TestState::Allocating,
        StatusDetails::environment(environment.id.clone()),
    ) {
        // cancelled or superseded between claim and start
        debug!(test = %key, error = %e, "Attempt no longer runnable");
        release(&shared, &environment.id, true);
        return;
    }

    let plan_token = shared.plan_token(&key.plan);
    if plan_token.is_cancelled() {
        let result = unstarted_result(
            &queued,
            Some(&environment.id),
            TestState::Cancelled,
            "cancelled before start",
        );
        finish(&shared, result, None);
        release(&shared, &environment.id, true);
        return;
    }

    let runner = match shared.resources.dispatcher().select(&spec, &environment) {
        Ok(runner) => runner,
        Err(e) => {
            error!(test = %key, error = %e, "No runner for environment");
            let result =
                unstarted_result(&queued, Some(&environment.id), TestState::Error, e.to_string());
            finish(&shared, result, None);
            release(&shared, &environment.id, true);
            return;
        }
    };

    if let Err(e) = shared.tracker.update(
        &key,
        attempt,
        TestState::Running,
        StatusDetails::environment(environment.id.clone()),
    ) {
        error!(test = %key, error = %e, "Failed to mark test running");
        let result =
            unstarted_result(&queued, Some(&environment.id), TestState::Error, e.to_string());
        finish(&shared, result, None);
        release(&shared, &environment.id, true);
        return;
    }

    info!(
        test = %key,
        attempt,
        environment = %environment.id,
        backend = %environment.backend,
        "Running test"
    );

    let deadline = spec
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| shared.config.test_timeout());
    let (ended, timed_out, elapsed) =
        execute(&shared, runner.as_ref(), &spec, &plan_token, &key, attempt, deadline).await;

    let outcome = classify(
        &ended,
        timed_out,
        plan_token.is_cancelled(),
        deadline,
        &shared.retry,
    );
    info!(
        test = %key,
        attempt,
        state = %outcome.state,
        duration_ms = elapsed.as_millis() as u64,
        "Test finished"
    );

    let retry = !plan_token.is_cancelled()
        && shared
            .retry
            .should_retry(attempt, outcome.state, outcome.transient);
    if outcome.transient && !retry && attempt > shared.retry.max_retries() {
        warn!(
            test = %key,
            attempt,
            max_retries = shared.retry.max_retries(),
            "Transient failure with no retries left"
        );
    }
    let result = build_result(&key, attempt, &environment.id, outcome, ended, elapsed);
    finish(&shared, result, Some(retry));

    let clean = match tokio::time::timeout(shared.config.release_timeout(), runner.cleanup()).await
    {
        Ok(clean) => clean,
        Err(_) => {
            warn!(environment = %environment.id, "Cleanup did not finish in time");
            false
        }
    };
    release(&shared, &environment.id, clean);
}

/// Runs the test with a deadline watchdog and a hard stop for runners that
/// ignore their kill token.
async fn execute(
    shared: &Arc<Shared>,
    runner: &dyn Runner,
    spec: &TestSpec,
    plan_token: &CancellationToken,
    key: &TestKey,
    attempt: u32,
    deadline: Duration,
) -> (Ended, bool, Duration) {
    let kill = plan_token.child_token();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog = tokio::spawn({
        let kill = kill.clone();
        let timed_out = timed_out.clone();
        async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    timed_out.store(true, Ordering::SeqCst);
                    kill.cancel();
                }
                _ = kill.cancelled() => {}
            }
        }
    });

    let grace = shared.config.kill_grace();
    let partial = Arc::new(Mutex::new(OutputCapture::default()));
    let ctx = ExecContext::new(kill.clone(), grace)
        .with_output(output_callback(shared, key, attempt, partial.clone()));
    let started = Instant::now();
    let taken = || std::mem::take(&mut *partial.lock().unwrap_or_else(|e| e.into_inner()));
    let ended = tokio::select! {
        result = runner.execute(spec, ctx) => match result {
            Ok(execution) => Ended::Execution(execution),
            Err(e) => Ended::Failed(e, taken()),
        },
        _ = async {
            kill.cancelled().await;
            tokio::time::sleep(grace * 3).await;
        } => Ended::Unresponsive(taken()),
    };
    watchdog.abort();

    (ended, timed_out.load(Ordering::SeqCst), started.elapsed())
}

/// Records `result`, or when `retry` says so, records it and queues the
/// next attempt.
fn finish(shared: &Shared, result: TestResult, retry: Option<bool>) {
    let key = result.key.clone();
    if retry == Some(true) {
        match shared.tracker.retry(result) {
            Ok(next) => {
                info!(test = %key, attempt = next.attempt, "Retrying after transient failure");
                shared.queue.requeue_retry(next);
                shared.wake.notify_waiters();
            }
            Err(e) => error!(test = %key, error = %e, "Failed to queue retry"),
        }
    } else if let Err(e) = shared.tracker.record_result(result) {
        error!(test = %key, error = %e, "Failed to record result");
    }
    shared.forget_plan_if_done(&key.plan);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(1, &OrchestratorConfig::default().transient_patterns).unwrap()
    }

    fn exec(exit: ExitStatus) -> Ended {
        Ended::Execution(Execution {
            exit,
            stdout: "partial\n".into(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
            artifacts: Vec::new(),
        })
    }

    fn state(ended: &Ended, timed_out: bool, cancelled: bool) -> TestState {
        classify(ended, timed_out, cancelled, Duration::from_secs(5), &policy()).state
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(state(&exec(ExitStatus::Exited(0)), false, false), TestState::Completed);
        let failed = classify(
            &exec(ExitStatus::Exited(3)),
            false,
            false,
            Duration::from_secs(5),
            &policy(),
        );
        assert_eq!(failed.state, TestState::Failed);
        assert_eq!(failed.exit_code, Some(3));
        assert!(!failed.transient);
    }

    #[test]
    fn test_killed_by_deadline_or_cancel() {
        assert_eq!(state(&exec(ExitStatus::Killed), true, false), TestState::Timeout);
        assert_eq!(state(&exec(ExitStatus::Killed), false, true), TestState::Cancelled);
        assert_eq!(
            state(&Ended::Unresponsive(OutputCapture::default()), true, false),
            TestState::Timeout
        );
        // a deadline that fires after the test already exited does not matter
        assert_eq!(state(&exec(ExitStatus::Exited(0)), true, false), TestState::Completed);
    }

    #[test]
    fn test_runner_failures_are_errors() {
        let disconnected = classify(
            &exec(ExitStatus::Disconnected("Connection closed by remote host".into())),
            false,
            false,
            Duration::from_secs(5),
            &policy(),
        );
        assert_eq!(disconnected.state, TestState::Error);
        assert!(disconnected.transient);

        let refused = Ended::Failed(
            ProviderError::ExecFailed("connection refused".into()),
            OutputCapture::default(),
        );
        let outcome = classify(&refused, false, false, Duration::from_secs(5), &policy());
        assert_eq!(outcome.state, TestState::Error);
        assert!(outcome.transient);

        let missing = Ended::Failed(
            ProviderError::NotFound("vm-3".into()),
            OutputCapture::default(),
        );
        assert!(!classify(&missing, false, false, Duration::from_secs(5), &policy()).transient);
    }

    #[test]
    fn test_transient_patterns_match_stderr() {
        let killed = Ended::Execution(Execution {
            exit: ExitStatus::Killed,
            stdout: String::new(),
            stderr: "write: Connection reset by peer\n".into(),
            duration: Duration::from_millis(5),
            artifacts: Vec::new(),
        });
        let outcome = classify(&killed, false, false, Duration::from_secs(5), &policy());
        assert_eq!(outcome.state, TestState::Error);
        assert!(outcome.transient);

        let failed = Ended::Failed(
            ProviderError::ExecFailed("exec exited early".into()),
            OutputCapture {
                stdout: String::new(),
                stderr: "sh: write error: Broken pipe\n".into(),
            },
        );
        assert!(classify(&failed, false, false, Duration::from_secs(5), &policy()).transient);

        // a failing test is never infrastructure, whatever it prints
        let exited = Ended::Execution(Execution {
            exit: ExitStatus::Exited(1),
            stdout: String::new(),
            stderr: "Connection refused\n".into(),
            duration: Duration::from_millis(5),
            artifacts: Vec::new(),
        });
        assert!(!classify(&exited, false, false, Duration::from_secs(5), &policy()).transient);
        let plain_kill = exec(ExitStatus::Killed);
        assert!(!classify(&plain_kill, false, false, Duration::from_secs(5), &policy()).transient);
    }

    #[test]
    fn test_partial_output_is_kept() {
        let ended = exec(ExitStatus::Killed);
        let outcome = classify(&ended, true, false, Duration::from_secs(5), &policy());
        let result = build_result(
            &TestKey::new("p", "t"),
            1,
            &EnvironmentId::from("env"),
            outcome,
            ended,
            Duration::from_secs(5),
        );
        assert_eq!(result.state, TestState::Timeout);
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(result.usage.stdout_bytes, 8);
    }

    #[test]
    fn test_output_before_runner_failure_is_kept() {
        let ended = Ended::Failed(
            ProviderError::Connection("exec stream closed".into()),
            OutputCapture {
                stdout: "step 1\nstep 2\n".into(),
                stderr: "warning\n".into(),
            },
        );
        let outcome = classify(&ended, false, false, Duration::from_secs(5), &policy());
        let result = build_result(
            &TestKey::new("p", "t"),
            1,
            &EnvironmentId::from("env"),
            outcome,
            ended,
            Duration::from_secs(2),
        );
        assert_eq!(result.state, TestState::Error);
        assert_eq!(result.stdout, "step 1\nstep 2\n");
        assert_eq!(result.stderr, "warning\n");
        assert_eq!(result.usage.stdout_bytes, 14);
        assert_eq!(result.duration_ms, 2000);
    }
}
