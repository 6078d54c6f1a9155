//! Console output for plan status, failed results and the environment pool.

use std::time::Duration;

use console::style;

use crate::model::{ExecutionPlanStatus, PlanState, TestResult, TestState};
use crate::pool::{Environment, EnvironmentStatus};

/// Process exit code for a set of finished plans: 0 only if every plan
/// completed.
pub fn exit_code(plans: &[ExecutionPlanStatus]) -> i32 {
    if plans.iter().all(|p| p.state == PlanState::Completed) {
        0
    } else {
        1
    }
}

fn styled_state(state: PlanState) -> console::StyledObject<PlanState> {
    match state {
        PlanState::Completed => style(state).green(),
        PlanState::Failed => style(state).red(),
        PlanState::Cancelled => style(state).yellow(),
        PlanState::Queued | PlanState::Running => style(state).cyan(),
    }
}

/// Prints the aggregated counts of one plan.
pub fn print_summary(status: &ExecutionPlanStatus, duration: Option<Duration>) {
    println!();
    println!(
        "Plan {} [{}] {}",
        style(&status.plan).bold(),
        status.priority,
        styled_state(status.state)
    );
    println!("  Total:     {}", status.total);
    println!("  Completed: {}", style(status.completed).green());
    println!("  Failed:    {}", style(status.failed).red());
    if status.timed_out > 0 {
        println!("  Timeout:   {}", style(status.timed_out).red().bold());
    }
    if status.errored > 0 {
        println!("  Error:     {}", style(status.errored).red().bold());
    }
    if status.cancelled > 0 {
        println!("  Cancelled: {}", style(status.cancelled).yellow());
    }
    if !status.state.is_terminal() {
        println!("  Queued:    {}", status.queued);
        println!("  Active:    {}", status.active + status.allocating);
    }
    if status.retries > 0 {
        println!("  Retries:   {}", style(status.retries).yellow());
    }
    if let Some(duration) = duration {
        println!("  Duration:  {:?}", duration);
    }
}

/// Prints one block per unsuccessful result, with the tail of its output.
pub fn print_failures(results: &[TestResult]) {
    for result in results.iter().filter(|r| r.state != TestState::Completed) {
        println!();
        println!(
            "{} {} (attempt {}, {})",
            style("✗").red().bold(),
            style(&result.key).bold(),
            result.attempt,
            result.state
        );
        if let Some(message) = &result.message {
            println!("  {}", style(message).dim());
        }
        for line in tail(&result.stderr, 10) {
            println!("  | {}", line);
        }
    }
}

fn tail(text: &str, lines: usize) -> impl Iterator<Item = &str> {
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    all.into_iter().skip(skip)
}

/// Prints the pool as a table.
pub fn print_pool(environments: &[Environment]) {
    println!(
        "{:<24} {:<18} {:<8} {:>9} {:>5}  {}",
        "ID", "BACKEND", "ARCH", "MEMORY", "CPUS", "STATUS"
    );
    for env in environments {
        let status = match env.status {
            EnvironmentStatus::Available => style(env.status).green(),
            EnvironmentStatus::Busy => style(env.status).cyan(),
            EnvironmentStatus::Provisioning => style(env.status).yellow(),
            EnvironmentStatus::Unhealthy => style(env.status).red().bold(),
        };
        println!(
            "{:<24} {:<18} {:<8} {:>7}MB {:>5}  {}",
            env.id,
            env.backend.to_string(),
            env.capabilities.architecture.to_string(),
            env.capabilities.memory_mb,
            env.capabilities.cpu_cores,
            status
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlanId, Priority};

    fn status(state: PlanState) -> ExecutionPlanStatus {
        ExecutionPlanStatus {
            plan: PlanId::from("p"),
            state,
            priority: Priority::Normal,
            total: 1,
            queued: 0,
            allocating: 0,
            active: 0,
            completed: 0,
            failed: 0,
            timed_out: 0,
            errored: 0,
            cancelled: 0,
            retries: 0,
        }
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(&[]), 0);
        assert_eq!(exit_code(&[status(PlanState::Completed)]), 0);
        assert_eq!(
            exit_code(&[status(PlanState::Completed), status(PlanState::Failed)]),
            1
        );
        assert_eq!(exit_code(&[status(PlanState::Cancelled)]), 1);
    }

    #[test]
    fn test_tail() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail(text, 2).collect::<Vec<_>>(), vec!["c", "d"]);
        assert_eq!(tail(text, 10).count(), 4);
    }
}
