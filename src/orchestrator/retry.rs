//! Transient-failure detection and the retry budget.

use regex::Regex;

use crate::model::TestState;

/// Decides whether a failed attempt is worth another try.
///
/// Only `error` outcomes are ever retried: a timeout means the test hung,
/// and a non-zero exit means the test under test failed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    patterns: Vec<Regex>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_retries,
            patterns,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether any configured pattern matches one of `texts`.
    pub fn matches(&self, texts: &[&str]) -> bool {
        self.patterns
            .iter()
            .any(|re| texts.iter().any(|t| re.is_match(t)))
    }

    /// Whether attempt number `attempt` (1-based) ending in `state` should be
    /// followed by another attempt.
    pub fn should_retry(&self, attempt: u32, state: TestState, transient: bool) -> bool {
        state == TestState::Error && transient && attempt <= self.max_retries
    }
}
