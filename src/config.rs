//! Configuration loading and schema definitions for testgrid.
//!
//! This module provides types and functions for loading testgrid
//! configuration from TOML files or strings, and for checking the loaded
//! configuration for mistakes that would otherwise only surface at dispatch
//! time.

pub mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Loads testgrid configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use testgrid::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testgrid.toml"))?;
/// println!("Max parallel: {}", config.orchestrator.max_parallel);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads testgrid configuration from a TOML string.
///
/// ```
/// use testgrid::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [orchestrator]
///     max_parallel = 4
/// "#)?;
///
/// assert_eq!(config.orchestrator.max_parallel, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Checks cross-field rules the schema alone cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.orchestrator.max_parallel == 0 {
        bail!("orchestrator.max_parallel must be at least 1");
    }

    let mut ids = HashSet::new();
    for env in &config.environments {
        if !ids.insert(env.id.as_str()) {
            bail!("environment id '{}' is declared more than once", env.id);
        }
        if !config.backends.is_configured(env.backend) {
            bail!(
                "environment '{}' uses backend '{}' but [backends] has no table for it",
                env.id,
                env.backend
            );
        }
    }

    for pattern in &config.orchestrator.transient_patterns {
        regex::Regex::new(pattern)
            .with_context(|| format!("Invalid transient pattern: {pattern}"))?;
    }

    if config.provisioning.enabled
        && !config.backends.is_configured(config.provisioning.default_backend)
    {
        tracing::warn!(
            backend = %config.provisioning.default_backend,
            "Default provisioning backend is not configured"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_consistent_config() {
        let config = load_config_str(
            r#"
            [backends.emulator]
            exec_command = "sh -c {command}"

            [[environments]]
            id = "emu-1"
            backend = "emulated_hardware"
            architecture = "x86_64"
            memory_mb = 1024
            cpu_cores = 1
            "#,
        )
        .unwrap();
        validate(&config).unwrap();
    }

    #[test]
    fn test_validate_rejects_unconfigured_backend() {
        let config = load_config_str(
            r#"
            [[environments]]
            id = "board-1"
            backend = "physical"
            architecture = "arm64"
            memory_mb = 1024
            cpu_cores = 1
            "#,
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("board-1"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = load_config_str(
            r#"
            [backends.emulator]
            exec_command = "sh -c {command}"

            [[environments]]
            id = "emu"
            backend = "emulated_hardware"
            architecture = "x86_64"
            memory_mb = 1024
            cpu_cores = 1

            [[environments]]
            id = "emu"
            backend = "emulated_hardware"
            architecture = "x86_64"
            memory_mb = 1024
            cpu_cores = 1
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = Config::default();
        config.orchestrator.transient_patterns = vec!["(unclosed".to_string()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/testgrid.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
