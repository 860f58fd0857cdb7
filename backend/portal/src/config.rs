//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{PortalError, Result};

/// Upper bound for `DEADLINE_GRACE_MINUTES`: one week.
const MAX_DEADLINE_GRACE_MINUTES: i64 = 7 * 24 * 60;

/// Which [`commit_engine::FailurePolicy`] the engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicyKind {
    Never,
    DailyDeadline,
}

impl FromStr for FailurePolicyKind {
    type Err = PortalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(Self::Never),
            "daily_deadline" => Ok(Self::DailyDeadline),
            other => Err(PortalError::Config(format!(
                "Invalid FAILURE_POLICY: {other} (expected never | daily_deadline)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// JSON catalog file; the built-in catalog is used when unset
    pub catalog_path: Option<String>,
    /// Verification oracle endpoint; proofs are accepted after a simulated delay when unset
    pub verifier_url: Option<String>,
    pub verify_delay_ms: u64,
    pub failure_policy: FailurePolicyKind,
    pub deadline_grace_minutes: i64,
    /// How often (in seconds) the overdue sweep runs
    pub sweep_interval_secs: u64,
    pub max_write_retries: u32,
    /// Upper bound on a decoded proof image
    pub max_proof_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./commit_portal.db".to_string()),
            api_port: parsed("API_PORT", "3001")?,
            catalog_path: env_var("CATALOG_PATH").ok().filter(|s| !s.is_empty()),
            verifier_url: env_var("VERIFIER_URL").ok().filter(|s| !s.is_empty()),
            verify_delay_ms: parsed("VERIFY_DELAY_MS", "2000")?,
            failure_policy: parsed("FAILURE_POLICY", "never")?,
            deadline_grace_minutes: grace_minutes(parsed("DEADLINE_GRACE_MINUTES", "0")?)?,
            sweep_interval_secs: parsed("SWEEP_INTERVAL_SECS", "300")?,
            max_write_retries: parsed("MAX_WRITE_RETRIES", "3")?,
            max_proof_bytes: parsed("MAX_PROOF_BYTES", "5242880")?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| PortalError::Config(format!("Missing env var: {key}")))
}

fn parsed<T: FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| PortalError::Config(format!("Invalid {key}")))
}

fn grace_minutes(minutes: i64) -> Result<i64> {
    if (0..=MAX_DEADLINE_GRACE_MINUTES).contains(&minutes) {
        Ok(minutes)
    } else {
        Err(PortalError::Config(format!(
            "Invalid DEADLINE_GRACE_MINUTES: {minutes} (expected 0..={MAX_DEADLINE_GRACE_MINUTES})"
        )))
    }
}
