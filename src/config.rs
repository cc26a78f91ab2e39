//! Run configuration: TOML-loadable, every field defaulted, validated.
//!
//! ```toml
//! output_root = "harvest"
//! max_concurrency = 4
//! ledger_backend = "sqlite"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [politeness]
//! min_delay_ms = 1500
//! max_delay_ms = 3500
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::{HttpClient, RateLimiter, RetryPolicy};
use crate::filename::{DEFAULT_MAX_FILENAME_LEN, OutputLayout};
use crate::ledger::LedgerBackend;
use crate::user_agent::default_user_agent;

const MAX_CONCURRENCY_RANGE: std::ops::RangeInclusive<usize> = 1..=64;
const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<u32> = 1..=20;
const FILENAME_LEN_RANGE: std::ops::RangeInclusive<usize> = 16..=200;
const MAX_DELAY_MS: u64 = 3_600_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config value for `{field}`: {value}. Expected range: {expected}")]
    Invalid {
        field: &'static str,
        value: String,
        expected: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl fmt::Display, expected: impl fmt::Display) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// What happens to in-flight items when a run is stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Let running items finish, up to `drain_timeout_ms`.
    #[default]
    Drain,
    /// Interrupt running items immediately.
    Abort,
}

impl FromStr for CancelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "abort" => Ok(Self::Abort),
            other => Err(format!("unknown cancel policy '{other}' (expected drain or abort)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 32_000,
            jitter_ms: 500,
        }
    }
}

/// Per-host randomized delay range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolitenessSettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PolitenessSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 1500,
            max_delay_ms: 3500,
        }
    }
}

/// Everything the core needs for one harvest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    pub output_root: PathBuf,
    pub max_concurrency: usize,
    pub retry: RetrySettings,
    pub politeness: PolitenessSettings,
    pub network_timeout_ms: u64,
    pub max_filename_len: usize,
    pub ledger_backend: LedgerBackend,
    pub drain_timeout_ms: u64,
    pub cancel_policy: CancelPolicy,
    pub verify_pdf_signature: bool,
    /// Overrides the crate's identifying User-Agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("harvest"),
            max_concurrency: 4,
            retry: RetrySettings::default(),
            politeness: PolitenessSettings::default(),
            network_timeout_ms: 30_000,
            max_filename_len: DEFAULT_MAX_FILENAME_LEN,
            ledger_backend: LedgerBackend::default(),
            drain_timeout_ms: 10_000,
            cancel_policy: CancelPolicy::default(),
            verify_pdf_signature: true,
            user_agent: None,
        }
    }
}

impl HarvestConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Reads and parses a TOML file (not validated).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !MAX_CONCURRENCY_RANGE.contains(&self.max_concurrency) {
            return Err(ConfigError::invalid(
                "max_concurrency",
                self.max_concurrency,
                "1..=64",
            ));
        }
        if !MAX_ATTEMPTS_RANGE.contains(&self.retry.max_attempts) {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                self.retry.max_attempts,
                "1..=20",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                self.retry.base_delay_ms,
                format!("0..={} (retry.max_delay_ms)", self.retry.max_delay_ms),
            ));
        }
        for (field, value) in [
            ("retry.max_delay_ms", self.retry.max_delay_ms),
            ("retry.jitter_ms", self.retry.jitter_ms),
            ("politeness.max_delay_ms", self.politeness.max_delay_ms),
            ("drain_timeout_ms", self.drain_timeout_ms),
        ] {
            if value > MAX_DELAY_MS {
                return Err(ConfigError::invalid(field, value, "0..=3600000"));
            }
        }
        if self.politeness.min_delay_ms > self.politeness.max_delay_ms {
            return Err(ConfigError::invalid(
                "politeness.min_delay_ms",
                self.politeness.min_delay_ms,
                format!("0..={} (politeness.max_delay_ms)", self.politeness.max_delay_ms),
            ));
        }
        if !(1..=MAX_DELAY_MS).contains(&self.network_timeout_ms) {
            return Err(ConfigError::invalid(
                "network_timeout_ms",
                self.network_timeout_ms,
                "1..=3600000",
            ));
        }
        if !FILENAME_LEN_RANGE.contains(&self.max_filename_len) {
            return Err(ConfigError::invalid(
                "max_filename_len",
                self.max_filename_len,
                "16..=200",
            ));
        }
        if self.user_agent.as_deref().is_some_and(|ua| ua.trim().is_empty()) {
            return Err(ConfigError::invalid("user_agent", "\"\"", "non-empty string"));
        }
        Ok(())
    }

    #[must_use]
    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(&self.output_root)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
        .with_max_jitter(Duration::from_millis(self.retry.jitter_ms))
    }

    #[must_use]
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            Duration::from_millis(self.politeness.min_delay_ms),
            Duration::from_millis(self.politeness.max_delay_ms),
        )
    }

    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    #[must_use]
    pub fn user_agent(&self) -> String {
        self.user_agent.clone().unwrap_or_else(default_user_agent)
    }

    /// Builds the shared HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn http_client(&self) -> Result<HttpClient, reqwest::Error> {
        Ok(HttpClient::with_options(&self.user_agent(), self.network_timeout())?
            .with_pdf_signature_check(self.verify_pdf_signature))
    }
}
