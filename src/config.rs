//! Configuration: server-wide defaults and per-session options
//!
//! Server defaults come from `FrontendConfig` (JSON file and/or CLI flags).
//! Each session carries a string overlay (`SET key = value`); the two options
//! the query controller cares about are parsed out of it into
//! `QuerySettings` at submission time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FrontendError, Result};

/// Statement timeout option. Integer seconds, `0` disables the watchdog.
pub const STATEMENT_TIMEOUT_KEY: &str = "sqlfront.statement.timeout";

/// Force cancel on interrupt option. `true` selects forceful cancellation.
pub const INTERRUPT_ON_CANCEL_KEY: &str = "sqlfront.cancel.interrupt";

/// How a timed-out (or otherwise cancelled) job is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancellationMode {
    /// Stop scheduling new work; running work finishes on its own
    Cooperative,
    /// Interrupt running work
    Forceful,
}

impl CancellationMode {
    pub fn from_interrupt_flag(interrupt: bool) -> Self {
        if interrupt {
            CancellationMode::Forceful
        } else {
            CancellationMode::Cooperative
        }
    }

    pub fn interrupt_on_cancel(&self) -> bool {
        matches!(self, CancellationMode::Forceful)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationMode::Cooperative => "cooperative",
            CancellationMode::Forceful => "forceful",
        }
    }
}

/// Settings captured when a query is submitted.
///
/// Later `SET` commands on the session never touch a captured value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySettings {
    /// `None` = unbounded
    pub timeout: Option<Duration>,
    pub cancellation: CancellationMode,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            timeout: None,
            cancellation: CancellationMode::Cooperative,
        }
    }
}

/// Parse a timeout value: plain integer seconds, or `<n>s` / `<n>ms`.
pub fn parse_timeout(value: &str) -> std::result::Result<Option<Duration>, String> {
    let value = value.trim();
    let (digits, unit_ms) = if let Some(ms) = value.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(s) = value.strip_suffix('s') {
        (s, 1000)
    } else {
        (value, 1000)
    };

    let amount: u64 = digits
        .trim()
        .parse()
        .map_err(|_| "expected a non-negative integer number of seconds".to_string())?;

    if amount == 0 {
        return Ok(None);
    }
    amount
        .checked_mul(unit_ms)
        .map(|ms| Some(Duration::from_millis(ms)))
        .ok_or_else(|| "timeout is too large".to_string())
}

pub fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err("expected a boolean".to_string()),
    }
}

fn format_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        None => "0".to_string(),
        Some(d) if d.subsec_millis() == 0 => d.as_secs().to_string(),
        Some(d) => format!("{}ms", d.as_millis()),
    }
}

/// Per-session option overlay.
///
/// Keys are stored verbatim. The two known keys are validated on write so a
/// bad value is rejected by `SET` instead of failing a later query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    values: BTreeMap<String, String>,
}

impl SessionOptions {
    pub fn with_defaults(timeout: Option<Duration>, cancellation: CancellationMode) -> Self {
        let mut values = BTreeMap::new();
        values.insert(STATEMENT_TIMEOUT_KEY.to_string(), format_timeout(timeout));
        values.insert(
            INTERRUPT_ON_CANCEL_KEY.to_string(),
            cancellation.interrupt_on_cancel().to_string(),
        );
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        Self::validate(key, value)?;
        self.values.insert(key.to_string(), value.trim().to_string());
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Apply `overlay` on top of a copy of these options.
    pub fn merged(&self, overlay: &BTreeMap<String, String>) -> Result<Self> {
        let mut merged = self.clone();
        for (key, value) in overlay {
            merged.set(key, value)?;
        }
        Ok(merged)
    }

    pub fn query_settings(&self) -> QuerySettings {
        let timeout = self
            .get(STATEMENT_TIMEOUT_KEY)
            .and_then(|v| parse_timeout(v).ok())
            .flatten();
        let interrupt = self
            .get(INTERRUPT_ON_CANCEL_KEY)
            .and_then(|v| parse_bool(v).ok())
            .unwrap_or(false);

        QuerySettings {
            timeout,
            cancellation: CancellationMode::from_interrupt_flag(interrupt),
        }
    }

    fn validate(key: &str, value: &str) -> Result<()> {
        let check = match key {
            STATEMENT_TIMEOUT_KEY => parse_timeout(value).map(|_| ()),
            INTERRUPT_ON_CANCEL_KEY => parse_bool(value).map(|_| ()),
            _ if key.trim().is_empty() => Err("option name must not be empty".to_string()),
            _ => Ok(()),
        };

        check.map_err(|reason| FrontendError::InvalidConfig {
            key: key.to_string(),
            value: value.to_string(),
            reason,
        })
    }
}

/// Server-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FrontendConfig {
    /// Directory under which per-session scratch directories are created
    pub scratch_root: PathBuf,
    /// Default statement timeout for new sessions, in seconds (0 = unbounded)
    pub statement_timeout_secs: u64,
    /// Default cancellation mode for new sessions
    pub interrupt_on_cancel: bool,
    /// Collect performance metrics
    pub metrics: bool,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
            statement_timeout_secs: 0,
            interrupt_on_cancel: false,
            metrics: false,
        }
    }
}

impl FrontendConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        match self.statement_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn default_cancellation(&self) -> CancellationMode {
        CancellationMode::from_interrupt_flag(self.interrupt_on_cancel)
    }

    pub fn session_defaults(&self) -> SessionOptions {
        SessionOptions::with_defaults(self.default_timeout(), self.default_cancellation())
    }
}
