//! `[settings]` block of hoist.toml.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Orchestrator settings. Every field has a default so the block may be
/// omitted entirely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory on each worker that receives the synced tree.
    pub remote_root: String,
    /// Local directory for the state database, artifacts, rendered worker
    /// trees and the certificate authority. Relative paths resolve against
    /// the project directory.
    pub state_dir: PathBuf,
    /// Upper bound on concurrently running remote operations.
    pub max_in_flight: usize,
    pub health: HealthSettings,
    pub ssh: SshSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote_root: "/opt/hoist".to_string(),
            state_dir: PathBuf::from(".hoist"),
            max_in_flight: 16,
            health: HealthSettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

/// Retry policy for health checks run in wait mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    pub attempts: u32,
    /// Delay between attempts (e.g., "2s").
    pub delay: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay: "2s".to_string(),
        }
    }
}

impl HealthSettings {
    pub fn delay(&self) -> Duration {
        parse_duration(&self.delay).unwrap_or(Duration::from_secs(2))
    }
}

/// Transport settings for the SSH/rsync executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: String,
    /// Hard limit on a single remote command or sync.
    pub command_timeout: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout: "10s".to_string(),
            command_timeout: "10m".to_string(),
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(Duration::from_secs(600))
    }
}

/// Parse a duration setting.
///
/// Accepts a bare number of seconds (`"10"`) or a run of `<count><unit>`
/// terms with units `h`, `m`, `s` and `ms` (`"500ms"`, `"1m30s"`).
/// Returns `None` for anything else, including totals that overflow.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if s.is_empty() {
        return None;
    }

    let mut rest = s;
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let count: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let term = match &rest[..unit] {
            "ms" => Duration::from_millis(count),
            "s" => Duration::from_secs(count),
            "m" => Duration::from_secs(count.checked_mul(60)?),
            "h" => Duration::from_secs(count.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(term)?;
        rest = &rest[unit..];
    }
    Some(total)
}
