use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PushyError, Result};

/// Server configuration.
///
/// Timing values are kept in the units operators think in and exposed as
/// [`Duration`]s through the accessor methods.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for the HTTP API.
    pub listen_addr: SocketAddr,
    /// Heartbeat cadence expected from nodes.
    pub heartbeat_interval_ms: u64,
    /// A node with no heartbeat for this long is marked offline.
    pub offline_timeout_ms: u64,
    /// How long a job waits for commit votes before deciding quorum.
    pub voting_timeout_ms: u64,
    /// Run timeout for jobs that do not specify one.
    pub default_run_timeout_secs: u64,
    /// How long a misbehaving node stays in rehab.
    pub rehab_duration_ms: u64,
    /// Node messages whose timestamp differs from the server clock by more
    /// than this are dropped as stale.
    pub message_window_secs: u64,
    /// JSON file mapping allowed command names to the command nodes run.
    /// When unset every command is allowed.
    pub whitelist_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 10003)),
            heartbeat_interval_ms: 1_000,
            offline_timeout_ms: 5_000,
            voting_timeout_ms: 60_000,
            default_run_timeout_secs: 3_600,
            rehab_duration_ms: 10_000,
            message_window_secs: 300,
            whitelist_path: None,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_whitelist(mut self, path: PathBuf) -> Self {
        self.whitelist_path = Some(path);
        self
    }

    pub fn with_voting_timeout(mut self, timeout: Duration) -> Self {
        self.voting_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_rehab_duration(mut self, duration: Duration) -> Self {
        self.rehab_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_millis(self.offline_timeout_ms)
    }

    pub fn voting_timeout(&self) -> Duration {
        Duration::from_millis(self.voting_timeout_ms)
    }

    pub fn default_run_timeout(&self) -> Duration {
        Duration::from_secs(self.default_run_timeout_secs)
    }

    pub fn rehab_duration(&self) -> Duration {
        Duration::from_millis(self.rehab_duration_ms)
    }

    pub fn message_window(&self) -> Duration {
        Duration::from_secs(self.message_window_secs)
    }

    /// Reject settings the state machines cannot run with.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("offline_timeout_ms", self.offline_timeout_ms),
            ("voting_timeout_ms", self.voting_timeout_ms),
            ("default_run_timeout_secs", self.default_run_timeout_secs),
            ("rehab_duration_ms", self.rehab_duration_ms),
            ("message_window_secs", self.message_window_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(PushyError::Config(format!("{} must be greater than zero", name)));
        }
        if self.offline_timeout_ms <= self.heartbeat_interval_ms {
            return Err(PushyError::Config(
                "offline_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        Ok(())
    }
}
