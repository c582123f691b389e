#![forbid(unsafe_code)]

//! Relay tunables. Parses a TOML file into a strongly-typed structure; every field has a
//! default so a partial (or empty) file is valid. Values are read once when a relay is
//! constructed; instances never observe later changes.
//!
//! Defaults follow the RFC 4380 timers: qualification probes every 4 s up to 3 times,
//! a 30 s refresh interval for the client's own NAT binding, bubbles no closer than 2 s
//! apart, and a 30 s lifetime for a direct mapping that stopped receiving traffic.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use tracing::debug;

use crate::{CoreError, CoreResult};

/// Largest retry budget the probe counter can represent (3 bits).
pub const MAX_QUALIFICATION_RETRIES: u8 = 7;

/// Upper bound for every timer, one year. Deadlines are computed as
/// `now + timer` and must not overflow the monotonic clock.
pub const MAX_TIMER_SECS: u64 = 365 * 24 * 60 * 60;

/// Tunables shared by every relay instance created from this value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Router Solicitations sent per qualification phase before giving up on it.
    pub qualification_retries: u8,

    /// Seconds to wait for a Router Advertisement before re-probing.
    pub qualification_timeout_secs: u64,

    /// Seconds to stay down after a failed qualification before starting over.
    pub restart_delay_secs: u64,

    /// Seconds between keepalive solicitations once qualified.
    pub refresh_interval_secs: u64,

    /// Seconds between two bubbles to the same peer.
    pub bubble_interval_secs: u64,

    /// Bubbles sent to a peer before falling back to the server path.
    pub bubble_retries: u8,

    /// Seconds of silence after which a trusted direct peer is routed indirectly again.
    pub direct_idle_timeout_secs: u64,

    /// Seconds of silence after which a peer entry is evicted.
    pub peer_idle_timeout_secs: u64,

    /// Upper bound on simultaneously tracked peers.
    pub max_peers: usize,

    /// ICMPv6 unreachable messages allowed per second.
    pub icmp_rate_limit: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            qualification_retries: 3,
            qualification_timeout_secs: 4,
            restart_delay_secs: 300,
            refresh_interval_secs: 30,
            bubble_interval_secs: 2,
            bubble_retries: 4,
            direct_idle_timeout_secs: 30,
            peer_idle_timeout_secs: 300,
            max_peers: 1024,
            icmp_rate_limit: 10,
        }
    }
}

impl RelayConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let data = fs::read_to_string(&path).map_err(CoreError::from)?;
        let cfg = Self::from_toml(&data)?;
        debug!(path = %path.as_ref().display(), "relay config loaded");
        Ok(cfg)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(data: &str) -> CoreResult<Self> {
        let cfg = toml::from_str::<RelayConfig>(data).map_err(CoreError::ConfigParse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the state machines cannot work with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.qualification_retries == 0 || self.qualification_retries > MAX_QUALIFICATION_RETRIES {
            return Err(CoreError::invalid(format!(
                "qualification_retries must be within 1..={MAX_QUALIFICATION_RETRIES}, got {}",
                self.qualification_retries
            )));
        }
        let timers = [
            ("qualification_timeout_secs", self.qualification_timeout_secs),
            ("restart_delay_secs", self.restart_delay_secs),
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("bubble_interval_secs", self.bubble_interval_secs),
            ("direct_idle_timeout_secs", self.direct_idle_timeout_secs),
            ("peer_idle_timeout_secs", self.peer_idle_timeout_secs),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, v)| *v == 0) {
            return Err(CoreError::invalid(format!("{name} must be non-zero")));
        }
        if let Some((name, v)) = timers.iter().find(|(_, v)| *v > MAX_TIMER_SECS) {
            return Err(CoreError::invalid(format!("{name} must not exceed {MAX_TIMER_SECS}, got {v}")));
        }
        if self.bubble_retries == 0 {
            return Err(CoreError::invalid("bubble_retries must be non-zero"));
        }
        if self.max_peers == 0 {
            return Err(CoreError::invalid("max_peers must be non-zero"));
        }
        if self.peer_idle_timeout_secs < self.direct_idle_timeout_secs {
            return Err(CoreError::invalid(
                "peer_idle_timeout_secs must not be shorter than direct_idle_timeout_secs",
            ));
        }
        Ok(())
    }

    pub fn qualification_timeout(&self) -> Duration {
        Duration::from_secs(self.qualification_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn bubble_interval(&self) -> Duration {
        Duration::from_secs(self.bubble_interval_secs)
    }

    pub fn direct_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_idle_timeout_secs)
    }

    pub fn peer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = RelayConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.qualification_timeout(), Duration::from_secs(4));
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(30));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = RelayConfig::from_toml("max_peers = 8\nbubble_retries = 2\n").unwrap();
        assert_eq!(cfg.max_peers, 8);
        assert_eq!(cfg.bubble_retries, 2);
        assert_eq!(cfg.qualification_retries, 3);
        assert_eq!(cfg.restart_delay_secs, 300);
    }

    #[test]
    fn retry_budget_above_counter_width_rejected() {
        let err = RelayConfig::from_toml("qualification_retries = 8").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn zero_timer_rejected() {
        let err = RelayConfig::from_toml("bubble_interval_secs = 0").unwrap_err();
        assert!(err.to_string().contains("bubble_interval_secs"));
    }

    #[test]
    fn oversized_timer_rejected() {
        let err = RelayConfig::from_toml("qualification_timeout_secs = 9223372036854775807").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
        assert!(err.to_string().contains("qualification_timeout_secs"));

        let at_cap = format!("restart_delay_secs = {MAX_TIMER_SECS}");
        assert_eq!(RelayConfig::from_toml(&at_cap).unwrap().restart_delay_secs, MAX_TIMER_SECS);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = RelayConfig::from_toml("max_peers = \"many\"").unwrap_err();
        assert!(matches!(err, CoreError::ConfigParse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "qualification_timeout_secs = 6").unwrap();
        let cfg = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.qualification_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RelayConfig::from_file("/nonexistent/teredo.toml").unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
