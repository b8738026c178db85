//! Runtime configuration for the directory service.
//!
//! Every option is a command line flag; `DirectoryConfig::default()` yields the
//! same values the flags default to so components can be built without parsing
//! arguments.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Fleet directory: game registry, replication and presence")]
pub struct DirectoryConfig {
    /// Address to bind the UDP intake to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
    /// Port to listen on
    #[clap(short, long, default_value = "4530")]
    pub port: u16,
    /// Grace period before a disconnected fleet member is removed
    #[clap(long, default_value = "5000")]
    pub disconnect_ttl_ms: u64,
    /// Upper bound on how long replication may take before it is force-completed
    #[clap(long, default_value = "10000")]
    pub replication_finish_check_ms: u64,
    /// How long preserved games stay listed after their member went away
    #[clap(long, default_value = "1")]
    pub expiry_grace_minutes: u64,
    /// Interval between expiry list sweeps
    #[clap(long, default_value = "1")]
    pub expiry_sweep_minutes: u64,
    /// Minimum spacing between stats broadcasts
    #[clap(long, default_value = "1000")]
    pub stats_publish_ms: u64,
    /// Concurrent game sessions per user above which a warning is logged
    #[clap(long, default_value = "5")]
    pub max_sessions_per_user: usize,
    /// Lifetime of session tokens issued to clients
    #[clap(long, default_value = "3600")]
    pub token_lifetime_secs: u64,
    /// Excluded actors are released after token lifetime times this factor
    #[clap(long, default_value = "2")]
    pub ban_expiry_multiplier: u32,
    /// Silence after which the UDP intake treats a member as disconnected
    #[clap(long, default_value = "15000")]
    pub member_timeout_ms: u64,
    /// Bias member load upwards using a peer-count trend
    #[clap(long)]
    pub prediction: bool,
    /// Number of peer-count samples the trend is fitted over
    #[clap(long, default_value = "8")]
    pub prediction_window: usize,
    /// How many samples ahead the trend is extrapolated
    #[clap(long, default_value = "4")]
    pub prediction_horizon: u32,
    /// Peers per load level when converting predicted peers to a level
    #[clap(long, default_value = "50")]
    pub peers_per_level: u32,
    /// Log filter used when RUST_LOG is not set
    #[clap(long, default_value = "info")]
    pub log_level: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4530,
            disconnect_ttl_ms: 5000,
            replication_finish_check_ms: 10_000,
            expiry_grace_minutes: 1,
            expiry_sweep_minutes: 1,
            stats_publish_ms: 1000,
            max_sessions_per_user: 5,
            token_lifetime_secs: 3600,
            ban_expiry_multiplier: 2,
            member_timeout_ms: 15_000,
            prediction: false,
            prediction_window: 8,
            prediction_horizon: 4,
            peers_per_level: 50,
            log_level: "info".to_string(),
        }
    }
}

impl DirectoryConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn disconnect_ttl(&self) -> Duration {
        Duration::from_millis(self.disconnect_ttl_ms)
    }

    pub fn replication_finish_check(&self) -> Duration {
        Duration::from_millis(self.replication_finish_check_ms)
    }

    pub fn expiry_grace(&self) -> Duration {
        Duration::from_secs(self.expiry_grace_minutes * 60)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        // A zero interval would make tokio::time::interval panic.
        Duration::from_secs(self.expiry_sweep_minutes.max(1) * 60)
    }

    pub fn stats_publish_interval(&self) -> Duration {
        Duration::from_millis(self.stats_publish_ms)
    }

    pub fn ban_expiry(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs) * self.ban_expiry_multiplier.max(1)
    }

    pub fn member_timeout(&self) -> Duration {
        Duration::from_millis(self.member_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_flags() {
        let parsed = DirectoryConfig::parse_from(["directory-server"]);
        let default = DirectoryConfig::default();

        assert_eq!(parsed.port, default.port);
        assert_eq!(parsed.disconnect_ttl_ms, default.disconnect_ttl_ms);
        assert_eq!(
            parsed.replication_finish_check_ms,
            default.replication_finish_check_ms
        );
        assert_eq!(parsed.expiry_grace_minutes, default.expiry_grace_minutes);
        assert_eq!(parsed.stats_publish_ms, default.stats_publish_ms);
        assert_eq!(parsed.prediction, default.prediction);
        assert_eq!(parsed.peers_per_level, default.peers_per_level);
    }

    #[test]
    fn test_derived_durations() {
        let config = DirectoryConfig::parse_from([
            "directory-server",
            "--disconnect-ttl-ms",
            "250",
            "--expiry-grace-minutes",
            "3",
            "--token-lifetime-secs",
            "60",
            "--ban-expiry-multiplier",
            "2",
        ]);

        assert_eq!(config.disconnect_ttl(), Duration::from_millis(250));
        assert_eq!(config.expiry_grace(), Duration::from_secs(180));
        assert_eq!(config.ban_expiry(), Duration::from_secs(120));
        assert_eq!(config.bind_address(), "127.0.0.1:4530");
    }

    #[test]
    fn test_zero_sweep_interval_is_raised() {
        let config = DirectoryConfig {
            expiry_sweep_minutes: 0,
            ..Default::default()
        };
        assert_eq!(config.expiry_sweep_interval(), Duration::from_secs(60));
    }
}
