//! Configuration types for rust-conntrack
//!
//! This module defines every tunable of the tracker. Configuration is loaded
//! from JSON, every field has a default, and `validate()` runs at startup.
//! Timeouts are stored in seconds and exposed as `Duration`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest accepted explicit bucket count
pub const MIN_HASHSIZE: usize = 16;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Flow table sizing and admission
    #[serde(default)]
    pub table: TableConfig,

    /// TCP tracker settings
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP tracker settings
    #[serde(default)]
    pub udp: UdpConfig,

    /// ICMP / ICMPv6 tracker settings
    #[serde(default)]
    pub icmp: IcmpConfig,

    /// Fallback tracker for other transport protocols
    #[serde(default)]
    pub generic: GenericConfig,

    /// Background reaper
    #[serde(default)]
    pub gc: GcConfig,

    /// Per-connection extensions
    #[serde(default)]
    pub accounting: AccountingConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.table.validate()?;
        self.tcp.validate()?;
        self.udp.validate()?;

        if self.icmp.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "icmp.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.generic.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "generic.timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Create a default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "log.format must be \"json\" or \"text\", got \"{other}\""
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Flow table sizing and admission
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    /// Bucket count; 0 derives it from `max_connections`
    #[serde(default)]
    pub hashsize: usize,

    /// Live connections allowed per namespace; 0 means unlimited
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Validate transport checksums on packets entering at PRE_ROUTING
    #[serde(default = "default_true")]
    pub checksum: bool,

    /// Number of per-worker unconfirmed/dying lists; 0 uses available parallelism
    #[serde(default)]
    pub workers: usize,
}

impl TableConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.hashsize != 0 && self.hashsize < MIN_HASHSIZE {
            return Err(ConfigError::ValidationError(format!(
                "table.hashsize must be 0 or at least {MIN_HASHSIZE}"
            )));
        }
        if self.workers > 4096 {
            return Err(ConfigError::ValidationError(
                "table.workers must not exceed 4096".into(),
            ));
        }
        Ok(())
    }

    /// Bucket count to build the table with
    #[must_use]
    pub fn effective_hashsize(&self) -> usize {
        if self.hashsize != 0 {
            return self.hashsize;
        }
        let derived = if self.max_connections == 0 {
            default_max_connections()
        } else {
            self.max_connections
        };
        (derived / 4).max(MIN_HASHSIZE)
    }

    /// Number of per-worker lists to allocate
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers != 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            hashsize: 0,
            max_connections: default_max_connections(),
            checksum: true,
            workers: 0,
        }
    }
}

/// TCP tracker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    /// Pick up connections already in progress
    #[serde(default = "default_true")]
    pub loose: bool,

    /// Accept out-of-window segments instead of marking them invalid
    #[serde(default)]
    pub be_liberal: bool,

    /// Retransmissions tolerated before the short retransmission timeout applies
    #[serde(default = "default_tcp_max_retrans")]
    pub max_retrans: u8,

    /// Per-state timeouts
    #[serde(default)]
    pub timeouts: TcpTimeoutConfig,
}

impl TcpConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate()
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            loose: true,
            be_liberal: false,
            max_retrans: default_tcp_max_retrans(),
            timeouts: TcpTimeoutConfig::default(),
        }
    }
}

/// Per-state TCP timeouts in seconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TcpTimeoutConfig {
    #[serde(default = "default_tcp_syn_sent")]
    pub syn_sent: u64,
    #[serde(default = "default_tcp_syn_recv")]
    pub syn_recv: u64,
    #[serde(default = "default_tcp_established")]
    pub established: u64,
    #[serde(default = "default_tcp_fin_wait")]
    pub fin_wait: u64,
    #[serde(default = "default_tcp_close_wait")]
    pub close_wait: u64,
    #[serde(default = "default_tcp_last_ack")]
    pub last_ack: u64,
    #[serde(default = "default_tcp_time_wait")]
    pub time_wait: u64,
    #[serde(default = "default_tcp_close")]
    pub close: u64,
    #[serde(default = "default_tcp_syn_sent")]
    pub syn_sent2: u64,
    /// Applied once the retransmission limit is reached
    #[serde(default = "default_tcp_retrans")]
    pub retrans: u64,
    /// Applied while sent data is not yet acknowledged
    #[serde(default = "default_tcp_unack")]
    pub unack: u64,
}

impl TcpTimeoutConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("syn_sent", self.syn_sent),
            ("syn_recv", self.syn_recv),
            ("established", self.established),
            ("fin_wait", self.fin_wait),
            ("close_wait", self.close_wait),
            ("last_ack", self.last_ack),
            ("time_wait", self.time_wait),
            ("close", self.close),
            ("syn_sent2", self.syn_sent2),
            ("retrans", self.retrans),
            ("unack", self.unack),
        ];
        if let Some((name, _)) = all.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::ValidationError(format!(
                "tcp.timeouts.{name} must be greater than 0"
            )));
        }
        Ok(())
    }
}

impl Default for TcpTimeoutConfig {
    fn default() -> Self {
        Self {
            syn_sent: default_tcp_syn_sent(),
            syn_recv: default_tcp_syn_recv(),
            established: default_tcp_established(),
            fin_wait: default_tcp_fin_wait(),
            close_wait: default_tcp_close_wait(),
            last_ack: default_tcp_last_ack(),
            time_wait: default_tcp_time_wait(),
            close: default_tcp_close(),
            syn_sent2: default_tcp_syn_sent(),
            retrans: default_tcp_retrans(),
            unack: default_tcp_unack(),
        }
    }
}

/// UDP tracker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    /// Timeout before a reply has been seen
    #[serde(default = "default_udp_unreplied")]
    pub timeout_unreplied_secs: u64,

    /// Timeout for flows that have become streams
    #[serde(default = "default_udp_stream")]
    pub timeout_stream_secs: u64,
}

impl UdpConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_unreplied_secs == 0 || self.timeout_stream_secs == 0 {
            return Err(ConfigError::ValidationError(
                "udp timeouts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get unreplied timeout as Duration
    #[must_use]
    pub const fn timeout_unreplied(&self) -> Duration {
        Duration::from_secs(self.timeout_unreplied_secs)
    }

    /// Get stream timeout as Duration
    #[must_use]
    pub const fn timeout_stream(&self) -> Duration {
        Duration::from_secs(self.timeout_stream_secs)
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            timeout_unreplied_secs: default_udp_unreplied(),
            timeout_stream_secs: default_udp_stream(),
        }
    }
}

/// ICMP / ICMPv6 tracker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IcmpConfig {
    #[serde(default = "default_icmp_timeout")]
    pub timeout_secs: u64,
}

impl IcmpConfig {
    /// Get timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_icmp_timeout(),
        }
    }
}

/// Fallback tracker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenericConfig {
    #[serde(default = "default_generic_timeout")]
    pub timeout_secs: u64,
}

impl GenericConfig {
    /// Get timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_generic_timeout(),
        }
    }
}

/// Background reaper settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcConfig {
    /// Run the GC task alongside the engine
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Per-connection extension switches
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccountingConfig {
    /// Per-direction packet and byte counters
    #[serde(default)]
    pub acct: bool,

    /// Start/stop wall-clock timestamps
    #[serde(default)]
    pub timestamp: bool,
}

// Default value functions for serde

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

const fn default_max_connections() -> usize {
    262_144
}

const fn default_tcp_max_retrans() -> u8 {
    3
}

const fn default_tcp_syn_sent() -> u64 {
    120
}

const fn default_tcp_syn_recv() -> u64 {
    60
}

const fn default_tcp_established() -> u64 {
    5 * 24 * 60 * 60
}

const fn default_tcp_fin_wait() -> u64 {
    120
}

const fn default_tcp_close_wait() -> u64 {
    60
}

const fn default_tcp_last_ack() -> u64 {
    30
}

const fn default_tcp_time_wait() -> u64 {
    120
}

const fn default_tcp_close() -> u64 {
    10
}

const fn default_tcp_retrans() -> u64 {
    300
}

const fn default_tcp_unack() -> u64 {
    300
}

const fn default_udp_unreplied() -> u64 {
    30
}

const fn default_udp_stream() -> u64 {
    120
}

const fn default_icmp_timeout() -> u64 {
    30
}

const fn default_generic_timeout() -> u64 {
    600
}
