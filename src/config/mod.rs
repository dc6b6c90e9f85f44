//! Configuration module for rust-conntrack
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use rust_conntrack::config::{load_config, Config};
//!
//! let config = load_config("/etc/rust-conntrack/config.json").unwrap();
//! println!("Max connections: {}", config.table.max_connections);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str, load_config_with_env,
};
pub use types::{
    AccountingConfig, Config, GcConfig, GenericConfig, IcmpConfig, LogConfig, TableConfig,
    TcpConfig, TcpTimeoutConfig, UdpConfig, MIN_HASHSIZE,
};
