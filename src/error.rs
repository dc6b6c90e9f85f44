//! Error types for rust-conntrack
//!
//! This module defines the error hierarchy for the connection tracker.
//! The packet path never surfaces these to callers: every rejection there is
//! folded into a [`Verdict`](crate::packet::Verdict). Errors exist for the
//! control plane (configuration, resize, NAT reply rewrites, expectations) and
//! for the packet adapter, whose failures are converted into verdicts.

use std::io;

use thiserror::Error;

/// Top-level error type for rust-conntrack
#[derive(Debug, Error)]
pub enum ConntrackError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet parsing and validation errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Flow table errors
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Expectation registration errors
    #[error("Expectation error: {0}")]
    Expectation(#[from] ExpectationError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConntrackError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Packet(e) => e.is_recoverable(),
            Self::Table(e) => e.is_recoverable(),
            Self::Expectation(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Packet adapter and protocol validation errors
///
/// All of these classify a packet as invalid. Only [`PacketError::is_untrackable`]
/// variants let the packet through untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// A header is shorter than its fixed part or its declared length
    #[error("Truncated {layer} header: need {needed} bytes, have {available}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        available: usize,
    },

    /// Not the IP version the caller said it was
    #[error("Unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// Non-first fragment, no transport header to track
    #[error("Non-first fragment")]
    Fragment,

    /// Transport checksum mismatch
    #[error("Bad {protocol} checksum")]
    BadChecksum { protocol: &'static str },

    /// Control-bit combination outside the valid set
    #[error("Invalid TCP flag combination {0:#04x}")]
    InvalidFlags(u8),

    /// ICMP type outside the known range
    #[error("Invalid ICMP type {0}")]
    InvalidType(u8),

    /// Tuple cannot be inverted by its protocol
    #[error("Tuple cannot be inverted")]
    NotInvertible,

    /// Inconsistent header fields
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
}

impl PacketError {
    /// Packet errors never succeed on retry
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Packets the tracker cannot see into are passed through instead of dropped
    #[must_use]
    pub const fn is_untrackable(&self) -> bool {
        matches!(self, Self::UnsupportedVersion(_) | Self::Fragment)
    }

    /// Create a truncation error
    #[must_use]
    pub const fn truncated(layer: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            layer,
            needed,
            available,
        }
    }
}

/// Flow table and lifecycle errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    /// Admission failed: the table is at capacity and nothing was evictable
    #[error("Table full: {max} connections")]
    Full { max: usize },

    /// Operation only valid before confirmation
    #[error("Connection {id} is already confirmed")]
    AlreadyConfirmed { id: u64 },

    /// Requested bucket count is out of range
    #[error("Invalid table size {size}: minimum is {min}")]
    InvalidSize { size: usize, min: usize },
}

impl TableError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Full { .. })
    }

    /// Create a table-full error
    #[must_use]
    pub const fn full(max: usize) -> Self {
        Self::Full { max }
    }
}

/// Expectation registration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpectationError {
    /// An identical expectation is already registered
    #[error("Expectation already registered for {tuple}")]
    Duplicate { tuple: String },

    /// The master connection is being torn down
    #[error("Master connection {id} is dying")]
    MasterDying { id: u64 },
}

impl ExpectationError {
    /// A dying master never comes back; duplicates clear once the first is used
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Result type alias for rust-conntrack operations
pub type Result<T> = std::result::Result<T, ConntrackError>;
