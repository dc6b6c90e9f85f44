//! Integration tests for rust-conntrack
//!
//! Every test drives the engine through `Conntrack::classify` the way a
//! packet filter would, with a manual clock so timeouts are deterministic.
//!
//! # Test Organization
//!
//! - `common`: Engine harness and packet helpers
//! - `scenarios`: End-to-end TCP handshake, window, reaping and admission flows
//! - `concurrency`: Confirm races, resize under lookup, eviction under churn
//! - `lifecycle`: Teardown, window tracking, GC task, namespaces, configuration files

pub mod common;
pub mod concurrency;
pub mod lifecycle;
pub mod scenarios;
