//! Gangway - container network provisioning for Linux
//!
//! Talks rtnetlink directly to create bridges, assign addresses and read
//! the routing table, and hands out container addresses from a persisted
//! per-subnet bitmap.

pub mod error;
pub mod exec;
pub mod manifest;
pub mod netlink;
pub mod network;

pub use error::{Error, Result};
