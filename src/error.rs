//! Unified error types for Gangway

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Gangway operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Netlink transport errors
    #[error("Netlink socket {op} failed: {source}")]
    Socket {
        op: &'static str,
        source: io::Error,
    },

    #[error("Timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    // Netlink protocol errors
    #[error("Short netlink response: got {len} bytes, need at least a header")]
    ShortResponse { len: usize },

    #[error("Malformed netlink message: {0}")]
    MalformedMessage(String),

    #[error("Netlink sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u32, actual: u32 },

    #[error("Netlink pid mismatch: expected {expected}, got {actual}")]
    PidMismatch { expected: u32, actual: u32 },

    #[error("Kernel returned error {code}: {errno}")]
    Kernel { code: i32, errno: nix::errno::Errno },

    // Routing errors
    #[error("No default route found")]
    NoDefaultRoute,

    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Interface '{0}' exists and is not a bridge")]
    NotABridge(String),

    // Address management errors
    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("Address {addr} is not in subnet {subnet}")]
    AddressNotInSubnet { addr: String, subnet: String },

    #[error("No available addresses in {0}")]
    SubnetExhausted(String),

    #[error("Corrupt allocation table: {0}")]
    CorruptTable(String),

    // Persistence errors
    #[error("Failed to access '{path}': {source}")]
    Persistence { path: PathBuf, source: io::Error },

    #[error("Invalid JSON in '{path}': {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    // Network registry errors
    #[error("Unknown network driver '{0}'")]
    UnknownDriver(String),

    #[error("Network '{0}' already exists")]
    NetworkExists(String),

    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    #[error("Invalid network name '{0}'")]
    InvalidName(String),

    // Provisioning errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Bridge provisioning failed at '{step}': {source}")]
    Provision {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Build a kernel error from the (positive) errno carried in an NLMSG_ERROR reply
    pub fn kernel(code: i32) -> Self {
        Error::Kernel {
            code,
            errno: nix::errno::Errno::from_raw(code),
        }
    }

    /// Kernel errno, if this is a kernel-reported error
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self {
            Error::Kernel { errno, .. } => Some(*errno),
            Error::Provision { source, .. } => source.errno(),
            _ => None,
        }
    }

    /// Wrap an error as a failed provisioning step
    pub fn provision(step: &'static str, source: Error) -> Self {
        Error::Provision {
            step,
            source: Box::new(source),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Error::Json {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for Gangway operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_kernel_error_carries_errno() {
        let err = Error::kernel(libc::EEXIST);
        assert_eq!(err.errno(), Some(Errno::EEXIST));
        assert!(err.to_string().contains("17"));
    }

    #[test]
    fn test_provision_error_exposes_inner_errno() {
        let err = Error::provision("assign gateway", Error::kernel(libc::EPERM));
        assert_eq!(err.errno(), Some(Errno::EPERM));
        assert!(err.to_string().contains("assign gateway"));
    }
}
