//! Network and endpoint records

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// A provisioned network, persisted as `<network_dir>/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    /// Gateway address with the subnet's prefix length
    pub ip_range: Ipv4Net,
    pub driver_name: String,
    /// The driver created the network device and owns its removal
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub created_device: bool,
}

impl Network {
    /// Subnet with host bits cleared
    pub fn subnet(&self) -> Ipv4Net {
        self.ip_range.trunc()
    }

    /// Gateway address assigned to the network device
    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.addr()
    }
}

/// A container's attachment to a network
///
/// Declared for connect/disconnect; no current operation creates one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub device: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<String>,
    #[serde(default)]
    pub port_mappings: Vec<String>,
    pub network: String,
}
