//! Container network provisioning
//!
//! Provides:
//! - Bitmap IP address allocation (IPAM)
//! - The Linux bridge driver with outbound NAT
//! - A registry of drivers and provisioned networks

pub mod bridge;
pub mod driver;
pub mod ipam;
pub mod manager;
pub mod nat;
pub mod types;

pub use bridge::{BRIDGE_DRIVER, BridgeDriver, LinkControl};
pub use driver::NetworkDriver;
pub use ipam::Ipam;
pub use manager::NetworkManager;
pub use nat::{Iptables, MasqueradeRule, NatControl};
pub use types::{Endpoint, Network};
