//! Network driver interface

use crate::error::Result;
use crate::network::types::{Endpoint, Network};
use ipnet::Ipv4Net;

/// A backend that realizes networks on the host
pub trait NetworkDriver {
    /// Registry key, stored as the network's `driverName`
    fn name(&self) -> &str;

    /// Provision network `name`
    ///
    /// `gateway` is the address the network device takes, carrying the
    /// subnet's prefix length.
    fn create(&self, gateway: Ipv4Net, name: &str) -> Result<Network>;

    /// Tear down everything `create` provisioned
    fn delete(&self, network: &Network) -> Result<()>;

    /// Attach an endpoint to the network
    fn connect(&self, network: &Network, endpoint: &mut Endpoint) -> Result<()>;

    /// Detach an endpoint from the network
    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;
}
