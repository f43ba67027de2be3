//! Network registry
//!
//! Owns the registered drivers, the provisioned networks and the IPAM
//! allocator. Each network is persisted as a JSON file named after it.

use crate::error::{Error, Result};
use crate::manifest::GangwayConfig;
use crate::netlink::socket::NetlinkSocket;
use crate::network::bridge::BridgeDriver;
use crate::network::driver::NetworkDriver;
use crate::network::ipam::{self, Ipam};
use crate::network::nat::Iptables;
use crate::network::types::Network;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Registry of drivers and networks
pub struct NetworkManager {
    network_dir: PathBuf,
    drivers: HashMap<String, Box<dyn NetworkDriver>>,
    networks: BTreeMap<String, Network>,
    ipam: Ipam,
}

impl NetworkManager {
    /// Empty manager; call [`register_driver`](Self::register_driver) and
    /// [`load`](Self::load) before use
    pub fn new(network_dir: impl Into<PathBuf>, ipam: Ipam) -> Self {
        Self {
            network_dir: network_dir.into(),
            drivers: HashMap::new(),
            networks: BTreeMap::new(),
            ipam,
        }
    }

    /// Manager with the bridge driver registered and saved networks loaded
    pub fn init(config: &GangwayConfig) -> Result<Self> {
        let socket = NetlinkSocket::open_with_timeout(config.netlink.timeout())?;
        let nat = Iptables::new(config.nat.iptables.clone(), config.nat.timeout());

        let mut manager = Self::new(
            config.paths.network_dir.clone(),
            Ipam::new(config.paths.ipam_file.clone()),
        );
        manager.register_driver(Box::new(BridgeDriver::new(Box::new(socket), Box::new(nat))));
        manager.load()?;
        Ok(manager)
    }

    /// Register a driver under its name, replacing any previous one
    pub fn register_driver(&mut self, driver: Box<dyn NetworkDriver>) {
        debug!(driver = driver.name(), "registering network driver");
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Load every saved network from the network directory
    ///
    /// Unreadable or unparsable files are skipped with a warning.
    pub fn load(&mut self) -> Result<()> {
        fs::create_dir_all(&self.network_dir)
            .map_err(|e| Error::persistence(&self.network_dir, e))?;

        let entries =
            fs::read_dir(&self.network_dir).map_err(|e| Error::persistence(&self.network_dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| Error::persistence(&self.network_dir, e))?;
            let path = entry.path();

            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_file || name.ends_with(".tmp") {
                continue;
            }

            match read_network(&path) {
                Ok(network) => {
                    debug!(name, subnet = %network.subnet(), "loaded network");
                    self.networks.insert(name.to_string(), network);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping network file"),
            }
        }

        info!(count = self.networks.len(), "networks loaded");
        Ok(())
    }

    /// Create network `name` on `subnet` with the named driver
    ///
    /// The first free address of the subnet becomes the gateway.
    pub fn create_network(&mut self, driver: &str, subnet: &Ipv4Net, name: &str) -> Result<Network> {
        validate_name(name)?;
        if self.networks.contains_key(name) {
            return Err(Error::NetworkExists(name.to_string()));
        }

        let driver = self
            .drivers
            .get(driver)
            .ok_or_else(|| Error::UnknownDriver(driver.to_string()))?;

        let subnet = subnet.trunc();
        let gateway_ip = self.ipam.allocate(&subnet)?;
        let gateway = Ipv4Net::new(gateway_ip, subnet.prefix_len())
            .map_err(|e| Error::InvalidSubnet(e.to_string()))?;

        let network = match driver.create(gateway, name) {
            Ok(network) => network,
            Err(e) => {
                if let Err(release) = self.ipam.release(&subnet, gateway_ip) {
                    warn!(%subnet, gateway = %gateway_ip, error = %release, "failed to release gateway");
                }
                return Err(e);
            }
        };

        if let Err(e) = self.save(&network) {
            if let Err(cleanup) = driver.delete(&network) {
                warn!(name, error = %cleanup, "failed to tear down unsaved network");
            }
            if let Err(release) = self.ipam.release(&subnet, gateway_ip) {
                warn!(%subnet, gateway = %gateway_ip, error = %release, "failed to release gateway");
            }
            return Err(e);
        }
        info!(
            name,
            driver = %network.driver_name,
            ip_range = %network.ip_range,
            "network created"
        );

        self.networks.insert(name.to_string(), network.clone());
        Ok(network)
    }

    /// Tear down a network, release its gateway and forget it
    pub fn remove_network(&mut self, name: &str) -> Result<()> {
        let network = self
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NetworkNotFound(name.to_string()))?;

        let driver = self
            .drivers
            .get(&network.driver_name)
            .ok_or_else(|| Error::UnknownDriver(network.driver_name.clone()))?;

        driver.delete(&network)?;
        self.ipam.release(&network.subnet(), network.gateway())?;

        let path = self.network_dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::persistence(path, e)),
        }

        self.networks.remove(name);
        info!(name, "network removed");
        Ok(())
    }

    /// Known networks, ordered by name
    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    pub fn get(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    pub fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    fn save(&self, network: &Network) -> Result<()> {
        let path = self.network_dir.join(&network.name);
        let bytes = serde_json::to_vec(network).map_err(|e| Error::json(&path, e))?;
        ipam::write_atomic(&path, &bytes)
    }
}

fn read_network(path: &Path) -> Result<Network> {
    let bytes = fs::read(path).map_err(|e| Error::persistence(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::json(path, e))
}

/// Network names double as file names; `.tmp` is reserved for in-flight writes
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\0'])
        || name.ends_with(".tmp")
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}
