//! Linux bridge network driver
//!
//! Provides:
//! - Idempotent bridge creation
//! - Gateway address assignment and link-up
//! - Outbound masquerade for the bridge subnet
//! - Rollback of a half-provisioned bridge
//!
//! A bridge that existed before `create` is adopted but never deleted.

use crate::error::{Error, Result};
use crate::netlink::link::{self, Link};
use crate::netlink::socket::NetlinkSocket;
use crate::network::driver::NetworkDriver;
use crate::network::nat::{MasqueradeRule, NatControl};
use crate::network::types::{Endpoint, Network};
use ipnet::Ipv4Net;
use nix::errno::Errno;
use tracing::{debug, info, warn};

/// Driver name used in the registry
pub const BRIDGE_DRIVER: &str = "bridge";

/// Kernel link operations the bridge driver needs
pub trait LinkControl {
    /// Look up a link by name
    fn find(&self, name: &str) -> Result<Option<Link>>;

    /// Create a bridge device and return it
    fn create_bridge(&self, name: &str) -> Result<Link>;

    /// Assign an address (with prefix) to a link
    fn add_address(&self, link: &Link, addr: Ipv4Net) -> Result<()>;

    /// Bring a link up
    fn set_up(&self, link: &Link) -> Result<()>;

    /// Delete a link
    fn delete(&self, link: &Link) -> Result<()>;
}

impl LinkControl for NetlinkSocket {
    fn find(&self, name: &str) -> Result<Option<Link>> {
        link::get_by_name(self, name)
    }

    fn create_bridge(&self, name: &str) -> Result<Link> {
        link::create_bridge(self, name)?;
        link::get_by_name(self, name)?.ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
    }

    fn add_address(&self, link: &Link, addr: Ipv4Net) -> Result<()> {
        link::add_address(self, link, addr)
    }

    fn set_up(&self, link: &Link) -> Result<()> {
        link::set_up(self, link)
    }

    fn delete(&self, link: &Link) -> Result<()> {
        link::delete(self, link)
    }
}

/// Bridge driver: one Linux bridge per network, named after the network
pub struct BridgeDriver {
    links: Box<dyn LinkControl>,
    nat: Box<dyn NatControl>,
}

impl BridgeDriver {
    pub fn new(links: Box<dyn LinkControl>, nat: Box<dyn NatControl>) -> Self {
        Self { links, nat }
    }

    /// Find the bridge or create it; the flag tells whether this call created it
    fn ensure_bridge(&self, name: &str) -> Result<(Link, bool)> {
        if let Some(existing) = self.links.find(name)? {
            if !existing.is_bridge() {
                return Err(Error::NotABridge(name.to_string()));
            }
            debug!(name, index = existing.index, "bridge already exists");
            return Ok((existing, false));
        }

        match self.links.create_bridge(name) {
            Ok(created) => Ok((created, true)),
            // Lost a race with another creator
            Err(e) if e.errno() == Some(Errno::EEXIST) => {
                warn!(name, "bridge appeared concurrently, reusing it");
                let existing = self
                    .links
                    .find(name)?
                    .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;
                if !existing.is_bridge() {
                    return Err(Error::NotABridge(name.to_string()));
                }
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Steps after the device exists; any failure triggers rollback
    fn configure(&self, bridge: &Link, gateway: Ipv4Net) -> Result<()> {
        match self.links.add_address(bridge, gateway) {
            Ok(()) => {}
            Err(e) if e.errno() == Some(Errno::EEXIST) => {
                warn!(name = %bridge.name, %gateway, "gateway address already assigned");
            }
            Err(e) => return Err(Error::provision("assign gateway", e)),
        }

        self.links
            .set_up(bridge)
            .map_err(|e| Error::provision("set link up", e))?;

        self.nat
            .ensure(&MasqueradeRule::new(gateway, &bridge.name))
            .map_err(|e| Error::provision("install masquerade rule", e))
    }

    fn rollback(&self, bridge: &Link) {
        if let Err(e) = self.links.delete(bridge) {
            warn!(name = %bridge.name, error = %e, "rollback: failed to delete bridge");
        } else {
            info!(name = %bridge.name, "rollback: bridge deleted");
        }
    }
}

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE_DRIVER
    }

    fn create(&self, gateway: Ipv4Net, name: &str) -> Result<Network> {
        link::validate_name(name)?;

        let (bridge, created) = self
            .ensure_bridge(name)
            .map_err(|e| Error::provision("create bridge", e))?;

        if let Err(e) = self.configure(&bridge, gateway) {
            if created {
                self.rollback(&bridge);
            }
            return Err(e);
        }

        info!(name, %gateway, index = bridge.index, "bridge network provisioned");
        Ok(Network {
            name: name.to_string(),
            ip_range: gateway,
            driver_name: BRIDGE_DRIVER.to_string(),
            created_device: created,
        })
    }

    fn delete(&self, network: &Network) -> Result<()> {
        self.nat
            .remove(&MasqueradeRule::new(network.ip_range, &network.name))?;

        if !network.created_device {
            info!(name = %network.name, "bridge predates the network, leaving it in place");
            return Ok(());
        }

        match self.links.find(&network.name)? {
            Some(bridge) => {
                self.links.delete(&bridge)?;
                info!(name = %network.name, "bridge deleted");
            }
            None => debug!(name = %network.name, "bridge already gone"),
        }
        Ok(())
    }

    fn connect(&self, _network: &Network, _endpoint: &mut Endpoint) -> Result<()> {
        Err(Error::Unsupported("bridge connect"))
    }

    fn disconnect(&self, _network: &Network, _endpoint: &Endpoint) -> Result<()> {
        Err(Error::Unsupported("bridge disconnect"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    pub(crate) struct HostState {
        pub links: BTreeMap<String, Link>,
        pub addresses: Vec<(String, Ipv4Net)>,
        pub up: Vec<String>,
        pub rules: Vec<MasqueradeRule>,
        pub fail_step: Option<&'static str>,
        next_index: u32,
    }

    impl HostState {
        fn fail(&self, step: &'static str) -> Result<()> {
            if self.fail_step == Some(step) {
                return Err(Error::kernel(libc::EPERM));
            }
            Ok(())
        }
    }

    /// In-memory host shared between the link and NAT fakes
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeHost(pub Rc<RefCell<HostState>>);

    impl LinkControl for FakeHost {
        fn find(&self, name: &str) -> Result<Option<Link>> {
            Ok(self.0.borrow().links.get(name).cloned())
        }

        fn create_bridge(&self, name: &str) -> Result<Link> {
            let mut state = self.0.borrow_mut();
            state.fail("create")?;
            if state.links.contains_key(name) {
                return Err(Error::kernel(libc::EEXIST));
            }
            state.next_index += 1;
            let link = Link {
                index: state.next_index + 10,
                name: name.to_string(),
                mtu: Some(1500),
                kind: Some("bridge".to_string()),
            };
            state.links.insert(name.to_string(), link.clone());
            Ok(link)
        }

        fn add_address(&self, link: &Link, addr: Ipv4Net) -> Result<()> {
            let mut state = self.0.borrow_mut();
            state.fail("address")?;
            let entry = (link.name.clone(), addr);
            if state.addresses.contains(&entry) {
                return Err(Error::kernel(libc::EEXIST));
            }
            state.addresses.push(entry);
            Ok(())
        }

        fn set_up(&self, link: &Link) -> Result<()> {
            let mut state = self.0.borrow_mut();
            state.fail("up")?;
            state.up.push(link.name.clone());
            Ok(())
        }

        fn delete(&self, link: &Link) -> Result<()> {
            let mut state = self.0.borrow_mut();
            state.links.remove(&link.name);
            state.addresses.retain(|(name, _)| name != &link.name);
            Ok(())
        }
    }

    impl NatControl for FakeHost {
        fn ensure(&self, rule: &MasqueradeRule) -> Result<()> {
            let mut state = self.0.borrow_mut();
            state.fail("nat")?;
            if !state.rules.contains(rule) {
                state.rules.push(rule.clone());
            }
            Ok(())
        }

        fn remove(&self, rule: &MasqueradeRule) -> Result<()> {
            self.0.borrow_mut().rules.retain(|r| r != rule);
            Ok(())
        }
    }

    impl FakeHost {
        /// Add a link that exists before any driver call
        pub(crate) fn with_link(self, name: &str, kind: Option<&str>) -> Self {
            {
                let mut state = self.0.borrow_mut();
                state.next_index += 1;
                let link = Link {
                    index: state.next_index + 10,
                    name: name.to_string(),
                    mtu: Some(1500),
                    kind: kind.map(str::to_string),
                };
                state.links.insert(name.to_string(), link);
            }
            self
        }
    }

    pub(crate) fn driver(host: &FakeHost) -> BridgeDriver {
        BridgeDriver::new(Box::new(host.clone()), Box::new(host.clone()))
    }

    fn gateway() -> Ipv4Net {
        "192.168.0.1/24".parse().unwrap()
    }

    #[test]
    fn test_create_provisions_bridge() {
        let host = FakeHost::default();
        let network = driver(&host).create(gateway(), "gw0").unwrap();

        assert_eq!(network.name, "gw0");
        assert_eq!(network.ip_range, gateway());
        assert_eq!(network.driver_name, BRIDGE_DRIVER);
        assert!(network.created_device);

        let state = host.0.borrow();
        assert!(state.links.contains_key("gw0"));
        assert_eq!(state.addresses, vec![("gw0".to_string(), gateway())]);
        assert_eq!(state.up, vec!["gw0".to_string()]);
        assert_eq!(state.rules[0].subnet.to_string(), "192.168.0.0/24");
        assert_eq!(state.rules[0].bridge, "gw0");
    }

    #[test]
    fn test_create_twice_is_idempotent() {
        let host = FakeHost::default();
        let driver = driver(&host);

        driver.create(gateway(), "gw0").unwrap();
        driver.create(gateway(), "gw0").unwrap();

        let state = host.0.borrow();
        assert_eq!(state.links.len(), 1);
        assert_eq!(state.addresses.len(), 1);
        assert_eq!(state.rules.len(), 1);
    }

    #[test]
    fn test_failed_step_rolls_back_new_bridge() {
        for step in ["address", "up", "nat"] {
            let host = FakeHost::default();
            host.0.borrow_mut().fail_step = Some(step);

            let err = driver(&host).create(gateway(), "gw0").unwrap_err();
            assert!(matches!(err, Error::Provision { .. }), "step {}", step);
            assert_eq!(err.errno(), Some(Errno::EPERM));

            let state = host.0.borrow();
            assert!(state.links.is_empty(), "step {} left the bridge", step);
            assert!(state.rules.is_empty());
        }
    }

    #[test]
    fn test_rollback_keeps_existing_bridge() {
        let host = FakeHost::default();
        let driver = driver(&host);
        driver.create(gateway(), "gw0").unwrap();

        host.0.borrow_mut().fail_step = Some("up");
        assert!(driver.create(gateway(), "gw0").is_err());
        assert!(host.0.borrow().links.contains_key("gw0"));
    }

    #[test]
    fn test_create_failure_is_wrapped() {
        let host = FakeHost::default();
        host.0.borrow_mut().fail_step = Some("create");

        let err = driver(&host).create(gateway(), "gw0").unwrap_err();
        assert!(matches!(
            err,
            Error::Provision {
                step: "create bridge",
                ..
            }
        ));
    }

    #[test]
    fn test_create_rejects_long_name() {
        let host = FakeHost::default();
        assert!(matches!(
            driver(&host).create(gateway(), "much-too-long-bridge"),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_delete_removes_rule_and_link() {
        let host = FakeHost::default();
        let driver = driver(&host);
        let network = driver.create(gateway(), "gw0").unwrap();

        driver.delete(&network).unwrap();
        driver.delete(&network).unwrap();

        let state = host.0.borrow();
        assert!(state.links.is_empty());
        assert!(state.rules.is_empty());
    }

    #[test]
    fn test_delete_keeps_adopted_bridge() {
        let host = FakeHost::default().with_link("docker0", Some("bridge"));
        let driver = driver(&host);

        let network = driver.create(gateway(), "docker0").unwrap();
        assert!(!network.created_device);

        driver.delete(&network).unwrap();

        let state = host.0.borrow();
        assert!(state.links.contains_key("docker0"));
        assert!(state.rules.is_empty());
    }

    #[test]
    fn test_create_refuses_non_bridge_link() {
        let host = FakeHost::default().with_link("eth0", None);

        let err = driver(&host).create(gateway(), "eth0").unwrap_err();
        assert!(matches!(
            err,
            Error::Provision {
                step: "create bridge",
                ..
            }
        ));

        let state = host.0.borrow();
        assert!(state.links.contains_key("eth0"));
        assert!(state.addresses.is_empty());
        assert!(state.rules.is_empty());
    }

    #[test]
    fn test_connect_is_unsupported() {
        let host = FakeHost::default();
        let driver = driver(&host);
        let network = driver.create(gateway(), "gw0").unwrap();
        let mut endpoint = Endpoint::default();

        assert!(matches!(
            driver.connect(&network, &mut endpoint),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            driver.disconnect(&network, &endpoint),
            Err(Error::Unsupported(_))
        ));
    }
}
