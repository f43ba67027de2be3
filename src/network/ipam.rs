//! IP address management for container subnets
//!
//! Provides:
//! - Lowest-free-first IPv4 allocation from a subnet bitmap
//! - Release of allocated addresses
//! - A shared on-disk table guarded by an advisory file lock
//!
//! The table maps each subnet (in CIDR notation) to one byte per host slot,
//! 0 = free, 1 = allocated. Slot 0 is the address right after the network
//! address, so a subnet with `B` host bits has `2^B` slots.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use nix::fcntl::{Flock, FlockArg};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Shortest prefix accepted
///
/// /12 covers the widest default pools container engines hand out
/// (172.16.0.0/12) and bounds a bitmap at 2^20 slots.
pub const MIN_PREFIX_LEN: u8 = 12;

/// Allocation table as persisted: CIDR -> slot bitmap
pub type AllocationTable = BTreeMap<String, Vec<u8>>;

/// Bitmap allocator persisted to a single JSON file
#[derive(Debug, Clone)]
pub struct Ipam {
    path: PathBuf,
}

impl Ipam {
    /// Allocator backed by the table at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the allocation table
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate the lowest free address in `subnet`
    ///
    /// An unseen subnet starts with every slot free. Fails with
    /// [`Error::SubnetExhausted`] once every slot is taken.
    pub fn allocate(&self, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
        let subnet = normalize(subnet)?;
        let slots = slot_count(&subnet);
        let key = subnet.to_string();

        let _lock = self.lock()?;
        let mut table = self.load()?;

        let bitmap = table
            .entry(key.clone())
            .or_insert_with(|| vec![0u8; slots]);
        check_len(&key, bitmap, slots)?;

        let offset = bitmap
            .iter()
            .position(|&slot| slot == 0)
            .ok_or_else(|| Error::SubnetExhausted(key.clone()))?;
        bitmap[offset] = 1;

        let addr = address_at(&subnet, offset);
        self.store(&table)?;

        info!(subnet = %key, %addr, "address allocated");
        Ok(addr)
    }

    /// Return `addr` to `subnet`'s pool
    ///
    /// Releasing a free address, or one from a subnet never allocated from,
    /// is a no-op.
    pub fn release(&self, subnet: &Ipv4Net, addr: Ipv4Addr) -> Result<()> {
        let subnet = normalize(subnet)?;
        let slots = slot_count(&subnet);
        let key = subnet.to_string();
        let offset = offset_of(&subnet, addr)?;

        let _lock = self.lock()?;
        let mut table = self.load()?;

        let Some(bitmap) = table.get_mut(&key) else {
            debug!(subnet = %key, %addr, "release from unknown subnet ignored");
            return Ok(());
        };
        check_len(&key, bitmap, slots)?;

        if bitmap[offset] == 0 {
            debug!(subnet = %key, %addr, "address already free");
            return Ok(());
        }
        bitmap[offset] = 0;
        self.store(&table)?;

        info!(subnet = %key, %addr, "address released");
        Ok(())
    }

    /// Snapshot of the persisted table
    pub fn allocations(&self) -> Result<AllocationTable> {
        let _lock = self.lock()?;
        self.load()
    }

    /// Take the exclusive lock that serializes every read-modify-write
    fn lock(&self) -> Result<Flock<File>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::persistence(parent, e))?;
        }

        let lock_path = sibling(&self.path, "lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::persistence(&lock_path, e))?;

        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::persistence(&lock_path, errno.into()))
    }

    fn load(&self) -> Result<AllocationTable> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(AllocationTable::new()),
            Err(e) => return Err(Error::persistence(&self.path, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(AllocationTable::new());
        }

        serde_json::from_slice(&bytes).map_err(|e| Error::json(&self.path, e))
    }

    /// Write through a temporary file so readers never see a partial table
    fn store(&self, table: &AllocationTable) -> Result<()> {
        let bytes = serde_json::to_vec(table).map_err(|e| Error::json(&self.path, e))?;
        write_atomic(&self.path, &bytes)
    }
}

/// Replace `path` with `bytes` via write-to-temp and rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = sibling(path, "tmp");

    let mut file = File::create(&tmp).map_err(|e| Error::persistence(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::persistence(&tmp, e))?;

    fs::rename(&tmp, path).map_err(|e| Error::persistence(path, e))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Truncate host bits and reject subnets the bitmap cannot represent
fn normalize(subnet: &Ipv4Net) -> Result<Ipv4Net> {
    let subnet = subnet.trunc();
    if subnet.prefix_len() < MIN_PREFIX_LEN {
        return Err(Error::InvalidSubnet(format!(
            "{} (prefix must be /{} or longer)",
            subnet, MIN_PREFIX_LEN
        )));
    }

    let base = u32::from(subnet.network());
    if base.checked_add(slot_count(&subnet) as u32).is_none() {
        return Err(Error::InvalidSubnet(format!(
            "{} (allocations would overflow the address space)",
            subnet
        )));
    }

    Ok(subnet)
}

fn slot_count(subnet: &Ipv4Net) -> usize {
    1usize << (32 - subnet.prefix_len())
}

fn check_len(key: &str, bitmap: &[u8], slots: usize) -> Result<()> {
    if bitmap.len() != slots {
        return Err(Error::CorruptTable(format!(
            "{} has {} slots, expected {}",
            key,
            bitmap.len(),
            slots
        )));
    }
    Ok(())
}

fn address_at(subnet: &Ipv4Net, offset: usize) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + offset as u32 + 1)
}

fn offset_of(subnet: &Ipv4Net, addr: Ipv4Addr) -> Result<usize> {
    let base = u32::from(subnet.network());
    let value = u32::from(addr);
    let slots = slot_count(subnet) as u32;

    if value <= base || value - base > slots {
        return Err(Error::AddressNotInSubnet {
            addr: addr.to_string(),
            subnet: subnet.to_string(),
        });
    }

    Ok((value - base - 1) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Ipam) {
        let dir = TempDir::new().unwrap();
        let ipam = Ipam::new(dir.path().join("ipam").join("subnet.json"));
        (dir, ipam)
    }

    fn net(cidr: &str) -> Ipv4Net {
        cidr.parse().unwrap()
    }

    #[test]
    fn test_allocate_lowest_free_and_reuse() {
        let (_dir, ipam) = setup();
        let subnet = net("192.168.0.0/24");

        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(192, 168, 0, 2));

        ipam.release(&subnet, Ipv4Addr::new(192, 168, 0, 1)).unwrap();
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(192, 168, 0, 3));
    }

    #[test]
    fn test_exhaustion_is_explicit() {
        let (_dir, ipam) = setup();

        for (cidr, host_bits) in [("10.1.0.0/30", 2), ("10.2.0.0/32", 0), ("10.3.0.0/28", 4)] {
            let subnet = net(cidr);
            for _ in 0..(1 << host_bits) {
                ipam.allocate(&subnet).unwrap();
            }
            assert!(matches!(
                ipam.allocate(&subnet),
                Err(Error::SubnetExhausted(_))
            ));
        }
    }

    #[test]
    fn test_carry_across_octets() {
        let (_dir, ipam) = setup();
        let subnet = net("172.16.0.0/23");

        let mut last = Ipv4Addr::UNSPECIFIED;
        for _ in 0..256 {
            last = ipam.allocate(&subnet).unwrap();
        }
        assert_eq!(last, Ipv4Addr::new(172, 16, 1, 0));
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(172, 16, 1, 1));

        ipam.release(&subnet, Ipv4Addr::new(172, 16, 1, 0)).unwrap();
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(172, 16, 1, 0));
    }

    #[test]
    fn test_table_persists_across_instances() {
        let (_dir, ipam) = setup();
        let subnet = net("10.0.0.0/24");
        ipam.allocate(&subnet).unwrap();

        let reopened = Ipam::new(ipam.path());
        assert_eq!(reopened.allocate(&subnet).unwrap(), Ipv4Addr::new(10, 0, 0, 2));

        let table = reopened.allocations().unwrap();
        let bitmap = &table["10.0.0.0/24"];
        assert_eq!(bitmap.len(), 256);
        assert_eq!(&bitmap[..3], &[1, 1, 0]);
    }

    #[test]
    fn test_host_bits_are_truncated() {
        let (_dir, ipam) = setup();
        let addr = ipam.allocate(&net("192.168.5.77/24")).unwrap();
        assert_eq!(addr, Ipv4Addr::new(192, 168, 5, 1));
        assert!(ipam.allocations().unwrap().contains_key("192.168.5.0/24"));
    }

    #[test]
    fn test_release_outside_subnet() {
        let (_dir, ipam) = setup();
        let subnet = net("192.168.0.0/24");
        ipam.allocate(&subnet).unwrap();

        for addr in [Ipv4Addr::new(192, 168, 0, 0), Ipv4Addr::new(10, 0, 0, 1)] {
            assert!(matches!(
                ipam.release(&subnet, addr),
                Err(Error::AddressNotInSubnet { .. })
            ));
        }
    }

    #[test]
    fn test_release_unknown_or_free_is_noop() {
        let (_dir, ipam) = setup();
        let subnet = net("192.168.0.0/24");

        ipam.release(&subnet, Ipv4Addr::new(192, 168, 0, 9)).unwrap();
        assert!(!ipam.path().exists());

        ipam.allocate(&subnet).unwrap();
        ipam.release(&subnet, Ipv4Addr::new(192, 168, 0, 9)).unwrap();
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(192, 168, 0, 2));
    }

    #[test]
    fn test_rejects_wide_prefix() {
        let (_dir, ipam) = setup();
        assert!(matches!(
            ipam.allocate(&net("10.0.0.0/11")),
            Err(Error::InvalidSubnet(_))
        ));
        assert!(matches!(
            ipam.allocate(&net("255.255.255.255/32")),
            Err(Error::InvalidSubnet(_))
        ));
    }

    #[test]
    fn test_allocates_from_widest_prefix() {
        let (_dir, ipam) = setup();
        let subnet = net("172.16.0.0/12");
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(172, 16, 0, 2));
    }

    #[test]
    fn test_corrupt_bitmap_length() {
        let (_dir, ipam) = setup();
        fs::create_dir_all(ipam.path().parent().unwrap()).unwrap();
        fs::write(ipam.path(), r#"{"10.0.0.0/24":[1,0]}"#).unwrap();

        assert!(matches!(
            ipam.allocate(&net("10.0.0.0/24")),
            Err(Error::CorruptTable(_))
        ));
    }

    #[test]
    fn test_invalid_json() {
        let (_dir, ipam) = setup();
        fs::create_dir_all(ipam.path().parent().unwrap()).unwrap();
        fs::write(ipam.path(), "{not json").unwrap();

        assert!(matches!(
            ipam.allocate(&net("10.0.0.0/24")),
            Err(Error::Json { .. })
        ));
    }

    #[test]
    fn test_large_table_is_read_in_full() {
        let (_dir, ipam) = setup();
        let subnet = net("10.9.0.0/16");
        ipam.allocate(&subnet).unwrap();

        assert!(fs::metadata(ipam.path()).unwrap().len() > 4096);
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(10, 9, 0, 2));
    }
}
