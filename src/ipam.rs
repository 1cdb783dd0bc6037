//! Allocation of appliance addresses from the config network.
//!
//! Allocations are persisted in a sqlite catalog shared by every operation and every process on
//! the machine. The catalog is opened for each operation so that allocations made by other
//! processes are always observed.

use std::{
    collections::BTreeSet,
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use ipnetwork::Ipv4Network;
use log::{debug, info, warn};

use commissioner_api::{
    config::ConfigNetwork,
    error::{CatalogError, CommissionError, ReportError, ResourceExhaustionError},
};

/// Address range appliances may be given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPool {
    pub network: Ipv4Network,
    pub start: Option<Ipv4Addr>,
    pub end: Option<Ipv4Addr>,
    pub gateway: Ipv4Addr,
}

impl IpPool {
    pub fn from_config(config: &ConfigNetwork) -> Result<Self, CommissionError> {
        let network = config.network().map_err(CommissionError::new)?;
        Ok(Self {
            network,
            start: config.start_ip,
            end: config.end_ip,
            gateway: config.gateway,
        })
    }

    /// Key the pool's allocations are stored under. Host bits written in the CIDR are dropped,
    /// so every spelling of a network shares one key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.network.network(), self.network.prefix())
    }

    /// Addresses that may be handed out, in ascending order.
    ///
    /// Network and broadcast addresses are excluded for prefixes shorter than /31, and the
    /// gateway is never a candidate.
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let first = u32::from(self.network.network());
        let last = u32::from(self.network.broadcast());
        let (first, last) = if self.network.prefix() < 31 {
            (first.saturating_add(1), last.saturating_sub(1))
        } else {
            (first, last)
        };
        let first = self.start.map_or(first, |s| first.max(u32::from(s)));
        let last = self.end.map_or(last, |e| last.min(u32::from(e)));

        (first..=last)
            .map(Ipv4Addr::from)
            .filter(move |ip| *ip != self.gateway)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.network.mask()
    }
}

/// Hands out and takes back pool addresses. Every read-modify-write of the catalog happens
/// while holding `lock`.
pub struct IpAllocator {
    catalog: PathBuf,
    lock: Mutex<()>,
}

impl IpAllocator {
    pub fn new(catalog: impl Into<PathBuf>) -> Self {
        Self {
            catalog: catalog.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn catalog_path(&self) -> &Path {
        &self.catalog
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The guarded state lives in the catalog, so a poisoned lock carries no broken invariant.
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self) -> Result<sqlite::Connection, CommissionError> {
        if let Some(parent) = self.catalog.parent() {
            fs::create_dir_all(parent).structured(CatalogError::CreateCatalogDirectory)?;
        }

        let db = sqlite::open(&self.catalog).structured(CatalogError::OpenCatalog {
            path: self.catalog.to_string_lossy().into(),
        })?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS allocations (
                pool TEXT NOT NULL,
                address TEXT NOT NULL,
                owner TEXT NOT NULL,
                allocated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (pool, address)
            )",
        )
        .structured(CatalogError::InitializeCatalog)?;
        Ok(db)
    }

    fn read_allocated(
        db: &sqlite::Connection,
        pool: &IpPool,
    ) -> Result<BTreeSet<Ipv4Addr>, CommissionError> {
        let mut statement = db
            .prepare("SELECT address FROM allocations WHERE pool = ?")
            .structured(CatalogError::ReadCatalog)?;
        statement
            .bind((1, pool.key().as_str()))
            .structured(CatalogError::ReadCatalog)?;

        let mut allocated = BTreeSet::new();
        for row in statement.into_iter() {
            let row = row.structured(CatalogError::ReadCatalog)?;
            let address = row.read::<&str, _>(0);
            match address.parse() {
                Ok(ip) => {
                    allocated.insert(ip);
                }
                Err(_) => warn!("Ignoring malformed catalog entry '{address}'"),
            }
        }
        Ok(allocated)
    }

    /// Runs `f` inside an immediate transaction, committing on success and rolling back
    /// otherwise.
    fn transaction<T>(
        db: &sqlite::Connection,
        f: impl FnOnce(&sqlite::Connection) -> Result<T, CommissionError>,
    ) -> Result<T, CommissionError> {
        db.execute("BEGIN IMMEDIATE")
            .structured(CatalogError::WriteCatalog)?;
        match f(db) {
            Ok(value) => {
                db.execute("COMMIT").structured(CatalogError::WriteCatalog)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = db.execute("ROLLBACK") {
                    warn!("Failed to roll back catalog transaction: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Allocates `count` distinct free addresses, lowest first, recording them under `owner`.
    ///
    /// Nothing is recorded unless all `count` addresses could be found.
    pub fn allocate(
        &self,
        pool: &IpPool,
        count: usize,
        owner: &str,
    ) -> Result<Vec<Ipv4Addr>, CommissionError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.guard();
        let db = self.open()?;
        Self::transaction(&db, |db| {
            let allocated = Self::read_allocated(db, pool)?;
            let chosen: Vec<Ipv4Addr> = pool
                .candidates()
                .filter(|ip| !allocated.contains(ip))
                .take(count)
                .collect();

            if chosen.len() < count {
                return Err(CommissionError::new(
                    ResourceExhaustionError::IpPoolExhausted {
                        pool: pool.key(),
                        requested: count,
                        available: chosen.len(),
                    },
                ));
            }

            let mut statement = db
                .prepare("INSERT INTO allocations (pool, address, owner) VALUES (?, ?, ?)")
                .structured(CatalogError::WriteCatalog)?;
            for ip in &chosen {
                statement.reset().structured(CatalogError::WriteCatalog)?;
                statement
                    .bind(&[pool.key().as_str(), ip.to_string().as_str(), owner][..])
                    .structured(CatalogError::WriteCatalog)?;
                statement.next().structured(CatalogError::WriteCatalog)?;
            }

            info!(
                "Allocated {} address(es) from '{}' for '{owner}': {:?}",
                chosen.len(),
                pool.key(),
                chosen
            );
            Ok(chosen)
        })
    }

    /// Returns addresses to the pool. Addresses that are not allocated are ignored.
    pub fn release(&self, pool: &IpPool, addresses: &[Ipv4Addr]) -> Result<(), CommissionError> {
        if addresses.is_empty() {
            return Ok(());
        }

        let _guard = self.guard();
        let db = self.open()?;
        Self::transaction(&db, |db| {
            let mut statement = db
                .prepare("DELETE FROM allocations WHERE pool = ? AND address = ?")
                .structured(CatalogError::WriteCatalog)?;
            for ip in addresses {
                statement.reset().structured(CatalogError::WriteCatalog)?;
                statement
                    .bind(&[pool.key().as_str(), ip.to_string().as_str()][..])
                    .structured(CatalogError::WriteCatalog)?;
                statement.next().structured(CatalogError::WriteCatalog)?;
            }
            Ok(())
        })?;

        info!("Released {:?} back to '{}'", addresses, pool.key());
        Ok(())
    }

    /// Records a new owner for an allocated address.
    pub fn assign_owner(
        &self,
        pool: &IpPool,
        address: Ipv4Addr,
        owner: &str,
    ) -> Result<(), CommissionError> {
        let _guard = self.guard();
        let db = self.open()?;
        let mut statement = db
            .prepare("UPDATE allocations SET owner = ? WHERE pool = ? AND address = ?")
            .structured(CatalogError::WriteCatalog)?;
        statement
            .bind(&[owner, pool.key().as_str(), address.to_string().as_str()][..])
            .structured(CatalogError::WriteCatalog)?;
        statement.next().structured(CatalogError::WriteCatalog)?;
        debug!("Address {address} in '{}' now owned by '{owner}'", pool.key());
        Ok(())
    }

    /// Currently allocated addresses of the pool.
    pub fn allocated(&self, pool: &IpPool) -> Result<BTreeSet<Ipv4Addr>, CommissionError> {
        let _guard = self.guard();
        let db = self.open()?;
        Self::read_allocated(&db, pool)
    }

    /// Addresses of the pool recorded under `owner`.
    pub fn lookup_owner(
        &self,
        pool: &IpPool,
        owner: &str,
    ) -> Result<Vec<Ipv4Addr>, CommissionError> {
        let _guard = self.guard();
        let db = self.open()?;
        let mut statement = db
            .prepare("SELECT address FROM allocations WHERE pool = ? AND owner = ?")
            .structured(CatalogError::ReadCatalog)?;
        statement
            .bind(&[pool.key().as_str(), owner][..])
            .structured(CatalogError::ReadCatalog)?;

        let mut addresses = Vec::new();
        for row in statement.into_iter() {
            let row = row.structured(CatalogError::ReadCatalog)?;
            if let Ok(ip) = row.read::<&str, _>(0).parse() {
                addresses.push(ip);
            }
        }
        addresses.sort();
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use commissioner_api::error::ErrorKind;

    use super::*;

    fn pool(cidr: &str, gateway: &str) -> IpPool {
        IpPool {
            network: cidr.parse().unwrap(),
            start: None,
            end: None,
            gateway: gateway.parse().unwrap(),
        }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_candidates_skip_reserved() {
        let p = pool("10.0.0.0/29", "10.0.0.1");
        let candidates: Vec<_> = p.candidates().collect();
        assert_eq!(
            candidates,
            vec![
                ip("10.0.0.2"),
                ip("10.0.0.3"),
                ip("10.0.0.4"),
                ip("10.0.0.5"),
                ip("10.0.0.6")
            ]
        );

        // Point-to-point networks use both addresses.
        let p = pool("10.0.0.0/31", "192.168.0.1");
        assert_eq!(p.candidates().count(), 2);
    }

    #[test]
    fn test_candidates_respect_range() {
        let mut p = pool("10.0.0.0/24", "10.0.0.1");
        p.start = Some(ip("10.0.0.100"));
        p.end = Some(ip("10.0.0.102"));
        let candidates: Vec<_> = p.candidates().collect();
        assert_eq!(
            candidates,
            vec![ip("10.0.0.100"), ip("10.0.0.101"), ip("10.0.0.102")]
        );
    }

    #[test]
    fn test_allocate_lowest_first() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpAllocator::new(dir.path().join("catalog").join("ip.sqlite"));
        let p = pool("10.0.0.0/24", "10.0.0.1");

        let first = allocator.allocate(&p, 2, "cluster-a").unwrap();
        assert_eq!(first, vec![ip("10.0.0.2"), ip("10.0.0.3")]);

        let second = allocator.allocate(&p, 1, "cluster-b").unwrap();
        assert_eq!(second, vec![ip("10.0.0.4")]);

        allocator.release(&p, &[ip("10.0.0.3")]).unwrap();
        let third = allocator.allocate(&p, 1, "cluster-c").unwrap();
        assert_eq!(third, vec![ip("10.0.0.3")]);

        assert_eq!(allocator.allocated(&p).unwrap().len(), 3);
    }

    #[test]
    fn test_exhaustion_leaves_catalog_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpAllocator::new(dir.path().join("ip.sqlite"));
        let mut p = pool("10.0.0.0/24", "10.0.0.1");
        p.start = Some(ip("10.0.0.10"));
        p.end = Some(ip("10.0.0.12"));

        allocator.allocate(&p, 1, "a").unwrap();
        let err = allocator.allocate(&p, 3, "b").unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::ResourceExhaustion(ResourceExhaustionError::IpPoolExhausted {
                pool: "10.0.0.0/24".into(),
                requested: 3,
                available: 2,
            })
        );
        assert_eq!(
            allocator.allocated(&p).unwrap(),
            BTreeSet::from([ip("10.0.0.10")])
        );
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpAllocator::new(dir.path().join("ip.sqlite"));
        let p = pool("10.0.0.0/24", "10.0.0.1");

        allocator.allocate(&p, 1, "a").unwrap();
        allocator
            .release(&p, &[ip("10.0.0.200"), ip("10.0.0.201")])
            .unwrap();
        allocator.release(&p, &[]).unwrap();
        assert_eq!(allocator.allocated(&p).unwrap().len(), 1);
    }

    #[test]
    fn test_pools_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpAllocator::new(dir.path().join("ip.sqlite"));
        let a = pool("10.0.0.0/24", "10.0.0.1");
        let b = pool("10.0.1.0/24", "10.0.1.1");

        assert_eq!(allocator.allocate(&a, 1, "x").unwrap(), vec![ip("10.0.0.2")]);
        assert_eq!(allocator.allocate(&b, 1, "x").unwrap(), vec![ip("10.0.1.2")]);
    }

    #[test]
    fn test_pool_key_ignores_host_bits() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpAllocator::new(dir.path().join("ip.sqlite"));
        let a = pool("10.0.0.0/24", "10.0.0.1");
        let b = pool("10.0.0.5/24", "10.0.0.1");
        assert_eq!(a.key(), "10.0.0.0/24");
        assert_eq!(b.key(), a.key());

        let first = allocator.allocate(&a, 1, "x").unwrap();
        let second = allocator.allocate(&b, 1, "y").unwrap();
        assert_eq!(first, vec![ip("10.0.0.2")]);
        assert_eq!(second, vec![ip("10.0.0.3")]);
        assert_eq!(allocator.allocated(&a).unwrap().len(), 2);
    }

    #[test]
    fn test_release_twice() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpAllocator::new(dir.path().join("ip.sqlite"));
        let p = pool("10.0.0.0/24", "10.0.0.1");

        let ips = allocator.allocate(&p, 3, "a").unwrap();
        allocator.release(&p, &ips[1..2]).unwrap();
        let after_first = allocator.allocated(&p).unwrap();
        allocator.release(&p, &ips[1..2]).unwrap();
        assert_eq!(allocator.allocated(&p).unwrap(), after_first);
        assert_eq!(after_first, BTreeSet::from([ips[0], ips[2]]));
    }

    #[test]
    fn test_owner_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpAllocator::new(dir.path().join("ip.sqlite"));
        let p = pool("10.0.0.0/24", "10.0.0.1");

        let ips = allocator.allocate(&p, 2, "domain-c7").unwrap();
        allocator
            .assign_owner(&p, ips[1], "ovsvapp-esx2")
            .unwrap();

        assert_eq!(
            allocator.lookup_owner(&p, "ovsvapp-esx2").unwrap(),
            vec![ips[1]]
        );
        assert_eq!(allocator.lookup_owner(&p, "domain-c7").unwrap(), vec![ips[0]]);
        assert!(allocator.lookup_owner(&p, "nobody").unwrap().is_empty());
    }

    #[test]
    fn test_persisted_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip.sqlite");
        let p = pool("10.0.0.0/24", "10.0.0.1");

        IpAllocator::new(&path).allocate(&p, 2, "a").unwrap();
        let again = IpAllocator::new(&path).allocate(&p, 1, "b").unwrap();
        assert_eq!(again, vec![ip("10.0.0.4")]);
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = Arc::new(IpAllocator::new(dir.path().join("ip.sqlite")));
        let p = pool("10.0.0.0/24", "10.0.0.1");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let allocator = allocator.clone();
                let p = p.clone();
                std::thread::spawn(move || allocator.allocate(&p, 3, &format!("owner-{i}")).unwrap())
            })
            .collect();

        let mut all = BTreeSet::new();
        for handle in handles {
            for address in handle.join().unwrap() {
                assert!(all.insert(address), "{address} handed out twice");
            }
        }
        assert_eq!(all.len(), 24);
        assert!(!all.contains(&ip("10.0.0.1")));
        assert!(!all.contains(&ip("10.0.0.0")));
    }
}
