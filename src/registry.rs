//! Record of the topology names in effect for each commissioned cluster.
//!
//! A fresh install renames the trunk switch and the port groups per cluster. The registration
//! keeps that mapping so that later incremental commissions, info queries and teardown use the
//! same names, and so the lifecycle manager can map tenant networks onto the cluster's trunk.

use std::{collections::BTreeMap, fs, path::PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use commissioner_api::{
    config::{DriverInput, NetworkProperties},
    error::{CatalogError, CommissionError, InternalError, ReportError},
    ObjectId,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TopologyRegistration {
    pub cluster_id: ObjectId,
    pub cluster_name: String,

    /// Configured switch or port group name to the name in effect for the cluster.
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
}

impl TopologyRegistration {
    /// Names for a cluster installed from scratch: the trunk switch and every port group carry
    /// the cluster name as suffix, so clusters sharing a datacenter do not collide.
    pub fn fresh_install(
        cluster_id: &str,
        cluster_name: &str,
        network: &NetworkProperties,
    ) -> Self {
        let suffixed = |name: &str| (name.to_owned(), format!("{name}-{cluster_name}"));
        let renames = network
            .trunk_switch()
            .map(|trunk| suffixed(&trunk.name))
            .into_iter()
            .chain(network.port_groups.iter().map(|pg| suffixed(&pg.name)))
            .collect();

        Self {
            cluster_id: cluster_id.into(),
            cluster_name: cluster_name.into(),
            renames,
        }
    }

    /// Copy of `input` with every switch and port group name, and every reference to one,
    /// replaced by the name in effect for the cluster.
    pub fn apply(&self, input: &DriverInput) -> DriverInput {
        let rename = |name: &mut String| {
            if let Some(renamed) = self.renames.get(name.as_str()) {
                *name = renamed.clone();
            }
        };

        let mut effective = input.clone();
        for switch in effective.network.switches.iter_mut() {
            rename(&mut switch.name);
        }
        for pg in effective.network.port_groups.iter_mut() {
            rename(&mut pg.name);
            rename(&mut pg.switch_name);
        }
        for nic in effective.appliance.nics.iter_mut() {
            rename(&mut nic.port_group);
        }
        rename(&mut effective.config_network.port_group);
        effective
    }
}

/// Names in effect for the cluster: the registered ones, or the configured ones when the cluster
/// was never registered.
pub fn effective_input(
    registry: &dyn TopologyRegistry,
    input: &DriverInput,
) -> Result<DriverInput, CommissionError> {
    Ok(match registry.registration(&input.cluster.id)? {
        Some(registration) => registration.apply(input),
        None => {
            debug!(
                "Cluster '{}' has no registered topology, using configured names",
                input.cluster.name
            );
            input.clone()
        }
    })
}

pub trait TopologyRegistry: Send + Sync {
    fn register_cluster(&self, registration: &TopologyRegistration) -> Result<(), CommissionError>;

    fn registration(&self, cluster: &str) -> Result<Option<TopologyRegistration>, CommissionError>;

    /// Removes the cluster's registration. Returns whether one existed.
    fn deregister_cluster(&self, cluster: &str) -> Result<bool, CommissionError>;
}

/// Registry kept in the same sqlite catalog as the IP allocations.
pub struct CatalogRegistry {
    catalog: PathBuf,
}

impl CatalogRegistry {
    pub fn new(catalog: impl Into<PathBuf>) -> Self {
        Self {
            catalog: catalog.into(),
        }
    }

    fn open(&self) -> Result<sqlite::Connection, CommissionError> {
        if let Some(parent) = self.catalog.parent() {
            fs::create_dir_all(parent).structured(CatalogError::CreateCatalogDirectory)?;
        }
        let db = sqlite::open(&self.catalog).structured(CatalogError::OpenCatalog {
            path: self.catalog.to_string_lossy().into(),
        })?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS registrations (
                cluster TEXT PRIMARY KEY,
                registered_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                contents TEXT NOT NULL
            )",
        )
        .structured(CatalogError::InitializeCatalog)?;
        Ok(db)
    }
}

impl TopologyRegistry for CatalogRegistry {
    fn register_cluster(&self, registration: &TopologyRegistration) -> Result<(), CommissionError> {
        let contents =
            serde_yaml::to_string(registration).structured(InternalError::SerializeResult)?;
        let db = self.open()?;
        let mut statement = db
            .prepare("INSERT OR REPLACE INTO registrations (cluster, contents) VALUES (?, ?)")
            .structured(CatalogError::WriteCatalog)?;
        statement
            .bind(&[registration.cluster_id.as_str(), contents.as_str()][..])
            .structured(CatalogError::WriteCatalog)?;
        statement.next().structured(CatalogError::WriteCatalog)?;

        info!(
            "Registered topology of cluster '{}'",
            registration.cluster_name
        );
        Ok(())
    }

    fn registration(&self, cluster: &str) -> Result<Option<TopologyRegistration>, CommissionError> {
        let db = self.open()?;
        let mut statement = db
            .prepare("SELECT contents FROM registrations WHERE cluster = ?")
            .structured(CatalogError::ReadCatalog)?;
        statement
            .bind((1, cluster))
            .structured(CatalogError::ReadCatalog)?;

        match statement.next().structured(CatalogError::ReadCatalog)? {
            sqlite::State::Row => {
                let contents = statement
                    .read::<String, _>(0)
                    .structured(CatalogError::ReadCatalog)?;
                serde_yaml::from_str(&contents)
                    .map(Some)
                    .structured(CatalogError::ReadCatalog)
            }
            sqlite::State::Done => Ok(None),
        }
    }

    fn deregister_cluster(&self, cluster: &str) -> Result<bool, CommissionError> {
        let existed = self.registration(cluster)?.is_some();
        let db = self.open()?;
        let mut statement = db
            .prepare("DELETE FROM registrations WHERE cluster = ?")
            .structured(CatalogError::WriteCatalog)?;
        statement
            .bind((1, cluster))
            .structured(CatalogError::WriteCatalog)?;
        statement.next().structured(CatalogError::WriteCatalog)?;

        debug!("Deregistered cluster '{cluster}' (registered: {existed})");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    #[test]
    fn test_register_and_deregister() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CatalogRegistry::new(dir.path().join("catalog.sqlite"));
        assert_eq!(registry.registration("domain-c7").unwrap(), None);

        let registration = TopologyRegistration {
            cluster_id: "domain-c7".into(),
            cluster_name: "Compute".into(),
            renames: btreemap! {
                "TRUNK".into() => "TRUNK-Compute".into(),
                "TRUNK-DVS".into() => "TRUNK-DVS-Compute".into(),
            },
        };
        registry.register_cluster(&registration).unwrap();
        assert_eq!(
            registry.registration("domain-c7").unwrap(),
            Some(registration.clone())
        );

        // Registering again replaces.
        registry.register_cluster(&registration).unwrap();

        assert!(registry.deregister_cluster("domain-c7").unwrap());
        assert!(!registry.deregister_cluster("domain-c7").unwrap());
        assert_eq!(registry.registration("domain-c7").unwrap(), None);
    }

    #[test]
    fn test_fresh_install_renames() {
        let input = crate::engine::context::tests::sample_input();
        let registration =
            TopologyRegistration::fresh_install("domain-c7", "Compute", &input.network);
        assert_eq!(
            registration.renames,
            btreemap! {
                "MGMT".to_owned() => "MGMT-Compute".to_owned(),
                "TRUNK".to_owned() => "TRUNK-Compute".to_owned(),
                "TRUNK-DVS".to_owned() => "TRUNK-DVS-Compute".to_owned(),
            }
        );

        let effective = registration.apply(&input);
        let names: Vec<_> = effective
            .network
            .switches
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        // Only the trunk switch is per cluster.
        assert_eq!(names, vec!["MGMT-DVS", "TRUNK-DVS-Compute"]);
        assert_eq!(effective.network.port_groups[0].switch_name, "MGMT-DVS");
        assert_eq!(
            effective.network.port_groups[1].switch_name,
            "TRUNK-DVS-Compute"
        );
        assert_eq!(effective.appliance.nics[0].port_group, "MGMT-Compute");
        assert_eq!(effective.config_network.port_group, "MGMT-Compute");
        assert!(effective.validate_with_topology().is_ok());
    }

    #[test]
    fn test_unregistered_cluster_keeps_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CatalogRegistry::new(dir.path().join("catalog.sqlite"));
        let input = crate::engine::context::tests::sample_input();
        assert_eq!(effective_input(&registry, &input).unwrap(), input);

        registry
            .register_cluster(&TopologyRegistration::fresh_install(
                "domain-c7",
                "Compute",
                &input.network,
            ))
            .unwrap();
        let effective = effective_input(&registry, &input).unwrap();
        assert_eq!(effective.network.port_groups[1].name, "TRUNK-Compute");
    }
}
