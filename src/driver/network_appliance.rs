use std::sync::Arc;

use log::{debug, error, info, warn};

use commissioner_api::{
    config::DriverInput,
    error::{CommissionError, CommissionResultExt, ErrorKind},
    status::{ApplianceRole, ClusterInfoMap},
};

use crate::{
    config::DriverKind,
    driver::{self, ApplianceDriver},
    engine::{CleanupOrchestrator, ClusterContext, ClusterInstaller, Services},
    registry::{self, TopologyRegistration},
};

const ROLE: ApplianceRole = ApplianceRole::NetworkAppliance;

/// Puts a network appliance on every host of a cluster and manages the switches and port groups
/// they attach to.
pub struct NetworkApplianceDriver {
    services: Arc<Services>,
}

impl NetworkApplianceDriver {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Names in effect for the cluster. An unregistered cluster gets the names of a fresh
    /// install, recorded so that the installer finds them again.
    fn register_names(&self, input: &DriverInput) -> Result<DriverInput, CommissionError> {
        let registry = self.services.registry.as_ref();
        if let Some(registration) = registry.registration(&input.cluster.id)? {
            return Ok(registration.apply(input));
        }
        let registration = TopologyRegistration::fresh_install(
            &input.cluster.id,
            &input.cluster.name,
            &input.network,
        );
        registry.register_cluster(&registration)?;
        Ok(registration.apply(input))
    }

    fn teardown(&self, effective: &DriverInput) -> Result<(), CommissionError> {
        let ctx = ClusterContext::open(&self.services, effective)?;
        let hosts: Vec<String> = ctx.hosts()?.into_iter().map(|h| h.id).collect();
        let report = ctx.topology().teardown(&effective.network, &hosts)?;
        info!(
            "Tore down topology of cluster '{}': removed {} switch(es) and {} port group(s)",
            ctx.cluster.name,
            report.removed_switches.len(),
            report.removed_port_groups.len()
        );
        if !report.kept.is_empty() {
            warn!("Kept objects still in use: {:?}", report.kept);
        }
        Ok(())
    }
}

impl ApplianceDriver for NetworkApplianceDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::NetworkAppliance
    }

    fn setup_network(&self, input: &DriverInput) -> Result<(), CommissionError> {
        input
            .validate_with_topology()
            .map_err(CommissionError::new)?;
        let effective = self.register_names(input)?;
        let ctx = ClusterContext::open(&self.services, &effective)?;
        let topology = ctx
            .topology()
            .build(&effective.network, &[])
            .message("Failed to set up network")?;
        debug!(
            "Network of cluster '{}' has {} switch(es) and {} port group(s)",
            ctx.cluster.name,
            topology.switches.len(),
            topology.port_groups.len()
        );
        Ok(())
    }

    fn create(&self, input: &DriverInput) -> Result<ClusterInfoMap, CommissionError> {
        let installer = ClusterInstaller::new(&self.services, ROLE);
        if let Err(e) = installer.commission(input, None) {
            if matches!(e.kind(), ErrorKind::Commission(_)) {
                warn!("Fresh install of cluster '{}' failed, cleaning up", input.cluster.name);
                if let Err(cleanup) = self.delete(input) {
                    error!("Failed to clean up cluster '{}'", input.cluster.name);
                    return Err(e.secondary_error_context(cleanup));
                }
            }
            return Err(e);
        }
        self.get_info(input)
    }

    fn get_info(&self, input: &DriverInput) -> Result<ClusterInfoMap, CommissionError> {
        let effective = registry::effective_input(self.services.registry.as_ref(), input)?;
        driver::cluster_info(&self.services, &effective, ROLE, true)
    }

    fn delete(&self, input: &DriverInput) -> Result<(), CommissionError> {
        // Decommissioning drops the registration, so resolve the names first.
        let effective = registry::effective_input(self.services.registry.as_ref(), input)?;
        CleanupOrchestrator::new(&self.services)
            .decommission(input, ROLE)
            .message("Failed to decommission appliances")?;
        self.teardown(&effective)
    }

    fn update(&self, input: &DriverInput) -> Result<(), CommissionError> {
        let batch = ClusterInstaller::new(&self.services, ROLE).commission(input, None)?;
        for failed in batch.failed() {
            warn!(
                "Host '{}' was rolled back: {}",
                failed.host_name,
                failed.error.as_deref().unwrap_or_default()
            );
        }
        info!(
            "Commissioned {} of {} new host(s)",
            batch.succeeded().count(),
            batch.results.len()
        );
        Ok(())
    }

    fn teardown_network(&self, input: &DriverInput) -> Result<(), CommissionError> {
        let effective = registry::effective_input(self.services.registry.as_ref(), input)?;
        self.teardown(&effective)
    }
}

#[cfg(test)]
mod tests {
    use commissioner_api::{config::HostEntry, error::CommissionFailure};

    use super::*;
    use crate::{
        engine::context::tests::{sample_input, test_services},
        platform::simulator::{fixtures, Operation},
    };

    fn driver(hosts: usize) -> (
        tempfile::TempDir,
        Arc<crate::platform::simulator::SimulatedPlatform>,
        NetworkApplianceDriver,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let (platform, services) = test_services(fixtures::cluster(hosts), dir.path());
        (dir, platform, NetworkApplianceDriver::new(Arc::new(services)))
    }

    #[test]
    fn test_setup_network_then_create() {
        let (_dir, platform, driver) = driver(2);
        let input = sample_input();

        driver.setup_network(&input).unwrap();
        let trunk = platform.switch_by_name("TRUNK-DVS-Compute").unwrap();
        assert!(trunk.hosts.is_empty());
        assert!(platform.calls_of(Operation::CloneVm).is_empty());

        let info = driver.create(&input).unwrap();
        let cluster = &info["domain-c7"];
        assert_eq!(cluster.cluster_name, "Compute");
        assert_eq!(cluster.switches, vec!["MGMT-DVS", "TRUNK-DVS-Compute"]);
        assert_eq!(cluster.port_groups, vec!["MGMT-Compute", "TRUNK-Compute"]);
        assert_eq!(cluster.appliances.len(), 2);
        assert!(cluster.appliances.iter().all(|a| a.config_ip.is_some()));
        assert!(cluster.appliances.iter().all(|a| a.pxe_mac.is_some()));

        // Creating the switches again reused the ones from setup.
        assert_eq!(
            platform.calls_of(Operation::CreateSwitch),
            vec!["MGMT-DVS", "TRUNK-DVS-Compute"]
        );
        assert_eq!(driver.get_info(&input).unwrap(), info);
    }

    #[test]
    fn test_failed_create_cleans_up() {
        let (_dir, platform, driver) = driver(2);
        platform.inject_fault(Operation::CloneVm, "esx2");
        let input = sample_input();

        let err = driver.create(&input).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Commission(CommissionFailure::PartialCommissionFailure { .. })
        ));
        assert!(platform.vm_by_name("ovsvapp-esx1.example.com").is_none());
        assert!(platform.switch_by_name("TRUNK-DVS-Compute").is_none());
        assert!(platform.port_group_by_name("MGMT-Compute").is_none());
        assert_eq!(
            driver.services.registry.registration("domain-c7").unwrap(),
            None
        );
    }

    #[test]
    fn test_update_adds_new_hosts() {
        let (_dir, platform, driver) = driver(3);
        let mut input = sample_input();
        input.hosts = vec![HostEntry {
            id: "host-1".into(),
            source_cluster: None,
        }];
        driver.create(&input).unwrap();

        input.hosts.clear();
        driver.update(&input).unwrap();
        let info = driver.get_info(&input).unwrap();
        assert_eq!(info["domain-c7"].appliances.len(), 3);
        assert_eq!(platform.calls_of(Operation::CloneVm).len(), 3);
    }

    #[test]
    fn test_delete_removes_everything() {
        let (_dir, platform, driver) = driver(2);
        let input = sample_input();
        driver.create(&input).unwrap();

        driver.delete(&input).unwrap();
        let info = driver.get_info(&input).unwrap();
        assert!(info["domain-c7"].appliances.is_empty());
        assert!(platform.switch_by_name("MGMT-DVS").is_none());
        assert!(platform.switch_by_name("TRUNK-DVS-Compute").is_none());

        // Deleting again has nothing left to do.
        driver.delete(&input).unwrap();
        driver.teardown_network(&input).unwrap();
    }
}
