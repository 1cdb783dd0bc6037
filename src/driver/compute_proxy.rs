use std::sync::Arc;

use log::{debug, error, info, warn};

use commissioner_api::{
    config::DriverInput,
    error::{CommissionError, ErrorKind, ResourceExhaustionError},
    status::{ApplianceRole, ClusterInfoMap},
};

use crate::{
    config::DriverKind,
    driver::{self, ApplianceDriver},
    engine::{CleanupOrchestrator, ClusterContext, ClusterInstaller, Services},
};

const ROLE: ApplianceRole = ApplianceRole::ComputeProxy;

/// Runs a single compute-proxy appliance per cluster. The port groups it attaches to are managed
/// elsewhere.
pub struct ComputeProxyDriver {
    services: Arc<Services>,
}

impl ComputeProxyDriver {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

impl ApplianceDriver for ComputeProxyDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::ComputeProxy
    }

    fn setup_network(&self, input: &DriverInput) -> Result<(), CommissionError> {
        debug!(
            "Compute proxies do not manage the network of cluster '{}'",
            input.cluster.name
        );
        Ok(())
    }

    fn create(&self, input: &DriverInput) -> Result<ClusterInfoMap, CommissionError> {
        input.validate().map_err(CommissionError::new)?;

        let host = {
            let ctx = ClusterContext::open(&self.services, input)?;
            if let Some(existing) = ctx.appliances(ROLE)?.first() {
                info!(
                    "Cluster '{}' already has compute proxy '{}'",
                    ctx.cluster.name, existing.name
                );
                None
            } else {
                let host = ctx.hosts()?.into_iter().find(|h| h.is_active()).ok_or_else(|| {
                    CommissionError::new(ResourceExhaustionError::NoEligibleHost {
                        cluster: ctx.cluster.name.clone(),
                    })
                })?;
                Some(host)
            }
        };

        if let Some(host) = host {
            info!("Placing the compute proxy on host '{}'", host.name);
            let installer = ClusterInstaller::new(&self.services, ROLE);
            if let Err(e) = installer.commission(input, Some(&[host.id])) {
                if matches!(e.kind(), ErrorKind::Commission(_)) {
                    warn!("Compute proxy of '{}' failed, cleaning up", input.cluster.name);
                    if let Err(cleanup) = self.delete(input) {
                        error!("Failed to clean up cluster '{}'", input.cluster.name);
                        return Err(e.secondary_error_context(cleanup));
                    }
                }
                return Err(e);
            }
        }

        self.get_info(input)
    }

    fn get_info(&self, input: &DriverInput) -> Result<ClusterInfoMap, CommissionError> {
        driver::cluster_info(&self.services, input, ROLE, false)
    }

    fn delete(&self, input: &DriverInput) -> Result<(), CommissionError> {
        CleanupOrchestrator::new(&self.services)
            .decommission(input, ROLE)
            .map(|report| debug!("Removed compute proxies {:?}", report.destroyed))
    }

    fn update(&self, input: &DriverInput) -> Result<(), CommissionError> {
        debug!(
            "The compute proxy of cluster '{}' does not follow host changes",
            input.cluster.name
        );
        Ok(())
    }

    fn teardown_network(&self, input: &DriverInput) -> Result<(), CommissionError> {
        debug!(
            "Compute proxies do not manage the network of cluster '{}'",
            input.cluster.name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::context::tests::{sample_input, test_services},
        platform::simulator::{fixtures, Operation},
    };

    /// Compute proxies attach to port groups that already exist.
    fn driver_with_network(
        hosts: usize,
    ) -> (
        tempfile::TempDir,
        Arc<crate::platform::simulator::SimulatedPlatform>,
        ComputeProxyDriver,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let (platform, services) = test_services(fixtures::cluster(hosts), dir.path());
        let services = Arc::new(services);
        let input = sample_input();
        let ctx = ClusterContext::open(&services, &input).unwrap();
        ctx.topology().build(&input.network, &[]).unwrap();
        drop(ctx);
        (dir, platform, ComputeProxyDriver::new(services))
    }

    #[test]
    fn test_single_proxy_per_cluster() {
        let (_dir, platform, driver) = driver_with_network(3);
        platform.with_inventory(|inv| inv.hosts[0].in_maintenance_mode = true);
        let input = sample_input();

        let info = driver.create(&input).unwrap();
        let appliances = &info["domain-c7"].appliances;
        assert_eq!(appliances.len(), 1);
        assert_eq!(appliances[0].host, "host-2");
        assert_eq!(appliances[0].role, ApplianceRole::ComputeProxy);
        assert!(info["domain-c7"].switches.is_empty());

        // A second create finds the proxy in place.
        driver.create(&input).unwrap();
        assert_eq!(platform.calls_of(Operation::CloneVm).len(), 1);

        // The network is never touched by the proxy driver.
        driver.update(&input).unwrap();
        driver.teardown_network(&input).unwrap();
        assert!(platform.switch_by_name("TRUNK-DVS").is_some());

        driver.delete(&input).unwrap();
        assert!(driver.get_info(&input).unwrap()["domain-c7"]
            .appliances
            .is_empty());
    }

    #[test]
    fn test_no_eligible_host() {
        let (_dir, platform, driver) = driver_with_network(1);
        platform.with_inventory(|inv| inv.hosts[0].in_maintenance_mode = true);

        let err = driver.create(&sample_input()).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::ResourceExhaustion(ResourceExhaustionError::NoEligibleHost {
                cluster: "Compute".into()
            })
        );
    }
}
