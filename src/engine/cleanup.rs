use std::{collections::BTreeSet, net::Ipv4Addr};

use log::{debug, error, info, warn};

use commissioner_api::{
    config::DriverInput,
    error::{CommissionError, CommissionResultExt, PlatformFault, ReportError, TimeoutError},
    status::{ApplianceRole, PowerState},
};

use crate::{
    engine::{
        commission::affinity_rule_name,
        context::{ClusterContext, Services},
    },
    platform::{ClusterReconfigSpec, VirtualMachine},
    registry,
    retry,
};

/// What a decommission removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecommissionReport {
    /// Names of the destroyed appliance VMs.
    pub destroyed: Vec<String>,
    pub released: Vec<Ipv4Addr>,
    pub deregistered: bool,
}

/// Outcome of retiring one appliance VM.
struct Retired {
    vm: VirtualMachine,
    addresses: Vec<Ipv4Addr>,
    result: Result<(), CommissionError>,
}

pub struct CleanupOrchestrator<'a> {
    services: &'a Services,
}

impl<'a> CleanupOrchestrator<'a> {
    pub fn new(services: &'a Services) -> Self {
        Self { services }
    }

    /// Shuts down and destroys every appliance of the role in the cluster, then returns their
    /// addresses to the pool. Network appliances also drop the cluster's topology registration.
    #[tracing::instrument(skip_all, fields(cluster = %input.cluster.name, role = %role))]
    pub fn decommission(
        &self,
        input: &DriverInput,
        role: ApplianceRole,
    ) -> Result<DecommissionReport, CommissionError> {
        let input = registry::effective_input(self.services.registry.as_ref(), input)?;
        let ctx = ClusterContext::open(self.services, &input)?;
        let appliances = ctx.appliances(role)?;
        let mut report = DecommissionReport::default();

        if appliances.is_empty() {
            info!("Cluster '{}' has no {role} appliances", ctx.cluster.name);
        } else {
            let config_port_group = ctx.port_group_id(&input.config_network.port_group)?;
            info!(
                "Decommissioning {} {role} appliance(s) of cluster '{}'",
                appliances.len(),
                ctx.cluster.name
            );

            let retired = self.services.workers.run(appliances, |vm| {
                let addresses = capture_addresses(&ctx, &vm, config_port_group.as_deref());
                let result = retire(&ctx, &vm);
                Retired {
                    vm,
                    addresses,
                    result,
                }
            });

            let mut failures = Vec::new();
            let mut destroyed = Vec::new();
            let mut addresses = BTreeSet::new();
            for outcome in retired {
                match outcome.result {
                    Ok(()) => {
                        addresses.extend(outcome.addresses);
                        destroyed.push(outcome.vm);
                    }
                    Err(e) => {
                        error!("Failed to retire '{}': {e:?}", outcome.vm.name);
                        failures.push((outcome.vm.name, e));
                    }
                }
            }

            // Release and rule removal both run; the first failure is reported afterwards.
            let mut errors = Vec::new();

            report.released = addresses.into_iter().collect();
            if let Err(e) = self
                .services
                .allocator
                .release(&ctx.pool, &report.released)
            {
                error!("Failed to release {:?}: {e:?}", report.released);
                errors.push(e);
            }
            if let Err(e) = remove_affinity_rules(&ctx, &destroyed) {
                error!("Failed to remove the affinity rules of cluster '{}': {e:?}", ctx.cluster.name);
                errors.push(e);
            }
            report.destroyed = destroyed.into_iter().map(|vm| vm.name).collect();

            if let Some((name, e)) = failures.into_iter().next() {
                return Err(e).message(format!("Failed to decommission appliance '{name}'"));
            }
            if let Some(e) = errors.into_iter().next() {
                return Err(e);
            }
        }

        if role == ApplianceRole::NetworkAppliance {
            report.deregistered = self
                .services
                .registry
                .deregister_cluster(&ctx.cluster.id)?;
        }

        info!(
            "Decommissioned cluster '{}': destroyed {:?}, released {:?}",
            ctx.cluster.name, report.destroyed, report.released
        );
        Ok(report)
    }
}

/// Addresses held by the appliance: the one its guest reports on the config network and those
/// recorded under its name in the catalog.
fn capture_addresses(
    ctx: &ClusterContext,
    vm: &VirtualMachine,
    config_port_group: Option<&str>,
) -> Vec<Ipv4Addr> {
    let mut addresses: BTreeSet<Ipv4Addr> = config_port_group
        .and_then(|pg| vm.guest_ip_on(pg))
        .into_iter()
        .collect();
    match ctx.services.allocator.lookup_owner(&ctx.pool, &vm.name) {
        Ok(owned) => addresses.extend(owned),
        Err(e) => warn!("Failed to look up addresses of '{}': {e}", vm.name),
    }
    debug!("Captured {addresses:?} for '{}'", vm.name);
    addresses.into_iter().collect()
}

/// Shuts an appliance VM down, forcing it off when the guest does not comply, and destroys it.
/// A VM that no longer exists counts as retired.
pub(crate) fn retire(ctx: &ClusterContext, vm: &VirtualMachine) -> Result<(), CommissionError> {
    let platform = ctx.platform();
    let Some(current) = platform.vm(&vm.id).structured(PlatformFault::Query {
        kind: "VM".into(),
        name: vm.name.clone(),
    })?
    else {
        debug!("VM '{}' is already gone", vm.name);
        return Ok(());
    };

    if current.power_state == PowerState::PoweredOn {
        if let Err(e) = shut_down(ctx, &current) {
            warn!("Forcing '{}' off: {e}", vm.name);
            let fault = || PlatformFault::PowerState {
                vm: vm.name.clone(),
            };
            let task = platform.power_off_vm(&vm.id).structured(fault())?;
            ctx.poller().await_success(&task, fault())?;
        }
    }

    let fault = || PlatformFault::Destroy {
        vm: vm.name.clone(),
    };
    let task = platform.destroy_vm(&vm.id).structured(fault())?;
    ctx.poller().await_success(&task, fault())?;
    info!("Destroyed '{}'", vm.name);
    Ok(())
}

fn shut_down(ctx: &ClusterContext, vm: &VirtualMachine) -> Result<(), CommissionError> {
    let platform = ctx.platform();
    platform
        .shutdown_guest(&vm.id)
        .structured(PlatformFault::GuestOperation {
            operation: "shutdown".into(),
            vm: vm.name.clone(),
        })?;

    let outcome = retry::retry_until(
        &ctx.settings().guest_shutdown_wait,
        "guest-shutdown",
        |_| {
            platform
                .vm(&vm.id)
                .structured(PlatformFault::Query {
                    kind: "VM".into(),
                    name: vm.name.clone(),
                })
                .map(|current| current.map_or(PowerState::PoweredOff, |c| c.power_state))
        },
        |state| *state != PowerState::PoweredOn,
    )?;
    if !outcome.is_satisfied() {
        return Err(CommissionError::new(TimeoutError::GuestShutdown {
            vm: vm.name.clone(),
            attempts: outcome.attempts(),
        }));
    }
    debug!("Guest of '{}' shut down", vm.name);
    Ok(())
}

/// Removes the cluster affinity rules that pin any of `vms`. Returns the removed rule names.
pub(crate) fn remove_affinity_rules(
    ctx: &ClusterContext,
    vms: &[VirtualMachine],
) -> Result<Vec<String>, CommissionError> {
    if vms.is_empty() {
        return Ok(Vec::new());
    }
    let names: Vec<String> = vms.iter().map(|vm| affinity_rule_name(&vm.name)).collect();

    let _guard = ctx.services.topology_lock.acquire();
    let stale: Vec<String> = ctx
        .platform()
        .affinity_rules(&ctx.cluster.id)
        .structured(PlatformFault::Query {
            kind: "affinity rules of cluster".into(),
            name: ctx.cluster.name.clone(),
        })?
        .into_iter()
        .filter(|rule| names.contains(&rule.name) || vms.iter().any(|vm| vm.id == rule.vm))
        .map(|rule| rule.name)
        .collect();
    if stale.is_empty() {
        return Ok(stale);
    }

    let fault = || PlatformFault::ReconfigureCluster {
        cluster: ctx.cluster.name.clone(),
    };
    let task = ctx
        .platform()
        .reconfigure_cluster(
            &ctx.cluster.id,
            &ClusterReconfigSpec {
                remove_rules: stale.clone(),
                ..Default::default()
            },
        )
        .structured(fault())?;
    ctx.poller().await_success(&task, fault())?;
    debug!("Removed affinity rules {stale:?}");
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use commissioner_api::error::ErrorKind;

    use super::*;
    use crate::{
        engine::{
            context::tests::{sample_input, test_services, test_settings},
            install::ClusterInstaller,
            template::{PlatformTemplateProvider, TemplateCache},
        },
        ipam::{IpAllocator, IpPool},
        platform::{
            simulator::{fixtures, Operation, SimulatedConnector, SimulatedPlatform},
            ClusterOps,
        },
        registry::{CatalogRegistry, TopologyRegistration, TopologyRegistry},
    };

    /// Catalog registry that counts deregistrations.
    struct CountingRegistry {
        inner: CatalogRegistry,
        deregistrations: Arc<AtomicUsize>,
    }

    impl TopologyRegistry for CountingRegistry {
        fn register_cluster(&self, registration: &TopologyRegistration) -> Result<(), CommissionError> {
            self.inner.register_cluster(registration)
        }

        fn registration(&self, cluster: &str) -> Result<Option<TopologyRegistration>, CommissionError> {
            self.inner.registration(cluster)
        }

        fn deregister_cluster(&self, cluster: &str) -> Result<bool, CommissionError> {
            self.deregistrations.fetch_add(1, Ordering::SeqCst);
            self.inner.deregister_cluster(cluster)
        }
    }

    /// Services keeping IP allocations in `dir/ip.sqlite` and registrations in
    /// `dir/registry.sqlite`.
    fn counting_services(
        hosts: usize,
        dir: &Path,
    ) -> (Arc<SimulatedPlatform>, Services, Arc<AtomicUsize>) {
        let platform = Arc::new(SimulatedPlatform::new(fixtures::cluster(hosts)));
        let deregistrations = Arc::new(AtomicUsize::new(0));
        let services = Services::new(
            Box::new(SimulatedConnector::new(platform.clone())),
            IpAllocator::new(dir.join("ip.sqlite")),
            Box::new(CountingRegistry {
                inner: CatalogRegistry::new(dir.join("registry.sqlite")),
                deregistrations: deregistrations.clone(),
            }),
            TemplateCache::new(Box::new(PlatformTemplateProvider)),
            test_settings(),
        )
        .unwrap();
        (platform, services, deregistrations)
    }

    #[test]
    fn test_decommission_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, services) = test_services(fixtures::cluster(2), dir.path());
        let input = sample_input();
        let batch = ClusterInstaller::new(&services, ApplianceRole::NetworkAppliance)
            .commission(&input, None)
            .unwrap();
        assert_eq!(batch.succeeded().count(), 2);
        // One guest ignores the shutdown request and has to be forced off.
        platform.with_inventory(|inv| {
            inv.behaviors
                .ignore_shutdown
                .insert("ovsvapp-esx2.example.com".into())
        });

        let report = CleanupOrchestrator::new(&services)
            .decommission(&input, ApplianceRole::NetworkAppliance)
            .unwrap();
        assert_eq!(
            report,
            DecommissionReport {
                destroyed: vec![
                    "ovsvapp-esx1.example.com".into(),
                    "ovsvapp-esx2.example.com".into()
                ],
                released: vec!["10.0.0.2".parse().unwrap(), "10.0.0.3".parse().unwrap()],
                deregistered: true,
            }
        );

        assert_eq!(platform.calls_of(Operation::ShutdownGuest).len(), 2);
        assert_eq!(
            platform.calls_of(Operation::PowerOff),
            vec!["ovsvapp-esx2.example.com"]
        );
        assert!(platform.vm_by_name("ovsvapp-esx1.example.com").is_none());
        assert!(platform.vm_by_name("ovsvapp-esx2.example.com").is_none());
        assert!(platform.affinity_rules("domain-c7").unwrap().is_empty());

        let pool = crate::ipam::IpPool::from_config(&input.config_network).unwrap();
        assert!(services.allocator.allocated(&pool).unwrap().is_empty());
        assert_eq!(services.registry.registration("domain-c7").unwrap(), None);
    }

    #[test]
    fn test_decommission_without_appliances() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, services) = test_services(fixtures::cluster(2), dir.path());

        let report = CleanupOrchestrator::new(&services)
            .decommission(&sample_input(), ApplianceRole::NetworkAppliance)
            .unwrap();
        assert_eq!(report, DecommissionReport::default());
        assert!(platform.calls().is_empty());
    }

    #[test]
    fn test_decommission_reports_destroy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, services) = test_services(fixtures::cluster(2), dir.path());
        let input = sample_input();
        ClusterInstaller::new(&services, ApplianceRole::NetworkAppliance)
            .commission(&input, None)
            .unwrap();
        platform.inject_fault(Operation::DestroyVm, "esx1");

        let err = CleanupOrchestrator::new(&services)
            .decommission(&input, ApplianceRole::NetworkAppliance)
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Platform(PlatformFault::Destroy {
                vm: "ovsvapp-esx1.example.com".into()
            })
        );

        // The other appliance is gone and only its address went back to the pool.
        assert!(platform.vm_by_name("ovsvapp-esx2.example.com").is_none());
        let pool = crate::ipam::IpPool::from_config(&input.config_network).unwrap();
        assert_eq!(
            services.allocator.allocated(&pool).unwrap(),
            BTreeSet::from(["10.0.0.2".parse().unwrap()])
        );
        // The registration stays until every appliance is gone.
        assert!(services.registry.registration("domain-c7").unwrap().is_some());
    }

    #[test]
    fn test_decommission_deregisters_once() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, services, deregistrations) = counting_services(2, dir.path());
        let input = sample_input();
        ClusterInstaller::new(&services, ApplianceRole::NetworkAppliance)
            .commission(&input, None)
            .unwrap();

        let report = CleanupOrchestrator::new(&services)
            .decommission(&input, ApplianceRole::NetworkAppliance)
            .unwrap();
        assert_eq!(report.destroyed.len(), 2);
        assert_eq!(report.released.len(), 2);
        assert_eq!(deregistrations.load(Ordering::SeqCst), 1);
        assert_eq!(platform.calls_of(Operation::DestroyVm).len(), 2);
    }

    #[test]
    fn test_decommission_continues_after_release_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, services, deregistrations) = counting_services(2, dir.path());
        let input = sample_input();
        ClusterInstaller::new(&services, ApplianceRole::NetworkAppliance)
            .commission(&input, None)
            .unwrap();
        assert!(!platform.affinity_rules("domain-c7").unwrap().is_empty());

        // Swap the IP catalog for something sqlite cannot open.
        let catalog = dir.path().join("ip.sqlite");
        fs::remove_file(&catalog).unwrap();
        fs::create_dir(&catalog).unwrap();

        let err = CleanupOrchestrator::new(&services)
            .decommission(&input, ApplianceRole::NetworkAppliance)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Catalog(_)), "{err:?}");

        assert!(platform.vm_by_name("ovsvapp-esx1.example.com").is_none());
        assert!(platform.vm_by_name("ovsvapp-esx2.example.com").is_none());
        assert!(platform.affinity_rules("domain-c7").unwrap().is_empty());
        assert_eq!(deregistrations.load(Ordering::SeqCst), 0);

        // Once the catalog is back, running again releases nothing and succeeds.
        fs::remove_dir(&catalog).unwrap();
        let pool = IpPool::from_config(&input.config_network).unwrap();
        let report = CleanupOrchestrator::new(&services)
            .decommission(&input, ApplianceRole::NetworkAppliance)
            .unwrap();
        assert!(report.destroyed.is_empty());
        assert!(services.allocator.allocated(&pool).unwrap().is_empty());
    }
}
