use std::{collections::BTreeMap, net::Ipv4Addr};

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;

use commissioner_api::{
    config::NicSpec,
    constants::{
        AFFINITY_RULE_SUFFIX, GUEST_AUTHORIZED_KEYS_PATH, GUEST_CUSTOMIZATION_SCRIPT_PATH,
    },
    error::{
        CommissionError, CommissionResultExt, PlatformFault, ReportError,
        ResourceExhaustionError, TimeoutError,
    },
    status::{ApplianceRole, ApplianceVm, HostCommissionResult},
};

use crate::{
    engine::{context::ClusterContext, placement},
    platform::{
        AffinityRule, CloneSpec, ClusterReconfigSpec, Host, NicDevice, PortGroup, ProgramSpec,
        VirtualMachine, VmOverride, VmReconfigSpec, GUESTINFO_GATEWAY, GUESTINFO_IP,
        GUESTINFO_NETMASK, GUESTINFO_NETWORK,
    },
    retry::{self, RetryOutcome},
};

lazy_static! {
    static ref INVALID_NAME_CHARACTERS: Regex = Regex::new(r"[^A-Za-z0-9._-]+").unwrap();
}

/// Name of the appliance VM on a host.
pub fn appliance_vm_name(prefix: &str, host_name: &str) -> String {
    format!(
        "{prefix}-{}",
        INVALID_NAME_CHARACTERS.replace_all(host_name, "-")
    )
}

/// Name of the affinity rule pinning an appliance VM to its host.
pub fn affinity_rule_name(vm_name: &str) -> String {
    format!("{vm_name}-{AFFINITY_RULE_SUFFIX}")
}

/// One appliance to create.
#[derive(Debug, Clone)]
pub struct CommissionJob {
    pub host: Host,
    pub ip: Ipv4Addr,
    pub vm_name: String,
}

impl CommissionJob {
    pub fn new(prefix: &str, host: Host, ip: Ipv4Addr) -> Self {
        let vm_name = appliance_vm_name(prefix, &host.name);
        Self { host, ip, vm_name }
    }
}

/// A NIC of the appliance with the port group it attaches to.
struct ResolvedNic<'a> {
    spec: &'a NicSpec,
    port_group: PortGroup,
    label: String,
}

/// Creates and customizes the appliance VM of one host.
pub struct CommissionWorker<'a> {
    ctx: &'a ClusterContext<'a>,
    role: ApplianceRole,
    cluster_hosts: &'a [Host],
}

impl<'a> CommissionWorker<'a> {
    /// `cluster_hosts` is the snapshot of the cluster's hosts placement decisions are based on.
    pub fn new(ctx: &'a ClusterContext<'a>, role: ApplianceRole, cluster_hosts: &'a [Host]) -> Self {
        Self {
            ctx,
            role,
            cluster_hosts,
        }
    }

    /// Commissions the host. Failures are reported in the result, never returned.
    #[tracing::instrument(name = "commission_host", skip_all, fields(host = %job.host.name))]
    pub fn run(&self, job: &CommissionJob) -> HostCommissionResult {
        match self.commission(job) {
            Ok((vm, ip)) => {
                info!(
                    "Commissioned appliance '{}' on host '{}' with address {ip}",
                    job.vm_name, job.host.name
                );
                HostCommissionResult::success(job.host.id.clone(), job.host.name.clone(), ip, vm)
            }
            Err(e) => {
                error!("Failed to commission host '{}': {e:?}", job.host.name);
                HostCommissionResult::failed(
                    job.host.id.clone(),
                    job.host.name.clone(),
                    Some(job.ip),
                    e.to_string(),
                )
            }
        }
    }

    fn commission(
        &self,
        job: &CommissionJob,
    ) -> Result<(ApplianceVm, Ipv4Addr), CommissionError> {
        let ctx = self.ctx;
        let platform = ctx.platform();
        let poller = ctx.poller();
        let input = ctx.input;
        let appliance = &input.appliance;

        // Placement
        let host = self.prepare_host(&job.host)?;
        let placement = placement::resolve(
            platform,
            &ctx.cluster,
            self.cluster_hosts,
            &host,
            ctx.settings().min_datastore_free_bytes,
        )?;

        let template = ctx.services.templates.get(
            platform,
            &poller,
            &ctx.datacenter,
            &appliance.template,
            &placement,
        )?;

        // Devices
        let topology = ctx.topology();
        let mut nics = Vec::with_capacity(appliance.nics.len());
        for (i, spec) in appliance.nics.iter().enumerate() {
            nics.push(ResolvedNic {
                spec,
                port_group: topology.resolve_port_group(&spec.port_group)?,
                label: format!("Network adapter {}", i + 1),
            });
        }
        let config_nic = nics
            .iter()
            .find(|n| n.spec.port_group == input.config_network.port_group)
            .structured(PlatformFault::ObjectNotFound {
                kind: "config network NIC".into(),
                name: input.config_network.port_group.clone(),
            })?;
        let pxe_port_group = nics.iter().find(|n| n.spec.pxe).map(|n| n.port_group.id.clone());

        // Clone
        info!(
            "Cloning '{}' into '{}' on host '{}'",
            template.name, job.vm_name, host.name
        );
        let clone_fault = || PlatformFault::Clone {
            template: template.name.clone(),
            vm: job.vm_name.clone(),
        };
        let task = platform
            .clone_vm(
                &template.id,
                &CloneSpec {
                    name: job.vm_name.clone(),
                    folder: ctx.cluster.vm_folder.clone(),
                    host: placement.host.clone(),
                    datastore: placement.datastore.clone(),
                    resource_pool: placement.resource_pool.clone(),
                    power_on: true,
                    annotation: self.role.marker().into(),
                    cpus: appliance.cpus,
                    memory_mb: appliance.memory_mb,
                    nics: nics
                        .iter()
                        .map(|n| NicDevice {
                            label: n.label.clone(),
                            device_type: n.spec.device_type,
                            switch: n.port_group.switch.clone(),
                            port_group: n.port_group.id.clone(),
                            start_connected: n.label != config_nic.label,
                        })
                        .collect(),
                    extra_config: self.guest_network_config(job.ip),
                },
            )
            .structured(clone_fault())?;
        let vm_id = poller.await_object(&task, clone_fault())?;

        if appliance
            .disable_ha_drs
            .unwrap_or(ctx.settings().disable_ha_drs)
        {
            self.pin_to_host(&vm_id, &job.vm_name, &host)?;
        }

        // Config network
        let reconfigure_fault = || PlatformFault::ReconfigureVm {
            vm: job.vm_name.clone(),
        };
        let task = platform
            .reconfigure_vm(
                &vm_id,
                &VmReconfigSpec {
                    connect_nics: vec![config_nic.label.clone()],
                },
            )
            .structured(reconfigure_fault())?;
        poller.await_success(&task, reconfigure_fault())?;
        let ip = self.await_guest_ip(&vm_id, &job.vm_name, &config_nic.port_group.id, job.ip)?;

        self.customize(&vm_id, &job.vm_name)
            .message("Failed to customize appliance")?;

        let vm = self.vm(&vm_id, &job.vm_name)?;
        Ok((
            ctx.describe(
                &vm,
                self.role,
                Some(&config_nic.port_group.id),
                pxe_port_group.as_deref(),
            ),
            ip,
        ))
    }

    /// Makes sure the host can run the appliance, taking it out of maintenance mode if needed.
    fn prepare_host(&self, host: &Host) -> Result<Host, CommissionError> {
        let current = self.ctx.host(&host.id)?;
        if !current.is_connected() {
            return Err(CommissionError::new(
                ResourceExhaustionError::NoEligibleHost {
                    cluster: self.ctx.cluster.name.clone(),
                },
            ))
            .message(format!("Host '{}' is not connected", current.name));
        }
        if !current.in_maintenance_mode {
            return Ok(current);
        }

        debug!("Taking host '{}' out of maintenance mode", current.name);
        let fault = || PlatformFault::MaintenanceMode {
            host: current.name.clone(),
        };
        let task = self
            .ctx
            .platform()
            .exit_maintenance_mode(&current.id)
            .structured(fault())?;
        self.ctx.poller().await_success(&task, fault())?;
        self.ctx.host(&current.id)
    }

    fn guest_network_config(&self, ip: Ipv4Addr) -> BTreeMap<String, String> {
        let config_network = &self.ctx.input.config_network;
        BTreeMap::from([
            (GUESTINFO_IP.to_owned(), ip.to_string()),
            (
                GUESTINFO_NETWORK.to_owned(),
                config_network.port_group.clone(),
            ),
            (
                GUESTINFO_NETMASK.to_owned(),
                self.ctx.pool.netmask().to_string(),
            ),
            (
                GUESTINFO_GATEWAY.to_owned(),
                config_network.gateway.to_string(),
            ),
        ])
    }

    /// Keeps HA and DRS from moving the appliance and binds it to its host.
    fn pin_to_host(&self, vm_id: &str, vm_name: &str, host: &Host) -> Result<(), CommissionError> {
        let ctx = self.ctx;
        let fault = || PlatformFault::ReconfigureCluster {
            cluster: ctx.cluster.name.clone(),
        };

        let _guard = ctx.services.topology_lock.acquire();
        debug!("Pinning '{vm_name}' to host '{}'", host.name);
        let task = ctx
            .platform()
            .reconfigure_cluster(
                &ctx.cluster.id,
                &ClusterReconfigSpec {
                    vm_overrides: vec![VmOverride {
                        vm: vm_id.into(),
                        ha_restart_disabled: true,
                        drs_manual: true,
                    }],
                    add_rules: vec![AffinityRule {
                        name: affinity_rule_name(vm_name),
                        vm: vm_id.into(),
                        host: host.id.clone(),
                        mandatory: true,
                    }],
                    remove_rules: Vec::new(),
                },
            )
            .structured(fault())?;
        ctx.poller().await_success(&task, fault())?;
        Ok(())
    }

    /// Waits for the guest to report `expected` on the config network. When it never does, the
    /// address it reports instead is used.
    fn await_guest_ip(
        &self,
        vm_id: &str,
        vm_name: &str,
        port_group: &str,
        expected: Ipv4Addr,
    ) -> Result<Ipv4Addr, CommissionError> {
        let outcome = retry::retry_until(
            &self.ctx.settings().guest_ip_wait,
            "guest-ip",
            |_| self.vm(vm_id, vm_name).map(|vm| vm.guest_ip_on(port_group)),
            |ip| *ip == Some(expected),
        )?;

        Ok(match outcome {
            RetryOutcome::Satisfied { .. } => expected,
            RetryOutcome::Exhausted {
                last: Some(observed),
                attempts,
            } => {
                warn!(
                    "Guest of '{vm_name}' reports {observed} instead of {expected} after {attempts} attempts"
                );
                observed
            }
            RetryOutcome::Exhausted {
                last: None,
                attempts,
            } => {
                warn!("Guest of '{vm_name}' reports no address after {attempts} attempts");
                expected
            }
        })
    }

    /// Pushes the SSH key and the customization script into the guest and starts the script.
    fn customize(&self, vm_id: &str, vm_name: &str) -> Result<(), CommissionError> {
        let platform = self.ctx.platform();
        let appliance = &self.ctx.input.appliance;
        let credentials = &appliance.guest;

        let outcome = retry::retry_until(
            &self.ctx.settings().guest_tools_wait,
            "guest-tools",
            |_| self.vm(vm_id, vm_name).map(|vm| vm.guest.tools_running),
            |running| *running,
        )?;
        if !outcome.is_satisfied() {
            return Err(CommissionError::new(TimeoutError::GuestToolsNotReady {
                vm: vm_name.into(),
                attempts: outcome.attempts(),
            }));
        }

        let guest_fault = |operation: &str| PlatformFault::GuestOperation {
            operation: operation.into(),
            vm: vm_name.into(),
        };

        if let Some(key) = &appliance.ssh_public_key {
            debug!("Uploading SSH public key to '{vm_name}'");
            platform
                .upload_file(
                    vm_id,
                    &credentials.username,
                    &credentials.password,
                    GUEST_AUTHORIZED_KEYS_PATH,
                    format!("{}\n", key.trim_end()).as_bytes(),
                )
                .structured(guest_fault("upload-file"))?;
        }

        if let Some(customization) = &appliance.customization {
            debug!("Uploading customization script to '{vm_name}'");
            platform
                .upload_file(
                    vm_id,
                    &credentials.username,
                    &credentials.password,
                    GUEST_CUSTOMIZATION_SCRIPT_PATH,
                    customization.script.as_bytes(),
                )
                .structured(guest_fault("upload-file"))?;

            let mut arguments = vec![GUEST_CUSTOMIZATION_SCRIPT_PATH.to_owned()];
            arguments.extend(customization.arguments.iter().cloned());
            let pid = platform
                .start_program(
                    vm_id,
                    &credentials.username,
                    &credentials.password,
                    &ProgramSpec {
                        path: customization.interpreter.clone(),
                        arguments,
                    },
                )
                .structured(guest_fault("start-program"))?;
            info!("Started customization of '{vm_name}' as process {pid}");
        }

        Ok(())
    }

    fn vm(&self, id: &str, name: &str) -> Result<VirtualMachine, CommissionError> {
        self.ctx
            .platform()
            .vm(id)
            .structured(PlatformFault::Query {
                kind: "VM".into(),
                name: name.into(),
            })?
            .structured(PlatformFault::ObjectNotFound {
                kind: "VM".into(),
                name: name.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use commissioner_api::{
        config::Customization,
        error::ErrorKind,
        status::{CommissionStatus, PowerState},
    };

    use super::*;
    use crate::{
        engine::context::tests::{sample_input, test_services},
        platform::{
            simulator::{fixtures, Operation},
            ClusterOps,
        },
    };

    #[test]
    fn test_vm_name() {
        assert_eq!(
            appliance_vm_name("ovsvapp", "esx1.example.com"),
            "ovsvapp-esx1.example.com"
        );
        assert_eq!(appliance_vm_name("proxy", "esx 2/rack#4"), "proxy-esx-2-rack-4");
        assert_eq!(affinity_rule_name("ovsvapp-esx1"), "ovsvapp-esx1-affinity");
    }

    /// Runs the worker for the first host of a freshly built topology.
    fn commission_first_host(
        input: &commissioner_api::config::DriverInput,
        setup: impl FnOnce(&crate::platform::simulator::SimulatedPlatform),
    ) -> (
        HostCommissionResult,
        std::sync::Arc<crate::platform::simulator::SimulatedPlatform>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let (platform, services) = test_services(fixtures::cluster(2), dir.path());
        setup(&platform);
        let ctx = ClusterContext::open(&services, input).unwrap();
        let hosts = ctx.hosts().unwrap();
        ctx.topology().build(&input.network, &hosts).unwrap();

        let worker = CommissionWorker::new(&ctx, ApplianceRole::NetworkAppliance, &hosts);
        let job = CommissionJob::new("ovsvapp", hosts[0].clone(), "10.0.0.2".parse().unwrap());
        (worker.run(&job), platform)
    }

    #[test]
    fn test_commission_host() {
        let mut input = sample_input();
        input.appliance.customization = Some(Customization {
            script: "#!/bin/bash\necho configured\n".into(),
            interpreter: "/bin/bash".into(),
            arguments: vec!["--verbose".into()],
        });

        let (result, platform) = commission_first_host(&input, |_| ());
        assert_eq!(result.status, CommissionStatus::Success, "{:?}", result.error);
        assert_eq!(result.ip, Some("10.0.0.2".parse().unwrap()));

        let vm = result.vm.unwrap();
        assert_eq!(vm.name, "ovsvapp-esx1.example.com");
        assert_eq!(vm.host, "host-1");
        assert_eq!(vm.power_state, PowerState::PoweredOn);
        assert_eq!(vm.annotation, ApplianceRole::NetworkAppliance.marker());
        assert_eq!(vm.config_ip, Some("10.0.0.2".parse().unwrap()));
        assert!(vm.pxe_mac.is_some());

        let created = platform.vm_by_name("ovsvapp-esx1.example.com").unwrap();
        assert_eq!(created.extra_config[GUESTINFO_NETMASK], "255.255.255.0");
        assert!(created.nics.iter().all(|n| n.connected));

        let rules = platform.affinity_rules("domain-c7").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "ovsvapp-esx1.example.com-affinity");
        assert!(rules[0].mandatory);

        assert_eq!(
            platform.guest_file(&created.id, GUEST_AUTHORIZED_KEYS_PATH),
            Some(b"ssh-ed25519 AAAA stack@deployer\n".to_vec())
        );
        let programs = platform.programs();
        assert_eq!(programs.len(), 1);
        assert_eq!(
            programs[0].1.arguments,
            vec![GUEST_CUSTOMIZATION_SCRIPT_PATH.to_owned(), "--verbose".to_owned()]
        );
    }

    #[test]
    fn test_host_in_maintenance_is_activated() {
        let input = sample_input();
        let (result, platform) = commission_first_host(&input, |platform| {
            platform.with_inventory(|inv| inv.hosts[0].in_maintenance_mode = true)
        });
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(
            platform.calls_of(Operation::ExitMaintenanceMode),
            vec!["esx1.example.com"]
        );
    }

    #[test]
    fn test_clone_fault_is_reported() {
        let input = sample_input();
        let (result, platform) = commission_first_host(&input, |platform| {
            platform.inject_fault(Operation::CloneVm, "esx1")
        });
        assert_eq!(result.status, CommissionStatus::Failed);
        assert_eq!(result.ip, Some("10.0.0.2".parse().unwrap()));
        assert!(result.vm.is_none());
        let error = result.error.unwrap();
        assert!(error.contains("ovsvapp-esx1.example.com"), "{error}");
        assert!(error.contains("injected fault"), "{error}");
        assert!(platform.vm_by_name("ovsvapp-esx1.example.com").is_none());
    }

    #[test]
    fn test_observed_ip_wins() {
        let input = sample_input();
        let (result, _) = commission_first_host(&input, |platform| {
            platform.with_inventory(|inv| {
                inv.behaviors
                    .guest_ip_overrides
                    .insert("ovsvapp-esx1.example.com".into(), "10.0.0.77".parse().unwrap());
            })
        });
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.ip, Some("10.0.0.77".parse().unwrap()));
    }

    #[test]
    fn test_guest_tools_timeout() {
        let input = sample_input();
        let (result, platform) = commission_first_host(&input, |platform| {
            platform.with_inventory(|inv| {
                inv.behaviors
                    .tools_never_ready
                    .insert("ovsvapp-esx1.example.com".into());
            })
        });
        assert_eq!(result.status, CommissionStatus::Failed);
        assert!(result.error.unwrap().contains("Guest tools"));
        assert!(platform.programs().is_empty());
    }

    #[test]
    fn test_ha_drs_can_stay_enabled() {
        let mut input = sample_input();
        input.appliance.disable_ha_drs = Some(false);
        let (result, platform) = commission_first_host(&input, |_| ());
        assert!(result.is_success(), "{:?}", result.error);
        assert!(platform.calls_of(Operation::ReconfigureCluster).is_empty());
    }

    #[test]
    fn test_missing_port_group_fails_host() {
        let dir = tempfile::tempdir().unwrap();
        let (_, services) = test_services(fixtures::cluster(1), dir.path());
        let input = sample_input();
        let ctx = ClusterContext::open(&services, &input).unwrap();
        let hosts = ctx.hosts().unwrap();

        let worker = CommissionWorker::new(&ctx, ApplianceRole::NetworkAppliance, &hosts);
        let job = CommissionJob::new("ovsvapp", hosts[0].clone(), "10.0.0.2".parse().unwrap());
        let err = worker.commission(&job).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NetworkTopology(_)));
    }
}
