use log::{debug, info, warn};

use commissioner_api::{
    config::{
        FailoverDetection, LoadBalancing, NetworkProperties, PortGroupSpec, SecurityPolicy,
        SwitchSpec, ValidationError, VlanSpec,
    },
    constants::TOPOLOGY_MARKER,
    error::{CommissionError, NetworkTopologyError, PlatformFault, ReportError},
};

use crate::{
    engine::{context::TopologyLock, task::TaskPoller},
    platform::{
        Datacenter, DistributedSwitch, Host, PlatformClient, PortBinding, PortGroup,
        PortGroupCreateSpec, PortGroupPolicy, PortGroupReconfigSpec, SwitchCreateSpec,
        SwitchHostMember, SwitchReconfigSpec, TeamingPolicy, UplinkBinding, VlanPolicy,
    },
};

/// Switches and port groups in effect after a build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub switches: Vec<DistributedSwitch>,
    pub port_groups: Vec<PortGroup>,
}

/// What a teardown removed and what it had to leave behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed_switches: Vec<String>,
    pub removed_port_groups: Vec<String>,
    pub kept: Vec<String>,
}

/// Creates and reconfigures the distributed switches and port groups appliances attach to.
///
/// Every mutation runs while holding the topology lock. None of the public operations call each
/// other while holding it.
pub struct TopologyBuilder<'a> {
    platform: &'a dyn PlatformClient,
    poller: TaskPoller<'a>,
    lock: &'a TopologyLock,
    datacenter: &'a Datacenter,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(
        platform: &'a dyn PlatformClient,
        poller: TaskPoller<'a>,
        lock: &'a TopologyLock,
        datacenter: &'a Datacenter,
    ) -> Self {
        Self {
            platform,
            poller,
            lock,
            datacenter,
        }
    }

    /// Creates every switch and port group of `network`, adds `hosts` to the switches and applies
    /// the port group policies. Existing objects are reused.
    #[tracing::instrument(skip_all, fields(hosts = hosts.len()))]
    pub fn build(
        &self,
        network: &NetworkProperties,
        hosts: &[Host],
    ) -> Result<Topology, CommissionError> {
        let mut topology = Topology::default();

        for spec in &network.switches {
            let switch = self.create_or_get_switch(spec)?;
            let switch = if hosts.is_empty() {
                switch
            } else {
                self.reconfigure_switch(&switch, hosts, spec)?
            };
            topology.switches.push(switch);
        }

        for spec in &network.port_groups {
            let switch = topology
                .switches
                .iter()
                .find(|s| s.name == spec.switch_name)
                .structured(NetworkTopologyError::SwitchNotFound {
                    switch: spec.switch_name.clone(),
                })?;
            let port_group = self.create_or_get_port_group(spec, switch)?;
            let port_group = self.reconfigure_port_group(switch, &port_group, spec)?;
            topology.port_groups.push(port_group);
        }

        Ok(topology)
    }

    pub fn create_or_get_switch(
        &self,
        spec: &SwitchSpec,
    ) -> Result<DistributedSwitch, CommissionError> {
        let _guard = self.lock.acquire();
        if let Some(existing) = self.find_switch(&spec.name)? {
            debug!("Switch '{}' already exists as '{}'", spec.name, existing.id);
            return Ok(existing);
        }

        info!("Creating switch '{}'", spec.name);
        let on_fault = || NetworkTopologyError::CreateSwitch {
            switch: spec.name.clone(),
        };
        let task = self
            .platform
            .create_switch(
                &self.datacenter.id,
                &SwitchCreateSpec {
                    name: spec.name.clone(),
                    description: TOPOLOGY_MARKER.into(),
                    mtu: spec.mtu(),
                    uplink_names: spec.uplink_names(),
                },
            )
            .structured(on_fault())?;
        let id = self.poller.await_object(&task, on_fault())?;
        self.switch(&id, &spec.name)
    }

    pub fn create_or_get_port_group(
        &self,
        spec: &PortGroupSpec,
        switch: &DistributedSwitch,
    ) -> Result<PortGroup, CommissionError> {
        let _guard = self.lock.acquire();
        if let Some(existing) = self.find_port_group(switch, &spec.name)? {
            debug!("Port group '{}' already exists as '{}'", spec.name, existing.id);
            return Ok(existing);
        }

        info!("Creating port group '{}' on switch '{}'", spec.name, switch.name);
        let on_fault = || NetworkTopologyError::CreatePortGroup {
            port_group: spec.name.clone(),
        };
        let task = self
            .platform
            .create_port_group(
                &switch.id,
                &PortGroupCreateSpec {
                    name: spec.name.clone(),
                    description: TOPOLOGY_MARKER.into(),
                    auto_expand: true,
                    binding: PortBinding::Early,
                },
            )
            .structured(on_fault())?;
        self.poller.await_object(&task, on_fault())?;
        self.find_port_group(switch, &spec.name)?
            .structured(NetworkTopologyError::PortGroupNotFound {
                port_group: spec.name.clone(),
            })
    }

    /// Adds the hosts that are not members yet, binding the free NICs named by `spec` on each of
    /// them. Returns the switch as it is afterwards.
    pub fn reconfigure_switch(
        &self,
        switch: &DistributedSwitch,
        hosts: &[Host],
        spec: &SwitchSpec,
    ) -> Result<DistributedSwitch, CommissionError> {
        let _guard = self.lock.acquire();
        let current = self.switch(&switch.id, &switch.name)?;

        let mut members = Vec::new();
        for host in hosts.iter().filter(|h| !current.has_host(&h.id)) {
            members.push(SwitchHostMember {
                host: host.id.clone(),
                uplinks: self.free_uplinks(&current, host, spec)?,
            });
        }
        if members.is_empty() {
            debug!("All hosts are already members of switch '{}'", current.name);
            return Ok(current);
        }

        info!(
            "Adding {} host(s) to switch '{}'",
            members.len(),
            current.name
        );
        let on_fault = || NetworkTopologyError::ReconfigureSwitch {
            switch: current.name.clone(),
        };
        let task = self
            .platform
            .reconfigure_switch(
                &current.id,
                &SwitchReconfigSpec {
                    config_version: current.config_version,
                    add_hosts: members,
                    remove_hosts: Vec::new(),
                },
            )
            .structured(on_fault())?;
        self.poller.await_success(&task, on_fault())?;
        self.switch(&current.id, &current.name)
    }

    /// NICs named by `spec` that exist on the host and are not bound by a standard switch or
    /// another distributed switch, with the uplink each one goes to.
    fn free_uplinks(
        &self,
        switch: &DistributedSwitch,
        host: &Host,
        spec: &SwitchSpec,
    ) -> Result<Vec<UplinkBinding>, CommissionError> {
        if spec.physical_nics.is_empty() {
            return Ok(Vec::new());
        }

        let network = self
            .platform
            .host_network(&host.id)
            .structured(PlatformFault::Query {
                kind: "network of host".into(),
                name: host.name.clone(),
            })?;
        let free: Vec<UplinkBinding> = spec
            .physical_nics
            .iter()
            .filter(|nic| network.physical_nics.contains(nic))
            .filter(|nic| !network.is_busy(nic, &switch.name))
            .filter_map(|nic| {
                spec.uplink_for_nic(nic).map(|uplink| UplinkBinding {
                    uplink,
                    pnic: nic.clone(),
                })
            })
            .collect();

        if free.is_empty() {
            return Err(CommissionError::new(NetworkTopologyError::NoFreePhysicalNic {
                host: host.name.clone(),
                switch: switch.name.clone(),
                nics: spec.physical_nics.join(", "),
            }));
        }
        Ok(free)
    }

    /// Applies the policy derived from `spec`, skipping the call when nothing changes.
    pub fn reconfigure_port_group(
        &self,
        switch: &DistributedSwitch,
        port_group: &PortGroup,
        spec: &PortGroupSpec,
    ) -> Result<PortGroup, CommissionError> {
        let _guard = self.lock.acquire();
        let switch = self.switch(&switch.id, &switch.name)?;
        let current = self
            .find_port_group(&switch, &port_group.name)?
            .structured(NetworkTopologyError::PortGroupNotFound {
                port_group: port_group.name.clone(),
            })?;

        let policy = port_group_policy(&switch, spec)?;
        if policy == current.policy {
            debug!("Port group '{}' is up to date", current.name);
            return Ok(current);
        }

        info!("Reconfiguring port group '{}'", current.name);
        let on_fault = || NetworkTopologyError::ReconfigurePortGroup {
            port_group: current.name.clone(),
        };
        let task = self
            .platform
            .reconfigure_port_group(
                &current.id,
                &PortGroupReconfigSpec {
                    config_version: current.config_version,
                    policy,
                },
            )
            .structured(on_fault())?;
        self.poller.await_success(&task, on_fault())?;
        self.find_port_group(&switch, &current.name)?
            .structured(NetworkTopologyError::PortGroupNotFound {
                port_group: current.name.clone(),
            })
    }

    /// Looks a port group up by name anywhere in the datacenter.
    pub fn resolve_port_group(&self, name: &str) -> Result<PortGroup, CommissionError> {
        let _guard = self.lock.acquire();
        self.platform
            .find_network(&self.datacenter.id, name)
            .structured(PlatformFault::Query {
                kind: "port group".into(),
                name: name.into(),
            })?
            .structured(NetworkTopologyError::PortGroupNotFound {
                port_group: name.into(),
            })
    }

    /// Removes the port groups and switches of `network` this system created.
    ///
    /// Port groups still carrying VMs are left alone. The cluster's hosts are detached from owned
    /// switches, and a switch is destroyed once no host and no port group remains on it. Missing
    /// objects are skipped.
    #[tracing::instrument(skip_all)]
    pub fn teardown(
        &self,
        network: &NetworkProperties,
        cluster_hosts: &[String],
    ) -> Result<TeardownReport, CommissionError> {
        let _guard = self.lock.acquire();
        let mut report = TeardownReport::default();

        for spec in &network.port_groups {
            let Some(switch) = self.find_switch(&spec.switch_name)? else {
                continue;
            };
            let Some(port_group) = self.find_port_group(&switch, &spec.name)? else {
                continue;
            };
            if port_group.description.as_deref() != Some(TOPOLOGY_MARKER) {
                info!("Keeping port group '{}', it was not created here", spec.name);
                report.kept.push(spec.name.clone());
                continue;
            }
            if !port_group.vms.is_empty() {
                warn!(
                    "Keeping port group '{}', {} VM(s) are still attached",
                    spec.name,
                    port_group.vms.len()
                );
                report.kept.push(spec.name.clone());
                continue;
            }

            info!("Deleting port group '{}'", spec.name);
            let on_fault = || NetworkTopologyError::DeletePortGroup {
                port_group: spec.name.clone(),
            };
            let task = self
                .platform
                .destroy_port_group(&port_group.id)
                .structured(on_fault())?;
            self.poller.await_success(&task, on_fault())?;
            report.removed_port_groups.push(spec.name.clone());
        }

        for spec in &network.switches {
            let Some(switch) = self.find_switch(&spec.name)? else {
                continue;
            };
            if switch.description.as_deref() != Some(TOPOLOGY_MARKER) {
                info!("Keeping switch '{}', it was not created here", spec.name);
                report.kept.push(spec.name.clone());
                continue;
            }

            let remaining = self
                .platform
                .port_groups(&switch.id)
                .structured(PlatformFault::Query {
                    kind: "port groups of switch".into(),
                    name: switch.name.clone(),
                })?;
            if remaining.iter().any(|pg| !pg.vms.is_empty()) {
                warn!("Keeping switch '{}', VMs are still attached", spec.name);
                report.kept.push(spec.name.clone());
                continue;
            }

            let switch = self.detach_hosts(switch, cluster_hosts)?;
            if !switch.hosts.is_empty() || !remaining.is_empty() {
                info!(
                    "Keeping switch '{}', {} host(s) and {} port group(s) remain",
                    spec.name,
                    switch.hosts.len(),
                    remaining.len()
                );
                report.kept.push(spec.name.clone());
                continue;
            }

            info!("Deleting switch '{}'", spec.name);
            let on_fault = || NetworkTopologyError::DeleteSwitch {
                switch: spec.name.clone(),
            };
            let task = self
                .platform
                .destroy_switch(&switch.id)
                .structured(on_fault())?;
            self.poller.await_success(&task, on_fault())?;
            report.removed_switches.push(spec.name.clone());
        }

        Ok(report)
    }

    fn detach_hosts(
        &self,
        switch: DistributedSwitch,
        hosts: &[String],
    ) -> Result<DistributedSwitch, CommissionError> {
        let remove: Vec<String> = hosts
            .iter()
            .filter(|h| switch.has_host(h))
            .cloned()
            .collect();
        if remove.is_empty() {
            return Ok(switch);
        }

        debug!(
            "Detaching {} host(s) from switch '{}'",
            remove.len(),
            switch.name
        );
        let on_fault = || NetworkTopologyError::ReconfigureSwitch {
            switch: switch.name.clone(),
        };
        let task = self
            .platform
            .reconfigure_switch(
                &switch.id,
                &SwitchReconfigSpec {
                    config_version: switch.config_version,
                    add_hosts: Vec::new(),
                    remove_hosts: remove,
                },
            )
            .structured(on_fault())?;
        self.poller.await_success(&task, on_fault())?;
        self.switch(&switch.id, &switch.name)
    }

    fn find_switch(&self, name: &str) -> Result<Option<DistributedSwitch>, CommissionError> {
        self.platform
            .find_switch(&self.datacenter.id, name)
            .structured(PlatformFault::Query {
                kind: "switch".into(),
                name: name.into(),
            })
    }

    fn switch(&self, id: &str, name: &str) -> Result<DistributedSwitch, CommissionError> {
        self.platform
            .switch(id)
            .structured(PlatformFault::Query {
                kind: "switch".into(),
                name: name.into(),
            })?
            .structured(NetworkTopologyError::SwitchNotFound {
                switch: name.into(),
            })
    }

    fn find_port_group(
        &self,
        switch: &DistributedSwitch,
        name: &str,
    ) -> Result<Option<PortGroup>, CommissionError> {
        self.platform
            .find_port_group(&switch.id, name)
            .structured(PlatformFault::Query {
                kind: "port group".into(),
                name: name.into(),
            })
    }
}

fn vlan_policy(spec: VlanSpec) -> VlanPolicy {
    match spec {
        VlanSpec::None => VlanPolicy::None,
        VlanSpec::Single(id) => VlanPolicy::Single(id),
        VlanSpec::Trunk(ranges) => {
            VlanPolicy::Trunk(ranges.iter().map(|r| (*r.start(), *r.end())).collect())
        }
    }
}

/// Policy a port group on `switch` should carry.
///
/// A switch without any physical NIC attached is still being bootstrapped. Its port groups
/// always get the full VLAN trunk with promiscuous mode and forged transmits, whatever the
/// request says.
pub fn port_group_policy(
    switch: &DistributedSwitch,
    spec: &PortGroupSpec,
) -> Result<PortGroupPolicy, CommissionError> {
    if switch.attached_nic_count() == 0 {
        return Ok(PortGroupPolicy {
            vlan: vlan_policy(VlanSpec::full_trunk()),
            security: SecurityPolicy::permissive(),
            teaming: None,
        });
    }

    let vlan = vlan_policy(spec.vlan_spec().map_err(CommissionError::new)?);

    Ok(PortGroupPolicy {
        vlan,
        security: spec.effective_security(),
        teaming: teaming_policy(switch, spec)?,
    })
}

fn teaming_policy(
    switch: &DistributedSwitch,
    spec: &PortGroupSpec,
) -> Result<Option<TeamingPolicy>, CommissionError> {
    let Some(teaming) = &spec.nic_teaming else {
        return Ok(None);
    };

    spec.validate_teaming().map_err(|e| match e {
        ValidationError::IpHashWithBeaconProbing { port_group } => {
            CommissionError::new(NetworkTopologyError::InvalidNicTeaming { port_group })
        }
        other => CommissionError::new(other),
    })?;
    let (Ok(load_balancing), Ok(failover_detection)) = (
        LoadBalancing::try_from(teaming.load_balancing),
        FailoverDetection::try_from(teaming.network_failover_detection),
    ) else {
        return Err(CommissionError::internal(
            "Teaming codes passed validation but do not convert",
        ));
    };

    let mut active_uplinks = Vec::new();
    for nic in &teaming.active_nics {
        match switch.uplink_of(nic) {
            Some(uplink) => active_uplinks.push(uplink.to_owned()),
            None => warn!(
                "Active NIC '{nic}' of port group '{}' is not bound on switch '{}'",
                spec.name, switch.name
            ),
        }
    }

    Ok(Some(TeamingPolicy {
        load_balancing,
        failover_detection,
        notify_switches: teaming.notify_switches,
        active_uplinks,
    }))
}

#[cfg(test)]
mod tests {
    use commissioner_api::{config::NicTeaming, error::ErrorKind};

    use super::*;
    use crate::{
        platform::{
            simulator::{fixtures, Operation, SimulatedPlatform},
            Inventory,
        },
        retry::{Backoff, RetryPolicy},
    };

    const WAIT: RetryPolicy = RetryPolicy::new(10, Backoff::None);

    struct Fixture {
        platform: SimulatedPlatform,
        lock: TopologyLock,
        datacenter: Datacenter,
    }

    impl Fixture {
        fn new(hosts: usize) -> Self {
            let platform = SimulatedPlatform::new(fixtures::cluster(hosts));
            let datacenter = platform.datacenter("datacenter-1").unwrap().unwrap();
            Self {
                platform,
                lock: TopologyLock::default(),
                datacenter,
            }
        }

        fn builder(&self) -> TopologyBuilder<'_> {
            TopologyBuilder::new(
                &self.platform,
                TaskPoller::new(&self.platform, &WAIT),
                &self.lock,
                &self.datacenter,
            )
        }

        fn hosts(&self) -> Vec<Host> {
            self.platform.hosts("domain-c7").unwrap()
        }
    }

    fn network() -> NetworkProperties {
        crate::engine::context::tests::sample_input().network
    }

    #[test]
    fn test_build_creates_topology() {
        let fixture = Fixture::new(2);
        let builder = fixture.builder();

        let topology = builder.build(&network(), &fixture.hosts()).unwrap();
        assert_eq!(topology.switches.len(), 2);
        assert_eq!(topology.port_groups.len(), 2);

        let mgmt = fixture.platform.switch_by_name("MGMT-DVS").unwrap();
        assert_eq!(mgmt.description.as_deref(), Some(TOPOLOGY_MARKER));
        assert_eq!(mgmt.uplink_names, vec!["uplink0".to_owned()]);
        assert_eq!(mgmt.hosts.len(), 2);
        assert_eq!(mgmt.uplink_of("vmnic1"), Some("uplink0"));

        let trunk = fixture.platform.switch_by_name("TRUNK-DVS").unwrap();
        assert_eq!(trunk.uplink_names, vec!["uplink".to_owned()]);
        assert_eq!(trunk.attached_nic_count(), 0);

        let mgmt_pg = fixture.platform.port_group_by_name("MGMT").unwrap();
        assert!(mgmt_pg.auto_expand);
        assert_eq!(mgmt_pg.binding, PortBinding::Early);
        assert_eq!(mgmt_pg.policy.vlan, VlanPolicy::Single(20));
        assert_eq!(mgmt_pg.policy.security, SecurityPolicy::default());
    }

    #[test]
    fn test_create_port_group_twice_is_noop() {
        let fixture = Fixture::new(1);
        let builder = fixture.builder();
        let network = network();

        let switch = builder.create_or_get_switch(&network.switches[0]).unwrap();
        let first = builder
            .create_or_get_port_group(&network.port_groups[0], &switch)
            .unwrap();
        let calls = fixture.platform.calls().len();

        let second = builder
            .create_or_get_port_group(&network.port_groups[0], &switch)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fixture.platform.calls().len(), calls);
        assert_eq!(fixture.platform.calls_of(Operation::CreatePortGroup), vec!["MGMT"]);
    }

    #[test]
    fn test_bootstrap_rule_forces_full_trunk() {
        let fixture = Fixture::new(1);
        let builder = fixture.builder();
        let mut network = network();
        let trunk_spec = &mut network.port_groups[1];
        trunk_spec.vlan = Some("100".into());
        trunk_spec.vlan_type = None;
        trunk_spec.security = Some(SecurityPolicy::default());

        let switch = builder.create_or_get_switch(&network.switches[1]).unwrap();
        let port_group = builder
            .create_or_get_port_group(&network.port_groups[1], &switch)
            .unwrap();
        let port_group = builder
            .reconfigure_port_group(&switch, &port_group, &network.port_groups[1])
            .unwrap();

        assert_eq!(port_group.policy.vlan, VlanPolicy::Trunk(vec![(1, 4094)]));
        assert_eq!(port_group.policy.security, SecurityPolicy::permissive());

        // Applying the same policy again does not touch the platform.
        builder
            .reconfigure_port_group(&switch, &port_group, &network.port_groups[1])
            .unwrap();
        assert_eq!(
            fixture.platform.calls_of(Operation::ReconfigurePortGroup),
            vec!["TRUNK"]
        );
    }

    #[test]
    fn test_busy_nic_is_rejected() {
        let fixture = Fixture::new(1);
        let builder = fixture.builder();
        let spec = SwitchSpec {
            name: "DATA-DVS".into(),
            switch_type: "distributed".into(),
            physical_nics: vec!["vmnic0".into()],
            mtu: None,
        };

        let switch = builder.create_or_get_switch(&spec).unwrap();
        let err = builder
            .reconfigure_switch(&switch, &fixture.hosts(), &spec)
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::NetworkTopology(NetworkTopologyError::NoFreePhysicalNic {
                host: "esx1.example.com".into(),
                switch: "DATA-DVS".into(),
                nics: "vmnic0".into(),
            })
        );
        assert!(fixture.platform.calls_of(Operation::ReconfigureSwitch).is_empty());
    }

    #[test]
    fn test_existing_members_are_skipped() {
        let fixture = Fixture::new(2);
        let builder = fixture.builder();
        let network = network();
        let hosts = fixture.hosts();

        let switch = builder.create_or_get_switch(&network.switches[0]).unwrap();
        let switch = builder
            .reconfigure_switch(&switch, &hosts[..1], &network.switches[0])
            .unwrap();
        let switch = builder
            .reconfigure_switch(&switch, &hosts, &network.switches[0])
            .unwrap();
        builder
            .reconfigure_switch(&switch, &hosts, &network.switches[0])
            .unwrap();

        assert_eq!(switch.hosts.len(), 2);
        assert_eq!(
            fixture.platform.calls_of(Operation::ReconfigureSwitch).len(),
            2
        );
    }

    #[test]
    fn test_teaming_policy() {
        let fixture = Fixture::new(1);
        let builder = fixture.builder();
        let mut network = network();
        network.port_groups[0].nic_teaming = Some(NicTeaming {
            load_balancing: 2,
            network_failover_detection: 2,
            notify_switches: false,
            active_nics: vec!["vmnic1".into(), "vmnic3".into()],
        });

        builder.build(&network, &fixture.hosts()).unwrap();
        let teaming = fixture
            .platform
            .port_group_by_name("MGMT")
            .unwrap()
            .policy
            .teaming
            .unwrap();
        assert_eq!(teaming.load_balancing, LoadBalancing::SourceMac);
        assert_eq!(teaming.failover_detection, FailoverDetection::BeaconProbing);
        assert_eq!(teaming.active_uplinks, vec!["uplink0".to_owned()]);

        network.port_groups[0].nic_teaming = Some(NicTeaming {
            load_balancing: 1,
            network_failover_detection: 2,
            notify_switches: true,
            active_nics: Vec::new(),
        });
        let switch = fixture.platform.switch_by_name("MGMT-DVS").unwrap();
        let err = port_group_policy(&switch, &network.port_groups[0]).unwrap_err();
        assert_eq!(err.category(), "network-topology");
    }

    #[test]
    fn test_fault_names_the_object() {
        let fixture = Fixture::new(1);
        fixture
            .platform
            .inject_fault(Operation::CreatePortGroup, "TRUNK");

        let err = fixture.builder().build(&network(), &[]).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::NetworkTopology(NetworkTopologyError::CreatePortGroup {
                port_group: "TRUNK".into()
            })
        );
        assert!(err.to_string().contains("injected fault"));
    }

    #[test]
    fn test_teardown() {
        let fixture = Fixture::new(2);
        let builder = fixture.builder();
        let network = network();
        let hosts = fixture.hosts();
        builder.build(&network, &hosts).unwrap();

        // A VM on MGMT keeps the port group and its switch alive.
        fixture.platform.with_inventory(|inv| {
            let pg = inv.port_groups.iter_mut().find(|pg| pg.name == "MGMT").unwrap();
            pg.vms.push("vm-42".into());
        });
        let host_ids: Vec<String> = hosts.iter().map(|h| h.id.clone()).collect();
        let report = builder.teardown(&network, &host_ids).unwrap();
        assert_eq!(report.removed_port_groups, vec!["TRUNK".to_owned()]);
        assert_eq!(report.removed_switches, vec!["TRUNK-DVS".to_owned()]);
        assert_eq!(report.kept, vec!["MGMT".to_owned(), "MGMT-DVS".to_owned()]);

        fixture.platform.with_inventory(|inv| {
            for pg in inv.port_groups.iter_mut() {
                pg.vms.clear();
            }
        });
        let report = builder.teardown(&network, &host_ids).unwrap();
        assert_eq!(report.removed_port_groups, vec!["MGMT".to_owned()]);
        assert_eq!(report.removed_switches, vec!["MGMT-DVS".to_owned()]);
        assert!(fixture.platform.switch_by_name("MGMT-DVS").is_none());
        assert!(fixture.platform.inventory().host_networks["host-1"]
            .proxy_switches
            .is_empty());

        // Nothing left to do.
        let report = builder.teardown(&network, &host_ids).unwrap();
        assert_eq!(report, TeardownReport::default());
    }

    #[test]
    fn test_teardown_keeps_foreign_objects() {
        let fixture = Fixture::new(1);
        let builder = fixture.builder();
        let network = network();
        builder.build(&network, &[]).unwrap();
        fixture.platform.with_inventory(|inv| {
            for switch in inv.switches.iter_mut() {
                switch.description = None;
            }
        });

        let report = builder.teardown(&network, &[]).unwrap();
        assert_eq!(
            report.removed_port_groups,
            vec!["MGMT".to_owned(), "TRUNK".to_owned()]
        );
        assert!(report.removed_switches.is_empty());
        assert_eq!(report.kept.len(), 2);
    }
}
