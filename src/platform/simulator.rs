//! In-memory platform.
//!
//! Implements the whole platform surface over an inventory that can be loaded from and saved to a
//! YAML file. Operations complete as tasks that report `running` for a configurable number of
//! update rounds. Faults can be injected per operation and object name.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    net::{IpAddr, Ipv4Addr},
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use anyhow::{bail, Context, Error};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use commissioner_api::{config::PlatformEndpoint, status::PowerState, ObjectId};

use super::{
    AffinityRule, Cluster, ClusterOps, ClusterReconfigSpec, CloneSpec, Connector, Datacenter,
    Datastore, DistributedSwitch, Fault, GuestNic, GuestOps, Host, HostNetworkInfo, Inventory,
    NetworkOps, PlatformClient, PortGroup, PortGroupCreateSpec, PortGroupPolicy,
    PortGroupReconfigSpec, ProgramSpec, PropertyFilter, SwitchCreateSpec, SwitchReconfigSpec,
    TaskCollector, TaskHandle, TaskInfo, TaskResult, TaskState, TemplateImportSpec, UpdateSet,
    VirtualMachine, VmNic, VmOps, VmOverride, VmReconfigSpec, GUESTINFO_IP, GUESTINFO_NETWORK,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    CloneVm,
    ReconfigureVm,
    ShutdownGuest,
    PowerOff,
    DestroyVm,
    ImportTemplate,
    CreateSwitch,
    ReconfigureSwitch,
    DestroySwitch,
    CreatePortGroup,
    ReconfigurePortGroup,
    DestroyPortGroup,
    ReconfigureCluster,
    MoveHost,
    EnterMaintenanceMode,
    ExitMaintenanceMode,
    UploadFile,
    StartProgram,
}

/// Matches an operation on every object whose name contains `object`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct OperationRule {
    pub operation: Operation,
    pub object: String,
}

impl OperationRule {
    fn matches(&self, operation: Operation, object: &str) -> bool {
        self.operation == operation && object.contains(&self.object)
    }
}

/// Deviations from a well-behaved platform.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Behaviors {
    /// Operations whose tasks end in a fault.
    #[serde(default)]
    pub faults: Vec<OperationRule>,

    /// Operations whose tasks never complete.
    #[serde(default)]
    pub stalls: Vec<OperationRule>,

    /// Update rounds a task reports `running` before completing.
    #[serde(default = "default_task_rounds")]
    pub task_rounds: u32,

    /// VMs (by name) whose guest tools never start.
    #[serde(default)]
    pub tools_never_ready: BTreeSet<String>,

    /// VMs (by name) that ignore guest shutdown requests.
    #[serde(default)]
    pub ignore_shutdown: BTreeSet<String>,

    /// VMs (by name) whose guest reports an address other than the one it was configured with.
    #[serde(default)]
    pub guest_ip_overrides: BTreeMap<String, Ipv4Addr>,

    /// Makes every wait for property updates fail.
    #[serde(default)]
    pub broken_session: bool,
}

fn default_task_rounds() -> u32 {
    1
}

impl Default for Behaviors {
    fn default() -> Self {
        Self {
            faults: Vec::new(),
            stalls: Vec::new(),
            task_rounds: default_task_rounds(),
            tools_never_ready: BTreeSet::new(),
            ignore_shutdown: BTreeSet::new(),
            guest_ip_overrides: BTreeMap::new(),
            broken_session: false,
        }
    }
}

/// Everything the simulated platform knows about.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SimulatedInventory {
    #[serde(default)]
    pub datacenters: Vec<Datacenter>,
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub datastores: Vec<Datastore>,
    #[serde(default)]
    pub vms: Vec<VirtualMachine>,
    #[serde(default)]
    pub switches: Vec<DistributedSwitch>,
    #[serde(default)]
    pub port_groups: Vec<PortGroup>,
    #[serde(default)]
    pub host_networks: BTreeMap<ObjectId, HostNetworkInfo>,
    #[serde(default)]
    pub affinity_rules: BTreeMap<ObjectId, Vec<AffinityRule>>,
    #[serde(default)]
    pub vm_overrides: BTreeMap<ObjectId, Vec<VmOverride>>,
    #[serde(default)]
    pub behaviors: Behaviors,
    /// Last object ID handed out.
    #[serde(default)]
    pub next_id: u64,
}

#[derive(Debug)]
struct SimulatedTask {
    info: TaskInfo,
    rounds_left: u32,
}

#[derive(Debug, Default)]
struct State {
    inventory: SimulatedInventory,
    tasks: BTreeMap<TaskHandle, SimulatedTask>,
    filters: BTreeMap<String, (TaskHandle, u64)>,
    filters_created: usize,
    calls: Vec<String>,
    guest_files: BTreeMap<(ObjectId, String), Vec<u8>>,
    programs: Vec<(ObjectId, ProgramSpec)>,
}

/// Outcome of applying an operation to the inventory.
type Applied = Result<TaskResult, Fault>;

pub struct SimulatedPlatform {
    state: Mutex<State>,
}

impl SimulatedPlatform {
    pub fn new(inventory: SimulatedInventory) -> Self {
        Self {
            state: Mutex::new(State {
                inventory,
                ..Default::default()
            }),
        }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        let inventory: SimulatedInventory = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse '{}'", path.display()))?;
        Ok(Self::new(inventory))
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let rendered = serde_yaml::to_string(&self.state().inventory)
            .context("Failed to serialize simulated inventory")?;
        fs::write(path, rendered).with_context(|| format!("Failed to write '{}'", path.display()))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current inventory.
    pub fn inventory(&self) -> SimulatedInventory {
        self.state().inventory.clone()
    }

    /// Mutates the inventory in place.
    pub fn with_inventory<T>(&self, f: impl FnOnce(&mut SimulatedInventory) -> T) -> T {
        f(&mut self.state().inventory)
    }

    pub fn inject_fault(&self, operation: Operation, object: &str) {
        self.with_inventory(|inv| {
            inv.behaviors.faults.push(OperationRule {
                operation,
                object: object.into(),
            })
        });
    }

    pub fn stall(&self, operation: Operation, object: &str) {
        self.with_inventory(|inv| {
            inv.behaviors.stalls.push(OperationRule {
                operation,
                object: object.into(),
            })
        });
    }

    /// Operations invoked so far, as `"<operation>:<object name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_of(&self, operation: Operation) -> Vec<String> {
        let prefix = format!("{operation}:");
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }

    /// Number of task filters not yet destroyed.
    pub fn open_filters(&self) -> usize {
        self.state().filters.len()
    }

    pub fn filters_created(&self) -> usize {
        self.state().filters_created
    }

    pub fn guest_file(&self, vm: &str, path: &str) -> Option<Vec<u8>> {
        self.state()
            .guest_files
            .get(&(vm.to_owned(), path.to_owned()))
            .cloned()
    }

    pub fn programs(&self) -> Vec<(ObjectId, ProgramSpec)> {
        self.state().programs.clone()
    }

    pub fn vm_by_name(&self, name: &str) -> Option<VirtualMachine> {
        self.state()
            .inventory
            .vms
            .iter()
            .find(|vm| vm.name == name)
            .cloned()
    }

    pub fn switch_by_name(&self, name: &str) -> Option<DistributedSwitch> {
        self.state()
            .inventory
            .switches
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    pub fn port_group_by_name(&self, name: &str) -> Option<PortGroup> {
        self.state()
            .inventory
            .port_groups
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Records the call and turns the outcome of `apply` into a task.
    fn submit(
        &self,
        operation: Operation,
        object: &str,
        apply: impl FnOnce(&mut SimulatedInventory) -> Applied,
    ) -> TaskHandle {
        let mut state = self.state();
        state.calls.push(format!("{operation}:{object}"));

        let behaviors = state.inventory.behaviors.clone();
        let outcome = if behaviors
            .faults
            .iter()
            .any(|r| r.matches(operation, object))
        {
            Err(fault("SystemError", "injected fault", object))
        } else {
            apply(&mut state.inventory)
        };
        let rounds_left = if behaviors.stalls.iter().any(|r| r.matches(operation, object)) {
            u32::MAX
        } else {
            behaviors.task_rounds
        };

        let handle = TaskHandle(format!("task-{}", next_id(&mut state.inventory)));
        let info = match outcome {
            Ok(result) => TaskInfo {
                handle: handle.clone(),
                state: TaskState::Success,
                result: Some(result),
                fault: None,
                entity_name: object.into(),
            },
            Err(fault) => TaskInfo {
                handle: handle.clone(),
                state: TaskState::Error,
                result: None,
                fault: Some(fault),
                entity_name: object.into(),
            },
        };
        debug!("Simulated {operation} on '{object}' as {handle}: {:?}", info.state);
        state
            .tasks
            .insert(handle.clone(), SimulatedTask { info, rounds_left });
        handle
    }

    /// Records a call that completes synchronously.
    fn call(&self, operation: Operation, object: &str) -> Result<MutexGuard<'_, State>, Error> {
        let mut state = self.state();
        state.calls.push(format!("{operation}:{object}"));
        if state
            .inventory
            .behaviors
            .faults
            .iter()
            .any(|r| r.matches(operation, object))
        {
            bail!("Injected fault in {operation} on '{object}'");
        }
        Ok(state)
    }

    fn vm_name(&self, id: &str) -> String {
        object_name(&self.state().inventory.vms, id, |vm| (&vm.id, &vm.name))
    }
}

fn fault(kind: &str, message: &str, object: &str) -> Fault {
    Fault {
        kind: kind.into(),
        message: message.into(),
        object: object.into(),
    }
}

fn next_id(inventory: &mut SimulatedInventory) -> u64 {
    inventory.next_id += 1;
    inventory.next_id
}

fn object_name<T>(items: &[T], id: &str, key: impl Fn(&T) -> (&String, &String)) -> String {
    items
        .iter()
        .map(&key)
        .find(|(item_id, _)| item_id.as_str() == id)
        .map_or_else(|| id.to_owned(), |(_, name)| name.clone())
}

fn not_found(object: &str) -> Fault {
    fault("ManagedObjectNotFound", "object does not exist", object)
}

/// Recomputes what the guest reports from the VM's power state and NIC wiring.
fn refresh_guest(vm: &mut VirtualMachine, inventory: &SimulatedInventory) {
    let behaviors = &inventory.behaviors;
    if vm.power_state != PowerState::PoweredOn || vm.template {
        vm.guest = Default::default();
        return;
    }

    vm.guest.tools_running = !behaviors.tools_never_ready.contains(&vm.name);
    let configured_network = vm.extra_config.get(GUESTINFO_NETWORK);
    let configured_ip = behaviors
        .guest_ip_overrides
        .get(&vm.name)
        .copied()
        .or_else(|| vm.extra_config.get(GUESTINFO_IP).and_then(|ip| ip.parse().ok()));

    vm.guest.nics = vm
        .nics
        .iter()
        .filter(|nic| nic.connected)
        .map(|nic| {
            let on_config_network = configured_network.is_some_and(|network| {
                inventory
                    .port_groups
                    .iter()
                    .any(|pg| pg.id == nic.port_group && &pg.name == network)
            });
            GuestNic {
                mac: nic.mac.clone(),
                ip_addresses: configured_ip
                    .filter(|_| on_config_network)
                    .map(IpAddr::V4)
                    .into_iter()
                    .collect(),
            }
        })
        .collect();
    vm.guest.ip_address = vm.guest.nics.iter().find_map(GuestNic::ipv4);
}

fn refresh_all_guests(inventory: &mut SimulatedInventory) {
    let mut vms = std::mem::take(&mut inventory.vms);
    for vm in vms.iter_mut() {
        refresh_guest(vm, inventory);
    }
    inventory.vms = vms;
}

impl Inventory for SimulatedPlatform {
    fn datacenter(&self, id: &str) -> Result<Option<Datacenter>, Error> {
        Ok(self
            .state()
            .inventory
            .datacenters
            .iter()
            .find(|dc| dc.id == id)
            .cloned())
    }

    fn cluster(&self, id: &str) -> Result<Option<Cluster>, Error> {
        Ok(self
            .state()
            .inventory
            .clusters
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    fn cluster_by_name(&self, datacenter: &str, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self
            .state()
            .inventory
            .clusters
            .iter()
            .find(|c| c.datacenter == datacenter && c.name == name)
            .cloned())
    }

    fn hosts(&self, cluster: &str) -> Result<Vec<Host>, Error> {
        Ok(self
            .state()
            .inventory
            .hosts
            .iter()
            .filter(|h| h.cluster == cluster)
            .cloned()
            .collect())
    }

    fn host(&self, id: &str) -> Result<Option<Host>, Error> {
        Ok(self
            .state()
            .inventory
            .hosts
            .iter()
            .find(|h| h.id == id)
            .cloned())
    }

    fn datastores(&self, ids: &[ObjectId]) -> Result<Vec<Datastore>, Error> {
        Ok(self
            .state()
            .inventory
            .datastores
            .iter()
            .filter(|ds| ids.contains(&ds.id))
            .cloned()
            .collect())
    }

    fn vms_in_folder(&self, folder: &str) -> Result<Vec<VirtualMachine>, Error> {
        Ok(self
            .state()
            .inventory
            .vms
            .iter()
            .filter(|vm| vm.folder == folder && !vm.template)
            .cloned()
            .collect())
    }

    fn vm(&self, id: &str) -> Result<Option<VirtualMachine>, Error> {
        Ok(self
            .state()
            .inventory
            .vms
            .iter()
            .find(|vm| vm.id == id)
            .cloned())
    }

    fn find_template(&self, _datacenter: &str, name: &str) -> Result<Option<VirtualMachine>, Error> {
        Ok(self
            .state()
            .inventory
            .vms
            .iter()
            .find(|vm| vm.template && vm.name == name)
            .cloned())
    }
}

impl NetworkOps for SimulatedPlatform {
    fn find_switch(&self, _datacenter: &str, name: &str) -> Result<Option<DistributedSwitch>, Error> {
        Ok(self.switch_by_name(name))
    }

    fn switch(&self, id: &str) -> Result<Option<DistributedSwitch>, Error> {
        Ok(self
            .state()
            .inventory
            .switches
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    fn create_switch(&self, _datacenter: &str, spec: &SwitchCreateSpec) -> Result<TaskHandle, Error> {
        Ok(self.submit(Operation::CreateSwitch, &spec.name, |inv| {
            if inv.switches.iter().any(|s| s.name == spec.name) {
                return Err(fault("DuplicateName", "switch already exists", &spec.name));
            }
            let id = format!("dvs-{}", next_id(inv));
            inv.switches.push(DistributedSwitch {
                id: id.clone(),
                name: spec.name.clone(),
                description: Some(spec.description.clone()),
                config_version: 1,
                mtu: spec.mtu,
                uplink_names: spec.uplink_names.clone(),
                hosts: Vec::new(),
                port_groups: Vec::new(),
            });
            Ok(TaskResult::Object(id))
        }))
    }

    fn reconfigure_switch(&self, id: &str, spec: &SwitchReconfigSpec) -> Result<TaskHandle, Error> {
        let name = object_name(&self.state().inventory.switches, id, |s| (&s.id, &s.name));
        Ok(self.submit(Operation::ReconfigureSwitch, &name, |inv| {
            let Some(index) = inv.switches.iter().position(|s| s.id == id) else {
                return Err(not_found(&name));
            };
            if inv.switches[index].config_version != spec.config_version {
                return Err(fault(
                    "ConcurrentModification",
                    "configuration version is stale",
                    &name,
                ));
            }

            for member in &spec.add_hosts {
                if inv.switches[index].has_host(&member.host) {
                    return Err(fault("AlreadyExists", "host is already a member", &name));
                }
                let Some(network) = inv.host_networks.get(&member.host) else {
                    continue;
                };
                if let Some(busy) = member
                    .uplinks
                    .iter()
                    .find(|b| network.is_busy(&b.pnic, &name))
                {
                    return Err(fault(
                        "ResourceInUse",
                        &format!("physical NIC {} is in use", busy.pnic),
                        &name,
                    ));
                }
            }

            for member in &spec.add_hosts {
                inv.host_networks
                    .entry(member.host.clone())
                    .or_default()
                    .proxy_switches
                    .insert(name.clone(), member.uplinks.clone());
            }

            for host in &spec.remove_hosts {
                if let Some(network) = inv.host_networks.get_mut(host) {
                    network.proxy_switches.remove(&name);
                }
            }

            let switch = &mut inv.switches[index];
            switch.hosts.retain(|m| !spec.remove_hosts.contains(&m.host));
            switch.hosts.extend(spec.add_hosts.iter().cloned());
            switch.config_version += 1;
            Ok(TaskResult::None)
        }))
    }

    fn destroy_switch(&self, id: &str) -> Result<TaskHandle, Error> {
        let name = object_name(&self.state().inventory.switches, id, |s| (&s.id, &s.name));
        Ok(self.submit(Operation::DestroySwitch, &name, |inv| {
            if !inv.switches.iter().any(|s| s.id == id) {
                return Err(not_found(&name));
            }
            if inv
                .port_groups
                .iter()
                .any(|pg| pg.switch == id && !pg.vms.is_empty())
            {
                return Err(fault("ResourceInUse", "switch has connected VMs", &name));
            }
            inv.port_groups.retain(|pg| pg.switch != id);
            inv.switches.retain(|s| s.id != id);
            for network in inv.host_networks.values_mut() {
                network.proxy_switches.remove(&name);
            }
            Ok(TaskResult::None)
        }))
    }

    fn find_port_group(&self, switch: &str, name: &str) -> Result<Option<PortGroup>, Error> {
        Ok(self
            .state()
            .inventory
            .port_groups
            .iter()
            .find(|pg| pg.switch == switch && pg.name == name)
            .cloned())
    }

    fn port_groups(&self, switch: &str) -> Result<Vec<PortGroup>, Error> {
        Ok(self
            .state()
            .inventory
            .port_groups
            .iter()
            .filter(|pg| pg.switch == switch)
            .cloned()
            .collect())
    }

    fn find_network(&self, _datacenter: &str, name: &str) -> Result<Option<PortGroup>, Error> {
        Ok(self.port_group_by_name(name))
    }

    fn create_port_group(
        &self,
        switch: &str,
        spec: &PortGroupCreateSpec,
    ) -> Result<TaskHandle, Error> {
        Ok(self.submit(Operation::CreatePortGroup, &spec.name, |inv| {
            let Some(index) = inv.switches.iter().position(|s| s.id == switch) else {
                return Err(not_found(switch));
            };
            if inv.port_groups.iter().any(|pg| pg.name == spec.name) {
                return Err(fault(
                    "DuplicateName",
                    "port group already exists",
                    &spec.name,
                ));
            }
            let id = format!("dvportgroup-{}", next_id(inv));
            inv.port_groups.push(PortGroup {
                id: id.clone(),
                name: spec.name.clone(),
                switch: switch.into(),
                description: Some(spec.description.clone()),
                config_version: 1,
                auto_expand: spec.auto_expand,
                binding: spec.binding,
                policy: PortGroupPolicy::default(),
                vms: Vec::new(),
            });
            inv.switches[index].port_groups.push(id.clone());
            Ok(TaskResult::Object(id))
        }))
    }

    fn reconfigure_port_group(
        &self,
        id: &str,
        spec: &PortGroupReconfigSpec,
    ) -> Result<TaskHandle, Error> {
        let name = object_name(&self.state().inventory.port_groups, id, |p| (&p.id, &p.name));
        Ok(self.submit(Operation::ReconfigurePortGroup, &name, |inv| {
            let Some(pg) = inv.port_groups.iter_mut().find(|pg| pg.id == id) else {
                return Err(not_found(&name));
            };
            if pg.config_version != spec.config_version {
                return Err(fault(
                    "ConcurrentModification",
                    "configuration version is stale",
                    &name,
                ));
            }
            pg.policy = spec.policy.clone();
            pg.config_version += 1;
            Ok(TaskResult::None)
        }))
    }

    fn destroy_port_group(&self, id: &str) -> Result<TaskHandle, Error> {
        let name = object_name(&self.state().inventory.port_groups, id, |p| (&p.id, &p.name));
        Ok(self.submit(Operation::DestroyPortGroup, &name, |inv| {
            let Some(pg) = inv.port_groups.iter().find(|pg| pg.id == id) else {
                return Err(not_found(&name));
            };
            if !pg.vms.is_empty() {
                return Err(fault("ResourceInUse", "port group has connected VMs", &name));
            }
            inv.port_groups.retain(|pg| pg.id != id);
            for switch in inv.switches.iter_mut() {
                switch.port_groups.retain(|p| p != id);
            }
            Ok(TaskResult::None)
        }))
    }

    fn host_network(&self, host: &str) -> Result<HostNetworkInfo, Error> {
        let state = self.state();
        if !state.inventory.hosts.iter().any(|h| h.id == host) {
            bail!("Host '{host}' does not exist");
        }
        Ok(state
            .inventory
            .host_networks
            .get(host)
            .cloned()
            .unwrap_or_default())
    }
}

impl VmOps for SimulatedPlatform {
    fn clone_vm(&self, template: &str, spec: &CloneSpec) -> Result<TaskHandle, Error> {
        Ok(self.submit(Operation::CloneVm, &spec.name, |inv| {
            if !inv.vms.iter().any(|vm| vm.id == template && vm.template) {
                return Err(not_found(template));
            }
            if inv.vms.iter().any(|vm| vm.name == spec.name) {
                return Err(fault("DuplicateName", "VM already exists", &spec.name));
            }
            if !inv.hosts.iter().any(|h| h.id == spec.host && h.is_active()) {
                return Err(fault("InvalidState", "host cannot run VMs", &spec.name));
            }

            let id = format!("vm-{}", next_id(inv));
            let mut nics = Vec::new();
            for device in &spec.nics {
                let n = next_id(inv);
                nics.push(VmNic {
                    label: device.label.clone(),
                    mac: format!(
                        "00:50:56:{:02x}:{:02x}:{:02x}",
                        (n >> 16) & 0xff,
                        (n >> 8) & 0xff,
                        n & 0xff
                    ),
                    port_group: device.port_group.clone(),
                    connected: device.start_connected,
                });
                if let Some(pg) = inv
                    .port_groups
                    .iter_mut()
                    .find(|pg| pg.id == device.port_group)
                {
                    pg.vms.push(id.clone());
                }
            }

            let mut vm = VirtualMachine {
                id: id.clone(),
                name: spec.name.clone(),
                host: spec.host.clone(),
                folder: spec.folder.clone(),
                annotation: Some(spec.annotation.clone()),
                power_state: if spec.power_on {
                    PowerState::PoweredOn
                } else {
                    PowerState::PoweredOff
                },
                template: false,
                nics,
                guest: Default::default(),
                extra_config: spec.extra_config.clone(),
            };
            refresh_guest(&mut vm, inv);
            inv.vms.push(vm);
            Ok(TaskResult::Object(id))
        }))
    }

    fn reconfigure_vm(&self, id: &str, spec: &VmReconfigSpec) -> Result<TaskHandle, Error> {
        let name = self.vm_name(id);
        Ok(self.submit(Operation::ReconfigureVm, &name, |inv| {
            let Some(vm) = inv.vms.iter_mut().find(|vm| vm.id == id) else {
                return Err(not_found(&name));
            };
            for nic in vm.nics.iter_mut() {
                if spec.connect_nics.contains(&nic.label) {
                    nic.connected = true;
                }
            }
            refresh_all_guests(inv);
            Ok(TaskResult::None)
        }))
    }

    fn shutdown_guest(&self, id: &str) -> Result<(), Error> {
        let name = self.vm_name(id);
        let mut state = self.call(Operation::ShutdownGuest, &name)?;
        let ignore = state.inventory.behaviors.ignore_shutdown.contains(&name);
        let Some(vm) = state.inventory.vms.iter_mut().find(|vm| vm.id == id) else {
            bail!("VM '{name}' does not exist");
        };
        if !vm.guest.tools_running {
            bail!("Guest tools are not running in '{name}'");
        }
        if !ignore {
            vm.power_state = PowerState::PoweredOff;
            vm.guest = Default::default();
        }
        Ok(())
    }

    fn power_off_vm(&self, id: &str) -> Result<TaskHandle, Error> {
        let name = self.vm_name(id);
        Ok(self.submit(Operation::PowerOff, &name, |inv| {
            let Some(vm) = inv.vms.iter_mut().find(|vm| vm.id == id) else {
                return Err(not_found(&name));
            };
            if vm.power_state == PowerState::PoweredOff {
                return Err(fault("InvalidPowerState", "VM is already off", &name));
            }
            vm.power_state = PowerState::PoweredOff;
            vm.guest = Default::default();
            Ok(TaskResult::None)
        }))
    }

    fn destroy_vm(&self, id: &str) -> Result<TaskHandle, Error> {
        let name = self.vm_name(id);
        Ok(self.submit(Operation::DestroyVm, &name, |inv| {
            let Some(vm) = inv.vms.iter().find(|vm| vm.id == id) else {
                return Err(not_found(&name));
            };
            if vm.power_state == PowerState::PoweredOn {
                return Err(fault("InvalidPowerState", "VM is powered on", &name));
            }
            inv.vms.retain(|vm| vm.id != id);
            for pg in inv.port_groups.iter_mut() {
                pg.vms.retain(|vm| vm != id);
            }
            Ok(TaskResult::None)
        }))
    }

    fn import_template(
        &self,
        _datacenter: &str,
        spec: &TemplateImportSpec,
    ) -> Result<TaskHandle, Error> {
        Ok(self.submit(Operation::ImportTemplate, &spec.name, |inv| {
            if inv.vms.iter().any(|vm| vm.name == spec.name) {
                return Err(fault("DuplicateName", "VM already exists", &spec.name));
            }
            let id = format!("vm-{}", next_id(inv));
            inv.vms.push(VirtualMachine {
                id: id.clone(),
                name: spec.name.clone(),
                host: spec.host.clone(),
                folder: spec.folder.clone(),
                annotation: Some(format!("imported from {}", spec.location)),
                power_state: PowerState::PoweredOff,
                template: true,
                nics: Vec::new(),
                guest: Default::default(),
                extra_config: BTreeMap::new(),
            });
            Ok(TaskResult::Object(id))
        }))
    }
}

impl ClusterOps for SimulatedPlatform {
    fn affinity_rules(&self, cluster: &str) -> Result<Vec<AffinityRule>, Error> {
        Ok(self
            .state()
            .inventory
            .affinity_rules
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }

    fn reconfigure_cluster(
        &self,
        cluster: &str,
        spec: &ClusterReconfigSpec,
    ) -> Result<TaskHandle, Error> {
        let name = object_name(&self.state().inventory.clusters, cluster, |c| (&c.id, &c.name));
        Ok(self.submit(Operation::ReconfigureCluster, &name, |inv| {
            if !inv.clusters.iter().any(|c| c.id == cluster) {
                return Err(not_found(&name));
            }
            let overrides = inv.vm_overrides.entry(cluster.into()).or_default();
            for o in &spec.vm_overrides {
                overrides.retain(|existing| existing.vm != o.vm);
                overrides.push(o.clone());
            }
            let rules = inv.affinity_rules.entry(cluster.into()).or_default();
            rules.retain(|r| !spec.remove_rules.contains(&r.name));
            for rule in &spec.add_rules {
                rules.retain(|r| r.name != rule.name);
                rules.push(rule.clone());
            }
            Ok(TaskResult::None)
        }))
    }

    fn move_host(&self, host: &str, cluster: &str) -> Result<TaskHandle, Error> {
        let name = object_name(&self.state().inventory.hosts, host, |h| (&h.id, &h.name));
        Ok(self.submit(Operation::MoveHost, &name, |inv| {
            if !inv.clusters.iter().any(|c| c.id == cluster) {
                return Err(not_found(cluster));
            }
            let Some(h) = inv.hosts.iter_mut().find(|h| h.id == host) else {
                return Err(not_found(&name));
            };
            if !h.in_maintenance_mode {
                return Err(fault(
                    "InvalidState",
                    "host must be in maintenance mode",
                    &name,
                ));
            }
            h.cluster = cluster.into();
            for c in inv.clusters.iter_mut() {
                c.hosts.retain(|id| id != host);
                if c.id == cluster {
                    c.hosts.push(host.into());
                }
            }
            Ok(TaskResult::None)
        }))
    }

    fn enter_maintenance_mode(&self, host: &str) -> Result<TaskHandle, Error> {
        let name = object_name(&self.state().inventory.hosts, host, |h| (&h.id, &h.name));
        Ok(self.submit(Operation::EnterMaintenanceMode, &name, |inv| {
            let running = inv
                .vms
                .iter()
                .any(|vm| vm.host == host && vm.power_state == PowerState::PoweredOn);
            let Some(h) = inv.hosts.iter_mut().find(|h| h.id == host) else {
                return Err(not_found(&name));
            };
            if running {
                return Err(fault("InvalidState", "host has running VMs", &name));
            }
            h.in_maintenance_mode = true;
            Ok(TaskResult::None)
        }))
    }

    fn exit_maintenance_mode(&self, host: &str) -> Result<TaskHandle, Error> {
        let name = object_name(&self.state().inventory.hosts, host, |h| (&h.id, &h.name));
        Ok(self.submit(Operation::ExitMaintenanceMode, &name, |inv| {
            let Some(h) = inv.hosts.iter_mut().find(|h| h.id == host) else {
                return Err(not_found(&name));
            };
            h.in_maintenance_mode = false;
            Ok(TaskResult::None)
        }))
    }
}

impl GuestOps for SimulatedPlatform {
    fn upload_file(
        &self,
        vm: &str,
        username: &str,
        _password: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), Error> {
        let name = self.vm_name(vm);
        let mut state = self.call(Operation::UploadFile, &name)?;
        let ready = state
            .inventory
            .vms
            .iter()
            .any(|v| v.id == vm && v.guest.tools_running);
        if !ready {
            bail!("Guest tools are not running in '{name}'");
        }
        trace!("Uploading {} bytes to {path} in '{name}' as {username}", contents.len());
        state
            .guest_files
            .insert((vm.to_owned(), path.to_owned()), contents.to_vec());
        Ok(())
    }

    fn start_program(
        &self,
        vm: &str,
        _username: &str,
        _password: &str,
        program: &ProgramSpec,
    ) -> Result<i64, Error> {
        let name = self.vm_name(vm);
        let mut state = self.call(Operation::StartProgram, &name)?;
        let ready = state
            .inventory
            .vms
            .iter()
            .any(|v| v.id == vm && v.guest.tools_running);
        if !ready {
            bail!("Guest tools are not running in '{name}'");
        }
        state.programs.push((vm.to_owned(), program.clone()));
        Ok(1000 + state.programs.len() as i64)
    }
}

impl TaskCollector for SimulatedPlatform {
    fn create_task_filter(&self, task: &TaskHandle) -> Result<PropertyFilter, Error> {
        let mut state = self.state();
        if !state.tasks.contains_key(task) {
            bail!("Task '{task}' does not exist");
        }
        state.filters_created += 1;
        let id = format!("filter-{}", next_id(&mut state.inventory));
        state.filters.insert(id.clone(), (task.clone(), 0));
        Ok(PropertyFilter(id))
    }

    fn wait_for_updates(
        &self,
        filter: &PropertyFilter,
        _version: Option<&str>,
    ) -> Result<UpdateSet, Error> {
        let mut state = self.state();
        if state.inventory.behaviors.broken_session {
            bail!("Session is no longer authenticated");
        }

        let Some((handle, version)) = state.filters.get_mut(&filter.0) else {
            bail!("Filter '{}' does not exist", filter.0);
        };
        *version += 1;
        let version = version.to_string();
        let handle = handle.clone();

        let Some(task) = state.tasks.get_mut(&handle) else {
            bail!("Task '{handle}' does not exist");
        };
        let info = if task.rounds_left > 0 {
            task.rounds_left = task.rounds_left.saturating_sub(1);
            TaskInfo {
                state: TaskState::Running,
                result: None,
                fault: None,
                ..task.info.clone()
            }
        } else {
            task.info.clone()
        };

        Ok(UpdateSet {
            version,
            tasks: vec![info],
        })
    }

    fn destroy_filter(&self, filter: &PropertyFilter) -> Result<(), Error> {
        if self.state().filters.remove(&filter.0).is_none() {
            bail!("Filter '{}' does not exist", filter.0);
        }
        Ok(())
    }
}

/// Hands out the same simulated platform for every endpoint.
pub struct SimulatedConnector {
    platform: std::sync::Arc<SimulatedPlatform>,
}

impl SimulatedConnector {
    pub fn new(platform: std::sync::Arc<SimulatedPlatform>) -> Self {
        Self { platform }
    }
}

impl Connector for SimulatedConnector {
    fn connect(
        &self,
        endpoint: &PlatformEndpoint,
    ) -> Result<std::sync::Arc<dyn PlatformClient>, Error> {
        if endpoint.username.is_empty() {
            bail!("No username given for '{}'", endpoint.address());
        }
        debug!("Connected to simulated platform as '{}'", endpoint.username);
        Ok(self.platform.clone())
    }
}

/// Inventories used across the crate's tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    use crate::platform::ConnectionState;

    pub(crate) const GIB: u64 = 1024 * 1024 * 1024;

    /// Datacenter `datacenter-1` with cluster `domain-c7` ("Compute") holding `hosts` connected
    /// hosts named `esxN.example.com`, a shared datastore, one local datastore per host and the
    /// appliance template.
    pub(crate) fn cluster(hosts: usize) -> SimulatedInventory {
        let mut inventory = SimulatedInventory {
            datacenters: vec![Datacenter {
                id: "datacenter-1".into(),
                name: "DC1".into(),
                vm_folder: "group-v1".into(),
                network_folder: "group-n1".into(),
            }],
            clusters: vec![
                Cluster {
                    id: "domain-c7".into(),
                    name: "Compute".into(),
                    datacenter: "datacenter-1".into(),
                    resource_pool: "resgroup-8".into(),
                    vm_folder: "group-v1".into(),
                    hosts: Vec::new(),
                },
                Cluster {
                    id: "domain-c9".into(),
                    name: "Staging".into(),
                    datacenter: "datacenter-1".into(),
                    resource_pool: "resgroup-10".into(),
                    vm_folder: "group-v1".into(),
                    hosts: Vec::new(),
                },
            ],
            datastores: vec![Datastore {
                id: "datastore-shared".into(),
                name: "shared".into(),
                accessible: true,
                multiple_host_access: true,
                capacity: 2048 * GIB,
                free_space: 1024 * GIB,
                hosts: Vec::new(),
            }],
            vms: vec![VirtualMachine {
                id: "vm-template".into(),
                name: "appliance-template".into(),
                host: "host-1".into(),
                folder: "group-v1".into(),
                annotation: None,
                power_state: PowerState::PoweredOff,
                template: true,
                nics: Vec::new(),
                guest: Default::default(),
                extra_config: BTreeMap::new(),
            }],
            next_id: 100,
            ..Default::default()
        };

        for i in 1..=hosts {
            add_host(&mut inventory, i, "domain-c7");
        }
        inventory
    }

    /// Adds host `host-<i>` (`esx<i>.example.com`) to a cluster.
    pub(crate) fn add_host(inventory: &mut SimulatedInventory, i: usize, cluster: &str) {
        let id = format!("host-{i}");
        let local = format!("datastore-local-{i}");
        inventory.hosts.push(Host {
            id: id.clone(),
            name: format!("esx{i}.example.com"),
            cluster: cluster.into(),
            connection_state: ConnectionState::Connected,
            in_maintenance_mode: false,
            datastores: vec!["datastore-shared".into(), local.clone()],
        });
        inventory.datastores.push(Datastore {
            id: local,
            name: format!("local-{i}"),
            accessible: true,
            multiple_host_access: false,
            capacity: 100 * GIB,
            free_space: 60 * GIB,
            hosts: vec![id.clone()],
        });
        if let Some(shared) = inventory
            .datastores
            .iter_mut()
            .find(|ds| ds.id == "datastore-shared")
        {
            shared.hosts.push(id.clone());
        }
        if let Some(c) = inventory.clusters.iter_mut().find(|c| c.id == cluster) {
            c.hosts.push(id.clone());
        }
        inventory.host_networks.insert(
            id,
            HostNetworkInfo {
                physical_nics: vec![
                    "vmnic0".into(),
                    "vmnic1".into(),
                    "vmnic2".into(),
                    "vmnic3".into(),
                ],
                vswitches: BTreeMap::from([("vSwitch0".to_owned(), vec!["vmnic0".to_owned()])]),
                proxy_switches: BTreeMap::new(),
            },
        );
    }
}
