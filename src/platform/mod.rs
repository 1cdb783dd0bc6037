//! Seam to the virtualization platform.
//!
//! Everything the engine needs from the platform is expressed as a handful of traits returning
//! typed records. Records are mapped from the platform's loosely typed property sets right after
//! retrieval, so the engine never deals with string-keyed property maps.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use anyhow::Error;
use serde::{Deserialize, Serialize};
use url::Url;

use commissioner_api::{
    config::{FailoverDetection, LoadBalancing, NicDeviceType, PlatformEndpoint, SecurityPolicy},
    status::PowerState,
    ObjectId,
};

pub mod simulator;

/// Guest variable carrying the static address the appliance configures on first boot.
pub const GUESTINFO_IP: &str = "guestinfo.commissioner.ip";
/// Guest variable naming the port group the static address belongs to.
pub const GUESTINFO_NETWORK: &str = "guestinfo.commissioner.network";
pub const GUESTINFO_NETMASK: &str = "guestinfo.commissioner.netmask";
pub const GUESTINFO_GATEWAY: &str = "guestinfo.commissioner.gateway";

/// Handle of an asynchronous platform operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

impl Display for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Datacenter {
    pub id: ObjectId,
    pub name: String,
    pub vm_folder: ObjectId,
    pub network_folder: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub id: ObjectId,
    pub name: String,
    pub datacenter: ObjectId,
    pub resource_pool: ObjectId,
    pub vm_folder: ObjectId,
    #[serde(default)]
    pub hosts: Vec<ObjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    NotResponding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Host {
    pub id: ObjectId,
    pub name: String,
    pub cluster: ObjectId,
    pub connection_state: ConnectionState,
    #[serde(default)]
    pub in_maintenance_mode: bool,
    #[serde(default)]
    pub datastores: Vec<ObjectId>,
}

impl Host {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Connected and able to run VMs.
    pub fn is_active(&self) -> bool {
        self.is_connected() && !self.in_maintenance_mode
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Datastore {
    pub id: ObjectId,
    pub name: String,
    pub accessible: bool,
    pub multiple_host_access: bool,
    pub capacity: u64,
    pub free_space: u64,
    /// Hosts the datastore is mounted on.
    #[serde(default)]
    pub hosts: Vec<ObjectId>,
}

/// A virtual NIC as seen in the VM's hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmNic {
    pub label: String,
    pub mac: String,
    pub port_group: ObjectId,
    pub connected: bool,
}

/// A NIC as reported by the guest tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestNic {
    pub mac: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
}

impl GuestNic {
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ip_addresses.iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestInfo {
    #[serde(default)]
    pub tools_running: bool,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub nics: Vec<GuestNic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualMachine {
    pub id: ObjectId,
    pub name: String,
    pub host: ObjectId,
    pub folder: ObjectId,
    #[serde(default)]
    pub annotation: Option<String>,
    pub power_state: PowerState,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub nics: Vec<VmNic>,
    #[serde(default)]
    pub guest: GuestInfo,
    #[serde(default)]
    pub extra_config: BTreeMap<String, String>,
}

impl VirtualMachine {
    /// IPv4 address the guest reports on the NIC attached to the given port group.
    pub fn guest_ip_on(&self, port_group: &str) -> Option<Ipv4Addr> {
        let mac = self.mac_on(port_group)?;
        self.guest
            .nics
            .iter()
            .find(|n| n.mac.eq_ignore_ascii_case(mac))
            .and_then(GuestNic::ipv4)
    }

    /// MAC address of the virtual NIC attached to the given port group.
    pub fn mac_on(&self, port_group: &str) -> Option<&str> {
        self.nics
            .iter()
            .find(|n| n.port_group == port_group)
            .map(|n| n.mac.as_str())
    }
}

/// Physical NIC bound to an uplink port of a distributed switch on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UplinkBinding {
    pub uplink: String,
    pub pnic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SwitchHostMember {
    pub host: ObjectId,
    #[serde(default)]
    pub uplinks: Vec<UplinkBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DistributedSwitch {
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Optimistic concurrency token; every reconfiguration must carry the current value.
    pub config_version: u64,
    pub mtu: u32,
    #[serde(default)]
    pub uplink_names: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<SwitchHostMember>,
    #[serde(default)]
    pub port_groups: Vec<ObjectId>,
}

impl DistributedSwitch {
    /// Number of physical NICs bound across all member hosts.
    pub fn attached_nic_count(&self) -> usize {
        self.hosts.iter().map(|h| h.uplinks.len()).sum()
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h.host == host)
    }

    /// Uplink a physical NIC is bound to on any member host.
    pub fn uplink_of(&self, pnic: &str) -> Option<&str> {
        self.hosts
            .iter()
            .flat_map(|h| h.uplinks.iter())
            .find(|b| b.pnic == pnic)
            .map(|b| b.uplink.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VlanPolicy {
    None,
    Single(u16),
    Trunk(Vec<(u16, u16)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TeamingPolicy {
    pub load_balancing: LoadBalancing,
    pub failover_detection: FailoverDetection,
    pub notify_switches: bool,
    #[serde(default)]
    pub active_uplinks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortGroupPolicy {
    pub vlan: VlanPolicy,
    pub security: SecurityPolicy,
    #[serde(default)]
    pub teaming: Option<TeamingPolicy>,
}

impl Default for PortGroupPolicy {
    fn default() -> Self {
        Self {
            vlan: VlanPolicy::None,
            security: SecurityPolicy::default(),
            teaming: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortBinding {
    Early,
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortGroup {
    pub id: ObjectId,
    pub name: String,
    pub switch: ObjectId,
    #[serde(default)]
    pub description: Option<String>,
    pub config_version: u64,
    pub auto_expand: bool,
    pub binding: PortBinding,
    #[serde(default)]
    pub policy: PortGroupPolicy,
    /// VMs with a NIC on this port group.
    #[serde(default)]
    pub vms: Vec<ObjectId>,
}

/// Physical NIC usage on one host, used to detect NICs already claimed by another switch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostNetworkInfo {
    #[serde(default)]
    pub physical_nics: Vec<String>,
    /// Standard switches and the physical NICs they bind.
    #[serde(default)]
    pub vswitches: BTreeMap<String, Vec<String>>,
    /// Distributed switch proxies (keyed by switch name) and their uplink bindings.
    #[serde(default)]
    pub proxy_switches: BTreeMap<String, Vec<UplinkBinding>>,
}

impl HostNetworkInfo {
    /// Returns true if the NIC is bound by any standard switch or by a distributed switch other
    /// than `except_switch`.
    pub fn is_busy(&self, pnic: &str, except_switch: &str) -> bool {
        self.vswitches
            .values()
            .any(|nics| nics.iter().any(|n| n == pnic))
            || self
                .proxy_switches
                .iter()
                .filter(|(name, _)| name.as_str() != except_switch)
                .any(|(_, bindings)| bindings.iter().any(|b| b.pnic == pnic))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SwitchCreateSpec {
    pub name: String,
    pub description: String,
    pub mtu: u32,
    pub uplink_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SwitchReconfigSpec {
    pub config_version: u64,
    #[serde(default)]
    pub add_hosts: Vec<SwitchHostMember>,
    #[serde(default)]
    pub remove_hosts: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortGroupCreateSpec {
    pub name: String,
    pub description: String,
    pub auto_expand: bool,
    pub binding: PortBinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortGroupReconfigSpec {
    pub config_version: u64,
    pub policy: PortGroupPolicy,
}

/// A NIC to create on a cloned VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NicDevice {
    pub label: String,
    pub device_type: NicDeviceType,
    pub switch: ObjectId,
    pub port_group: ObjectId,
    pub start_connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CloneSpec {
    pub name: String,
    pub folder: ObjectId,
    pub host: ObjectId,
    pub datastore: ObjectId,
    pub resource_pool: ObjectId,
    pub power_on: bool,
    pub annotation: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub nics: Vec<NicDevice>,
    #[serde(default)]
    pub extra_config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmReconfigSpec {
    /// Labels of NICs to connect.
    pub connect_nics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TemplateImportSpec {
    pub name: String,
    pub location: Url,
    pub folder: ObjectId,
    pub host: ObjectId,
    pub datastore: ObjectId,
    pub resource_pool: ObjectId,
}

/// Mandatory or preferred VM-host affinity rule on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AffinityRule {
    pub name: String,
    pub vm: ObjectId,
    pub host: ObjectId,
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmOverride {
    pub vm: ObjectId,
    pub ha_restart_disabled: bool,
    pub drs_manual: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterReconfigSpec {
    #[serde(default)]
    pub vm_overrides: Vec<VmOverride>,
    #[serde(default)]
    pub add_rules: Vec<AffinityRule>,
    #[serde(default)]
    pub remove_rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProgramSpec {
    pub path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskResult {
    None,
    Object(ObjectId),
}

/// Failure reported by the platform for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Fault {
    pub kind: String,
    pub message: String,
    /// Name of the object the task operated on.
    pub object: String,
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} on '{}': {}", self.kind, self.object, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskInfo {
    pub handle: TaskHandle,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub fault: Option<Fault>,
    pub entity_name: String,
}

/// Subscription on the state of one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyFilter(pub String);

/// Changes observed by a filter since the version handed to `wait_for_updates`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSet {
    pub version: String,
    pub tasks: Vec<TaskInfo>,
}

pub trait Inventory {
    fn datacenter(&self, id: &str) -> Result<Option<Datacenter>, Error>;

    fn cluster(&self, id: &str) -> Result<Option<Cluster>, Error>;

    fn cluster_by_name(&self, datacenter: &str, name: &str) -> Result<Option<Cluster>, Error>;

    fn hosts(&self, cluster: &str) -> Result<Vec<Host>, Error>;

    fn host(&self, id: &str) -> Result<Option<Host>, Error>;

    fn datastores(&self, ids: &[ObjectId]) -> Result<Vec<Datastore>, Error>;

    fn vms_in_folder(&self, folder: &str) -> Result<Vec<VirtualMachine>, Error>;

    fn vm(&self, id: &str) -> Result<Option<VirtualMachine>, Error>;

    fn find_template(&self, datacenter: &str, name: &str) -> Result<Option<VirtualMachine>, Error>;
}

pub trait NetworkOps {
    fn find_switch(&self, datacenter: &str, name: &str) -> Result<Option<DistributedSwitch>, Error>;

    fn switch(&self, id: &str) -> Result<Option<DistributedSwitch>, Error>;

    fn create_switch(&self, datacenter: &str, spec: &SwitchCreateSpec) -> Result<TaskHandle, Error>;

    fn reconfigure_switch(&self, id: &str, spec: &SwitchReconfigSpec) -> Result<TaskHandle, Error>;

    fn destroy_switch(&self, id: &str) -> Result<TaskHandle, Error>;

    fn find_port_group(&self, switch: &str, name: &str) -> Result<Option<PortGroup>, Error>;

    fn port_groups(&self, switch: &str) -> Result<Vec<PortGroup>, Error>;

    /// Looks a port group up by name across every switch of the datacenter.
    fn find_network(&self, datacenter: &str, name: &str) -> Result<Option<PortGroup>, Error>;

    fn create_port_group(
        &self,
        switch: &str,
        spec: &PortGroupCreateSpec,
    ) -> Result<TaskHandle, Error>;

    fn reconfigure_port_group(
        &self,
        id: &str,
        spec: &PortGroupReconfigSpec,
    ) -> Result<TaskHandle, Error>;

    fn destroy_port_group(&self, id: &str) -> Result<TaskHandle, Error>;

    fn host_network(&self, host: &str) -> Result<HostNetworkInfo, Error>;
}

pub trait VmOps {
    fn clone_vm(&self, template: &str, spec: &CloneSpec) -> Result<TaskHandle, Error>;

    fn reconfigure_vm(&self, id: &str, spec: &VmReconfigSpec) -> Result<TaskHandle, Error>;

    /// Asks the guest OS to shut down. Returns once the request is delivered.
    fn shutdown_guest(&self, id: &str) -> Result<(), Error>;

    fn power_off_vm(&self, id: &str) -> Result<TaskHandle, Error>;

    fn destroy_vm(&self, id: &str) -> Result<TaskHandle, Error>;

    fn import_template(
        &self,
        datacenter: &str,
        spec: &TemplateImportSpec,
    ) -> Result<TaskHandle, Error>;
}

pub trait ClusterOps {
    fn affinity_rules(&self, cluster: &str) -> Result<Vec<AffinityRule>, Error>;

    fn reconfigure_cluster(
        &self,
        cluster: &str,
        spec: &ClusterReconfigSpec,
    ) -> Result<TaskHandle, Error>;

    fn move_host(&self, host: &str, cluster: &str) -> Result<TaskHandle, Error>;

    fn enter_maintenance_mode(&self, host: &str) -> Result<TaskHandle, Error>;

    fn exit_maintenance_mode(&self, host: &str) -> Result<TaskHandle, Error>;
}

pub trait GuestOps {
    fn upload_file(
        &self,
        vm: &str,
        username: &str,
        password: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), Error>;

    /// Starts a program inside the guest and returns its process ID.
    fn start_program(
        &self,
        vm: &str,
        username: &str,
        password: &str,
        program: &ProgramSpec,
    ) -> Result<i64, Error>;
}

/// Change-notification primitive for task state.
pub trait TaskCollector {
    fn create_task_filter(&self, task: &TaskHandle) -> Result<PropertyFilter, Error>;

    /// Blocks until the filter observes changes newer than `version`, or the platform's own
    /// wait interval elapses (in which case the update set is empty).
    fn wait_for_updates(
        &self,
        filter: &PropertyFilter,
        version: Option<&str>,
    ) -> Result<UpdateSet, Error>;

    fn destroy_filter(&self, filter: &PropertyFilter) -> Result<(), Error>;
}

/// A connected session with the platform.
pub trait PlatformClient:
    Inventory + NetworkOps + VmOps + ClusterOps + GuestOps + TaskCollector + Send + Sync
{
}

impl<T> PlatformClient for T where
    T: Inventory + NetworkOps + VmOps + ClusterOps + GuestOps + TaskCollector + Send + Sync
{
}

/// Opens sessions with the platform.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &PlatformEndpoint) -> Result<Arc<dyn PlatformClient>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_nic_detection() {
        let info = HostNetworkInfo {
            physical_nics: vec!["vmnic0".into(), "vmnic1".into(), "vmnic2".into()],
            vswitches: BTreeMap::from([("vSwitch0".to_owned(), vec!["vmnic0".to_owned()])]),
            proxy_switches: BTreeMap::from([(
                "MGMT-DVS".to_owned(),
                vec![UplinkBinding {
                    uplink: "uplink0".into(),
                    pnic: "vmnic1".into(),
                }],
            )]),
        };

        assert!(info.is_busy("vmnic0", "MGMT-DVS"));
        assert!(!info.is_busy("vmnic1", "MGMT-DVS"));
        assert!(info.is_busy("vmnic1", "DATA-DVS"));
        assert!(!info.is_busy("vmnic2", "DATA-DVS"));
    }

    #[test]
    fn test_guest_ip_on() {
        let vm = VirtualMachine {
            id: "vm-1".into(),
            name: "appliance".into(),
            host: "host-1".into(),
            folder: "group-v1".into(),
            annotation: None,
            power_state: PowerState::PoweredOn,
            template: false,
            nics: vec![VmNic {
                label: "Network adapter 1".into(),
                mac: "00:50:56:aa:bb:cc".into(),
                port_group: "dvportgroup-1".into(),
                connected: true,
            }],
            guest: GuestInfo {
                tools_running: true,
                ip_address: None,
                nics: vec![GuestNic {
                    mac: "00:50:56:AA:BB:CC".into(),
                    ip_addresses: vec![
                        "fe80::1".parse().unwrap(),
                        "10.0.0.2".parse().unwrap(),
                    ],
                }],
            },
            extra_config: BTreeMap::new(),
        };

        assert_eq!(
            vm.guest_ip_on("dvportgroup-1"),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
        assert_eq!(vm.guest_ip_on("dvportgroup-2"), None);
    }
}
