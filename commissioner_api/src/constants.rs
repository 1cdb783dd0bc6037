use const_format::formatcp;

// Agent constants

/// Path to load the agent config from.
pub const AGENT_CONFIG_PATH: &str = "/etc/commissioner/config.yaml";

/// Default location of the persisted IP catalog.
pub const IP_CATALOG_PATH_DEFAULT: &str = "/var/lib/commissioner/ip-catalog.sqlite";

/// Directory holding the commissioner's own log files.
pub const LOG_DIRECTORY: &str = "/var/log/commissioner";

/// Background log written for every mutating command.
pub const BACKGROUND_LOG_PATH: &str = formatcp!("{LOG_DIRECTORY}/background.log");

// Appliance constants

/// Prefix of the annotation placed on every object this system creates.
pub const OWNERSHIP_MARKER_PREFIX: &str = "commissioner-managed";

/// Ownership marker of network appliance VMs.
pub const NETWORK_APPLIANCE_MARKER: &str = formatcp!("{OWNERSHIP_MARKER_PREFIX}:network-appliance");

/// Ownership marker of compute proxy VMs.
pub const COMPUTE_PROXY_MARKER: &str = formatcp!("{OWNERSHIP_MARKER_PREFIX}:compute-proxy");

/// Description stamped on switches and port groups created by this system.
pub const TOPOLOGY_MARKER: &str = formatcp!("{OWNERSHIP_MARKER_PREFIX}:topology");

/// Suffix of the VM-host affinity rule pinning an appliance to its host.
pub const AFFINITY_RULE_SUFFIX: &str = "affinity";

// Network constants

/// MTU used for switches that do not specify one.
pub const DEFAULT_MTU: u32 = 1500;

/// Highest VLAN ID accepted in any VLAN specification.
pub const MAX_VLAN_ID: u16 = 4094;

/// Full trunk range forced on port groups of switches without physical NICs.
pub const FULL_TRUNK_RANGE: &str = formatcp!("1-{MAX_VLAN_ID}");

/// Uplink port name used when a switch is created without physical NICs.
pub const GENERIC_UPLINK_NAME: &str = "uplink";

/// Default switch type.
pub const DEFAULT_SWITCH_TYPE: &str = "distributed";

/// Default platform API port.
pub const DEFAULT_PLATFORM_PORT: u16 = 443;

/// Minimum free space of a local datastore used when a cluster has a single active host.
pub const MIN_LOCAL_DATASTORE_FREE_BYTES: u64 = 40 * 1024 * 1024 * 1024;

/// Path the SSH public key is pushed to inside the guest.
pub const GUEST_AUTHORIZED_KEYS_PATH: &str = "/home/stack/.ssh/authorized_keys";

/// Path the customization script is pushed to inside the guest.
pub const GUEST_CUSTOMIZATION_SCRIPT_PATH: &str = "/tmp/commissioner-customize.sh";

/// Interpreter used for the customization script when none is given.
pub const DEFAULT_SCRIPT_INTERPRETER: &str = "/bin/bash";
