//! Validation errors for the driver input document.

use serde::{Deserialize, Serialize};

/// Identifies errors detected during static validation of the input document, i.e. errors that
/// can be detected before anything is changed on the platform.
#[derive(thiserror::Error, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationError {
    #[error("Failed to load input document from '{path}'")]
    LoadInput { path: String },

    #[error("Failed to parse input document")]
    ParseInput,

    #[error("Active NIC '{nic}' of port group '{port_group}' is not bound to switch '{switch}'")]
    ActiveNicNotOnSwitch {
        port_group: String,
        switch: String,
        nic: String,
    },

    #[error("Address '{address}' of '{field}' is not inside '{cidr}'")]
    AddressOutsideCidr {
        field: String,
        address: String,
        cidr: String,
    },

    #[error("Switch '{switch}' lists physical NIC '{nic}' more than once")]
    DuplicatePhysicalNic { switch: String, nic: String },

    #[error("Port group '{port_group}' is defined more than once")]
    DuplicatePortGroup { port_group: String },

    #[error("Switch '{switch}' is defined more than once")]
    DuplicateSwitch { switch: String },

    #[error("Physical NIC '{nic}' is bound to both switch '{first}' and switch '{second}'")]
    PhysicalNicOnMultipleSwitches {
        nic: String,
        first: String,
        second: String,
    },

    #[error("Exactly one switch must have empty physical_nics, but {count} do")]
    TrunkSwitchCount { count: usize },

    #[error("CIDR '{cidr}' is invalid")]
    InvalidCidr { cidr: String },

    #[error("Port group '{port_group}' has invalid load balancing code {value}, must be 1 to 5")]
    InvalidLoadBalancing { port_group: String, value: u8 },

    #[error(
        "Port group '{port_group}' has invalid failover detection code {value}, must be 1 or 2"
    )]
    InvalidFailoverDetection { port_group: String, value: u8 },

    #[error("Port group '{port_group}' combines IP hash load balancing with beacon probing")]
    IpHashWithBeaconProbing { port_group: String },

    #[error("Switch '{switch}' has invalid MTU {mtu}")]
    InvalidMtu { switch: String, mtu: u32 },

    #[error("Port group '{port_group}' has invalid VLAN '{vlan}': {reason}")]
    InvalidVlan {
        port_group: String,
        vlan: String,
        reason: String,
    },

    #[error("Appliance must have exactly one NIC on config network port group '{port_group}', found {count}")]
    ConfigNetworkNicCount { port_group: String, count: usize },

    #[error("Range start '{start}' is after range end '{end}'")]
    RangeStartAfterEnd { start: String, end: String },

    #[error("Config network range [{start}, {end}] only contains the gateway")]
    EmptyAddressRange { start: String, end: String },

    #[error("At least one port group must carry a cloud_network_type")]
    MissingCloudNetworkType,

    #[error("Field '{field}' must not be empty")]
    EmptyField { field: String },

    #[error("Appliance NIC refers to unknown port group '{port_group}'")]
    UnknownPortGroup { port_group: String },

    #[error("Port group '{port_group}' refers to unknown switch '{switch}'")]
    UnknownSwitch { port_group: String, switch: String },

    #[error("Appliance has {count} PXE NICs, but at most one is allowed")]
    MultiplePxeNics { count: usize },
}
