use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use url::Url;

use crate::constants::{DEFAULT_PLATFORM_PORT, DEFAULT_SCRIPT_INTERPRETER};

mod error;
mod network;

pub use error::ValidationError;
pub use network::{
    CloudNetworkType, FailoverDetection, LoadBalancing, NetworkProperties, NicTeaming,
    PortGroupSpec, SecurityPolicy, SwitchSpec, VlanSpec, VlanType,
};

/// The document the resource-lifecycle manager hands to every driver operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DriverInput {
    /// Where and how to reach the virtualization platform.
    pub platform: PlatformEndpoint,

    pub datacenter: ObjectRef,

    pub cluster: ObjectRef,

    /// Hosts explicitly handed over for commissioning. When empty, every connected host of the
    /// cluster is considered.
    #[serde(default)]
    pub hosts: Vec<HostEntry>,

    #[serde(default)]
    pub network: NetworkProperties,

    pub appliance: ApplianceConfig,

    pub config_network: ConfigNetwork,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PlatformEndpoint {
    pub host: String,

    #[serde(default = "default_platform_port")]
    pub port: u16,

    pub username: String,

    pub password: String,
}

fn default_platform_port() -> u16 {
    DEFAULT_PLATFORM_PORT
}

impl PlatformEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for PlatformEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Reference to a platform object by both its ID and its display name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ObjectRef {
    pub id: String,
    pub name: String,
}

/// A host handed over for commissioning.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    pub id: String,

    /// Cluster the host was moved from, used to put it back when its commissioning fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_cluster: Option<String>,
}

/// The appliance VM to create on each host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApplianceConfig {
    /// VMs are named `<name_prefix>-<host name>`.
    pub name_prefix: String,

    pub template: TemplateInfo,

    #[serde(default = "default_cpus")]
    pub cpus: u32,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    pub nics: Vec<NicSpec>,

    pub guest: GuestCredentials,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customization: Option<Customization>,

    /// Pin the appliance to its host by disabling HA/DRS management and adding an affinity rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_ha_drs: Option<bool>,
}

fn default_cpus() -> u32 {
    2
}

fn default_memory_mb() -> u64 {
    4096
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TemplateInfo {
    pub name: String,

    /// Where the template image can be fetched from if the platform does not have it yet.
    pub location: Url,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NicDeviceType {
    #[default]
    Vmxnet3,
    E1000,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NicSpec {
    #[serde(alias = "portGroup")]
    pub port_group: String,

    #[serde(default, rename = "type")]
    pub device_type: NicDeviceType,

    /// The appliance boots and is identified over this NIC.
    #[serde(default)]
    pub pxe: bool,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Customization {
    /// Script content, pushed verbatim into the guest.
    pub script: String,

    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    #[serde(default)]
    pub arguments: Vec<String>,
}

fn default_interpreter() -> String {
    DEFAULT_SCRIPT_INTERPRETER.into()
}

/// The network appliances are configured over, and the pool their addresses come from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigNetwork {
    pub cidr: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ip: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ip: Option<Ipv4Addr>,

    pub gateway: Ipv4Addr,

    #[serde(alias = "portGroup")]
    pub port_group: String,
}

impl ConfigNetwork {
    pub fn network(&self) -> Result<Ipv4Network, ValidationError> {
        self.cidr
            .parse::<Ipv4Network>()
            .map_err(|_| ValidationError::InvalidCidr {
                cidr: self.cidr.clone(),
            })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let network = self.network()?;
        let check = |field: &str, address: Ipv4Addr| {
            if network.contains(address) {
                Ok(())
            } else {
                Err(ValidationError::AddressOutsideCidr {
                    field: field.into(),
                    address: address.to_string(),
                    cidr: self.cidr.clone(),
                })
            }
        };

        check("gateway", self.gateway)?;
        if let Some(start) = self.start_ip {
            check("start_ip", start)?;
        }
        if let Some(end) = self.end_ip {
            check("end_ip", end)?;
        }
        if let (Some(start), Some(end)) = (self.start_ip, self.end_ip) {
            if start > end {
                return Err(ValidationError::RangeStartAfterEnd {
                    start: start.to_string(),
                    end: end.to_string(),
                });
            }
            if start == end && start == self.gateway {
                return Err(ValidationError::EmptyAddressRange {
                    start: start.to_string(),
                    end: end.to_string(),
                });
            }
        }
        if self.port_group.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "config_network.port_group".into(),
            });
        }

        Ok(())
    }
}

impl ApplianceConfig {
    /// Returns the NIC attached to the config network.
    pub fn config_nic<'a>(&'a self, config_network: &ConfigNetwork) -> Option<&'a NicSpec> {
        self.nics
            .iter()
            .find(|n| n.port_group == config_network.port_group)
    }

    pub fn pxe_nic(&self) -> Option<&NicSpec> {
        self.nics.iter().find(|n| n.pxe)
    }

    pub fn validate(&self, config_network: &ConfigNetwork) -> Result<(), ValidationError> {
        if self.name_prefix.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "appliance.name_prefix".into(),
            });
        }
        if self.template.name.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "appliance.template.name".into(),
            });
        }

        let config_nics = self
            .nics
            .iter()
            .filter(|n| n.port_group == config_network.port_group)
            .count();
        if config_nics != 1 {
            return Err(ValidationError::ConfigNetworkNicCount {
                port_group: config_network.port_group.clone(),
                count: config_nics,
            });
        }

        let pxe_nics = self.nics.iter().filter(|n| n.pxe).count();
        if pxe_nics > 1 {
            return Err(ValidationError::MultiplePxeNics { count: pxe_nics });
        }

        Ok(())
    }
}

impl DriverInput {
    /// Validation shared by every driver: appliance definition and config network.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cluster.id.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "cluster.id".into(),
            });
        }
        self.config_network.validate()?;
        self.appliance.validate(&self.config_network)?;
        Ok(())
    }

    /// Full validation for drivers that manage the network topology: everything in `validate`,
    /// the switch and port group rules, and every NIC referring to a configured port group.
    pub fn validate_with_topology(&self) -> Result<(), ValidationError> {
        self.validate()?;
        self.network.validate()?;

        if let Some(nic) = self
            .appliance
            .nics
            .iter()
            .find(|n| self.network.port_group(&n.port_group).is_none())
        {
            return Err(ValidationError::UnknownPortGroup {
                port_group: nic.port_group.clone(),
            });
        }

        Ok(())
    }
}
