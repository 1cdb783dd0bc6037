use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display, Formatter},
    ops::RangeInclusive,
};

use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::constants::{DEFAULT_MTU, DEFAULT_SWITCH_TYPE, MAX_VLAN_ID};

use super::ValidationError;

/// Switches and port groups the appliances attach to.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkProperties {
    #[serde(default)]
    pub switches: Vec<SwitchSpec>,

    #[serde(default, alias = "portGroups")]
    pub port_groups: Vec<PortGroupSpec>,
}

/// A distributed virtual switch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SwitchSpec {
    pub name: String,

    #[serde(default = "default_switch_type", rename = "type")]
    pub switch_type: String,

    /// Physical NICs bound to the switch on every member host. An empty list marks the trunk
    /// switch carrying traffic between appliances.
    #[serde(default)]
    pub physical_nics: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

fn default_switch_type() -> String {
    DEFAULT_SWITCH_TYPE.into()
}

impl SwitchSpec {
    pub fn is_trunk(&self) -> bool {
        self.physical_nics.is_empty()
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    /// Uplink port names, one per physical NIC in order, or the single generic uplink.
    pub fn uplink_names(&self) -> Vec<String> {
        if self.physical_nics.is_empty() {
            vec![crate::constants::GENERIC_UPLINK_NAME.to_owned()]
        } else {
            (0..self.physical_nics.len())
                .map(|i| format!("uplink{i}"))
                .collect()
        }
    }

    /// Uplink port name that the given physical NIC is bound to.
    pub fn uplink_for_nic(&self, nic: &str) -> Option<String> {
        self.physical_nics
            .iter()
            .position(|n| n == nic)
            .map(|i| format!("uplink{i}"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VlanType {
    None,
    Vlan,
    Trunk,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CloudNetworkType {
    Vlan,
    Vxlan,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub promiscuous: bool,

    #[serde(default)]
    pub forged_transmits: bool,
}

impl SecurityPolicy {
    pub fn permissive() -> Self {
        Self {
            promiscuous: true,
            forged_transmits: true,
        }
    }
}

/// NIC teaming as numeric codes, the way the lifecycle manager sends them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NicTeaming {
    /// 1 = IP hash, 2 = source MAC hash, 3 = originating port, 4 = explicit failover,
    /// 5 = physical NIC load.
    #[serde(default = "default_load_balancing")]
    pub load_balancing: u8,

    /// 1 = link status only, 2 = beacon probing.
    #[serde(default = "default_failover_detection")]
    pub network_failover_detection: u8,

    #[serde(default = "default_true")]
    pub notify_switches: bool,

    #[serde(default)]
    pub active_nics: Vec<String>,
}

fn default_load_balancing() -> u8 {
    LoadBalancing::OriginatingPort as u8
}

fn default_failover_detection() -> u8 {
    FailoverDetection::LinkStatus as u8
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LoadBalancing {
    IpHash = 1,
    SourceMac = 2,
    OriginatingPort = 3,
    ExplicitFailover = 4,
    PhysicalNicLoad = 5,
}

impl TryFrom<u8> for LoadBalancing {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::IpHash,
            2 => Self::SourceMac,
            3 => Self::OriginatingPort,
            4 => Self::ExplicitFailover,
            5 => Self::PhysicalNicLoad,
            _ => return Err(value),
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailoverDetection {
    LinkStatus = 1,
    BeaconProbing = 2,
}

impl TryFrom<u8> for FailoverDetection {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::LinkStatus,
            2 => Self::BeaconProbing,
            _ => return Err(value),
        })
    }
}

/// A port group on one of the configured switches.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortGroupSpec {
    pub name: String,

    #[serde(alias = "switchName")]
    pub switch_name: String,

    /// `"0"`, a single VLAN such as `"100"`, or trunk ranges such as `"1-4094"` or `"10,20-30"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<String>,

    /// Inferred from `vlan` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_type: Option<VlanType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_teaming: Option<NicTeaming>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_network_type: Option<CloudNetworkType>,
}

/// Parsed VLAN configuration of a port group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlanSpec {
    None,
    Single(u16),
    Trunk(Vec<RangeInclusive<u16>>),
}

impl VlanSpec {
    pub fn full_trunk() -> Self {
        VlanSpec::Trunk(vec![1..=MAX_VLAN_ID])
    }
}

impl Display for VlanSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VlanSpec::None => write!(f, "none"),
            VlanSpec::Single(id) => write!(f, "{id}"),
            VlanSpec::Trunk(ranges) => {
                let rendered = ranges
                    .iter()
                    .map(|r| {
                        if r.start() == r.end() {
                            r.start().to_string()
                        } else {
                            format!("{}-{}", r.start(), r.end())
                        }
                    })
                    .collect::<Vec<_>>();
                write!(f, "{}", rendered.join(","))
            }
        }
    }
}

impl PortGroupSpec {
    /// Parses the VLAN string according to the (possibly inferred) VLAN type.
    pub fn vlan_spec(&self) -> Result<VlanSpec, ValidationError> {
        let raw = self.vlan.as_deref().map(str::trim).unwrap_or_default();
        let invalid = |reason: &str| ValidationError::InvalidVlan {
            port_group: self.name.clone(),
            vlan: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let vlan_type = match self.vlan_type {
            Some(t) => t,
            None if raw.is_empty() || raw == "0" => VlanType::None,
            None if raw.contains('-') || raw.contains(',') => VlanType::Trunk,
            None => VlanType::Vlan,
        };

        match vlan_type {
            VlanType::None => {
                if raw.is_empty() || raw == "0" {
                    Ok(VlanSpec::None)
                } else {
                    Err(invalid("vlan_type 'none' does not take a VLAN ID"))
                }
            }
            VlanType::Vlan => {
                if raw.is_empty() {
                    return Err(invalid("vlan_type 'vlan' requires a VLAN ID"));
                }
                parse_vlan_id(raw)
                    .map(VlanSpec::Single)
                    .ok_or_else(|| invalid("expected a VLAN ID between 0 and 4094"))
            }
            VlanType::Trunk => {
                if raw.is_empty() {
                    return Err(invalid("vlan_type 'trunk' requires VLAN ranges"));
                }
                let mut ranges = Vec::new();
                for part in raw.split(',').map(str::trim) {
                    let range = match part.split_once('-') {
                        Some((start, end)) => {
                            let start = parse_vlan_id(start)
                                .ok_or_else(|| invalid("range start is not a VLAN ID"))?;
                            let end = parse_vlan_id(end)
                                .ok_or_else(|| invalid("range end is not a VLAN ID"))?;
                            if start > end {
                                return Err(invalid("range start is after range end"));
                            }
                            start..=end
                        }
                        None => {
                            let id = parse_vlan_id(part)
                                .ok_or_else(|| invalid("expected a VLAN ID between 0 and 4094"))?;
                            id..=id
                        }
                    };
                    ranges.push(range);
                }
                Ok(VlanSpec::Trunk(ranges))
            }
        }
    }

    /// Security policy to apply when the switch already has physical NICs attached.
    pub fn effective_security(&self) -> SecurityPolicy {
        match self.security {
            Some(policy) => policy,
            None if self.cloud_network_type == Some(CloudNetworkType::Vlan) => {
                SecurityPolicy::permissive()
            }
            None => SecurityPolicy::default(),
        }
    }

    /// Validates the teaming codes and their combination.
    pub fn validate_teaming(&self) -> Result<(), ValidationError> {
        let Some(teaming) = &self.nic_teaming else {
            return Ok(());
        };

        let load_balancing = LoadBalancing::try_from(teaming.load_balancing).map_err(|value| {
            ValidationError::InvalidLoadBalancing {
                port_group: self.name.clone(),
                value,
            }
        })?;
        let failover = FailoverDetection::try_from(teaming.network_failover_detection).map_err(
            |value| ValidationError::InvalidFailoverDetection {
                port_group: self.name.clone(),
                value,
            },
        )?;

        if load_balancing == LoadBalancing::IpHash && failover == FailoverDetection::BeaconProbing
        {
            return Err(ValidationError::IpHashWithBeaconProbing {
                port_group: self.name.clone(),
            });
        }

        Ok(())
    }
}

fn parse_vlan_id(value: &str) -> Option<u16> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|id| *id <= MAX_VLAN_ID)
}

impl NetworkProperties {
    pub fn switch(&self, name: &str) -> Option<&SwitchSpec> {
        self.switches.iter().find(|s| s.name == name)
    }

    pub fn port_group(&self, name: &str) -> Option<&PortGroupSpec> {
        self.port_groups.iter().find(|p| p.name == name)
    }

    pub fn trunk_switch(&self) -> Option<&SwitchSpec> {
        self.switches.iter().find(|s| s.is_trunk())
    }

    /// Validates the switch list on its own and returns the switch names in declaration order.
    pub fn validate_switches(&self) -> Result<Vec<String>, ValidationError> {
        let mut names = HashSet::new();
        let mut nic_owner: HashMap<&str, &str> = HashMap::new();

        for switch in &self.switches {
            if switch.name.trim().is_empty() {
                return Err(ValidationError::EmptyField {
                    field: "switches.name".into(),
                });
            }
            if !names.insert(switch.name.as_str()) {
                return Err(ValidationError::DuplicateSwitch {
                    switch: switch.name.clone(),
                });
            }
            if let Some(mtu) = switch.mtu {
                if mtu == 0 || mtu > 9000 {
                    return Err(ValidationError::InvalidMtu {
                        switch: switch.name.clone(),
                        mtu,
                    });
                }
            }

            let mut local = HashSet::new();
            for nic in &switch.physical_nics {
                if nic.trim().is_empty() {
                    return Err(ValidationError::EmptyField {
                        field: format!("switches.{}.physical_nics", switch.name),
                    });
                }
                if !local.insert(nic.as_str()) {
                    return Err(ValidationError::DuplicatePhysicalNic {
                        switch: switch.name.clone(),
                        nic: nic.clone(),
                    });
                }
                if let Some(first) = nic_owner.insert(nic.as_str(), switch.name.as_str()) {
                    return Err(ValidationError::PhysicalNicOnMultipleSwitches {
                        nic: nic.clone(),
                        first: first.to_owned(),
                        second: switch.name.clone(),
                    });
                }
            }
        }

        let trunk_count = self.switches.iter().filter(|s| s.is_trunk()).count();
        if trunk_count != 1 {
            return Err(ValidationError::TrunkSwitchCount { count: trunk_count });
        }

        Ok(self.switches.iter().map(|s| s.name.clone()).collect())
    }

    /// Validates switches, port groups and the cross references between them.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_switches()?;

        let mut names = HashSet::new();
        for port_group in &self.port_groups {
            if port_group.name.trim().is_empty() {
                return Err(ValidationError::EmptyField {
                    field: "port_groups.name".into(),
                });
            }
            if !names.insert(port_group.name.as_str()) {
                return Err(ValidationError::DuplicatePortGroup {
                    port_group: port_group.name.clone(),
                });
            }

            let switch = self.switch(&port_group.switch_name).ok_or_else(|| {
                ValidationError::UnknownSwitch {
                    port_group: port_group.name.clone(),
                    switch: port_group.switch_name.clone(),
                }
            })?;

            port_group.vlan_spec()?;
            port_group.validate_teaming()?;

            if let Some(teaming) = &port_group.nic_teaming {
                if let Some(nic) = teaming
                    .active_nics
                    .iter()
                    .find(|nic| !switch.physical_nics.contains(nic))
                {
                    return Err(ValidationError::ActiveNicNotOnSwitch {
                        port_group: port_group.name.clone(),
                        switch: switch.name.clone(),
                        nic: nic.clone(),
                    });
                }
            }
        }

        if !self
            .port_groups
            .iter()
            .any(|p| p.cloud_network_type.is_some())
        {
            return Err(ValidationError::MissingCloudNetworkType);
        }

        Ok(())
    }
}
