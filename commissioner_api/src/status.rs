use std::{collections::BTreeMap, net::Ipv4Addr};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    constants::{COMPUTE_PROXY_MARKER, NETWORK_APPLIANCE_MARKER},
    ObjectId,
};

/// The function an appliance VM carries for its cluster.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ApplianceRole {
    ComputeProxy,
    NetworkAppliance,
}

impl ApplianceRole {
    /// Annotation that marks a VM as an appliance of this role.
    pub fn marker(&self) -> &'static str {
        match self {
            ApplianceRole::ComputeProxy => COMPUTE_PROXY_MARKER,
            ApplianceRole::NetworkAppliance => NETWORK_APPLIANCE_MARKER,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// A VM created to carry network or compute-proxy function for a cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ApplianceVm {
    pub id: ObjectId,
    pub name: String,
    pub host: ObjectId,
    pub role: ApplianceRole,
    pub power_state: PowerState,
    pub annotation: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ip: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_mac: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pxe_mac: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pxe_ip: Option<Ipv4Addr>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CommissionStatus {
    Success,
    Failed,
}

/// Outcome of commissioning one host. Produced once per host per batch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct HostCommissionResult {
    pub host: ObjectId,
    pub host_name: String,
    pub status: CommissionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<ApplianceVm>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostCommissionResult {
    pub fn success(host: ObjectId, host_name: String, ip: Ipv4Addr, vm: ApplianceVm) -> Self {
        Self {
            host,
            host_name,
            status: CommissionStatus::Success,
            ip: Some(ip),
            vm: Some(vm),
            error: None,
        }
    }

    pub fn failed(
        host: ObjectId,
        host_name: String,
        ip: Option<Ipv4Addr>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            host,
            host_name,
            status: CommissionStatus::Failed,
            ip,
            vm: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommissionStatus::Success
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CommissionType {
    FreshInstall,
    Incremental,
}

/// All host results of one commissioning batch, in the order the hosts were submitted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BatchResult {
    pub commission_type: CommissionType,
    pub results: Vec<HostCommissionResult>,
}

impl BatchResult {
    pub fn succeeded(&self) -> impl Iterator<Item = &HostCommissionResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &HostCommissionResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// What `create` and `get_info` report for one cluster.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterInfo {
    pub cluster_id: ObjectId,
    pub cluster_name: String,

    /// Switch names in effect for this cluster, after any per-cluster suffixing.
    #[serde(default)]
    pub switches: Vec<String>,

    /// Port group names in effect for this cluster, after any per-cluster suffixing.
    #[serde(default)]
    pub port_groups: Vec<String>,

    #[serde(default)]
    pub appliances: Vec<ApplianceVm>,
}

/// Per-cluster results keyed by cluster ID.
pub type ClusterInfoMap = BTreeMap<ObjectId, ClusterInfo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_marker() {
        assert_eq!(
            ApplianceRole::NetworkAppliance.marker(),
            "commissioner-managed:network-appliance"
        );
        assert_eq!(
            ApplianceRole::ComputeProxy.marker(),
            "commissioner-managed:compute-proxy"
        );
    }

    #[test]
    fn test_batch_partition() {
        let batch = BatchResult {
            commission_type: CommissionType::Incremental,
            results: vec![
                HostCommissionResult::failed("host-1".into(), "esx1".into(), None, "boom"),
                HostCommissionResult::failed(
                    "host-2".into(),
                    "esx2".into(),
                    Some(Ipv4Addr::new(10, 0, 0, 3)),
                    "boom",
                ),
            ],
        };
        assert_eq!(batch.succeeded().count(), 0);
        assert_eq!(batch.failed().count(), 2);

        let rendered = serde_yaml::to_string(&batch).unwrap();
        assert!(rendered.contains("commission-type: incremental"));
        assert!(rendered.contains("status: failed"));
    }
}
