//! The operations the resource-lifecycle manager drives, and the drivers implementing them.

use std::sync::Arc;

use commissioner_api::{
    config::DriverInput,
    error::CommissionError,
    status::{ApplianceRole, ClusterInfo, ClusterInfoMap},
};

use crate::{
    config::DriverKind,
    engine::{ClusterContext, Services},
};

mod compute_proxy;
mod network_appliance;
mod noop;

pub use compute_proxy::ComputeProxyDriver;
pub use network_appliance::NetworkApplianceDriver;
pub use noop::NoopDriver;

/// Every call takes the same input document. Operations that report nothing either succeed
/// silently or fail with a structured error.
pub trait ApplianceDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Creates the switches and port groups of the input, without adding any host to them.
    fn setup_network(&self, input: &DriverInput) -> Result<(), CommissionError>;

    /// Commissions the cluster and reports its appliances.
    fn create(&self, input: &DriverInput) -> Result<ClusterInfoMap, CommissionError>;

    fn get_info(&self, input: &DriverInput) -> Result<ClusterInfoMap, CommissionError>;

    /// Decommissions the cluster's appliances and removes the topology created for them.
    fn delete(&self, input: &DriverInput) -> Result<(), CommissionError>;

    /// Commissions hosts that joined the cluster since it was created.
    fn update(&self, input: &DriverInput) -> Result<(), CommissionError>;

    fn teardown_network(&self, input: &DriverInput) -> Result<(), CommissionError>;
}

/// Returns the driver configured for the agent.
pub fn select(kind: DriverKind, services: Arc<Services>) -> Box<dyn ApplianceDriver> {
    match kind {
        DriverKind::ComputeProxy => Box::new(ComputeProxyDriver::new(services)),
        DriverKind::NetworkAppliance => Box::new(NetworkApplianceDriver::new(services)),
        DriverKind::Noop => Box::new(NoopDriver),
    }
}

/// Reports the appliances of the role in the cluster. `input` carries the names in effect for
/// the cluster; the topology names are only reported when `with_topology` is set.
pub(crate) fn cluster_info(
    services: &Services,
    input: &DriverInput,
    role: ApplianceRole,
    with_topology: bool,
) -> Result<ClusterInfoMap, CommissionError> {
    let ctx = ClusterContext::open(services, input)?;
    let config_port_group = ctx.port_group_id(&input.config_network.port_group)?;
    let pxe_port_group = match input.appliance.pxe_nic() {
        Some(nic) => ctx.port_group_id(&nic.port_group)?,
        None => None,
    };

    let appliances = ctx
        .appliances(role)?
        .iter()
        .map(|vm| {
            ctx.describe(
                vm,
                role,
                config_port_group.as_deref(),
                pxe_port_group.as_deref(),
            )
        })
        .collect();

    let mut info = ClusterInfo {
        cluster_id: ctx.cluster.id.clone(),
        cluster_name: ctx.cluster.name.clone(),
        appliances,
        ..Default::default()
    };
    if with_topology {
        info.switches = input.network.switches.iter().map(|s| s.name.clone()).collect();
        info.port_groups = input
            .network
            .port_groups
            .iter()
            .map(|pg| pg.name.clone())
            .collect();
    }

    Ok(ClusterInfoMap::from([(info.cluster_id.clone(), info)]))
}
