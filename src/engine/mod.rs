//! The commissioning engine: putting appliance VMs on the hosts of a cluster, wiring them into
//! the cluster's network topology and taking them away again.

// Engine functionality
mod cleanup;
mod commission;
pub(crate) mod context;
mod install;
mod placement;
mod task;
mod template;
mod topology;

pub use cleanup::CleanupOrchestrator;
pub use context::{ClusterContext, Services};
pub use install::ClusterInstaller;
