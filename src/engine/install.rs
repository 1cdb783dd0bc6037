//! Commissioning of a batch of hosts of one cluster.

use std::{
    collections::BTreeSet,
    panic::{self, AssertUnwindSafe},
};

use log::{debug, error, info, warn};

use commissioner_api::{
    config::DriverInput,
    error::{CommissionError, CommissionFailure, InternalError, PlatformFault, ReportError},
    status::{ApplianceRole, BatchResult, CommissionType, HostCommissionResult},
    ObjectId,
};

use crate::{
    engine::{
        cleanup,
        commission::{CommissionJob, CommissionWorker},
        context::{ClusterContext, Services},
    },
    platform::Host,
    registry::TopologyRegistration,
};

/// Which hosts of the cluster already carry an appliance and which get one in this batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCommissionState {
    pub existing: BTreeSet<ObjectId>,

    /// New hosts as they were before the batch touched them.
    pub to_add: Vec<Host>,
}

impl ClusterCommissionState {
    /// Candidates are the requested hosts, else the hosts listed in the input, else every
    /// connected host of the cluster. Hosts that already carry an appliance are skipped.
    pub fn compute(
        ctx: &ClusterContext,
        role: ApplianceRole,
        requested: Option<&[ObjectId]>,
    ) -> Result<Self, CommissionError> {
        let existing: BTreeSet<ObjectId> = ctx
            .appliances(role)?
            .into_iter()
            .map(|vm| vm.host)
            .collect();

        let candidates = match requested {
            Some(ids) => ids
                .iter()
                .map(|id| ctx.host(id))
                .collect::<Result<Vec<_>, _>>()?,
            None if !ctx.input.hosts.is_empty() => ctx
                .input
                .hosts
                .iter()
                .map(|entry| ctx.host(&entry.id))
                .collect::<Result<Vec<_>, _>>()?,
            None => ctx
                .hosts()?
                .into_iter()
                .filter(|host| {
                    if !host.is_connected() {
                        warn!("Skipping host '{}': {:?}", host.name, host.connection_state);
                    }
                    host.is_connected()
                })
                .collect(),
        };

        let mut seen = BTreeSet::new();
        let to_add = candidates
            .into_iter()
            .filter(|host| !existing.contains(&host.id) && seen.insert(host.id.clone()))
            .collect();
        Ok(Self { existing, to_add })
    }

    /// Some hosts of the cluster already carry an appliance.
    pub fn incremental(&self) -> bool {
        !self.existing.is_empty()
    }

    pub fn commission_type(&self) -> CommissionType {
        if self.incremental() {
            CommissionType::Incremental
        } else {
            CommissionType::FreshInstall
        }
    }
}

/// Puts an appliance of one role on every new host of a cluster.
pub struct ClusterInstaller<'a> {
    services: &'a Services,
    role: ApplianceRole,
}

impl<'a> ClusterInstaller<'a> {
    pub fn new(services: &'a Services, role: ApplianceRole) -> Self {
        Self { services, role }
    }

    fn manages_topology(&self) -> bool {
        self.role == ApplianceRole::NetworkAppliance
    }

    /// Commissions the new hosts of the cluster and returns one result per host, in the order
    /// the hosts were considered.
    ///
    /// Failed hosts of an incremental batch are rolled back and reported in the batch. Any
    /// failure in a fresh install is an error, and the caller is expected to clean the cluster
    /// up.
    #[tracing::instrument(skip_all, fields(cluster = %input.cluster.name, role = %self.role))]
    pub fn commission(
        &self,
        input: &DriverInput,
        hosts: Option<&[ObjectId]>,
    ) -> Result<BatchResult, CommissionError> {
        if self.manages_topology() {
            input.validate_with_topology()
        } else {
            input.validate()
        }
        .map_err(CommissionError::new)?;

        let (state, effective, registration) = {
            let ctx = ClusterContext::open(self.services, input)?;
            let state = ClusterCommissionState::compute(&ctx, self.role, hosts)?;
            let (effective, registration) = self.effective_input(&ctx, &state)?;
            (state, effective, registration)
        };
        let commission_type = state.commission_type();
        info!(
            "Commissioning {} host(s) of cluster '{}' ({commission_type}, {} existing)",
            state.to_add.len(),
            input.cluster.name,
            state.existing.len()
        );
        if state.to_add.is_empty() {
            return Ok(BatchResult {
                commission_type,
                results: Vec::new(),
            });
        }

        let ctx = ClusterContext::open(self.services, &effective)?;
        let cluster_hosts = ctx.hosts()?;
        let allocator = &self.services.allocator;
        let addresses = allocator.allocate(&ctx.pool, state.to_add.len(), &ctx.cluster.id)?;

        if self.manages_topology() {
            let prepared = ctx
                .topology()
                .build(&effective.network, &state.to_add)
                .and_then(|_| match &registration {
                    Some(registration) => self.services.registry.register_cluster(registration),
                    None => Ok(()),
                });
            if let Err(e) = prepared {
                if let Err(release) = allocator.release(&ctx.pool, &addresses) {
                    error!("Failed to release {addresses:?}: {release:?}");
                }
                return Err(e);
            }
        }

        let jobs: Vec<CommissionJob> = state
            .to_add
            .iter()
            .zip(&addresses)
            .map(|(host, ip)| {
                CommissionJob::new(&effective.appliance.name_prefix, host.clone(), *ip)
            })
            .collect();
        for job in &jobs {
            if let Err(e) = allocator.assign_owner(&ctx.pool, job.ip, &job.vm_name) {
                warn!("Failed to record '{}' as owner of {}: {e}", job.vm_name, job.ip);
            }
        }

        let worker = CommissionWorker::new(&ctx, self.role, &cluster_hosts);
        let results = self.services.workers.run(jobs.iter().collect(), |job| {
            panic::catch_unwind(AssertUnwindSafe(|| worker.run(job))).unwrap_or_else(|_| {
                let e = CommissionError::new(InternalError::WorkerPanic {
                    host: job.host.name.clone(),
                });
                error!("{e:?}");
                HostCommissionResult::failed(
                    job.host.id.clone(),
                    job.host.name.clone(),
                    Some(job.ip),
                    e.to_string(),
                )
            })
        });

        let batch = BatchResult {
            commission_type,
            results,
        };
        self.verify(&ctx, &jobs, batch)
    }

    /// Names the topology carries for this batch, and the registration to record once the
    /// topology exists.
    fn effective_input(
        &self,
        ctx: &ClusterContext,
        state: &ClusterCommissionState,
    ) -> Result<(DriverInput, Option<TopologyRegistration>), CommissionError> {
        let input = ctx.input;
        if !self.manages_topology() {
            return Ok((input.clone(), None));
        }

        if state.incremental() {
            Ok((
                crate::registry::effective_input(self.services.registry.as_ref(), input)?,
                None,
            ))
        } else {
            let registration = TopologyRegistration::fresh_install(
                &ctx.cluster.id,
                &ctx.cluster.name,
                &input.network,
            );
            debug!("Topology names for '{}': {:?}", ctx.cluster.name, registration.renames);
            Ok((registration.apply(input), Some(registration)))
        }
    }

    fn verify(
        &self,
        ctx: &ClusterContext,
        jobs: &[CommissionJob],
        batch: BatchResult,
    ) -> Result<BatchResult, CommissionError> {
        let failed: Vec<&CommissionJob> = jobs
            .iter()
            .zip(&batch.results)
            .filter(|(_, result)| !result.is_success())
            .map(|(job, _)| job)
            .collect();
        if failed.is_empty() {
            info!("All {} host(s) commissioned", jobs.len());
            return Ok(batch);
        }

        if batch.commission_type == CommissionType::Incremental {
            warn!(
                "{} of {} host(s) failed, rolling them back",
                failed.len(),
                jobs.len()
            );
            for job in failed {
                self.roll_back(ctx, job);
            }
            return Ok(batch);
        }

        let addresses: Vec<_> = failed.iter().map(|job| job.ip).collect();
        if let Err(e) = self.services.allocator.release(&ctx.pool, &addresses) {
            error!("Failed to release {addresses:?}: {e:?}");
        }
        let hosts = failed
            .iter()
            .map(|job| job.host.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let total = jobs.len();
        Err(CommissionError::new(if failed.len() == total {
            CommissionFailure::AllHostsFailed { total, hosts }
        } else {
            CommissionFailure::PartialCommissionFailure {
                failed: failed.len(),
                total,
                hosts,
            }
        }))
    }

    /// Undoes what a failed job left behind. Errors are logged, never raised.
    fn roll_back(&self, ctx: &ClusterContext, job: &CommissionJob) {
        info!("Rolling back host '{}'", job.host.name);
        if let Err(e) = self.remove_partial_appliance(ctx, job) {
            error!("Failed to remove the appliance of '{}': {e:?}", job.host.name);
        }
        if let Err(e) = self.restore_host(ctx, job) {
            error!("Failed to restore host '{}': {e:?}", job.host.name);
        }
        if let Err(e) = self.services.allocator.release(&ctx.pool, &[job.ip]) {
            error!("Failed to release {}: {e:?}", job.ip);
        }
    }

    fn remove_partial_appliance(
        &self,
        ctx: &ClusterContext,
        job: &CommissionJob,
    ) -> Result<(), CommissionError> {
        let partial = ctx
            .platform()
            .vms_in_folder(&ctx.cluster.vm_folder)
            .structured(PlatformFault::Query {
                kind: "VMs of folder".into(),
                name: ctx.cluster.vm_folder.clone(),
            })?
            .into_iter()
            .find(|vm| vm.name == job.vm_name && !vm.template);
        let Some(vm) = partial else {
            debug!("No appliance was created for '{}'", job.host.name);
            return Ok(());
        };

        cleanup::retire(ctx, &vm)?;
        cleanup::remove_affinity_rules(ctx, &[vm])?;
        Ok(())
    }

    /// Puts the host back where it came from, in the maintenance state it had before the batch.
    fn restore_host(&self, ctx: &ClusterContext, job: &CommissionJob) -> Result<(), CommissionError> {
        let platform = ctx.platform();
        let poller = ctx.poller();
        let host = &job.host;
        let maintenance_fault = || PlatformFault::MaintenanceMode {
            host: host.name.clone(),
        };
        let mut in_maintenance = ctx.host(&host.id)?.in_maintenance_mode;

        let source = ctx
            .input
            .hosts
            .iter()
            .find(|entry| entry.id == host.id)
            .and_then(|entry| entry.source_cluster.as_deref());
        if let Some(source) = source {
            if !in_maintenance {
                let task = platform
                    .enter_maintenance_mode(&host.id)
                    .structured(maintenance_fault())?;
                poller.await_success(&task, maintenance_fault())?;
                in_maintenance = true;
            }

            let fault = || PlatformFault::MoveHost {
                host: host.name.clone(),
                cluster: source.into(),
            };
            let task = platform.move_host(&host.id, source).structured(fault())?;
            poller.await_success(&task, fault())?;
            info!("Moved host '{}' back to cluster '{source}'", host.name);
        }

        if in_maintenance != host.in_maintenance_mode {
            let task = if host.in_maintenance_mode {
                platform.enter_maintenance_mode(&host.id)
            } else {
                platform.exit_maintenance_mode(&host.id)
            }
            .structured(maintenance_fault())?;
            poller.await_success(&task, maintenance_fault())?;
        }
        Ok(())
    }
}
