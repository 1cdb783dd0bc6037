use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{debug, info};

use commissioner_api::{
    config::{DriverInput, PlatformEndpoint},
    error::{CommissionError, InitializationError, PlatformFault, ReportError},
    status::{ApplianceRole, ApplianceVm},
};

use crate::{
    config::{AgentConfig, Settings},
    engine::{
        task::TaskPoller,
        template::{PlatformTemplateProvider, TemplateCache},
        topology::TopologyBuilder,
    },
    ipam::{IpAllocator, IpPool},
    platform::{Cluster, Connector, Datacenter, Host, PlatformClient, VirtualMachine},
    registry::{CatalogRegistry, TopologyRegistry},
    workers::WorkerPool,
};

/// Serializes every switch and port group mutation and per-host device wiring.
#[derive(Clone, Default)]
pub struct TopologyLock(Arc<Mutex<()>>);

impl TopologyLock {
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Long-lived collaborators shared by every driver operation of the process.
pub struct Services {
    connector: Box<dyn Connector>,
    sessions: Mutex<HashMap<String, Arc<dyn PlatformClient>>>,
    pub allocator: IpAllocator,
    pub topology_lock: TopologyLock,
    pub templates: TemplateCache,
    pub registry: Box<dyn TopologyRegistry>,
    pub workers: WorkerPool,
    pub settings: Settings,
}

impl Services {
    pub fn new(
        connector: Box<dyn Connector>,
        allocator: IpAllocator,
        registry: Box<dyn TopologyRegistry>,
        templates: TemplateCache,
        settings: Settings,
    ) -> Result<Self, CommissionError> {
        Ok(Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
            allocator,
            topology_lock: TopologyLock::default(),
            templates,
            registry,
            workers: WorkerPool::new(settings.worker_pool_size)?,
            settings,
        })
    }

    /// Builds the services described by the agent config, using the catalog for both IP
    /// allocations and topology registrations.
    pub fn from_config(
        config: &AgentConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Self, CommissionError> {
        Self::new(
            connector,
            IpAllocator::new(&config.catalog_path),
            Box::new(CatalogRegistry::new(&config.catalog_path)),
            TemplateCache::new(Box::new(PlatformTemplateProvider)),
            config.settings.clone(),
        )
    }

    /// Returns the session for the endpoint, connecting on first use.
    pub fn session(
        &self,
        endpoint: &PlatformEndpoint,
    ) -> Result<Arc<dyn PlatformClient>, CommissionError> {
        let key = format!("{}@{}", endpoint.username, endpoint.address());
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(&key) {
            return Ok(session.clone());
        }

        info!("Connecting to platform at '{}'", endpoint.address());
        let session = self
            .connector
            .connect(endpoint)
            .structured(InitializationError::ConnectPlatform {
                endpoint: endpoint.address(),
            })?;
        sessions.insert(key, session.clone());
        Ok(session)
    }
}

/// Everything a driver operation on one cluster works with.
pub struct ClusterContext<'a> {
    pub services: &'a Services,
    pub platform: Arc<dyn PlatformClient>,
    pub input: &'a DriverInput,
    pub datacenter: Datacenter,
    pub cluster: Cluster,
    pub pool: IpPool,
}

impl<'a> ClusterContext<'a> {
    pub fn open(services: &'a Services, input: &'a DriverInput) -> Result<Self, CommissionError> {
        let platform = services.session(&input.platform)?;

        let datacenter = platform
            .datacenter(&input.datacenter.id)
            .structured(PlatformFault::Query {
                kind: "datacenter".into(),
                name: input.datacenter.name.clone(),
            })?
            .structured(PlatformFault::ObjectNotFound {
                kind: "datacenter".into(),
                name: input.datacenter.name.clone(),
            })?;
        let cluster = platform
            .cluster(&input.cluster.id)
            .structured(PlatformFault::Query {
                kind: "cluster".into(),
                name: input.cluster.name.clone(),
            })?
            .structured(PlatformFault::ObjectNotFound {
                kind: "cluster".into(),
                name: input.cluster.name.clone(),
            })?;
        let pool = IpPool::from_config(&input.config_network)?;
        debug!(
            "Opened context for cluster '{}' in datacenter '{}'",
            cluster.name, datacenter.name
        );

        Ok(Self {
            services,
            platform,
            input,
            datacenter,
            cluster,
            pool,
        })
    }

    pub fn platform(&self) -> &dyn PlatformClient {
        self.platform.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.services.settings
    }

    pub fn poller(&self) -> TaskPoller<'_> {
        TaskPoller::new(self.platform(), &self.services.settings.task_wait)
    }

    pub fn topology(&self) -> TopologyBuilder<'_> {
        TopologyBuilder::new(
            self.platform(),
            self.poller(),
            &self.services.topology_lock,
            &self.datacenter,
        )
    }

    pub fn hosts(&self) -> Result<Vec<Host>, CommissionError> {
        self.platform()
            .hosts(&self.cluster.id)
            .structured(PlatformFault::Query {
                kind: "hosts of cluster".into(),
                name: self.cluster.name.clone(),
            })
    }

    pub fn host(&self, id: &str) -> Result<Host, CommissionError> {
        self.platform()
            .host(id)
            .structured(PlatformFault::Query {
                kind: "host".into(),
                name: id.into(),
            })?
            .structured(PlatformFault::ObjectNotFound {
                kind: "host".into(),
                name: id.into(),
            })
    }

    /// Appliance VMs of the role in the cluster's VM folder, recognized by their ownership
    /// marker and placed on one of the cluster's hosts.
    pub fn appliances(&self, role: ApplianceRole) -> Result<Vec<VirtualMachine>, CommissionError> {
        let hosts: Vec<String> = self.hosts()?.into_iter().map(|h| h.id).collect();
        Ok(self
            .platform()
            .vms_in_folder(&self.cluster.vm_folder)
            .structured(PlatformFault::Query {
                kind: "VMs of folder".into(),
                name: self.cluster.vm_folder.clone(),
            })?
            .into_iter()
            .filter(|vm| vm.annotation.as_deref() == Some(role.marker()))
            .filter(|vm| hosts.contains(&vm.host))
            .collect())
    }

    /// Reported view of an appliance VM. `config_port_group` and `pxe_port_group` are port group
    /// IDs.
    pub fn describe(
        &self,
        vm: &VirtualMachine,
        role: ApplianceRole,
        config_port_group: Option<&str>,
        pxe_port_group: Option<&str>,
    ) -> ApplianceVm {
        let pxe_mac = pxe_port_group.and_then(|pg| vm.mac_on(pg)).map(str::to_owned);
        let pxe_ip = pxe_mac.as_deref().and_then(|mac| {
            vm.guest
                .nics
                .iter()
                .find(|n| n.mac.eq_ignore_ascii_case(mac))
                .and_then(|n| n.ipv4())
        });
        ApplianceVm {
            id: vm.id.clone(),
            name: vm.name.clone(),
            host: vm.host.clone(),
            role,
            power_state: vm.power_state,
            annotation: vm.annotation.clone().unwrap_or_default(),
            config_ip: config_port_group.and_then(|pg| vm.guest_ip_on(pg)),
            config_mac: config_port_group
                .and_then(|pg| vm.mac_on(pg))
                .map(str::to_owned),
            pxe_mac,
            pxe_ip,
        }
    }

    /// Looks up a port group by name anywhere in the datacenter. Returns its ID.
    pub fn port_group_id(&self, name: &str) -> Result<Option<String>, CommissionError> {
        Ok(self
            .platform()
            .find_network(&self.datacenter.id, name)
            .structured(PlatformFault::Query {
                kind: "port group".into(),
                name: name.into(),
            })?
            .map(|pg| pg.id))
    }
}
