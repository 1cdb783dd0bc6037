use std::{fs, path::Path, sync::Arc};

use log::info;
use serde::Serialize;
use strum_macros::{Display, EnumString};

use commissioner_api::{
    config::DriverInput,
    error::{CommissionError, InternalError, ReportError},
    status::ClusterInfoMap,
};

pub mod cli;
mod config;
pub mod driver;
mod engine;
mod ipam;
mod logging;
pub mod platform;
mod registry;
mod retry;
pub mod validation;
mod workers;

pub use config::{AgentConfig, DriverKind};
pub use logging::{background_log::BackgroundLog, multilog::MultiLogger};

use driver::ApplianceDriver;
use engine::Services;
use platform::Connector;

/// Commissioner version as provided by environment variables at build time
pub const COMMISSIONER_VERSION: &str = match option_env!("COMMISSIONER_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// The operations offered to the resource-lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum DriverOperation {
    SetupNetwork,
    Create,
    Update,
    GetInfo,
    Delete,
    TeardownNetwork,
}

/// The agent: the configured driver over the services shared by its operations.
pub struct Commissioner {
    driver: Box<dyn ApplianceDriver>,
}

impl Commissioner {
    pub fn new(config: &AgentConfig, connector: Box<dyn Connector>) -> Result<Self, CommissionError> {
        let services = Arc::new(Services::from_config(config, connector)?);
        info!(
            "Using the {} driver with {} worker(s)",
            config.driver, services.settings.worker_pool_size
        );
        Ok(Self {
            driver: driver::select(config.driver, services),
        })
    }

    pub fn driver_kind(&self) -> DriverKind {
        self.driver.kind()
    }

    /// Runs one driver operation. Only `create` and `get-info` report cluster information.
    pub fn execute(
        &self,
        operation: DriverOperation,
        input: &DriverInput,
    ) -> Result<Option<ClusterInfoMap>, CommissionError> {
        info!(
            "Executing '{operation}' for cluster '{}' ({})",
            input.cluster.name, input.cluster.id
        );
        let driver = self.driver.as_ref();
        match operation {
            DriverOperation::SetupNetwork => driver.setup_network(input).map(|()| None),
            DriverOperation::Create => driver.create(input).map(Some),
            DriverOperation::Update => driver.update(input).map(|()| None),
            DriverOperation::GetInfo => driver.get_info(input).map(Some),
            DriverOperation::Delete => driver.delete(input).map(|()| None),
            DriverOperation::TeardownNetwork => driver.teardown_network(input).map(|()| None),
        }
    }
}

/// Writes `value` to `path`, as JSON when the path ends in `.json` and YAML otherwise.
pub fn write_output<T: Serialize>(path: &Path, value: &T) -> Result<(), CommissionError> {
    let contents = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::to_string_pretty(value).structured(InternalError::SerializeResult)?
    } else {
        serde_yaml::to_string(value).structured(InternalError::SerializeResult)?
    };

    info!("Writing to {:?}", path);
    fs::write(path, contents).structured(InternalError::WriteOutput {
        path: path.display().to_string(),
    })
}
