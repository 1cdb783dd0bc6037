use log::debug;

use commissioner_api::{
    config::DriverInput,
    error::CommissionError,
    status::{ClusterInfo, ClusterInfoMap},
};

use crate::{config::DriverKind, driver::ApplianceDriver};

/// Driver for deployments without a managed network driver. Nothing is ever touched.
pub struct NoopDriver;

impl ApplianceDriver for NoopDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Noop
    }

    fn setup_network(&self, _input: &DriverInput) -> Result<(), CommissionError> {
        Ok(())
    }

    fn create(&self, input: &DriverInput) -> Result<ClusterInfoMap, CommissionError> {
        debug!("No appliances to create for cluster '{}'", input.cluster.name);
        Ok(ClusterInfoMap::from([(
            input.cluster.id.clone(),
            ClusterInfo {
                cluster_id: input.cluster.id.clone(),
                cluster_name: input.cluster.name.clone(),
                ..Default::default()
            },
        )]))
    }

    fn get_info(&self, _input: &DriverInput) -> Result<ClusterInfoMap, CommissionError> {
        Ok(ClusterInfoMap::new())
    }

    fn delete(&self, _input: &DriverInput) -> Result<(), CommissionError> {
        Ok(())
    }

    fn update(&self, _input: &DriverInput) -> Result<(), CommissionError> {
        Ok(())
    }

    fn teardown_network(&self, _input: &DriverInput) -> Result<(), CommissionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::tests::sample_input;

    #[test]
    fn test_create_reports_empty_cluster() {
        let input = sample_input();
        let info = NoopDriver.create(&input).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info["domain-c7"].cluster_name, "Compute");
        assert!(info["domain-c7"].appliances.is_empty());

        assert!(NoopDriver.get_info(&input).unwrap().is_empty());
        NoopDriver.setup_network(&input).unwrap();
        NoopDriver.update(&input).unwrap();
        NoopDriver.delete(&input).unwrap();
        NoopDriver.teardown_network(&input).unwrap();
    }
}
