use std::{fs, path::Path};

use log::{debug, info};

use commissioner_api::{
    config::{DriverInput, ValidationError},
    error::{CommissionError, ReportError},
};

/// Reads the input document handed over by the resource-lifecycle manager. JSON and YAML are
/// both accepted.
pub fn load_input(path: &Path) -> Result<DriverInput, CommissionError> {
    let contents = fs::read_to_string(path).structured(ValidationError::LoadInput {
        path: path.to_string_lossy().into(),
    })?;
    debug!("Loaded input document from '{}'", path.display());
    parse_input(&contents)
}

pub fn parse_input(contents: &str) -> Result<DriverInput, CommissionError> {
    serde_yaml::from_str(contents).structured(ValidationError::ParseInput)
}

/// Checks an input document without touching the platform. With `topology`, the switch and port
/// group rules are checked as well.
pub fn validate_input_file(path: &Path, topology: bool) -> Result<(), CommissionError> {
    let input = load_input(path)?;
    if topology {
        input.validate_with_topology()
    } else {
        input.validate()
    }
    .map_err(CommissionError::new)?;

    info!(
        "Input for cluster '{}' is valid: {} switch(es), {} port group(s), {} appliance NIC(s)",
        input.cluster.name,
        input.network.switches.len(),
        input.network.port_groups.len(),
        input.appliance.nics.len()
    );
    Ok(())
}
