use std::fmt::{Debug, Display, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::config::ValidationError;

/// The commissioner failed to initialize.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InitializationError {
    #[error("Failed to load agent configuration from '{path}'")]
    LoadAgentConfig { path: String },
    #[error("Failed to parse agent configuration")]
    ParseAgentConfig,
    #[error("Failed to load simulated inventory from '{path}'")]
    LoadInventory { path: String },
    #[error("Failed to connect to platform endpoint '{endpoint}'")]
    ConnectPlatform { endpoint: String },
    #[error("Failed to build worker pool with {size} threads")]
    BuildWorkerPool { size: usize },
    #[error("No platform connector available, a simulated inventory must be configured")]
    NoPlatformConnector,
}

/// The virtualization platform reported a failure. Every variant names the
/// object the failure relates to.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformFault {
    #[error("Operation '{operation}' on '{object}' failed: {fault}")]
    TaskFault {
        operation: String,
        object: String,
        fault: String,
    },
    #[error("Failed to find {kind} '{name}'")]
    ObjectNotFound { kind: String, name: String },
    #[error("Failed to query {kind} '{name}'")]
    Query { kind: String, name: String },
    #[error("Failed to clone template '{template}' into '{vm}'")]
    Clone { template: String, vm: String },
    #[error("Failed to change power state of VM '{vm}'")]
    PowerState { vm: String },
    #[error("Failed to destroy VM '{vm}'")]
    Destroy { vm: String },
    #[error("Failed to reconfigure VM '{vm}'")]
    ReconfigureVm { vm: String },
    #[error("Failed to reconfigure cluster '{cluster}'")]
    ReconfigureCluster { cluster: String },
    #[error("Failed to move host '{host}' to cluster '{cluster}'")]
    MoveHost { host: String, cluster: String },
    #[error("Failed to change maintenance mode of host '{host}'")]
    MaintenanceMode { host: String },
    #[error("Guest operation '{operation}' failed in VM '{vm}'")]
    GuestOperation { operation: String, vm: String },
    #[error("Failed to obtain template '{template}'")]
    Template { template: String },
    #[error("Failed to update topology registration for cluster '{cluster}'")]
    TopologyRegistry { cluster: String },
}

/// Creating, reconfiguring or removing switches and port groups failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkTopologyError {
    #[error("Failed to create switch '{switch}'")]
    CreateSwitch { switch: String },
    #[error("Failed to reconfigure switch '{switch}'")]
    ReconfigureSwitch { switch: String },
    #[error("Failed to delete switch '{switch}'")]
    DeleteSwitch { switch: String },
    #[error("Failed to create port group '{port_group}'")]
    CreatePortGroup { port_group: String },
    #[error("Failed to reconfigure port group '{port_group}'")]
    ReconfigurePortGroup { port_group: String },
    #[error("Failed to delete port group '{port_group}'")]
    DeletePortGroup { port_group: String },
    #[error("Port group '{port_group}' does not exist")]
    PortGroupNotFound { port_group: String },
    #[error("Switch '{switch}' does not exist")]
    SwitchNotFound { switch: String },
    #[error("No free physical NIC among [{nics}] on host '{host}' for switch '{switch}'")]
    NoFreePhysicalNic {
        host: String,
        switch: String,
        nics: String,
    },
    #[error("Port group '{port_group}' requests IP hash load balancing with beacon probing")]
    InvalidNicTeaming { port_group: String },
}

/// A finite resource was used up.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceExhaustionError {
    #[error("IP pool '{pool}' has {available} free addresses, but {requested} were requested")]
    IpPoolExhausted {
        pool: String,
        requested: usize,
        available: usize,
    },
    #[error("No shared datastore is accessible from all hosts of cluster '{cluster}'")]
    NoSharedDatastore { cluster: String },
    #[error("No datastore on host '{host}' has at least {required} bytes free")]
    NoLocalDatastore { host: String, required: u64 },
    #[error("Cluster '{cluster}' has no connected host to place an appliance on")]
    NoEligibleHost { cluster: String },
}

/// A bounded wait ran out of attempts.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutError {
    #[error("Guest tools in VM '{vm}' were not ready after {attempts} attempts")]
    GuestToolsNotReady { vm: String, attempts: u32 },
    #[error("VM '{vm}' did not shut down after {attempts} attempts")]
    GuestShutdown { vm: String, attempts: u32 },
    #[error("Task '{task}' did not complete after {attempts} update rounds")]
    TaskWait { task: String, attempts: u32 },
}

/// Some hosts of a commissioning batch failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CommissionFailure {
    #[error("{failed} of {total} hosts failed to commission: {hosts}")]
    PartialCommissionFailure {
        failed: usize,
        total: usize,
        hosts: String,
    },
    #[error("All {total} hosts failed to commission: {hosts}")]
    AllHostsFailed { total: usize, hosts: String },
}

/// The connection to the platform broke down.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportError {
    #[error("Lost session with platform endpoint '{endpoint}'")]
    SessionLost { endpoint: String },
    #[error("Failed to create property filter for '{object}'")]
    CreateFilter { object: String },
    #[error("Failed to wait for property updates")]
    WaitForUpdates,
}

/// The persisted IP catalog could not be used.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CatalogError {
    #[error("Failed to create catalog directory")]
    CreateCatalogDirectory,
    #[error("Failed to open IP catalog at '{path}'")]
    OpenCatalog { path: String },
    #[error("Failed to initialize IP catalog")]
    InitializeCatalog,
    #[error("Failed to read from IP catalog")]
    ReadCatalog,
    #[error("Failed to write to IP catalog")]
    WriteCatalog,
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Caught panic: {0}")]
    Panic(String),
    #[error("Failed to serialize result")]
    SerializeResult,
    #[error("Failed to write output to '{path}'")]
    WriteOutput { path: String },
    #[error("A worker panicked while commissioning host '{host}'")]
    WorkerPanic { host: String },
}

/// Each variant of `ErrorKind` corresponds to a different category of error. The categories are
/// intended to be meaningful to the caller of the driver so it can decide between retrying,
/// rolling back and reporting.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// The input document was malformed or contradictory. Nothing was changed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The virtualization platform reported a failure.
    #[error(transparent)]
    Platform(#[from] PlatformFault),

    /// Switch or port group management failed.
    #[error(transparent)]
    NetworkTopology(#[from] NetworkTopologyError),

    /// IP addresses or datastore space ran out.
    #[error(transparent)]
    ResourceExhaustion(#[from] ResourceExhaustionError),

    /// A bounded wait ran out of attempts.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// One or more hosts of a batch failed after the whole batch ran.
    #[error(transparent)]
    Commission(#[from] CommissionFailure),

    /// The connection to the platform failed, as opposed to the platform reporting a failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The persisted IP catalog could not be read or written.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The commissioner could not start.
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    /// A bug was encountered.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct CommissionErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct CommissionError(Box<CommissionErrorInner>);
impl CommissionError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        CommissionError(Box::new(CommissionErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn internal(message: &'static str) -> Self {
        Self::new(InternalError::Internal(message))
    }

    #[track_caller]
    pub fn secondary_error_context(mut self, secondary: CommissionError) -> Self {
        self.0.context.push((format!(
            "While handling the error, an additional error was caught: \n\n{secondary:?}\n\nThe earlier error:"
        ).into(), Location::caller()));
        self
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Category name of the error, e.g. `resource-exhaustion`.
    pub fn category(&self) -> &'static str {
        <&str>::from(&self.0.kind)
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured CommissionError.
    fn structured(self, kind: K) -> Result<T, CommissionError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, CommissionError> {
        match self {
            Some(t) => Ok(t),
            None => Err(CommissionError(Box::new(CommissionErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, CommissionError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(CommissionError(Box::new(CommissionErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait CommissionResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, CommissionError>;
}

impl<T> CommissionResultExt<T> for Result<T, CommissionError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, CommissionError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }
}

impl Serialize for CommissionError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("commission-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Validation(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Platform(ref e) => state.serialize_field("error", e)?,
            ErrorKind::NetworkTopology(ref e) => state.serialize_field("error", e)?,
            ErrorKind::ResourceExhaustion(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Timeout(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Commission(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Transport(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Catalog(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Initialization(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", self.category())?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

/// Single-line rendering used for per-host diagnostics: the kind, the most
/// recent context message and the root cause.
impl Display for CommissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.kind)?;
        if let Some((context, _)) = self.0.context.last() {
            write!(f, " ({context})")?;
        }
        if let Some(ref source) = self.0.source {
            write!(f, ": {}", source.root_cause())?;
        }
        Ok(())
    }
}

impl Debug for CommissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}
