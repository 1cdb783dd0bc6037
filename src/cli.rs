use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use commissioner_api::constants::AGENT_CONFIG_PATH;

use crate::{DriverOperation, COMMISSIONER_VERSION};

#[derive(Parser, Debug)]
#[clap(version = COMMISSIONER_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Debug)]
    pub verbosity: LevelFilter,

    /// Path to the agent configuration
    #[arg(global = true, long, default_value = AGENT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Run against the simulated platform inventory stored at this path
    ///
    /// Changes made by the command are written back to the inventory.
    #[arg(global = true, long)]
    pub simulate: Option<PathBuf>,

    /// Write JSON traces of the engine's spans to this file
    #[arg(global = true, long)]
    pub trace_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct DriverArgs {
    /// The input document describing the cluster
    #[clap(index = 1)]
    pub input: PathBuf,

    /// Path to save the result, printed to stdout when not given
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Path to save an eventual fatal error
    #[clap(short, long)]
    pub error: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the switches and port groups of the cluster
    #[clap(name = "setup-network")]
    SetupNetwork(DriverArgs),

    /// Commission the hosts of the cluster
    Create(DriverArgs),

    /// Commission hosts that joined the cluster since it was created
    Update(DriverArgs),

    /// Report the appliances of the cluster
    #[clap(name = "get-info")]
    GetInfo(DriverArgs),

    /// Decommission the appliances of the cluster
    Delete(DriverArgs),

    /// Remove the switches and port groups of the cluster
    #[clap(name = "teardown-network")]
    TeardownNetwork(DriverArgs),

    /// Validate an input document without contacting the platform
    Validate {
        /// Path to the input document
        #[clap(index = 1)]
        input: PathBuf,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::SetupNetwork(_) => "setup-network",
            Commands::Create(_) => "create",
            Commands::Update(_) => "update",
            Commands::GetInfo(_) => "get-info",
            Commands::Delete(_) => "delete",
            Commands::TeardownNetwork(_) => "teardown-network",
            Commands::Validate { .. } => "validate",
        }
    }

    /// The driver operation and its arguments, for every command but `validate`.
    pub fn driver_args(&self) -> Option<(DriverOperation, &DriverArgs)> {
        Some(match self {
            Commands::SetupNetwork(args) => (DriverOperation::SetupNetwork, args),
            Commands::Create(args) => (DriverOperation::Create, args),
            Commands::Update(args) => (DriverOperation::Update, args),
            Commands::GetInfo(args) => (DriverOperation::GetInfo, args),
            Commands::Delete(args) => (DriverOperation::Delete, args),
            Commands::TeardownNetwork(args) => (DriverOperation::TeardownNetwork, args),
            Commands::Validate { .. } => return None,
        })
    }

    /// Whether the command changes the platform.
    pub fn mutates(&self) -> bool {
        !matches!(self, Commands::GetInfo(_) | Commands::Validate { .. })
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissionerExitCodes {
    Success = 0,
    /// Logging, tracing or the agent failed to initialize.
    SetupFailed = 1,
    /// The command ran and failed.
    Failed = 2,
}

impl From<CommissionerExitCodes> for ExitCode {
    fn from(code: CommissionerExitCodes) -> Self {
        ExitCode::from(code as u8)
    }
}
