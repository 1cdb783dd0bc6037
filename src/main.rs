use std::{fs::File, panic, path::PathBuf, process::ExitCode, sync::Arc, sync::Mutex};

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info, LevelFilter};

use commissioner::{
    cli::{Cli, CommissionerExitCodes, Commands},
    platform::simulator::{SimulatedConnector, SimulatedPlatform},
    validation, write_output, AgentConfig, BackgroundLog, Commissioner, DriverKind, MultiLogger,
    COMMISSIONER_VERSION,
};
use commissioner_api::{
    constants::BACKGROUND_LOG_PATH,
    error::{
        CommissionError, CommissionResultExt, ErrorKind, InitializationError, InternalError,
        ReportError,
    },
};

fn run_commissioner(args: &Cli) -> Result<(), CommissionError> {
    // Log version ASAP
    info!("Commissioner version: {}", COMMISSIONER_VERSION);

    // Catch exit fast commands
    if let Commands::Validate { input } = &args.command {
        let config = AgentConfig::load(&args.config)?;
        return validation::validate_input_file(input, config.driver == DriverKind::NetworkAppliance);
    }

    let res = panic::catch_unwind(move || {
        let Some((operation, driver_args)) = args.command.driver_args() else {
            return Err(CommissionError::internal("Invalid command"));
        };

        let config = AgentConfig::load(&args.config)?;
        let inventory: PathBuf = args
            .simulate
            .clone()
            .or_else(|| config.simulated_inventory.clone())
            .structured(InitializationError::NoPlatformConnector)?;
        let platform = Arc::new(SimulatedPlatform::load(&inventory).structured(
            InitializationError::LoadInventory {
                path: inventory.display().to_string(),
            },
        )?);

        let commissioner =
            Commissioner::new(&config, Box::new(SimulatedConnector::new(platform.clone())))
                .message("Failed to initialize commissioner")?;

        let res = validation::load_input(&driver_args.input)
            .and_then(|input| commissioner.execute(operation, &input));

        // The inventory reflects whatever the command got done, even when it failed.
        if args.command.mutates() {
            if let Err(e) = platform.save(&inventory) {
                error!("Failed to save inventory to '{}': {e:?}", inventory.display());
            }
        }

        // return the cluster information, if any
        if let Ok(Some(info)) = &res {
            match &driver_args.output {
                Some(path) => write_output(path, info)?,
                None => println!(
                    "{}",
                    serde_json::to_string_pretty(info).structured(InternalError::SerializeResult)?
                ),
            }
        }

        // return error if requested
        if let Some(error_path) = driver_args.error.as_ref() {
            if let Err(e) = &res {
                if let Err(e2) = write_output(error_path, e) {
                    error!("Failed to write error to file: {e2:?}");
                }
            }
        }

        res.map(|_| ())
            .message(format!("Failed to execute '{}' command", args.command))
    });

    match res {
        Err(e) => Err(CommissionError::new(InternalError::Panic(format!("{e:?}")))),
        Ok(r) => r,
    }
}

fn setup_logging(args: &Cli) -> Result<(), Error> {
    // Set up the multilogger
    let mut multilogger = MultiLogger::new()
        // Add regular env_logger to output to stderr
        .with_logger(Box::new(
            env_logger::builder()
                .format_timestamp(None)
                .filter_level(args.verbosity)
                .build(),
        ))
        // Thread pool internals are only interesting when something goes wrong
        .with_global_filter("rayon", LevelFilter::Warn);

    // Add background logger if we're running a command that needs it
    if args.command.mutates() {
        multilogger.add_logger(BackgroundLog::new(BACKGROUND_LOG_PATH).into_logger());
    }

    multilogger.init().context("Logger already registered")?;

    Ok(())
}

fn setup_tracing(args: &Cli) -> Result<(), Error> {
    use tracing_subscriber::{filter, fmt, layer::SubscriberExt, Layer};

    let Some(path) = &args.trace_file else {
        return Ok(());
    };

    let file = File::options()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open trace file '{}'", path.display()))?;
    let trace_writer = fmt::layer()
        .json()
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_writer(Mutex::new(file))
        .with_filter(filter::LevelFilter::INFO);

    tracing::subscriber::set_global_default(
        tracing_subscriber::Registry::default().with(trace_writer),
    )
    .context("Failed to set global default subscriber")?;

    Ok(())
}

fn main() -> ExitCode {
    // Parse args
    let args = Cli::parse();

    // Initialize the loggers
    if let Err(e) = setup_logging(&args) {
        error!("Failed to initialize logging: {e:?}");
        return CommissionerExitCodes::SetupFailed.into();
    }

    // Initialize the telemetry flow
    if let Err(e) = setup_tracing(&args) {
        error!("Failed to initialize tracing: {e:?}");
        return CommissionerExitCodes::SetupFailed.into();
    }

    // Invoke the commissioner
    if let Err(e) = run_commissioner(&args) {
        error!("Commissioner failed: {e:?}");
        return match e.kind() {
            ErrorKind::Initialization(_) => CommissionerExitCodes::SetupFailed.into(),
            _ => CommissionerExitCodes::Failed.into(),
        };
    }

    CommissionerExitCodes::Success.into()
}
