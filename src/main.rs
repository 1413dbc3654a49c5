use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use laptrace::telemetry::validate_schema;
use laptrace::{
    CancellationToken, LaptraceError, PipelineConfig, ProcessingContext, process_session,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Turn a telemetry CSV into replay artifacts
    Process {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// JSON configuration file, defaults to the user config when present
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Split the lap into this many equal sectors
        #[arg(long)]
        sectors: Option<usize>,

        #[arg(long)]
        reference_vehicle: Option<String>,

        #[arg(long)]
        reference_lap: Option<u32>,

        #[arg(short, long)]
        workers: Option<usize>,

        /// Length of the default delta trails in seconds
        #[arg(long)]
        trail_window: Option<f64>,
    },
    /// Check a telemetry CSV without processing it
    Validate {
        #[arg(short, long)]
        input: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, LaptraceError> {
    match path {
        Some(path) => PipelineConfig::from_file(path),
        None => Ok(PipelineConfig::from_local_file().unwrap_or_default()),
    }
}

fn validate(input: &Path) -> Result<(), LaptraceError> {
    let report = validate_schema(input)?;
    println!("{} rows, {} vehicles", report.rows, report.vehicles.len());
    for vehicle_id in &report.vehicles {
        println!("  {vehicle_id}");
    }
    if !report.unknown_channels.is_empty() {
        warn!(
            "Unused channels: {}",
            report
                .unknown_channels
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

fn main() {
    colog::init();

    let cli = Args::parse();
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("Cancelling...");
        handler_token.cancel();
    }) {
        warn!("Could not set Ctrl-C handler: {}", e);
    }

    let result = match cli.command {
        Commands::Process {
            input,
            output,
            config,
            sectors,
            reference_vehicle,
            reference_lap,
            workers,
            trail_window,
        } => load_config(config.as_deref()).and_then(|mut config| {
            if sectors.is_some() {
                config.sector_count = sectors;
            }
            if reference_vehicle.is_some() {
                config.reference_vehicle = reference_vehicle;
            }
            if reference_lap.is_some() {
                config.reference_lap = reference_lap;
            }
            if workers.is_some() {
                config.workers = workers;
            }
            if let Some(window) = trail_window {
                config.trail_window_s = window;
            }
            let context = ProcessingContext::with_cancellation(config, cancel);
            let artifacts = process_session(&input, &output, &context)?;
            info!(
                "Wrote {} vehicles to {:?}",
                artifacts.metadata.vehicle_ids.len(),
                output
            );
            Ok(())
        }),
        Commands::Validate { input } => validate(&input),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
