//! hyperspec CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod config;
mod pipeline;
mod report;

#[derive(Parser)]
#[command(name = "hyperspec")]
#[command(about = "Hypernucleus yield spectra from unbinned invariant-mass fits")]
#[command(version)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Efficiency-corrected spectrum, with the systematic scan when configured
    Spectrum {
        /// Run configuration (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Result JSON (default: `<output_dir>/<output_file>.json`); the log goes next to it
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Invariant-mass fit of the selected data candidates
    MassFit {
        /// Run configuration (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Spectrum { config, output, threads } => {
            cmd_spectrum(&config, output.as_ref(), threads)
        }
        Commands::MassFit { config, output } => cmd_mass_fit(&config, output.as_ref()),
        Commands::Version => {
            println!("hyperspec {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn cmd_spectrum(config: &Path, output: Option<&PathBuf>, threads: usize) -> Result<()> {
    let cfg = config::read_run_config(config)?;
    let plan = cfg.spectrum_plan(&pipeline::config_dir(config))?;

    if threads > 0 {
        // Best-effort; ignore if a global pool already exists.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }

    let outcome = pipeline::run_spectrum(&plan)?;

    let json_path = output.cloned().unwrap_or_else(|| plan.output_json.clone());
    let log_path =
        if output.is_some() { json_path.with_extension("txt") } else { plan.output_log.clone() };
    let value = report::spectrum_json(&plan.spectrum, plan.systematics.as_ref(), plan.seed, &outcome)?;
    report::write_json(Some(&json_path), &value)?;
    report::write_log(&log_path, &report::spectrum_log(&outcome))?;
    Ok(())
}

fn cmd_mass_fit(config: &Path, output: Option<&PathBuf>) -> Result<()> {
    let cfg = config::read_run_config(config)?;
    let plan = cfg.mass_fit_plan(&pipeline::config_dir(config))?;
    let outcome = pipeline::run_mass_fit(&plan)?;
    report::write_json(output, &report::mass_fit_json(&outcome)?)
}
