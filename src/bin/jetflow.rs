use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use jetflow::{FlowUnfolder, InputCollection, JetFlowResult, RawInput, UnfoldingConfig};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level filter, overridden by `RUST_LOG`
    #[arg(short, long, value_name = "LEVEL", default_value = "info", global = true)]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Unfold one input file with one or more configurations.
    Run {
        /// Input collection (or raw input with `--raw`) written in bincode
        input: PathBuf,
        /// Output store to write
        output: PathBuf,
        /// JSON configuration files. Each one is a separate run, labeled by its file stem.
        #[arg(short, long = "config", value_name = "CONFIG", required = true)]
        configs: Vec<PathBuf>,
        /// Read the input as spectra which are already split by plane
        #[arg(long)]
        raw: bool,
    },
    /// Write the default configuration as JSON.
    Config { output: PathBuf },
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn run_label(path: &Path, index: usize) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("run_{index}"))
}

fn run(input: &Path, output: &Path, configs: &[PathBuf], raw: bool) -> JetFlowResult<()> {
    let (collection, raw_input) = if raw {
        (None, Some(RawInput::read(path_str(input))?))
    } else {
        (Some(InputCollection::read(path_str(input))?), None)
    };
    let mut unfolder: Option<FlowUnfolder> = None;
    for (index, config_path) in configs.iter().enumerate() {
        let config = UnfoldingConfig::read_json(path_str(config_path))?;
        let mut current = match unfolder.take() {
            Some(mut previous) => {
                *previous.config_mut() = config;
                previous
            }
            None => {
                let fresh = FlowUnfolder::new(config);
                match (&collection, &raw_input) {
                    (Some(collection), _) => fresh.with_input(collection.clone()),
                    (None, Some(raw_input)) => fresh.with_raw_input(raw_input.clone()),
                    (None, None) => fresh,
                }
            }
        };
        let label = run_label(config_path, index);
        current.set_active_run(&label);
        let summary = current.make()?;
        info!(
            run = %label,
            converged_in = summary.converged_in,
            converged_out = summary.converged_out,
            "run finished"
        );
        unfolder = Some(current);
    }
    if let Some(unfolder) = unfolder {
        unfolder.output().write(path_str(output))?;
        info!(path = %output.display(), "output written");
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    let result = match &cli.command {
        Commands::Run {
            input,
            output,
            configs,
            raw,
        } => run(input, output, configs, *raw),
        Commands::Config { output } => UnfoldingConfig::default().write_json(path_str(output)),
    };
    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}
