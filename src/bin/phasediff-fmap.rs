use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fmap_core::{Pipeline, PipelineConfig};

/// Compute a B0 fieldmap (Hz) from two phase images and a magnitude image
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Phase image of the first echo
    #[arg(long)]
    phase1: Option<PathBuf>,

    /// Phase image of the second echo
    #[arg(long)]
    phase2: Option<PathBuf>,

    /// Magnitude image (first echo)
    #[arg(long)]
    magnitude: Option<PathBuf>,

    /// BIDS sidecar of the first phase image
    #[arg(long)]
    phase1_json: Option<PathBuf>,

    /// BIDS sidecar of the second phase image
    #[arg(long)]
    phase2_json: Option<PathBuf>,

    /// Echo time difference in seconds
    #[arg(long)]
    delta_te: Option<f64>,

    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Use in-process backends for every stage (no FSL / ANTs needed)
    #[arg(long)]
    native: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(p) = &self.phase1 {
            config.inputs.phase1 = p.clone();
        }
        if let Some(p) = &self.phase2 {
            config.inputs.phase2 = p.clone();
        }
        if let Some(p) = &self.magnitude {
            config.inputs.magnitude = p.clone();
        }
        if let Some(p) = &self.phase1_json {
            config.inputs.phase1_sidecar = Some(p.clone());
        }
        if let Some(p) = &self.phase2_json {
            config.inputs.phase2_sidecar = Some(p.clone());
        }
        if let Some(dte) = self.delta_te {
            config.delta_te = Some(dte);
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if self.native {
            config.use_native_backends();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    args.apply(&mut config);

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    if !config.all_native() {
        tracing::info!("external backends selected; FSL / ANTs must be installed");
    }

    let pipeline = Pipeline::new(config).context("invalid configuration")?;
    let outputs = pipeline.run().context("fieldmap reconstruction failed")?;
    println!("{}", outputs.fieldmap.display());
    Ok(())
}
