//! Binary entrypoint for bayer-dither.
//!
//! Delegates all logic to the library crate; no local modules here.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt};

use bayer_dither::config::{BackendKind, Configuration};
use bayer_dither::processing::threshold::{MATRIX_SIZE, matrix_index, threshold_level};

/// Apply an 8x8 ordered-dither palette effect to an image
#[derive(Debug, Parser)]
#[command(name = "bayer-dither", about = "Ordered-dither palette quantizer")]
struct Cli {
    /// Path to YAML config file; defaults apply when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Image to dither
    #[arg(short, long, value_name = "FILE", required_unless_present = "print_matrix")]
    input: Option<PathBuf>,

    /// Where to write the dithered image
    #[arg(short, long, value_name = "FILE", required_unless_present = "print_matrix")]
    output: Option<PathBuf>,

    /// Override the configured backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Number of frames to run over the input
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Print the 8x8 threshold levels and exit
    #[arg(long)]
    print_matrix: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    // map -v to log level
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("bayer_dither={level}").parse()?)
        .add_directive("wgpu=warn".parse()?)
        .add_directive("naga=warn".parse()?);
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

fn print_matrix() {
    for y in 0..MATRIX_SIZE {
        let row: Vec<String> = (0..MATRIX_SIZE)
            .map(|x| format!("{:2}", threshold_level(matrix_index(x, y) as u32)))
            .collect();
        println!("{}", row.join(" "));
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    if cli.print_matrix {
        print_matrix();
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Configuration::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Configuration::default(),
    };
    if let Some(backend) = cli.backend {
        cfg.backend = backend;
    }
    let cfg = cfg.validated().context("validating configuration")?;

    let (Some(input), Some(output)) = (&cli.input, &cli.output) else {
        anyhow::bail!("--input and --output are required");
    };
    let source = image::open(input)
        .with_context(|| format!("opening {}", input.display()))?
        .to_rgba8();
    info!(
        width = source.width(),
        height = source.height(),
        "loaded input image"
    );

    let report = bayer_dither::process_image(&cfg, &source, cli.frames)?;
    info!(backend = report.backend, outcome = ?report.outcome, "frame processed");
    report
        .image
        .save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    Ok(())
}
