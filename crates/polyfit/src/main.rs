use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use params::Weights;
use polyfit::{reconstruct_file, write_report, ReconstructionConfig};
use solver::{available_backends, SolverKind};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "polyfit",
    author,
    version,
    about = "Reconstruct a watertight polygonal surface from a plane-segmented point cloud"
)]
struct Cli {
    /// Point cloud with planar groups (.vg or .json).
    #[arg(short = 'i', long, default_value = "in.vg")]
    input: PathBuf,

    /// Reconstructed surface (.obj, .off, .ply or .stl).
    #[arg(short = 'o', long, default_value = "out.obj")]
    output: PathBuf,

    #[arg(short = 'f', long = "lambda_data_fitting", default_value_t = 0.43)]
    lambda_data_fitting: f64,

    #[arg(short = 'c', long = "lambda_model_coverage", default_value_t = 0.27)]
    lambda_model_coverage: f64,

    #[arg(short = 'x', long = "lambda_model_complexity", default_value_t = 0.30)]
    lambda_model_complexity: f64,

    /// Face selection backend (branch-and-bound or microlp).
    #[arg(long, default_value = "branch-and-bound")]
    solver: SolverKind,

    /// Write a JSON QA report here.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Allow surfaces with boundary edges.
    #[arg(long)]
    open: bool,

    #[arg(long = "min-faces", default_value_t = 0)]
    min_faces: usize,

    /// Stop branch and bound after this many nodes.
    #[arg(long = "node-limit")]
    node_limit: Option<usize>,

    /// Print the solver backends compiled into this binary and exit.
    #[arg(long = "list-solvers")]
    list_solvers: bool,

    /// Increase output verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> ReconstructionConfig {
        ReconstructionConfig {
            weights: Weights::new(
                self.lambda_data_fitting,
                self.lambda_model_coverage,
                self.lambda_model_complexity,
            ),
            solver: self.solver,
            watertight: !self.open,
            min_faces: self.min_faces,
            node_limit: self.node_limit,
            ..ReconstructionConfig::default()
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if cli.list_solvers {
        for backend in available_backends() {
            println!(
                "{:<18} {}",
                backend.kind.as_str(),
                if backend.available { "available" } else { "not compiled in" }
            );
        }
        return Ok(());
    }
    let summary = run(&cli)?;
    println!("{summary}");
    Ok(())
}

fn run(cli: &Cli) -> Result<String> {
    let (reconstruction, format) = reconstruct_file(&cli.input, &cli.output, &cli.config())?;
    if let Some(path) = &cli.report {
        write_report(path, &reconstruction.report)?;
    }
    let report = &reconstruction.report;
    Ok(format!(
        "Wrote {} ({}): {} faces on {} planes, {} vertices{}",
        cli.output.display(),
        format,
        report.faces,
        report.selection.planes_used,
        report.vertices,
        if report.manifold.is_closed { ", closed" } else { "" }
    ))
}
