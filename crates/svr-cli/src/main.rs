mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "svr-reconstruct", about = "Slice-to-volume super-resolution reconstruction")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full reconstruction engine
    Reconstruct(commands::reconstruct::ReconstructArgs),
    /// Estimate a slice thickness from z-axis spacing
    GuessThickness(commands::guess_thickness::GuessThicknessArgs),
    /// Pad a volume/mask by a voxel margin
    Pad3d(commands::pad3d::Pad3dArgs),
    /// Rename/tag slice transforms by iteration
    TransformAndRename(commands::transform_rename::TransformAndRenameArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Reconstruct(args) => commands::reconstruct::run(args),
        Commands::GuessThickness(args) => commands::guess_thickness::run(args),
        Commands::Pad3d(args) => commands::pad3d::run(args),
        Commands::TransformAndRename(args) => commands::transform_rename::run(args),
    }
}
