use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fmmt_core::{BatchKind, FmmtConfig, FmmtSession, MutationRequest};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Firmware volume manipulation tool", long_about = None)]
struct Cli {
    /// TOML configuration (tools, codec table, packager)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the volumes and files of an image
    View {
        input: PathBuf,
        /// Render markdown tables
        #[arg(long)]
        markdown: bool,
    },
    /// Delete a whole volume
    DeleteVolume {
        input: PathBuf,
        volume: String,
        output: PathBuf,
    },
    /// Delete files: <in> (<volume> <file>)+ <out>
    DeleteFiles {
        input: PathBuf,
        #[arg(required = true, num_args = 3..)]
        operands: Vec<String>,
    },
    /// Add files: <in> (<volume> <new file>)+ <out>
    Add {
        input: PathBuf,
        #[arg(required = true, num_args = 3..)]
        operands: Vec<String>,
    },
    /// Replace files: <in> (<volume> <old file> <new file>)+ <out>
    Replace {
        input: PathBuf,
        #[arg(required = true, num_args = 4..)]
        operands: Vec<String>,
    },
    /// Regenerate a volume and everything nested in it
    Rebuild {
        input: PathBuf,
        volume: String,
        output: PathBuf,
    },
    /// Write the leaf content of one file
    Extract {
        input: PathBuf,
        volume: String,
        file: String,
        output: PathBuf,
    },
}

/// Split `(group)+ <out>` operands into a batch and the output path.
fn batch(kind: BatchKind, operands: &[String]) -> Result<(MutationRequest, PathBuf)> {
    let Some((output, groups)) = operands.split_last() else {
        bail!("missing output path");
    };
    let request = MutationRequest::from_operands(kind, groups)?;
    Ok((request, PathBuf::from(output)))
}

fn load_config(path: Option<&Path>) -> Result<FmmtConfig> {
    match path {
        Some(path) => FmmtConfig::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(FmmtConfig::default()),
    }
}

fn run(cli: Cli) -> Result<()> {
    let session = FmmtSession::new(load_config(cli.config.as_deref())?);

    match cli.command {
        Command::View { input, markdown } => {
            let report = session.view(&input)?;
            if markdown {
                print!("{}", report.to_markdown());
            } else {
                print!("{}", report);
            }
        }
        Command::DeleteVolume { input, volume, output } => {
            session.delete_volume(&input, &volume, &output)?;
        }
        Command::DeleteFiles { input, operands } => {
            let (request, output) = batch(BatchKind::Delete, &operands)?;
            session.apply(&input, &request, &output)?;
        }
        Command::Add { input, operands } => {
            let (request, output) = batch(BatchKind::Add, &operands)?;
            session.apply(&input, &request, &output)?;
        }
        Command::Replace { input, operands } => {
            let (request, output) = batch(BatchKind::Replace, &operands)?;
            session.apply(&input, &request, &output)?;
        }
        Command::Rebuild { input, volume, output } => {
            session.rebuild(&input, &volume, &output)?;
        }
        Command::Extract {
            input,
            volume,
            file,
            output,
        } => {
            session.extract(&input, &volume, &file, &output)?;
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting FMMT");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
