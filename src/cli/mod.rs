//! CLI entry point (spec.md §6): `hydrant [config_path] [input_path]`.
//!
//! Mirrors the teacher's `cli/cli.rs` structural choices — a
//! `#[derive(Parser)]` struct, `version` sourced from `CARGO_PKG_VERSION`,
//! an `after_help` usage block — but exposes the two positional arguments
//! spec.md names rather than the teacher's subcommand shape, since this
//! pipeline has a single run mode.

use crate::consts::POOL_SIZE;
use crate::orchestrator::Context;
use crate::pool::pg::{PgConnection, PgConnectionFactory};
use anyhow::{Context as _, Result};
use clap::Parser;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "hydrant",
    about = "High-throughput byte-stream ingestion pipeline with a self-healing bulk-copy backend",
    version,
    after_help = "\
    EXAMPLES:
        hydrant
        hydrant config.yaml
        hydrant config.yaml /var/spool/hydrant/incoming.bin"
)]
struct Cli {
    /// YAML configuration file. Falls back to HYDRANT_DB_URL / HYDRANT_BATCH_SIZE when omitted.
    config_path: Option<PathBuf>,

    /// Byte stream to ingest. Reads standard input until EOF when omitted.
    input_path: Option<PathBuf>,
}

/// Entry function for the CLI. Maps `OrchestratorError` (init failure) and
/// unreadable input files to a non-zero exit via the returned `Err` (spec.md
/// §6: "Exit 0 on clean shutdown; non-zero on init failure or unreadable
/// input file").
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let context: Arc<Context<PgConnection, PgConnectionFactory>> = Context::init(
        cli.config_path.as_deref(),
        POOL_SIZE,
        |config| PgConnectionFactory::new(config.database_url.clone(), config.require_secure_transport),
    )
    .context("hydrant failed to initialize")?;

    let input_result = match cli.input_path {
        Some(path) => {
            let file = File::open(&path).with_context(|| format!("failed to open input file {path:?}"))?;
            context.process_input(file)
        }
        None => context.process_input(io::stdin().lock()),
    };

    context.request_shutdown();

    input_result.context("error while reading input")?;
    Ok(())
}
