//! PartGen CLI: generate SEO product titles and descriptions.
//!
//! Reads a table of part numbers, enriches each row with known
//! specifications and writes model-generated web copy next to it.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
