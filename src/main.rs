//! bagoup - Export Mac OS Messages chats.
//!
//! Reads a copy of the Messages `chat.db`, groups chats by the person or
//! group they are with, and writes one text or PDF file per chat (or per
//! entity), optionally copying or embedding attachments.
//!
//!   bagoup -i ~/chat.db -o export             # text files
//!   bagoup -p -c contacts.vcf                 # PDFs named after contacts
//!   bagoup -a -r                              # copy attachments, keep paths

mod application;
mod cli;
mod domain;
mod infrastructure;
#[cfg(test)]
mod test_support;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main application logic.
async fn run(cli: Cli) -> domain::Result<()> {
    let config = cli.export_config()?;
    let summary = application::run(config).await?;
    tracing::info!(
        files = summary.counts.files,
        export = %summary.export_path.display(),
        "Export complete"
    );
    Ok(())
}

/// Setup tracing/logging based on verbosity level.
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
