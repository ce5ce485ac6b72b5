//! ZimSync CLI - peer-to-peer LAN file synchronization for audio workflows
//!
//! ## Quick Start
//!
//! ```bash
//! # Serve a directory of session files
//! zimsync serve --directory ~/Bounces --name "Studio"
//!
//! # On another machine, find it and pull a file
//! zimsync discover --timeout 5
//! zimsync fetch 192.168.1.20 note.wav
//! ```

#![allow(clippy::doc_markdown)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Discover(args) => commands::discover::run(args).await,
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Test(args) => commands::test::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Fetch(args) => commands::fetch::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,zimsync=info,zimsync_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
