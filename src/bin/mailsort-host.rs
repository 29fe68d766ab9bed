#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Native-messaging host binary
//!
//! Speaks length-prefixed JSON frames on stdin/stdout; every diagnostic
//! line goes to stderr. Exit codes: 0 normal shutdown, 1 unrecoverable
//! framing error, 2 configuration rejected at startup, 3 secret store
//! inaccessible while signing is required.

use clap::Parser;
use mailsort::{Config, Error};
use tracing_subscriber::EnvFilter;

const EXIT_FRAMING: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_SECRETS: i32 = 3;

#[derive(Parser)]
#[command(name = "mailsort-host")]
#[command(about = "LLM-backed mail classification native-messaging host")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "mailsort.json")]
    config: std::path::PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries frames exclusively; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration rejected: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if args.check {
        eprintln!("configuration OK: {}", args.config.display());
        return Ok(());
    }

    match mailsort::host::run(config).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("host terminated: {e}");
            let code = match &e {
                Error::Frame(_) => EXIT_FRAMING,
                Error::Secret(_) => EXIT_SECRETS,
                _ => EXIT_CONFIG,
            };
            std::process::exit(code);
        }
    }
}
