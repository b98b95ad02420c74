// ABOUTME: zmk-hermit entry point: compile out-of-tree ZMK firmware in a Docker sandbox
// ABOUTME: Parses arguments, sets up logging, and exits with the sandboxed command's code

mod args;
mod run;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = args::Args::parse();

    let default_directive = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(run::run(args).await);
}
