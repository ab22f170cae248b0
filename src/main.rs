//! Shim binary that calls into the `poolwatch` library's `inner_main`.
//!
//! Exit code 0 on clean shutdown, non-zero when the configuration cannot be
//! loaded.

use clap::Parser as _;
use eyre::Result;

use poolwatch::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    poolwatch::inner_main(Cli::parse()).await
}
