use anyhow::Result;
use clap::Parser;

use kustomize_controller::cli::ControllerArgs;
use kustomize_controller::runtime::{initialization::initialize, watch_loop::run_watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ControllerArgs::parse();

    let init = initialize(&args).await?;
    run_watch_loop(init, &args).await?;

    Ok(())
}
