//! Runs a zipper from a workflow file.
//!
//! Usage: `zipper [workflow.yaml]`. Without an argument the path comes from
//! `ZIPMESH_CONFIG`, then `workflow.yaml`.

use anyhow::Context;
use std::path::PathBuf;
use tracing::info;
use zipmesh::{RuntimeEnv, Zipmesh, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = RuntimeEnv::from_env();
    logging::init(&env).context("failed to set up logging")?;

    let path = std::env::args_os().nth(1).map(PathBuf::from).unwrap_or_else(|| env.config_path.clone());
    let config = Zipmesh::load(&path).with_context(|| format!("failed to load {}", path.display()))?;
    info!(
        zipper = %config.name,
        addr = %config.addr(),
        functions = ?config.functions.iter().map(|app| app.name.as_str()).collect::<Vec<_>>(),
        "Starting zipper"
    );

    Zipmesh::run(&config, &env).await.context("zipper failed")?;
    Ok(())
}
