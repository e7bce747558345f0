//! HTTP server command: `tfgen serve`.

use std::path::PathBuf;

use anyhow::Result;

use super::super::Cli;

pub async fn cmd_serve(
    cli: &Cli,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    provider: Option<String>,
    dev: bool,
) -> Result<()> {
    let (config, _guard) = super::load_config(cli)?;
    let config = config.with_cli_overrides(port, db_path, provider, dev);
    tfgen::server::start_server(config).await
}
