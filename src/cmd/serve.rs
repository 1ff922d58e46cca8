//! `stagegate serve`.

use anyhow::Result;
use stagegate::config::StagegateConfig;
use stagegate::server;

use super::build_engine;

pub async fn cmd_serve(mut config: StagegateConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.toml.server.host = host;
    }
    if let Some(port) = port {
        config.toml.server.port = port;
    }
    for warning in config.validate() {
        eprintln!("{} {}", console::style("warning:").yellow(), warning);
    }

    let engine = build_engine(&config)?;
    server::start_server(&config, engine).await
}
