//! `stagegate sweep`: one janitor pass.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use console::style;
use stagegate::config::StagegateConfig;
use stagegate::events::EventHub;
use stagegate::janitor;
use stagegate::store::open_store;

pub async fn cmd_sweep(config: &StagegateConfig, idle_secs: Option<u64>) -> Result<()> {
    let idle_timeout = match idle_secs.filter(|secs| *secs > 0) {
        Some(secs) => Duration::from_secs(secs),
        None => config
            .toml
            .janitor
            .idle_timeout()
            .context("No idle timeout: pass --idle-secs or set [janitor] idle_timeout_secs")?,
    };

    let store = open_store(config)?;
    let events = EventHub::new(store.clone(), config.toml.server.event_buffer);
    let report = janitor::sweep(&store, &events, idle_timeout, Utc::now()).await?;

    println!(
        "Examined {} active session(s), timed out {}, skipped {}",
        report.examined,
        style(report.timed_out.len()).bold(),
        report.skipped
    );
    for id in &report.timed_out {
        println!("  {} {}", style("✗").red(), id);
    }
    Ok(())
}
