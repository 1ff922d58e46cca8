//! CLI command implementations.
//!
//! | Module    | Commands handled                                  |
//! |-----------|----------------------------------------------------|
//! | `session` | `Start`, `Status`, `Decide`, `Resume`, `List`, `Log`, `Artifact` |
//! | `serve`   | `Serve`                                           |
//! | `sweep`   | `Sweep`                                           |
//! | `config`  | `Config`                                          |

pub mod config;
pub mod serve;
pub mod session;
pub mod sweep;

use std::sync::Arc;

use anyhow::Result;
use stagegate::config::StagegateConfig;
use stagegate::pipeline::Engine;
use stagegate::store::open_store;
use stagegate::worker::Workers;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use session::{
    DecisionChoice, cmd_artifact, cmd_decide, cmd_list, cmd_log, cmd_resume, cmd_start,
    cmd_status,
};
pub use sweep::cmd_sweep;

/// Engine over the configured store and process workers.
pub fn build_engine(config: &StagegateConfig) -> Result<Arc<Engine>> {
    let store = open_store(config)?;
    let workers = Workers::from_config(&config.toml, &config.project_dir)?;
    let engine = Engine::new(store, workers, config.toml.to_engine_settings())
        .with_event_buffer(config.toml.server.event_buffer);
    Ok(Arc::new(engine))
}
