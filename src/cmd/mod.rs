//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `generate` | `Generate`       |
//! | `validate` | `Validate`       |
//! | `config`   | `Config`         |

pub mod config;
pub mod generate;
pub mod serve;
pub mod validate;

pub use config::cmd_config;
pub use generate::{GenerateArgs, cmd_generate};
pub use serve::cmd_serve;
pub use validate::cmd_validate;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;

use super::Cli;
use tfgen::config::TfgenConfig;

/// Load configuration and start logging. The guard must outlive the command.
pub(crate) fn load_config(cli: &Cli) -> Result<(TfgenConfig, Option<WorkerGuard>)> {
    let config = TfgenConfig::load(cli.config_dir.clone())?;
    let guard = tfgen::logging::init(&config.toml.logging, cli.verbose)?;
    Ok((config, guard))
}
