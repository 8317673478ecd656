//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::{LogFormat, RuntimeEnv};
use crate::{MeshError, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `debug` with the debug
/// toggle and `info` without it.
pub fn init(env: &RuntimeEnv) -> Result<()> {
    let default_level = if env.debug { "zipmesh=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match env.log_format {
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => {
            registry.with(fmt::layer().json().with_current_span(false).flatten_event(true)).try_init()
        }
    };
    installed.map_err(|e| MeshError::config(format!("failed to install log subscriber: {e}")))
}
