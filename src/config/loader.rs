//! Configuration Loader
//!
//! Merges defaults, an optional file and environment overrides with the `config` crate.

use std::path::Path;

use tracing::debug;

use super::SchedulerConfig;
use crate::constants::system;
use crate::error::Result;

impl SchedulerConfig {
    /// Load configuration from defaults, an optional file and `ACQ_SCHEDULER_*` variables
    ///
    /// The file format is inferred from its extension (TOML, YAML or JSON).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            debug!("Loading scheduler configuration from {}", path.display());
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(system::ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true),
        );

        let config: SchedulerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            default_unit_name = %config.default_unit_name,
            interleaved_dispatch = config.interleaved_dispatch,
            worker_thread_name = %config.worker_thread_name,
            "Scheduler configuration loaded"
        );

        Ok(config)
    }
}
