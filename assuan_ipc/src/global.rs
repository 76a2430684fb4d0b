//! Process-wide defaults.
//!
//! A single registry holds the hook table, log prefix and error source that
//! new contexts start from. It is written at most once, before the first
//! context is created; afterwards it is read-only.

use std::sync::{Arc, OnceLock};

use assuan_utils::config::Config;
use tracing::debug;

use crate::error::{Error, ErrorSource, Result};
use crate::hooks::{NativeHooks, SystemHooks};

static GLOBAL: OnceLock<GlobalConfig> = OnceLock::new();

/// Defaults applied to every context that does not override them.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub hooks: Arc<dyn SystemHooks>,
    pub log_prefix: String,
    pub error_source: ErrorSource,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            hooks: Arc::new(NativeHooks),
            log_prefix: "assuan".to_string(),
            error_source: ErrorSource::ASSUAN,
        }
    }
}

impl GlobalConfig {
    /// Defaults taken from the `[protocol]` section of a configuration.
    pub fn from_config(config: &Config) -> Self {
        GlobalConfig {
            log_prefix: config.protocol.log_prefix.clone(),
            error_source: ErrorSource::new(config.protocol.error_source),
            ..GlobalConfig::default()
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SystemHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Install the process-wide defaults.
///
/// Must be called before any context is created. Fails if the registry was
/// already written or already read.
pub fn install(config: GlobalConfig) -> Result<()> {
    let prefix = config.log_prefix.clone();
    GLOBAL
        .set(config)
        .map_err(|_| Error::General("global configuration already in use".to_string()))?;
    debug!(target: "assuan::ctx", prefix = %prefix, "installed global configuration");
    Ok(())
}

/// The active process-wide defaults. The first call freezes the registry.
pub fn current() -> &'static GlobalConfig {
    GLOBAL.get_or_init(GlobalConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_fails() {
        // Either this call or an earlier `current()` froze the registry.
        let _ = install(GlobalConfig::default());
        assert!(install(GlobalConfig::default()).is_err());
        assert!(!current().log_prefix.is_empty());
    }

    #[test]
    fn from_config_copies_protocol_section() {
        let mut config = Config::default();
        config.protocol.log_prefix = "agent".to_string();
        config.protocol.error_source = 4;

        let global = GlobalConfig::from_config(&config);
        assert_eq!(global.log_prefix, "agent");
        assert_eq!(global.error_source, ErrorSource::GPGAGENT);
    }
}
