//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `AETHER_WORK_DIR` and `AETHER_LOG_LEVEL` env overrides.
//!
//! # Module layout
//!
//! - **types**: Public configuration structs consumed by the hub, provider
//!   and consumer (`Config`, `HubConfig`, `ProviderConfig`, …).
//! - **raw**: Raw TOML deserialization types. These mirror the file shape
//!   and use serde defaults; kept private.
//! - **load**: Loading logic: `merge_toml`, `load_raw_merged`, `load`,
//!   `load_from`, `expand_home`.

mod load;
mod raw;
mod types;

pub use load::{expand_home, load, load_from};
pub use types::*;

impl Config {
    /// Built-in defaults rooted at `work_dir`. Used when no config file is
    /// present, and by embedders that configure the SDK programmatically.
    pub fn with_work_dir(work_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            agent_name: "aether-agent".to_string(),
            work_dir: work_dir.into(),
            identity_dir: None,
            log_level: "info".to_string(),
            log_file: None,
            hub: HubConfig::default(),
            provider: ProviderConfig::default(),
            consumer: ConsumerConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

#[cfg(test)]
impl Config {
    /// Safe `Config` for unit tests: small buffers and short timeouts.
    pub fn test_default(work_dir: &std::path::Path) -> Self {
        let mut cfg = Self::with_work_dir(work_dir);
        cfg.agent_name = "test".into();
        cfg.hub.conversation_buffer = 8;
        cfg.consumer.response_timeout = std::time::Duration::from_secs(2);
        cfg.provider.idle_timeout = std::time::Duration::from_secs(2);
        cfg
    }
}
