//! Configuration loading with env-var overrides.
//!
//! Reads TOML files, supports `[meta] base = "..."` inheritance chains,
//! and applies `AETHER_WORK_DIR` and `AETHER_LOG_LEVEL` env overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MarketplaceError;

use super::raw::RawConfig;
use super::types::*;

/// Deep-merge two TOML values.
/// Tables are merged recursively: the overlay only needs to specify keys that
/// differ from the base. For every other type (string, integer, array, …)
/// the overlay value replaces the base value wholesale.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                let merged = match base_tbl.remove(&key) {
                    Some(base_val) => merge_toml(base_val, ov_val),
                    None => ov_val,
                };
                base_tbl.insert(key, merged);
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file, follow any `[meta] base = "..."` chain, and return the
/// fully merged `toml::Value`. `visited` carries canonicalized paths already
/// seen in this chain so circular references are caught early.
fn load_raw_merged(
    path: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<toml::Value, MarketplaceError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(MarketplaceError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| MarketplaceError::Config(format!("cannot read {}: {e}", path.display())))?;

    let overlay_val: toml::Value = toml::from_str(&raw)
        .map_err(|e| MarketplaceError::Config(format!("parse error in {}: {e}", path.display())))?;

    if let Some(base_str) = overlay_val
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
    {
        let base_path = if Path::new(base_str).is_absolute() {
            PathBuf::from(base_str)
        } else {
            path.parent().unwrap_or(Path::new(".")).join(base_str)
        };
        let base_val = load_raw_merged(&base_path, visited)?;
        Ok(merge_toml(base_val, overlay_val))
    } else {
        Ok(overlay_val)
    }
}

/// Load config from the given path, or `config/default.toml`, then apply env-var overrides.
/// If no path is given and `config/default.toml` does not exist, returns built-in defaults.
pub fn load(config_path: Option<&str>) -> Result<Config, MarketplaceError> {
    let work_dir_override = env::var("AETHER_WORK_DIR").ok();
    let log_level_override = env::var("AETHER_LOG_LEVEL").ok();

    if let Some(path) = config_path {
        return load_from(
            Path::new(path),
            work_dir_override.as_deref(),
            log_level_override.as_deref(),
        );
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        load_from(
            default_path,
            work_dir_override.as_deref(),
            log_level_override.as_deref(),
        )
    } else {
        let work_dir_str = work_dir_override.unwrap_or_else(|| "~/.aether".to_string());
        let mut config = Config::with_work_dir(expand_home(&work_dir_str));
        if let Some(level) = log_level_override {
            config.log_level = level;
        }
        Ok(config)
    }
}

/// Internal loader: accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, MarketplaceError> {
    let mut visited = HashSet::new();
    let merged = load_raw_merged(path, &mut visited)?;

    let parsed: RawConfig = merged
        .try_into()
        .map_err(|e| MarketplaceError::Config(format!("parse error in {}: {e}", path.display())))?;

    let m = parsed.marketplace;

    let work_dir_str = work_dir_override.unwrap_or(&m.work_dir).to_string();
    let work_dir = expand_home(&work_dir_str);
    let log_level = log_level_override.unwrap_or(&m.log_level).to_string();
    let identity_dir = m.identity_dir.map(|dir| {
        let path = PathBuf::from(dir);
        if path.is_absolute() {
            path
        } else {
            work_dir.join(path)
        }
    });
    let log_file = m.log_file.map(|f| expand_home(&f));

    for (name, value) in [
        ("hub.bus_buffer", parsed.hub.bus_buffer),
        ("hub.inbox_buffer", parsed.hub.inbox_buffer),
        ("hub.conversation_buffer", parsed.hub.conversation_buffer),
        ("provider.max_concurrent_conversations", parsed.provider.max_concurrent_conversations),
        ("conversation.history_cap", parsed.conversation.history_cap),
        ("conversation.transcript_cap", parsed.conversation.transcript_cap),
    ] {
        if value == 0 {
            return Err(MarketplaceError::Config(format!("{name} must be at least 1")));
        }
    }
    for (name, secs) in [
        ("provider.idle_timeout_secs", parsed.provider.idle_timeout_secs),
        ("consumer.response_timeout_secs", parsed.consumer.response_timeout_secs),
    ] {
        if secs == 0 {
            return Err(MarketplaceError::Config(format!("{name} must be at least 1")));
        }
    }

    Ok(Config {
        agent_name: m.agent_name,
        work_dir,
        identity_dir,
        log_level,
        log_file,
        hub: HubConfig {
            bus_buffer: parsed.hub.bus_buffer,
            inbox_buffer: parsed.hub.inbox_buffer,
            conversation_buffer: parsed.hub.conversation_buffer,
        },
        provider: ProviderConfig {
            max_concurrent_conversations: parsed.provider.max_concurrent_conversations,
            auto_quote: parsed.provider.auto_quote,
            idle_timeout: Duration::from_secs(parsed.provider.idle_timeout_secs),
        },
        consumer: ConsumerConfig {
            response_timeout: Duration::from_secs(parsed.consumer.response_timeout_secs),
            max_auto_accept_price: parsed.consumer.max_auto_accept_price,
        },
        conversation: ConversationConfig {
            history_cap: parsed.conversation.history_cap,
            persist_transcripts: parsed.conversation.persist_transcripts,
            transcript_cap: parsed.conversation.transcript_cap,
        },
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const MINIMAL_TOML: &str = r#"
[marketplace]
agent_name = "test-agent"
work_dir = "~/.aether"
log_level = "info"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_basic_config() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.agent_name, "test-agent");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.hub, HubConfig::default());
        assert_eq!(cfg.provider, ProviderConfig::default());
        assert_eq!(cfg.consumer, ConsumerConfig::default());
        assert!(!cfg.conversation.persist_transcripts);
    }

    #[test]
    fn parse_full_sections() {
        let f = write_toml(
            r#"
[marketplace]
agent_name = "full"
work_dir = "/tmp/aether-full"
identity_dir = "keys"
log_level = "debug"

[hub]
bus_buffer = 8
inbox_buffer = 4
conversation_buffer = 2

[provider]
max_concurrent_conversations = 3
auto_quote = false
idle_timeout_secs = 5

[consumer]
response_timeout_secs = 7
max_auto_accept_price = 100

[conversation]
history_cap = 10
persist_transcripts = true
transcript_cap = 20
"#,
        );
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.identity_dir, Some(PathBuf::from("/tmp/aether-full/keys")));
        assert_eq!(cfg.hub.conversation_buffer, 2);
        assert_eq!(cfg.provider.max_concurrent_conversations, 3);
        assert!(!cfg.provider.auto_quote);
        assert_eq!(cfg.provider.idle_timeout, Duration::from_secs(5));
        assert_eq!(cfg.consumer.response_timeout, Duration::from_secs(7));
        assert_eq!(cfg.consumer.max_auto_accept_price, Some(100));
        assert!(cfg.conversation.persist_transcripts);
        assert_eq!(cfg.conversation.transcript_cap, 20);
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let f = write_toml(&format!("{MINIMAL_TOML}\n[hub]\nbus_buffer = 0\n"));
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("hub.bus_buffer"));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let f = write_toml(&format!("{MINIMAL_TOML}\n[provider]\nidle_timeout_secs = 0\n"));
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("provider.idle_timeout_secs"));

        let f = write_toml(&format!("{MINIMAL_TOML}\n[consumer]\nresponse_timeout_secs = 0\n"));
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("consumer.response_timeout_secs"));
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/.aether");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with(".aether"));
    }

    #[test]
    fn absolute_path_unchanged() {
        assert_eq!(expand_home("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.toml"), None, None);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("config error"));
    }

    #[test]
    fn env_overrides_apply() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("/tmp/test-override"), Some("debug")).unwrap();
        assert_eq!(cfg.work_dir, PathBuf::from("/tmp/test-override"));
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn base_chain_merges_tables() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("base.toml"),
            format!("{MINIMAL_TOML}\n[provider]\nmax_concurrent_conversations = 2\nauto_quote = false\n"),
        )
        .unwrap();
        fs::write(
            dir.path().join("overlay.toml"),
            "[meta]\nbase = \"base.toml\"\n\n[marketplace]\nagent_name = \"overlay\"\n\n[provider]\nauto_quote = true\n",
        )
        .unwrap();

        let cfg = load_from(&dir.path().join("overlay.toml"), None, None).unwrap();
        assert_eq!(cfg.agent_name, "overlay");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.provider.max_concurrent_conversations, 2);
        assert!(cfg.provider.auto_quote);
    }

    #[test]
    fn circular_base_is_detected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.toml"), "[meta]\nbase = \"b.toml\"\n").unwrap();
        fs::write(dir.path().join("b.toml"), "[meta]\nbase = \"a.toml\"\n").unwrap();
        let err = load_from(&dir.path().join("a.toml"), None, None).unwrap_err();
        assert!(err.to_string().contains("circular base reference"));
    }
}
