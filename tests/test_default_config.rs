//! The shipped config/default.toml must load and match the built-in defaults.

use std::path::Path;

use aether_marketplace::config::{self, Config};

#[test]
fn test_default_config_file_exists() {
    assert!(
        std::fs::metadata("config/default.toml").is_ok(),
        "config/default.toml missing"
    );
}

#[test]
fn test_default_config_matches_builtin_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().to_string_lossy().into_owned();
    let loaded = config::load_from(Path::new("config/default.toml"), Some(&work_dir), None).unwrap();
    let builtin = Config::with_work_dir(dir.path());

    assert_eq!(loaded.agent_name, builtin.agent_name);
    assert_eq!(loaded.log_level, builtin.log_level);
    assert_eq!(loaded.hub, builtin.hub);
    assert_eq!(loaded.provider, builtin.provider);
    assert_eq!(loaded.consumer, builtin.consumer);
    assert_eq!(loaded.conversation, builtin.conversation);
    assert!(loaded.identity_dir.is_none());
}
