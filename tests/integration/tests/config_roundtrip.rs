//! Config save/load roundtrip integration tests.

use shardlink_core::config::{Backpressure, BindMode, BufferOverflow, Config};
use shardlink_core::SecretString;
use std::path::Path;
use tempfile::TempDir;

#[test]
fn test_config_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shardlink.json5");

    let config = Config::default();
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.server.port, config.server.port);
    assert_eq!(loaded.server.bind, config.server.bind);
    assert_eq!(
        loaded.sessions.resume_timeout_secs,
        config.sessions.resume_timeout_secs
    );
    assert_eq!(loaded.bus.backpressure, Backpressure::Unbounded);
}

#[test]
fn test_config_modify_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("shardlink.json5");

    let mut config = Config::default();
    config.server.bind = BindMode::Lan;
    config.server.password = SecretString::new("pw");
    config.sessions.max_buffered_frames = Some(128);
    config.sessions.overflow = BufferOverflow::Expire;
    config.bus.backpressure = Backpressure::DropNewest { capacity: 32 };
    config.subscriptions.max_attempts = Some(5);
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.server.bind, BindMode::Lan);
    assert!(loaded.server.password.matches("pw"));
    assert_eq!(loaded.sessions.max_buffered_frames, Some(128));
    assert_eq!(loaded.sessions.overflow, BufferOverflow::Expire);
    assert_eq!(loaded.bus.backpressure, Backpressure::DropNewest { capacity: 32 });
    assert_eq!(loaded.subscriptions.max_attempts, Some(5));
    assert!(loaded.validate().is_ok());
    assert!(!dir.path().join("nested").join("shardlink.tmp").exists());
}

#[test]
fn test_config_load_nonexistent() {
    let result = Config::load(Path::new("/nonexistent/shardlink.json5"));
    assert!(result.is_err());
}

#[test]
fn test_config_parse_invalid() {
    assert!(Config::parse("not valid json").is_err());
}
