use std::collections::HashMap;
use std::path::{Path, PathBuf};

use snipbox::config::{Config, ConfigError};

use super::FIXTURES_PATH;

fn fixture_config(name: &str) -> PathBuf {
    Path::new(FIXTURES_PATH).join("configs").join(name)
}

#[test]
fn test_load_valid_config() {
    let config = Config::from_file(fixture_config("valid_full.toml")).expect("Failed to load config");

    assert!(config.languages.contains_key("python"));
    assert!(config.languages.contains_key("ruby"));
    assert_eq!(config.limits.timeout_secs, 5.0);
    assert_eq!(config.limits.memory_limit_mb, 256);
    assert_eq!(config.limits.run_as, "65534");
    assert_eq!(config.rate_limit.max_requests, 20);
    assert_eq!(config.rate_limit.window_secs, 30);
    assert_eq!(config.sessions.workers, 8);
    assert_eq!(
        config.docker_socket.as_deref(),
        Some(Path::new("/var/run/docker.sock"))
    );

    let python = config.get_language("Python").unwrap();
    assert_eq!(python.run.command, ["python3", "-I", "{source}"]);
    assert_eq!(python.run.env.len(), 2);
}

#[test]
fn test_load_minimal_config() {
    let config =
        Config::from_file(fixture_config("valid_minimal.toml")).expect("Failed to load config");

    assert_eq!(config.languages.len(), 1);
    assert!(config.get_language("shell").is_ok());
    assert_eq!(config.limits.timeout_secs, 10.0);
    assert_eq!(config.limits.memory_limit_mb, 128);
    assert_eq!(config.limits.max_output_bytes, 65_536);
    assert_eq!(config.rate_limit.max_requests, 10);
}

#[test]
fn test_load_invalid_configs() {
    for name in [
        "invalid_empty_image.toml",
        "invalid_extension.toml",
        "invalid_empty_run_command.toml",
        "invalid_root_user.toml",
        "invalid_zero_timeout.toml",
    ] {
        let result = Config::from_file(fixture_config(name));
        assert!(result.is_err(), "{name} should be rejected");
    }
}

#[test]
fn test_load_missing_file() {
    let result = Config::from_file(fixture_config("does_not_exist.toml"));
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_environment_overrides_file() {
    let vars = HashMap::from([
        ("SNIPBOX_LIMITS__TIMEOUT_SECS".to_owned(), "3".to_owned()),
        ("SNIPBOX_LIMITS__MEMORY_LIMIT_MB".to_owned(), "64".to_owned()),
        ("SNIPBOX_SESSIONS__WORKERS".to_owned(), "2".to_owned()),
    ]);
    let path = fixture_config("valid_full.toml");
    let config = Config::load_from_vars(Some(&path), vars).expect("Failed to load config");

    assert_eq!(config.limits.timeout_secs, 3.0);
    assert_eq!(config.limits.memory_limit_mb, 64);
    assert_eq!(config.sessions.workers, 2);
    // Untouched keys keep the file's values
    assert_eq!(config.rate_limit.max_requests, 20);
}

#[test]
fn test_load_without_file_uses_embedded_defaults() {
    let config = Config::load_from_vars(None, HashMap::new()).expect("Failed to load config");

    assert_eq!(config.languages.len(), 2);
    assert_eq!(config.limits.timeout(), std::time::Duration::from_secs(10));
}

#[test]
fn test_invalid_environment_override() {
    let vars = HashMap::from([("SNIPBOX_SESSIONS__WORKERS".to_owned(), "0".to_owned())]);
    let result = Config::load_from_vars(None, vars);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}
