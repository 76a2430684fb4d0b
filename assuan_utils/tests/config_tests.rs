use assuan_utils::config::{Config, ConfigError, ConfigManager};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_emulated_socket_config() {
    let file = write_config(
        r#"
        log_level = "trace"

        [protocol]
        no_waitpid = true
        no_fixsignals = true

        [socket]
        path = "/tmp/S.emulated"
        emulate = true
        fd_passing = false
    "#,
    );

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "trace");
    assert!(config.protocol.no_waitpid);
    assert!(config.protocol.no_fixsignals);
    assert!(config.socket.emulate);
    assert!(!config.socket.fd_passing);
}

#[test]
fn test_emulate_alone_keeps_default_fd_passing() {
    let file = write_config(
        r#"
        [socket]
        emulate = true
    "#,
    );

    let config = Config::load(file.path()).expect("emulate without fd_passing should load");
    assert!(config.socket.emulate);
    // Left at its default; the emulated transport ignores it.
    assert!(config.socket.fd_passing);
}

#[test]
fn test_log_prefix_must_be_single_line() {
    let file = write_config(
        r#"
        [protocol]
        log_prefix = "two\nlines"
    "#,
    );

    match Config::load(file.path()) {
        Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "protocol.log_prefix"),
        other => panic!("Expected InvalidValue for protocol.log_prefix, got {:?}", other),
    }
}

#[test]
fn test_malformed_toml() {
    let file = write_config("log_level = [");
    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::TomlError(_))
    ));
}

#[test]
fn test_config_manager_reload() {
    let file = write_config(
        r#"
        [protocol]
        log_prefix = "first"
    "#,
    );

    let mut manager = ConfigManager::load(file.path()).unwrap();
    assert_eq!(manager.config().protocol.log_prefix, "first");
    assert_eq!(manager.config_path(), file.path());

    // Rewrite the file with modified content
    let mut rewrite = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(file.path())
        .unwrap();
    rewrite
        .write_all(b"[protocol]\nlog_prefix = \"second\"\nmax_inquire_len = 64\n")
        .unwrap();
    rewrite.flush().unwrap();

    manager.reload().unwrap();
    assert_eq!(manager.config().protocol.log_prefix, "second");
    assert_eq!(manager.config().protocol.max_inquire_len, 64);
}

#[test]
fn test_manager_save_as_roundtrip() {
    let mut manager = ConfigManager::new();
    manager.config_mut().protocol.convey_comments = true;
    manager.config_mut().logging.log_to_file = true;

    let file = NamedTempFile::new().unwrap();
    manager.save_as(file.path()).unwrap();

    let loaded = Config::load(file.path()).unwrap();
    assert_eq!(&loaded, manager.config());
}
