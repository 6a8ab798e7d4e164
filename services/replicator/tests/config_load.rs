use std::io::Write;

use replicator::config::{load_config_from_path, load_oauth2_credentials, Mode};

#[test]
fn loads_a_config_file_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
            schema_version = 1

            [process.replication]
            mode = "proxy"
            source = "node-b"
            server = "wss://peer.example.com/ws/replication"
            auth = "https://auth.example.com"
            provider = "internal"
            application = "replication-controller"
            oauth2 = "/etc/replctl/oauth2-internal.json"

            [database]
            url = "postgres://replctl@localhost/app"
            pool_min = 8
        "#
    )
    .unwrap();

    let cfg = load_config_from_path(file.path()).unwrap();
    assert_eq!(cfg.replication.mode, Mode::Proxy);
    assert_eq!(cfg.replication.source, "node-b");
    assert_eq!(cfg.database.pool_min, 8);
}

#[test]
fn loads_oauth2_credentials_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "key_id": "k1",
            "secret": "shared-secret",
            "issuer": "replication-controller",
            "audience": "https://auth.example.com",
            "token_endpoint": "https://auth.example.com/token"
        }}"#
    )
    .unwrap();

    let creds = load_oauth2_credentials(file.path().to_str().unwrap()).unwrap();
    assert_eq!(creds.key_id, "k1");
    assert_eq!(creds.token_endpoint, "https://auth.example.com/token");
}

#[test]
fn missing_config_file_is_an_io_error() {
    let err = load_config_from_path(std::path::Path::new("/nonexistent/replication.toml"))
        .unwrap_err();
    assert!(matches!(err, replicator::config::ConfigError::Io(_)));
}
