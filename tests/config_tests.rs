//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use persona_relay::config::RelayConfig;
use persona_relay::error::Error;
use persona_relay::session::{GroupScope, SessionStrategy};

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("relay.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}

fn relay_cmd() -> Command {
    let mut cmd = Command::cargo_bin("persona-relay").unwrap();
    cmd.env_remove("PERSONA_RELAY_CONFIG");
    cmd
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_empty_config_uses_defaults() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    let config = RelayConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.server.route_prefix, "/ws/llm");
    assert_eq!(config.session.strategy, SessionStrategy::UserScopedAutocreate);
    assert_eq!(config.session.group_scope, GroupScope::PersonaUser);
    assert!(config.session.fan_out);
    assert!(config.persona_seed.url.is_none());
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[server]
bind_addr = "0.0.0.0:9001"
route_prefix = "/chat"
outbound_queue = 8
worker_threads = 2

[auth]
jwt_secret = "file-secret"
leeway_secs = 5
token_ttl_secs = 600

[completion]
base_url = "https://llm.example.com"
timeout_secs = 30
multi_party_timeout_secs = 90
max_retries = 0
max_iterations = 7

[session]
strategy = "strict_persona_validation"
group_scope = "persona"
fan_out = false

[storage]
database = "/tmp/persona-relay-test.db"

[persona_seed]
url = "http://seed.example.com/get_all_personas/"
owner_handle = "curator"
refresh_interval_secs = 0

[logging]
level = "debug"
json_format = true
"#,
    );

    let config = RelayConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.bind_addr().unwrap().port(), 9001);
    assert_eq!(config.server.route_prefix, "/chat");
    assert_eq!(config.require_jwt_secret().unwrap(), "file-secret");
    assert_eq!(config.completion.max_iterations, 7);
    assert_eq!(config.session.strategy, SessionStrategy::StrictPersonaValidation);
    assert_eq!(config.session.group_scope, GroupScope::Persona);
    assert!(!config.session.fan_out);
    assert_eq!(config.persona_seed.owner_handle, "curator");
    assert_eq!(config.database_path(), PathBuf::from("/tmp/persona-relay-test.db"));
}

#[test]
fn test_missing_secret_only_fails_when_required() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[server]\n");

    let config = RelayConfig::load(Some(fixture.path())).unwrap();
    assert!(matches!(
        config.require_jwt_secret(),
        Err(Error::ConfigValidation { .. })
    ));
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

fn assert_invalid(content: &str, field: &str) {
    let fixture = ConfigFixture::new();
    fixture.write_config(content);

    match RelayConfig::load(Some(fixture.path())) {
        Err(Error::ConfigValidation { field: Some(f), .. }) => assert_eq!(f, field),
        other => panic!("expected validation failure on {}, got {:?}", field, other),
    }
}

#[test]
fn test_invalid_bind_addr() {
    assert_invalid("[server]\nbind_addr = \"not an address\"\n", "server.bind_addr");
}

#[test]
fn test_invalid_route_prefix() {
    assert_invalid("[server]\nroute_prefix = \"ws/llm\"\n", "server.route_prefix");
}

#[test]
fn test_invalid_completion_url() {
    assert_invalid(
        "[completion]\nbase_url = \"ftp://llm.example.com\"\n",
        "completion.base_url",
    );
}

#[test]
fn test_invalid_max_iterations() {
    assert_invalid("[completion]\nmax_iterations = 0\n", "completion.max_iterations");
}

#[test]
fn test_invalid_seed_url() {
    assert_invalid("[persona_seed]\nurl = \"seed.example.com\"\n", "persona_seed.url");
}

#[test]
fn test_invalid_log_level() {
    assert_invalid("[logging]\nlevel = \"chatty\"\n", "logging.level");
}

#[test]
fn test_unknown_strategy_is_a_parse_error() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[session]\nstrategy = \"sometimes\"\n");

    assert!(matches!(
        RelayConfig::load(Some(fixture.path())),
        Err(Error::ConfigParse { .. })
    ));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[server\nbind_addr = \"127.0.0.1:8001\"\n");

    relay_cmd()
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parse"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Variable Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_completion_url() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[completion]\nbase_url = \"http://file.example.com\"\n");

    relay_cmd()
        .args(["config", "show", "--config", fixture.path()])
        .env("PERSONA_RELAY_COMPLETION_URL", "http://env.example.com")
        .assert()
        .success()
        .stdout(predicate::str::contains("http://env.example.com"))
        .stdout(predicate::str::contains("http://file.example.com").not());
}

#[test]
fn test_env_override_session() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    relay_cmd()
        .args(["config", "show", "--config", fixture.path()])
        .env("PERSONA_RELAY_SESSION_STRATEGY", "echo")
        .env("PERSONA_RELAY_FAN_OUT", "false")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo_only_stub"))
        .stdout(predicate::str::contains("fan_out = false"));
}

#[test]
fn test_env_secret_is_redacted() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    relay_cmd()
        .args(["config", "show", "--config", fixture.path()])
        .env("PERSONA_RELAY_JWT_SECRET", "from-env")
        .assert()
        .success()
        .stdout(predicate::str::contains("<redacted>"))
        .stdout(predicate::str::contains("from-env").not());
}

// ─────────────────────────────────────────────────────────────────
// Path Expansion Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_tilde_expansion() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[storage]\ndatabase = \"~/relay-test/relay.db\"\n");

    let output = relay_cmd()
        .args(["config", "show", "--config", fixture.path()])
        .env_remove("PERSONA_RELAY_DATABASE")
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    assert!(!stdout.contains("database = \"~"));
    assert!(stdout.contains("relay-test/relay.db"));
}
