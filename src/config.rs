//! Configuration system for persona-relay
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (PERSONA_RELAY_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::{GroupScope, SessionStrategy};

/// Main relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket listener settings
    pub server: ServerSettings,

    /// Access token verification
    pub auth: AuthSettings,

    /// Remote completion service
    pub completion: CompletionSettings,

    /// Per-connection behavior
    pub session: SessionSettings,

    /// Conversation log database
    pub storage: StorageSettings,

    /// External persona seed source
    pub persona_seed: PersonaSeedSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// WebSocket listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to listen on
    pub bind_addr: String,

    /// Path prefix in front of the persona name
    pub route_prefix: String,

    /// Outbound frames buffered per connection before fan-out drops them
    pub outbound_queue: usize,

    /// Tokio worker threads (0 = number of CPUs, capped at 8)
    pub worker_threads: usize,
}

/// Access token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 shared secret used to verify access tokens
    #[serde(skip_serializing_if = "String::is_empty")]
    pub jwt_secret: String,

    /// Clock skew tolerated on expiry checks
    pub leeway_secs: u64,

    /// Lifetime of tokens minted by `token issue`
    pub token_ttl_secs: u64,
}

/// Completion service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    /// Base URL of the completion service
    pub base_url: String,

    /// Bound on each single-turn call (also each two-party turn)
    pub timeout_secs: u64,

    /// Bound on the multi-party round-robin call
    pub multi_party_timeout_secs: u64,

    /// Maximum retries on transient failures
    pub max_retries: u32,

    /// Upper bound accepted for `iterations`
    pub max_iterations: u32,
}

/// Session behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Persona admission strategy
    pub strategy: SessionStrategy,

    /// Whether group keys include the user handle
    pub group_scope: GroupScope,

    /// Broadcast successful results to the other members of the group
    pub fan_out: bool,
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database file
    pub database: String,
}

/// Persona seed source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaSeedSettings {
    /// Seed endpoint (unset = no synchronization)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// User that owns synchronized personas (created if missing)
    pub owner_handle: String,

    /// Seconds between refreshes (0 = sync once at startup)
    pub refresh_interval_secs: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8001".to_string(),
            route_prefix: "/ws/llm".to_string(),
            outbound_queue: 64,
            worker_threads: 0,
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: 30,
            token_ttl_secs: 3600,
        }
    }
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            timeout_secs: 120,
            multi_party_timeout_secs: 600,
            max_retries: 2,
            max_iterations: 20,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            strategy: SessionStrategy::UserScopedAutocreate,
            group_scope: GroupScope::PersonaUser,
            fan_out: true,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database: "~/.persona-relay/relay.db".to_string(),
        }
    }
}

impl Default for PersonaSeedSettings {
    fn default() -> Self {
        Self {
            url: None,
            owner_handle: "admin".to_string(),
            refresh_interval_secs: 300,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl CompletionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn multi_party_timeout(&self) -> Duration {
        Duration::from_secs(self.multi_party_timeout_secs)
    }
}

impl RelayConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
            config = toml::from_str(&content)
                .map_err(|e| Error::config_parse(format!("{}: {}", path.display(), e), e))?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            return if path.exists() {
                Ok(Some(path))
            } else {
                Err(Error::config_not_found(path))
            };
        }

        let search_paths = [
            PathBuf::from("persona-relay.toml"),
            PathBuf::from("config.toml"),
            dirs::config_dir()
                .map(|p| p.join("persona-relay").join("relay.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".persona-relay").join("relay.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/persona-relay/relay.toml"),
        ];

        for path in &search_paths {
            if path.is_file() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Server
        env_string("PERSONA_RELAY_BIND_ADDR", &mut self.server.bind_addr);
        env_string("PERSONA_RELAY_ROUTE_PREFIX", &mut self.server.route_prefix);
        env_parse("PERSONA_RELAY_WORKER_THREADS", &mut self.server.worker_threads);

        // Auth
        env_string("PERSONA_RELAY_JWT_SECRET", &mut self.auth.jwt_secret);
        env_parse("PERSONA_RELAY_TOKEN_TTL_SECS", &mut self.auth.token_ttl_secs);

        // Completion service
        env_string("PERSONA_RELAY_COMPLETION_URL", &mut self.completion.base_url);
        env_parse("PERSONA_RELAY_COMPLETION_TIMEOUT_SECS", &mut self.completion.timeout_secs);
        env_parse(
            "PERSONA_RELAY_MULTI_PARTY_TIMEOUT_SECS",
            &mut self.completion.multi_party_timeout_secs,
        );
        env_parse("PERSONA_RELAY_MAX_RETRIES", &mut self.completion.max_retries);
        env_parse("PERSONA_RELAY_MAX_ITERATIONS", &mut self.completion.max_iterations);

        // Session
        env_parse("PERSONA_RELAY_SESSION_STRATEGY", &mut self.session.strategy);
        env_parse("PERSONA_RELAY_GROUP_SCOPE", &mut self.session.group_scope);
        env_bool("PERSONA_RELAY_FAN_OUT", &mut self.session.fan_out);

        // Storage
        env_string("PERSONA_RELAY_DATABASE", &mut self.storage.database);

        // Persona seed
        if let Ok(val) = std::env::var("PERSONA_RELAY_SEED_URL") {
            self.persona_seed.url = if val.is_empty() { None } else { Some(val) };
        }
        env_parse(
            "PERSONA_RELAY_SEED_REFRESH_SECS",
            &mut self.persona_seed.refresh_interval_secs,
        );

        // Logging
        env_string("PERSONA_RELAY_LOG_LEVEL", &mut self.logging.level);
        if let Ok(val) = std::env::var("PERSONA_RELAY_LOG_FILE") {
            self.logging.file = Some(val);
        }
        env_bool("PERSONA_RELAY_LOG_JSON", &mut self.logging.json_format);
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.database = expand_path(&self.storage.database);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;

        if !self.server.route_prefix.starts_with('/') {
            return Err(Error::config_field_invalid(
                "server.route_prefix",
                "route_prefix must start with '/'",
            ));
        }
        if self.server.outbound_queue == 0 {
            return Err(Error::config_field_invalid(
                "server.outbound_queue",
                "outbound_queue must be at least 1",
            ));
        }

        if !is_http_url(&self.completion.base_url) {
            return Err(Error::config_field_invalid(
                "completion.base_url",
                "base_url must start with http:// or https://",
            ));
        }
        if self.completion.timeout_secs == 0 || self.completion.multi_party_timeout_secs == 0 {
            return Err(Error::config_field_invalid(
                "completion.timeout_secs",
                "completion timeouts must be greater than zero",
            ));
        }
        if self.completion.max_iterations == 0 {
            return Err(Error::config_field_invalid(
                "completion.max_iterations",
                "max_iterations must be at least 1",
            ));
        }

        if let Some(ref url) = self.persona_seed.url {
            if !is_http_url(url) {
                return Err(Error::config_field_invalid(
                    "persona_seed.url",
                    "seed url must start with http:// or https://",
                ));
            }
        }
        if self.persona_seed.owner_handle.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "persona_seed.owner_handle",
                "owner_handle cannot be empty",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Checks needed only by commands that verify or mint tokens
    pub fn require_jwt_secret(&self) -> Result<&str> {
        if self.auth.jwt_secret.is_empty() {
            return Err(Error::config_field_invalid(
                "auth.jwt_secret",
                "auth.jwt_secret must be set (or PERSONA_RELAY_JWT_SECRET)",
            ));
        }
        Ok(&self.auth.jwt_secret)
    }

    /// Parsed listen address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server.bind_addr.parse().map_err(|e| {
            Error::config_field_invalid(
                "server.bind_addr",
                format!("Invalid bind address '{}': {}", self.server.bind_addr, e),
            )
        })
    }

    /// Database file as a PathBuf
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.database)
    }
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(val) = std::env::var(name) {
        *target = val;
    }
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(val) = std::env::var(name) {
        *target = val.to_lowercase() == "true" || val == "1";
    }
}

/// Unparseable values are ignored and the previous value kept
fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".persona-relay")
                .join("relay.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# persona-relay configuration

[server]
# Address the WebSocket listener binds to
bind_addr = "127.0.0.1:8001"

# Clients connect to <route_prefix>/<persona_name>?token=<access token>
route_prefix = "/ws/llm"

# Outbound frames buffered per connection
outbound_queue = 64

# Tokio worker threads (0 = number of CPUs, capped at 8)
worker_threads = 0

[auth]
# HS256 secret shared with the token issuer (required to serve)
# jwt_secret = "change-me"

# Clock skew tolerated when checking expiry, in seconds
leeway_secs = 30

# Lifetime of tokens minted by 'persona-relay token issue'
token_ttl_secs = 3600

[completion]
# Completion service base URL (serves /generate and /generate_multi_llm)
base_url = "http://127.0.0.1:5000"

# Bound on each single-turn call in seconds
timeout_secs = 120

# Bound on the multi-party round-robin call in seconds
multi_party_timeout_secs = 600

# Retries on 429, 5xx and connection failures
max_retries = 2

# Largest accepted 'iterations' value
max_iterations = 20

[session]
# strict_persona_validation | user_scoped_autocreate | echo_only_stub
strategy = "user_scoped_autocreate"

# persona_user (one group per persona and user) | persona (shared per persona)
group_scope = "persona_user"

# Broadcast results to the other connections in the same group
fan_out = true

[storage]
# SQLite database holding users, personas and the conversation log
database = "~/.persona-relay/relay.db"

[persona_seed]
# Endpoint returning {"personas": [{"name": ..., "personality_traits": {...}}]}
# url = "http://127.0.0.1:8000/get_all_personas/"

# User that owns synchronized personas
owner_handle = "admin"

# Seconds between refreshes (0 = once at startup)
refresh_interval_secs = 300

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.persona-relay/logs/relay.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.server.route_prefix, "/ws/llm");
        assert_eq!(config.completion.timeout_secs, 120);
        assert_eq!(config.session.strategy, SessionStrategy::UserScopedAutocreate);
        assert_eq!(config.session.group_scope, GroupScope::PersonaUser);
        assert!(config.persona_seed.url.is_none());
    }

    #[test]
    fn test_env_override() {
        env::set_var("PERSONA_RELAY_COMPLETION_URL", "http://llm.internal:5000");
        env::set_var("PERSONA_RELAY_SESSION_STRATEGY", "strict_persona_validation");
        env::set_var("PERSONA_RELAY_MAX_ITERATIONS", "not-a-number");

        let mut config = RelayConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.completion.base_url, "http://llm.internal:5000");
        assert_eq!(config.session.strategy, SessionStrategy::StrictPersonaValidation);
        assert_eq!(config.completion.max_iterations, 20);

        env::remove_var("PERSONA_RELAY_COMPLETION_URL");
        env::remove_var("PERSONA_RELAY_SESSION_STRATEGY");
        env::remove_var("PERSONA_RELAY_MAX_ITERATIONS");
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_base_url() {
        let mut config = RelayConfig::default();
        config.completion.base_url = "ftp://llm".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_bind_addr() {
        let mut config = RelayConfig::default();
        config.server.bind_addr = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_route_prefix() {
        let mut config = RelayConfig::default();
        config.server.route_prefix = "ws/llm".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_iterations() {
        let mut config = RelayConfig::default();
        config.completion.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = RelayConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_require_jwt_secret() {
        let mut config = RelayConfig::default();
        assert!(config.require_jwt_secret().is_err());
        config.auth.jwt_secret = "s3cret".to_string();
        assert_eq!(config.require_jwt_secret().unwrap(), "s3cret");
    }

    #[test]
    fn test_path_expansion() {
        let mut config = RelayConfig::default();
        config.storage.database = "~/relay/test.db".to_string();
        config.expand_paths();
        assert!(!config.storage.database.contains('~'));
    }

    #[test]
    fn test_generated_default_parses() {
        let config: RelayConfig = toml::from_str(&generate_default_config()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_addr, "127.0.0.1:8001");
        assert!(config.session.fan_out);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[server]
bind_addr = "0.0.0.0:9000"

[auth]
jwt_secret = "abc"

[completion]
base_url = "http://10.0.0.5:5000"
multi_party_timeout_secs = 900

[session]
strategy = "echo_only_stub"
group_scope = "persona"
fan_out = false

[persona_seed]
url = "http://django:8000/get_all_personas/"
refresh_interval_secs = 0
"#;

        let config: RelayConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.server.route_prefix, "/ws/llm");
        assert_eq!(config.auth.jwt_secret, "abc");
        assert_eq!(config.completion.multi_party_timeout_secs, 900);
        assert_eq!(config.completion.timeout_secs, 120);
        assert_eq!(config.session.strategy, SessionStrategy::EchoOnlyStub);
        assert_eq!(config.session.group_scope, GroupScope::Persona);
        assert!(!config.session.fan_out);
        assert_eq!(config.persona_seed.refresh_interval_secs, 0);
    }
}
