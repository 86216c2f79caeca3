use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuillConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Public API location, used by clients to build request URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Public domain the API is reachable under
    #[serde(default)]
    pub domain: String,
    /// Whether clients should use https/wss
    #[serde(default = "default_true")]
    pub secure: bool,
    /// Local development mode: clients target host:port directly
    #[serde(default)]
    pub local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub api: ServerApiConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerApiConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Server sits behind a reverse proxy; trust X-Forwarded-For
    #[serde(default)]
    pub proxy: bool,
    /// Access key lifetime in seconds
    #[serde(default = "default_access_time")]
    pub access_time: u64,
    /// Refresh key lifetime in seconds
    #[serde(default = "default_refresh_time")]
    pub refresh_time: u64,
    /// Unexpired tokens a single user may hold
    #[serde(default = "default_max_tokens_per_user")]
    pub max_tokens_per_user: usize,
    /// Interval between background task runs, in seconds
    #[serde(default = "default_task_interval")]
    pub task_interval: u64,
    /// WebSocket ping interval in seconds
    #[serde(default = "default_ws_heartbeat")]
    pub ws_heartbeat: u64,
    /// Maximum WebSocket message size in KiB
    #[serde(default = "default_ws_max_message_size")]
    pub ws_max_message_size: usize,
    /// Messages allowed per connection per interval
    #[serde(default = "default_ws_message_limit")]
    pub ws_message_limit: usize,
    /// WebSocket message ratelimit window in seconds
    #[serde(default = "default_ws_message_interval")]
    pub ws_message_interval: u64,
    /// Seconds an unlocked cached resource may idle before eviction
    #[serde(default = "default_resource_grace")]
    pub resource_grace: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_database")]
    pub database: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            secure: true,
            local: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api: ServerApiConfig::default(),
            postgres: PostgresConfig::default(),
        }
    }
}

impl Default for ServerApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            proxy: false,
            access_time: default_access_time(),
            refresh_time: default_refresh_time(),
            max_tokens_per_user: default_max_tokens_per_user(),
            task_interval: default_task_interval(),
            ws_heartbeat: default_ws_heartbeat(),
            ws_max_message_size: default_ws_max_message_size(),
            ws_message_limit: default_ws_message_limit(),
            ws_message_interval: default_ws_message_interval(),
            resource_grace: default_resource_grace(),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_pg_port(),
            database: default_pg_database(),
            user: default_pg_user(),
            password: String::new(),
            min_pool_size: default_min_pool_size(),
            max_pool_size: default_max_pool_size(),
        }
    }
}

impl QuillConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        let api = &self.server.api;
        let pg = &self.server.postgres;

        if api.port == 0 {
            issues.push("ERROR: server.api.port must be between 1 and 65535, got 0.".to_string());
        }

        if api.access_time == 0 {
            issues.push("ERROR: server.api.access_time must be >= 1 second.".to_string());
        }
        if api.refresh_time <= api.access_time {
            issues.push(format!(
                "ERROR: server.api.refresh_time ({}) must exceed access_time ({}). \
                 A refresh key that dies with its access key can never be used.",
                api.refresh_time, api.access_time
            ));
        }

        if api.max_tokens_per_user == 0 {
            issues.push("ERROR: server.api.max_tokens_per_user must be >= 1.".to_string());
        }

        if api.task_interval == 0 {
            issues.push("ERROR: server.api.task_interval must be >= 1 second.".to_string());
        }

        if api.ws_heartbeat == 0 {
            issues.push("ERROR: server.api.ws_heartbeat must be >= 1 second.".to_string());
        }
        if api.ws_max_message_size == 0 {
            issues.push("ERROR: server.api.ws_max_message_size must be >= 1 KiB.".to_string());
        }
        if api.ws_message_limit == 0 {
            issues.push("ERROR: server.api.ws_message_limit must be >= 1.".to_string());
        }
        if api.ws_message_interval == 0 {
            issues.push("ERROR: server.api.ws_message_interval must be >= 1 second.".to_string());
        }

        if api.resource_grace < api.task_interval {
            issues.push(format!(
                "WARNING: server.api.resource_grace ({}) is shorter than task_interval ({}). \
                 Unlocked resources may be evicted on the first sweep after loading.",
                api.resource_grace, api.task_interval
            ));
        }

        if pg.min_pool_size > pg.max_pool_size {
            issues.push(format!(
                "ERROR: server.postgres.min_pool_size ({}) exceeds max_pool_size ({}).",
                pg.min_pool_size, pg.max_pool_size
            ));
        }
        if pg.max_pool_size == 0 {
            issues.push("ERROR: server.postgres.max_pool_size must be >= 1.".to_string());
        }

        if !self.api.local && self.api.domain.is_empty() {
            issues.push(
                "WARNING: api.domain is empty and api.local is false. \
                 Clients will not be able to resolve the API base URL."
                    .to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_access_time() -> u64 {
    900 // 15 minutes
}
fn default_refresh_time() -> u64 {
    86_400 // 24 hours
}
fn default_max_tokens_per_user() -> usize {
    5
}
fn default_task_interval() -> u64 {
    60
}
fn default_ws_heartbeat() -> u64 {
    30
}
fn default_ws_max_message_size() -> usize {
    64 // KiB
}
fn default_ws_message_limit() -> usize {
    30
}
fn default_ws_message_interval() -> u64 {
    1
}
fn default_resource_grace() -> u64 {
    900
}
fn default_pg_port() -> u16 {
    5432
}
fn default_pg_database() -> String {
    "quill".to_string()
}
fn default_pg_user() -> String {
    "quill".to_string()
}
fn default_min_pool_size() -> usize {
    1
}
fn default_max_pool_size() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: QuillConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.api.domain, "");
        assert!(config.api.secure);
        assert!(!config.api.local);

        assert_eq!(config.server.api.host, "127.0.0.1");
        assert_eq!(config.server.api.port, 8080);
        assert!(!config.server.api.proxy);
        assert_eq!(config.server.api.access_time, 900);
        assert_eq!(config.server.api.refresh_time, 86_400);
        assert_eq!(config.server.api.max_tokens_per_user, 5);
        assert_eq!(config.server.api.task_interval, 60);
        assert_eq!(config.server.api.ws_heartbeat, 30);
        assert_eq!(config.server.api.ws_max_message_size, 64);
        assert_eq!(config.server.api.ws_message_limit, 30);
        assert_eq!(config.server.api.ws_message_interval, 1);
        assert_eq!(config.server.api.resource_grace, 900);

        assert_eq!(config.server.postgres.host, "127.0.0.1");
        assert_eq!(config.server.postgres.port, 5432);
        assert_eq!(config.server.postgres.database, "quill");
        assert_eq!(config.server.postgres.user, "quill");
        assert_eq!(config.server.postgres.password, "");
        assert_eq!(config.server.postgres.min_pool_size, 1);
        assert_eq!(config.server.postgres.max_pool_size, 10);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let toml_str = r#"
[server.api]
port = 9000
access_time = 300

[server.postgres]
database = "quill_test"
"#;
        let config: QuillConfig = toml::from_str(toml_str).expect("partial config");
        assert_eq!(config.server.api.port, 9000);
        assert_eq!(config.server.api.access_time, 300);
        assert_eq!(config.server.api.refresh_time, 86_400);
        assert_eq!(config.server.postgres.database, "quill_test");
        assert_eq!(config.server.postgres.port, 5432);
    }

    #[test]
    fn default_trait_matches_empty_toml() {
        let from_toml: QuillConfig = toml::from_str("").unwrap();
        let api = ServerApiConfig::default();
        assert_eq!(api.port, from_toml.server.api.port);
        assert_eq!(api.access_time, from_toml.server.api.access_time);
        assert_eq!(api.refresh_time, from_toml.server.api.refresh_time);
        assert_eq!(api.resource_grace, from_toml.server.api.resource_grace);
        let pg = PostgresConfig::default();
        assert_eq!(pg.port, from_toml.server.postgres.port);
        assert_eq!(pg.max_pool_size, from_toml.server.postgres.max_pool_size);
    }

    fn valid_config() -> QuillConfig {
        let mut config: QuillConfig = toml::from_str("").unwrap();
        config.api.local = true;
        config
    }

    fn validate_issues(config: &QuillConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    #[test]
    fn validate_default_local_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.api.port = 0;
        assert!(has_error(&validate_issues(&config), "port"));
    }

    #[test]
    fn validate_refresh_must_outlive_access() {
        let mut config = valid_config();
        config.server.api.access_time = 600;
        config.server.api.refresh_time = 600;
        assert!(has_error(&validate_issues(&config), "refresh_time"));
    }

    #[test]
    fn validate_zero_max_tokens_is_error() {
        let mut config = valid_config();
        config.server.api.max_tokens_per_user = 0;
        assert!(has_error(&validate_issues(&config), "max_tokens_per_user"));
    }

    #[test]
    fn validate_pool_bounds() {
        let mut config = valid_config();
        config.server.postgres.min_pool_size = 20;
        config.server.postgres.max_pool_size = 10;
        assert!(has_error(&validate_issues(&config), "min_pool_size"));
    }

    #[test]
    fn validate_short_grace_is_warning_only() {
        let mut config = valid_config();
        config.server.api.resource_grace = 10;
        let issues = validate_issues(&config);
        assert!(issues.iter().any(|i| i.contains("resource_grace")));
        assert!(!issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_missing_domain_warns_when_not_local() {
        let mut config = valid_config();
        config.api.local = false;
        config.api.domain = String::new();
        let issues = validate_issues(&config);
        assert!(issues.iter().any(|i| i.contains("api.domain")));
    }
}
