//! Configuration management for the hookline service.

use std::{collections::HashSet, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookline_queue::{
    BackoffPolicy, BackoffStrategy, ForwardingHandler, HandlerRegistry, QueueConfig, TaskClient,
    TaskClientConfig, TaskDefaults,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "hookline.toml";

/// Environment variable that overrides the configuration file path.
pub const CONFIG_PATH_ENV: &str = "HOOKLINE_CONFIG";

/// Paths served by the service itself, unavailable to webhook routes.
const RESERVED_PATHS: &[&str] = &["/", "/health", "/ready", "/live", "/queue/stats"];

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`hookline.toml`, or the path in `HOOKLINE_CONFIG`)
/// 3. Built-in defaults (lowest priority)
///
/// Webhook routes are only practical to declare in the file:
///
/// ```toml
/// target_url = "https://crm.example.com/api/tasks"
///
/// [[webhooks]]
/// name = "tilda"
/// path = "/webhook/tilda"
/// tags = ["site"]
/// lead_source = "tilda"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    /// SQLite database file.
    ///
    /// Environment variable: `DATABASE_PATH`
    #[serde(default = "default_database_path", alias = "DATABASE_PATH")]
    pub database_path: String,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Queue
    /// Failed attempts after which an entry is no longer dispatched.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_ATTEMPTS")]
    pub max_attempts: u32,
    /// Unit delay for the backoff curve in milliseconds.
    ///
    /// Environment variable: `BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "BASE_DELAY_MS")]
    pub base_delay_ms: u64,
    /// Cap on a single retry delay in milliseconds. `u64::MAX` means no cap.
    ///
    /// Environment variable: `MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "MAX_DELAY_MS")]
    pub max_delay_ms: u64,
    /// Shape of the backoff curve.
    ///
    /// Environment variable: `BACKOFF_STRATEGY`
    #[serde(default, alias = "BACKOFF_STRATEGY")]
    pub backoff_strategy: BackoffStrategy,
    /// Re-check period when nothing is eligible, in milliseconds.
    ///
    /// Environment variable: `IDLE_RECHECK_MS`
    #[serde(default = "default_idle_recheck_ms", alias = "IDLE_RECHECK_MS")]
    pub idle_recheck_ms: u64,
    /// Extra tries for a failed intake write.
    ///
    /// Environment variable: `INTAKE_RETRIES`
    #[serde(default = "default_intake_retries", alias = "INTAKE_RETRIES")]
    pub intake_retries: u32,
    /// Pause between intake write tries in milliseconds.
    ///
    /// Environment variable: `INTAKE_RETRY_INTERVAL_MS`
    #[serde(default = "default_intake_retry_interval_ms", alias = "INTAKE_RETRY_INTERVAL_MS")]
    pub intake_retry_interval_ms: u64,

    // Downstream
    /// Task creation endpoint.
    ///
    /// Environment variable: `TARGET_URL`
    #[serde(default, alias = "TARGET_URL")]
    pub target_url: String,
    /// Bearer token for the task API.
    ///
    /// Environment variable: `TARGET_TOKEN`
    #[serde(default, alias = "TARGET_TOKEN", skip_serializing)]
    pub target_token: String,
    /// Task API request timeout in seconds.
    ///
    /// Environment variable: `TARGET_TIMEOUT_SECONDS`
    #[serde(default = "default_target_timeout", alias = "TARGET_TIMEOUT_SECONDS")]
    pub target_timeout_seconds: u64,

    // Routes
    /// Webhook routes, one forwarding handler each.
    #[serde(default)]
    pub webhooks: Vec<WebhookRoute>,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

/// One inbound webhook route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRoute {
    /// Source name the payloads are queued under.
    pub name: String,
    /// Request path, e.g. `/webhook/tilda`.
    pub path: String,
    /// Tags added to created tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Pipeline added to created tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    /// Project added to created tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Lead source label added to created tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_source: Option<String>,
}

impl WebhookRoute {
    /// Creates a route with no task defaults.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            tags: None,
            pipeline: None,
            project: None,
            lead_source: None,
        }
    }

    /// Returns the task defaults for this route.
    pub fn task_defaults(&self) -> TaskDefaults {
        TaskDefaults {
            tags: self.tags.clone(),
            pipeline: self.pipeline.clone(),
            project: self.project.clone(),
            lead_source: self.lead_source.clone(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides, then validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| CONFIG_FILE.to_string());
        let config: Self =
            Self::figment(&path).extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the layered figment for a configuration file path.
    pub fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("").ignore(&["webhooks"]))
    }

    /// Convert to the queue's configuration.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_attempts: self.max_attempts,
            idle_recheck: Duration::from_millis(self.idle_recheck_ms),
            intake_retries: self.intake_retries,
            intake_retry_interval: Duration::from_millis(self.intake_retry_interval_ms),
        }
    }

    /// Convert to the backoff policy.
    pub fn to_backoff_policy(&self) -> BackoffPolicy {
        let max_delay = match self.max_delay_ms {
            u64::MAX => Duration::MAX,
            ms => Duration::from_millis(ms),
        };

        BackoffPolicy::new(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(max_delay)
            .with_strategy(self.backoff_strategy)
    }

    /// Convert to the task client configuration.
    pub fn to_client_config(&self) -> TaskClientConfig {
        let mut config = TaskClientConfig::new(&self.target_url, &self.target_token);
        config.timeout = Duration::from_secs(self.target_timeout_seconds);
        config
    }

    /// Builds the handler registry: one forwarding handler per webhook route,
    /// sharing a single task client.
    ///
    /// # Errors
    ///
    /// Returns an error if the task client cannot be built or a route name
    /// is rejected by the registry.
    pub fn handler_registry(&self) -> Result<HandlerRegistry> {
        let client = TaskClient::new(self.to_client_config())?;

        let mut registry = HandlerRegistry::new();
        for route in &self.webhooks {
            let handler = ForwardingHandler::new(client.clone(), route.task_defaults());
            registry.register(&route.name, Arc::new(handler))?;
        }
        Ok(registry)
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Checks that the downstream task API is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the target URL or token is missing.
    pub fn require_target(&self) -> Result<()> {
        if self.target_url.trim().is_empty() {
            anyhow::bail!("target_url is required");
        }
        if self.target_token.trim().is_empty() {
            anyhow::bail!("target_token is required");
        }
        url::Url::parse(&self.target_url).context("target_url is not a valid URL")?;
        Ok(())
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.base_delay_ms == 0 {
            anyhow::bail!("base_delay_ms must be greater than 0");
        }

        if self.base_delay_ms > self.max_delay_ms {
            anyhow::bail!("base_delay_ms cannot exceed max_delay_ms");
        }

        if self.idle_recheck_ms == 0 {
            anyhow::bail!("idle_recheck_ms must be greater than 0");
        }

        let mut names = HashSet::new();
        let mut paths = HashSet::new();
        for route in &self.webhooks {
            if route.name.trim().is_empty() {
                anyhow::bail!("webhook route {} has an empty name", route.path);
            }
            if !is_valid_route_path(&route.path) {
                anyhow::bail!("webhook route {} has an invalid path {:?}", route.name, route.path);
            }
            if RESERVED_PATHS.contains(&route.path.as_str()) {
                anyhow::bail!("webhook route {} uses reserved path {}", route.name, route.path);
            }
            if !names.insert(route.name.as_str()) {
                anyhow::bail!("duplicate webhook name {}", route.name);
            }
            if !paths.insert(route.path.as_str()) {
                anyhow::bail!("duplicate webhook path {}", route.path);
            }
        }

        Ok(())
    }
}

/// Literal paths only: a leading slash, then letters, digits and `/-_.`.
fn is_valid_route_path(path: &str) -> bool {
    path.starts_with('/')
        && path.len() > 1
        && path.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::default(),
            idle_recheck_ms: default_idle_recheck_ms(),
            intake_retries: default_intake_retries(),
            intake_retry_interval_ms: default_intake_retry_interval_ms(),
            target_url: String::new(),
            target_token: String::new(),
            target_timeout_seconds: default_target_timeout(),
            webhooks: Vec::new(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_path() -> String {
    "data/webhooks.db".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3012
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    hookline_queue::DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    u64::MAX
}

fn default_idle_recheck_ms() -> u64 {
    5000
}

fn default_intake_retries() -> u32 {
    3
}

fn default_intake_retry_interval_ms() -> u64 {
    5000
}

fn default_target_timeout() -> u64 {
    hookline_queue::client::DEFAULT_TIMEOUT_SECONDS
}

fn default_log_level() -> String {
    "info,hookline=debug,tower_http=debug".to_string()
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, env, io::Write, sync::Mutex};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct TestEnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        vars: Vec<String>,
        originals: HashMap<String, Option<String>>,
    }

    impl TestEnvGuard {
        fn new() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Self { _lock: lock, vars: Vec::new(), originals: HashMap::new() }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            if !self.vars.contains(&key.to_string()) {
                self.originals.insert(key.to_string(), env::var(key).ok());
                self.vars.push(key.to_string());
            }
            env::set_var(key, value);
        }
    }

    impl Drop for TestEnvGuard {
        fn drop(&mut self) {
            for var in &self.vars {
                match self.originals.get(var) {
                    Some(Some(value)) => env::set_var(var, value),
                    Some(None) => env::remove_var(var),
                    None => {},
                }
            }
        }
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.database_path, "data/webhooks.db");
        assert_eq!(config.port, 3012);
        assert_eq!(config.max_attempts, 12);
        assert_eq!(config.to_backoff_policy().max_delay, Duration::MAX);
        assert_eq!(config.to_queue_config().idle_recheck, Duration::from_secs(5));
        assert_eq!(config.target_timeout_seconds, 30);
    }

    #[test]
    fn file_routes_and_env_overrides_are_layered() {
        let file = config_file(
            r#"
            port = 4000
            max_attempts = 5
            target_url = "https://crm.example.com/api/tasks"

            [[webhooks]]
            name = "tilda"
            path = "/webhook/tilda"
            tags = ["site"]
            lead_source = "tilda"

            [[webhooks]]
            name = "manychat"
            path = "/webhook/manychat"
            "#,
        );

        let mut guard = TestEnvGuard::new();
        guard.set_var(CONFIG_PATH_ENV, file.path().to_str().unwrap());
        guard.set_var("PORT", "4100");
        guard.set_var("TARGET_TOKEN", "from-env");
        guard.set_var("BACKOFF_STRATEGY", "linear");

        let config = Config::load().expect("config should load");

        assert_eq!(config.port, 4100);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.target_token, "from-env");
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.webhooks.len(), 2);
        assert_eq!(config.webhooks[0].task_defaults().lead_source.as_deref(), Some("tilda"));
        assert!(config.require_target().is_ok());
    }

    #[test]
    fn conversions_carry_settings() {
        let config = Config {
            base_delay_ms: 250,
            max_delay_ms: 60_000,
            intake_retries: 1,
            intake_retry_interval_ms: 100,
            target_url: "http://localhost:9000/tasks".to_string(),
            target_token: "t".to_string(),
            target_timeout_seconds: 7,
            ..Config::default()
        };

        let policy = config.to_backoff_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(60));

        let queue = config.to_queue_config();
        assert_eq!(queue.intake_retries, 1);
        assert_eq!(queue.intake_retry_interval, Duration::from_millis(100));

        let client = config.to_client_config();
        assert_eq!(client.url, "http://localhost:9000/tasks");
        assert_eq!(client.timeout, Duration::from_secs(7));
    }

    #[test]
    fn invalid_config_validation_fails() {
        let mut config = Config::default();
        config.port = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.max_attempts = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.base_delay_ms = 0;
        assert!(config.validate().is_err());

        config = Config { base_delay_ms: 5000, max_delay_ms: 1000, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config::default();
        config.idle_recheck_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn route_validation() {
        let with_routes =
            |routes: Vec<WebhookRoute>| Config { webhooks: routes, ..Config::default() };

        let ok = with_routes(vec![
            WebhookRoute::new("tilda", "/webhook/tilda"),
            WebhookRoute::new("amocrm", "/webhook/amo_crm-v2"),
        ]);
        assert!(ok.validate().is_ok());

        let duplicate_name = with_routes(vec![
            WebhookRoute::new("tilda", "/a"),
            WebhookRoute::new("tilda", "/b"),
        ]);
        assert!(duplicate_name.validate().is_err());

        let duplicate_path =
            with_routes(vec![WebhookRoute::new("a", "/hook"), WebhookRoute::new("b", "/hook")]);
        assert!(duplicate_path.validate().is_err());

        assert!(with_routes(vec![WebhookRoute::new(" ", "/hook")]).validate().is_err());
        assert!(with_routes(vec![WebhookRoute::new("a", "hook")]).validate().is_err());
        assert!(with_routes(vec![WebhookRoute::new("a", "/{id}")]).validate().is_err());
        assert!(with_routes(vec![WebhookRoute::new("a", "/health")]).validate().is_err());
    }

    #[test]
    fn missing_target_is_reported() {
        let config = Config::default();
        assert!(config.require_target().is_err());

        let config = Config { target_url: "https://crm.example.com".to_string(), ..config };
        let err = config.require_target().unwrap_err();
        assert!(err.to_string().contains("target_token"));

        let config = Config { target_token: "t".to_string(), ..config };
        assert!(config.require_target().is_ok());
    }

    #[test]
    fn registry_has_one_handler_per_route() {
        let config = Config {
            target_url: "http://localhost:9000/tasks".to_string(),
            target_token: "t".to_string(),
            webhooks: vec![
                WebhookRoute::new("tilda", "/webhook/tilda"),
                WebhookRoute::new("amocrm", "/webhook/amocrm"),
            ],
            ..Config::default()
        };

        let registry = config.handler_registry().unwrap();

        assert_eq!(registry.names(), vec!["amocrm", "tilda"]);
        assert!(Config::default().handler_registry().is_err());
    }

    #[test]
    fn token_is_not_serialized() {
        let config = Config { target_token: "secret".to_string(), ..Config::default() };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn socket_address_parsing() {
        let config = Config { host: "0.0.0.0".to_string(), port: 9000, ..Config::default() };

        let addr = config.parse_server_addr().expect("Should parse socket address");

        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert_eq!(addr.port(), 9000);
    }
}
