use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_PAYMENT_PROVIDER: &str = "razorpay";
const DEFAULT_DOWNLOAD_TOKEN_TTL_HOURS: i64 = 24 * 7;
const DEFAULT_VELOCITY_MAX_PENDING_ORDERS: u64 = 5;
const DEFAULT_VELOCITY_WINDOW_MINUTES: i64 = 60;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

const PAYMENT_PROVIDERS: [&str; 3] = ["razorpay", "stripe", "mock"];
const ENVIRONMENTS: [&str; 4] = ["development", "test", "staging", "production"];
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[serde(default = "default_environment")]
    #[validate(custom = "validate_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 500))]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Comma separated list of allowed CORS origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Shared secret used to verify identity-provider bearer tokens (HS256)
    #[validate(length(min = 32))]
    pub auth_jwt_secret: String,

    #[serde(default)]
    pub auth_issuer: Option<String>,

    #[serde(default)]
    pub auth_audience: Option<String>,

    /// Master switch for checkout
    #[serde(default = "default_true")]
    pub payments_enabled: bool,

    /// Which gateway adapter to construct: razorpay, stripe or mock
    #[serde(default = "default_payment_provider")]
    #[validate(custom = "validate_payment_provider")]
    pub payment_provider: String,

    #[serde(default)]
    pub razorpay_key_id: Option<String>,

    #[serde(default)]
    pub razorpay_key_secret: Option<String>,

    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    #[serde(default)]
    pub stripe_publishable_key: Option<String>,

    /// Overrides the provider API base URL (sandboxes, tests)
    #[serde(default)]
    pub gateway_api_base: Option<String>,

    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub gateway_timeout_secs: u64,

    /// Secret for inbound payment webhooks; webhooks are rejected when unset
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    #[serde(default = "default_webhook_tolerance_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub payment_webhook_tolerance_secs: i64,

    /// ISO-4217 currency used for catalog prices
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    #[serde(default = "default_download_token_ttl_hours")]
    #[validate(range(min = 1, max = 8760))]
    pub download_token_ttl_hours: i64,

    #[serde(default = "default_velocity_max_pending_orders")]
    #[validate(range(min = 1, max = 1000))]
    pub velocity_max_pending_orders: u64,

    #[serde(default = "default_velocity_window_minutes")]
    #[validate(range(min = 1, max = 10080))]
    pub velocity_window_minutes: i64,

    /// Transactional email endpoint; purchase notifications are only logged when unset
    #[serde(default)]
    pub notification_endpoint: Option<String>,

    #[serde(default)]
    pub notification_api_key: Option<String>,

    #[serde(default = "default_notification_sender")]
    pub notification_sender: String,

    #[serde(default = "default_notification_timeout_secs")]
    pub notification_timeout_secs: u64,
}

impl AppConfig {
    /// Builds a configuration with defaults for everything except the required values.
    pub fn new(database_url: String, auth_jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            host: default_host(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            cors_allowed_origins: None,
            auth_jwt_secret,
            auth_issuer: None,
            auth_audience: None,
            payments_enabled: true,
            payment_provider: default_payment_provider(),
            razorpay_key_id: None,
            razorpay_key_secret: None,
            stripe_secret_key: None,
            stripe_publishable_key: None,
            gateway_api_base: None,
            gateway_timeout_secs: default_gateway_timeout_secs(),
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            default_currency: default_currency(),
            download_token_ttl_hours: default_download_token_ttl_hours(),
            velocity_max_pending_orders: default_velocity_max_pending_orders(),
            velocity_window_minutes: default_velocity_window_minutes(),
            notification_endpoint: None,
            notification_api_key: None,
            notification_sender: default_notification_sender(),
            notification_timeout_secs: default_notification_timeout_secs(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn download_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.download_token_ttl_hours)
    }

    pub fn velocity_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.velocity_window_minutes)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }

    /// Cross-field rules that `#[validate]` attributes cannot express.
    pub fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.payments_enabled {
            match self.payment_provider.as_str() {
                "razorpay" => {
                    if is_blank(&self.razorpay_key_id) || is_blank(&self.razorpay_key_secret) {
                        errors.add(
                            "razorpay_key_secret",
                            with_message(
                                "gateway_credentials_missing",
                                "Set APP__RAZORPAY_KEY_ID and APP__RAZORPAY_KEY_SECRET or disable payments",
                            ),
                        );
                    }
                }
                "stripe" => {
                    if is_blank(&self.stripe_secret_key) {
                        errors.add(
                            "stripe_secret_key",
                            with_message(
                                "gateway_credentials_missing",
                                "Set APP__STRIPE_SECRET_KEY or disable payments",
                            ),
                        );
                    }
                }
                "mock" if self.is_production() => {
                    errors.add(
                        "payment_provider",
                        with_message(
                            "mock_gateway_in_production",
                            "The mock payment gateway cannot be used in production",
                        ),
                    );
                }
                _ => {}
            }
        }

        if self.db_min_connections > self.db_max_connections {
            errors.add(
                "db_min_connections",
                with_message(
                    "db_pool_bounds",
                    "db_min_connections must not exceed db_max_connections",
                ),
            );
        }

        if self.is_production() && is_blank(&self.cors_allowed_origins) {
            errors.add(
                "cors_allowed_origins",
                with_message(
                    "cors_allowed_origins_required",
                    "Set APP__CORS_ALLOWED_ORIGINS in production",
                ),
            );
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn with_message(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

fn validate_environment(value: &str) -> Result<(), ValidationError> {
    if ENVIRONMENTS.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new("environment"))
    }
}

fn validate_log_level(value: &str) -> Result<(), ValidationError> {
    if LOG_LEVELS.contains(&value.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(ValidationError::new("log_level"))
    }
}

fn validate_payment_provider(value: &str) -> Result<(), ValidationError> {
    if PAYMENT_PROVIDERS.contains(&value) {
        Ok(())
    } else {
        Err(with_message(
            "payment_provider",
            "payment_provider must be one of razorpay, stripe, mock",
        ))
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    16
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_payment_provider() -> String {
    DEFAULT_PAYMENT_PROVIDER.to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    15
}

fn default_webhook_tolerance_secs() -> i64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_download_token_ttl_hours() -> i64 {
    DEFAULT_DOWNLOAD_TOKEN_TTL_HOURS
}

fn default_velocity_max_pending_orders() -> u64 {
    DEFAULT_VELOCITY_MAX_PENDING_ORDERS
}

fn default_velocity_window_minutes() -> i64 {
    DEFAULT_VELOCITY_WINDOW_MINUTES
}

fn default_notification_sender() -> String {
    "orders@storefront.local".to_string()
}

fn default_notification_timeout_secs() -> u64 {
    5
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

/// Same as [`load_config`] but reading files from `dir`.
pub fn load_config_from(dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    // auth_jwt_secret has no default; it must come from a file or APP__AUTH_JWT_SECRET.
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("environment", run_env)?
        .add_source(File::with_name(&format!("{}/default", dir.display())).required(false))
        .add_source(File::with_name(&format!("{}/{}", dir.display(), run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("auth_jwt_secret").is_err() {
        error!("auth_jwt_secret is not configured");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "auth_jwt_secret is required but not configured. Set APP__AUTH_JWT_SECRET.".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SECRET: &str = "identity_provider_shared_secret_for_tests";

    fn write_config(contents: &str, name: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(name), contents).unwrap();
        dir
    }

    fn base_config() -> AppConfig {
        AppConfig::new("sqlite::memory:".into(), SECRET.into(), "test".into())
    }

    #[test]
    fn files_are_layered_by_environment() {
        let dir = write_config(
            &format!(
                r#"
                database_url = "postgres://localhost/storefront"
                auth_jwt_secret = "{SECRET}"
                payment_provider = "mock"
                velocity_max_pending_orders = 3
                "#
            ),
            "default.toml",
        );
        fs::write(
            dir.path().join("staging.toml"),
            "velocity_window_minutes = 15\n",
        )
        .unwrap();

        let config = load_config_from(dir.path(), "staging").unwrap();

        assert_eq!(config.database_url, "postgres://localhost/storefront");
        assert_eq!(config.environment, "staging");
        assert_eq!(config.velocity_max_pending_orders, 3);
        assert_eq!(config.velocity_window_minutes, 15);
        assert_eq!(config.download_token_ttl_hours, 168);
    }

    #[test]
    fn missing_jwt_secret_is_a_load_error() {
        let dir = write_config("payment_provider = \"mock\"\n", "default.toml");
        let result = load_config_from(dir.path(), "test");
        assert!(matches!(result, Err(AppConfigError::Load(_))));
    }

    #[test]
    fn field_validation_rejects_bad_values() {
        let dir = write_config(
            r#"
            auth_jwt_secret = "short"
            payment_provider = "paypal"
            default_currency = "RUPEE"
            log_level = "loud"
            "#,
            "default.toml",
        );

        let result = load_config_from(dir.path(), "test");
        let Err(AppConfigError::Validation(errors)) = result else {
            panic!("expected validation failure");
        };
        let fields = errors.field_errors();
        assert!(fields.contains_key("auth_jwt_secret"));
        assert!(fields.contains_key("payment_provider"));
        assert!(fields.contains_key("default_currency"));
        assert!(fields.contains_key("log_level"));
    }

    #[test]
    fn enabled_gateway_requires_credentials() {
        let cfg = base_config();
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.field_errors().contains_key("razorpay_key_secret"));

        let mut cfg = base_config();
        cfg.razorpay_key_id = Some("rzp_test_key".into());
        cfg.razorpay_key_secret = Some("rzp_test_secret".into());
        assert!(cfg.validate_additional_constraints().is_ok());

        let mut cfg = base_config();
        cfg.payments_enabled = false;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn mock_gateway_is_refused_in_production() {
        let mut cfg = base_config();
        cfg.environment = "production".into();
        cfg.payment_provider = "mock".into();
        cfg.cors_allowed_origins = Some("https://shop.example".into());
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.field_errors().contains_key("payment_provider"));
    }
}
