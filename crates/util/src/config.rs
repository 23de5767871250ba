use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;
use url::Url;

use super::bind_address_from_env;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://courseware.db?mode=rwc";
pub const DEFAULT_MODULESTORE_BASE_URL: &str = "http://127.0.0.1:8010/api/modulestore/";
pub const DEFAULT_MAILER_BASE_URL: &str = "http://127.0.0.1:8025/api/";
pub const DEFAULT_CERTIFICATE_DELAY_SECONDS: u64 = 2;

/// Deployment the process runs in; selects log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            _ => Err(ConfigError::InvalidEnvironment(value.to_string())),
        }
    }
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Identity of the site messages and requests are issued on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub domain: String,
    pub name: String,
    pub platform_name: String,
    pub contact_email: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            domain: "localhost:8000".to_string(),
            name: "localhost".to_string(),
            platform_name: "Your Platform Name Here".to_string(),
            contact_email: "info@example.com".to_string(),
        }
    }
}

impl SiteConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            domain: env::var("SITE_DOMAIN").unwrap_or(defaults.domain),
            name: env::var("SITE_NAME").unwrap_or(defaults.name),
            platform_name: env::var("PLATFORM_NAME").unwrap_or(defaults.platform_name),
            contact_email: env::var("CONTACT_EMAIL").unwrap_or(defaults.contact_email),
        }
    }
}

/// Service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub modulestore_base_url: Url,
    pub mailer_base_url: Url,
    /// Fallback for the auto-generation switch when no row is stored.
    pub auto_certificate_generation: bool,
    /// Countdown applied to certificate generation tasks.
    pub certificate_delay: Duration,
    pub site: SiteConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = match env::var("APP_ENV") {
            Ok(raw) => raw.parse()?,
            Err(_) => Environment::default(),
        };
        let bind_addr = bind_address_from_env().map_err(ConfigError::BindAddress)?;
        let delay_secs = env_number("CERTIFICATE_DELAY_SECONDS", DEFAULT_CERTIFICATE_DELAY_SECONDS)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            modulestore_base_url: env_url("MODULESTORE_BASE_URL", DEFAULT_MODULESTORE_BASE_URL)?,
            mailer_base_url: env_url("MAILER_BASE_URL", DEFAULT_MAILER_BASE_URL)?,
            auto_certificate_generation: env_flag("AUTO_CERTIFICATE_GENERATION", false)?,
            certificate_delay: Duration::from_secs(delay_secs),
            site: SiteConfig::from_env(),
        })
    }
}

fn env_url(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    Url::parse(&value).map_err(|source| ConfigError::InvalidUrl { name, source })
}

fn env_flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Ok(value) = env::var(name) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { name, value }),
    }
}

fn env_number(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("APP_ENV must be development, production or test (got {0:?})")]
    InvalidEnvironment(String),
    #[error("invalid APP_BIND_ADDR value: {0}")]
    BindAddress(std::net::AddrParseError),
    #[error("invalid {name} value: {source}")]
    InvalidUrl {
        name: &'static str,
        source: url::ParseError,
    },
    #[error("{name} must be a boolean flag (got {value:?})")]
    InvalidBool { name: &'static str, value: String },
    #[error("{name} must be a non-negative integer (got {value:?})")]
    InvalidNumber { name: &'static str, value: String },
}
