//! Process-level configuration shared by the courseware binaries.

pub mod config;

use std::{env, net::SocketAddr, path::PathBuf};

pub use config::{AppConfig, ConfigError, Environment, SiteConfig};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const BIND_ADDR_VAR: &str = "APP_BIND_ADDR";

/// Reads a `.env` file from the working directory or its ancestors.
///
/// Returns the path that was loaded; a missing or unreadable file is not an
/// error since deployments configure the process environment directly.
pub fn load_env_file() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

/// Address the HTTP listener binds, from [`BIND_ADDR_VAR`] or [`DEFAULT_BIND_ADDR`].
pub fn bind_address_from_env() -> Result<SocketAddr, std::net::AddrParseError> {
    env::var(BIND_ADDR_VAR)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .as_deref()
        .unwrap_or(DEFAULT_BIND_ADDR)
        .trim()
        .parse()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::ENV_GUARD;

    #[test]
    fn unset_or_blank_address_uses_default() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var(BIND_ADDR_VAR);
        assert_eq!(
            bind_address_from_env().unwrap().to_string(),
            DEFAULT_BIND_ADDR
        );

        env::set_var(BIND_ADDR_VAR, "  ");
        assert_eq!(
            bind_address_from_env().unwrap().to_string(),
            DEFAULT_BIND_ADDR
        );
        env::remove_var(BIND_ADDR_VAR);
    }

    #[test]
    fn custom_address_is_parsed() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::set_var(BIND_ADDR_VAR, "0.0.0.0:9000");
        assert_eq!(bind_address_from_env().unwrap().to_string(), "0.0.0.0:9000");

        env::set_var(BIND_ADDR_VAR, "localhost");
        assert!(bind_address_from_env().is_err());
        env::remove_var(BIND_ADDR_VAR);
    }
}
