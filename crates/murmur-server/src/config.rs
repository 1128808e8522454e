use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

const DEFAULT_WELCOME: &str = "Welcome to the chat application!";

#[derive(Debug, Clone)]
pub struct AdminAccount {
    pub username: String,
    pub password: String,
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// `None` keeps everything in memory
    pub db_path: Option<PathBuf>,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    pub require_token: bool,
    pub admin: Option<AdminAccount>,
    pub welcome_message: Option<String>,
    pub typing_timeout: Duration,
    pub stats_interval: Duration,
    pub static_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());

        let admin = match (non_empty("MURMUR_ADMIN_USERNAME"), get("MURMUR_ADMIN_PASSWORD")) {
            (Some(username), Some(password)) => Some(AdminAccount { username, password }),
            (Some(_), None) => bail!("MURMUR_ADMIN_USERNAME is set but MURMUR_ADMIN_PASSWORD is not"),
            _ => None,
        };

        Ok(Self {
            host: non_empty("MURMUR_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&get, "MURMUR_PORT", 3000)?,
            db_path: non_empty("MURMUR_DB_PATH").map(PathBuf::from),
            jwt_secret: non_empty("MURMUR_JWT_SECRET").unwrap_or_else(|| "dev-secret-change-me".into()),
            token_ttl: chrono::Duration::hours(parse(&get, "MURMUR_TOKEN_TTL_HOURS", 720)?),
            require_token: parse_flag(&get, "MURMUR_REQUIRE_TOKEN")?,
            admin,
            // Set but empty disables the welcome message
            welcome_message: match get("MURMUR_WELCOME_MESSAGE") {
                None => Some(DEFAULT_WELCOME.into()),
                Some(msg) if msg.is_empty() => None,
                Some(msg) => Some(msg),
            },
            typing_timeout: Duration::from_secs(parse(&get, "MURMUR_TYPING_TIMEOUT_SECS", 6)?),
            stats_interval: Duration::from_secs(parse(&get, "MURMUR_STATS_INTERVAL_SECS", 30)?),
            static_dir: non_empty("MURMUR_STATIC_DIR").map(PathBuf::from),
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e)),
    }
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("0") | Some("false") | Some("no") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some(other) => bail!("{} has invalid value '{}': expected true or false", key, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.addr().unwrap().port(), 3000);
        assert!(cfg.db_path.is_none());
        assert!(!cfg.require_token);
        assert!(cfg.admin.is_none());
        assert_eq!(cfg.welcome_message.as_deref(), Some(DEFAULT_WELCOME));
        assert_eq!(cfg.typing_timeout, Duration::from_secs(6));
        assert_eq!(cfg.token_ttl, chrono::Duration::hours(720));
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("MURMUR_PORT", "8080"),
            ("MURMUR_DB_PATH", "/tmp/murmur.db"),
            ("MURMUR_REQUIRE_TOKEN", "TRUE"),
            ("MURMUR_ADMIN_USERNAME", "root"),
            ("MURMUR_ADMIN_PASSWORD", "rootpass"),
            ("MURMUR_WELCOME_MESSAGE", ""),
        ])
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.db_path, Some(PathBuf::from("/tmp/murmur.db")));
        assert!(cfg.require_token);
        assert_eq!(cfg.admin.unwrap().username, "root");
        assert!(cfg.welcome_message.is_none());
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = config(&[("MURMUR_PORT", "lots")]).unwrap_err();
        assert!(err.to_string().contains("MURMUR_PORT"));
        assert!(config(&[("MURMUR_REQUIRE_TOKEN", "maybe")]).is_err());
        assert!(config(&[("MURMUR_ADMIN_USERNAME", "root")]).is_err());
    }
}
