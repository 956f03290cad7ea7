//! Application configuration loaded from environment variables.

use std::time::Duration;

use chrono_tz::Tz;

use crate::errors::{BrokerageError, Result};
use crate::window::{DEFAULT_OPEN_HOUR, DEFAULT_TIMEZONE};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Administrative recipient copied on payment and marketplace mail
    pub admin_email: String,
    /// Sender address handed to the mail relay
    pub email_from: String,
    /// Mail relay endpoint; notifications are only logged when unset
    pub notify_url: Option<String>,
    /// Reference timezone for the marketplace window
    pub market_timezone: Tz,
    /// Reference hour (0-23) during which the marketplace trades
    pub market_open_hour: u32,
    /// Upper bound on any single store call
    pub store_timeout: Duration,
    /// How many projects the analytics snapshot lists as "recent"
    pub recent_projects: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite:./brokerage.db".to_string(),
            api_port: 3001,
            admin_email: "admin@javadrops.co.in".to_string(),
            email_from: "noreply@javadrops.co.in".to_string(),
            notify_url: None,
            market_timezone: DEFAULT_TIMEZONE,
            market_open_hour: DEFAULT_OPEN_HOUR,
            store_timeout: Duration::from_millis(5_000),
            recent_projects: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the process environment
    /// in production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let market_open_hour = parse_or(&var, "MARKET_OPEN_HOUR", defaults.market_open_hour)?;
        if market_open_hour > 23 {
            return Err(BrokerageError::Config(format!(
                "MARKET_OPEN_HOUR must be 0-23, got {market_open_hour}"
            )));
        }

        let market_timezone = match var("MARKET_TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|_| {
                BrokerageError::Config(format!("Invalid MARKET_TIMEZONE: {name}"))
            })?,
            None => defaults.market_timezone,
        };

        Ok(Config {
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            api_port: parse_or(&var, "API_PORT", defaults.api_port)?,
            admin_email: var("ADMIN_EMAIL").unwrap_or(defaults.admin_email),
            email_from: var("EMAIL_FROM").unwrap_or(defaults.email_from),
            notify_url: var("NOTIFY_URL"),
            market_timezone,
            market_open_hour,
            store_timeout: Duration::from_millis(parse_or(
                &var,
                "STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
            recent_projects: parse_or(&var, "RECENT_PROJECTS", defaults.recent_projects)?,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BrokerageError::Config(format!("Invalid {key}"))),
        None => Ok(default),
    }
}
