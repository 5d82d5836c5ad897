//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::{SmtpConfig, TwilioConfig};
use crate::error::ConfigError;
use crate::scheduled::EngineConfig;

/// Largest batch a single delivery run may select.
pub const MAX_BATCH_SIZE: usize = 10;

/// A caller credential for the API: bearer token and the user it acts as.
#[derive(Debug, Clone)]
pub struct ApiToken {
    pub token: SecretString,
    pub user_id: String,
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HTTP listen address.
    pub bind: SocketAddr,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// How long a statement waits on a locked database.
    pub db_busy_timeout: Duration,
    /// Public base URL the provider calls, used to rebuild signed webhook URLs.
    pub public_url: Option<String>,
    /// Shared secret for the delivery trigger. Unset rejects every call.
    pub cron_api_key: Option<SecretString>,
    pub api_tokens: Vec<ApiToken>,
    /// Deadline for one provider call.
    pub send_timeout: Duration,
    /// Deadline for processing one webhook.
    pub webhook_timeout: Duration,
    pub engine: EngineConfig,
    /// Directory for daily rolling log files.
    pub log_dir: Option<PathBuf>,
    pub twilio: Option<TwilioConfig>,
    pub smtp: Option<SmtpConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            db_path: PathBuf::from("./data/inbox-gateway.db"),
            db_busy_timeout: Duration::from_millis(5000),
            public_url: None,
            cron_api_key: None,
            api_tokens: Vec::new(),
            send_timeout: Duration::from_secs(15),
            webhook_timeout: Duration::from_secs(10),
            engine: EngineConfig::default(),
            log_dir: None,
            twilio: None,
            smtp: None,
        }
    }
}

impl GatewayConfig {
    /// Build config from environment variables, including provider credentials.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.twilio = TwilioConfig::from_env();
        config.smtp = SmtpConfig::from_env().map(|mut smtp| {
            smtp.timeout = config.send_timeout;
            smtp
        });
        Ok(config)
    }

    /// Build the gateway settings from an arbitrary key lookup.
    /// Unset or blank keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let batch_size = parse_or(&get, "GATEWAY_BATCH_SIZE", defaults.engine.batch_size)?;
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "GATEWAY_BATCH_SIZE".into(),
                message: format!("must be between 1 and {MAX_BATCH_SIZE}"),
            });
        }
        let concurrency = parse_or(
            &get,
            "GATEWAY_BATCH_CONCURRENCY",
            defaults.engine.concurrency,
        )?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "GATEWAY_BATCH_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            bind: parse_or(&get, "GATEWAY_BIND", defaults.bind)?,
            db_path: get("GATEWAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            db_busy_timeout: millis_or(&get, "GATEWAY_DB_BUSY_TIMEOUT_MS", defaults.db_busy_timeout)?,
            public_url: get("GATEWAY_PUBLIC_URL").map(|u| u.trim_end_matches('/').to_string()),
            cron_api_key: get("CRON_API_KEY").map(SecretString::from),
            api_tokens: parse_api_tokens(get("GATEWAY_API_TOKENS").as_deref().unwrap_or(""))?,
            send_timeout: secs_or(&get, "GATEWAY_SEND_TIMEOUT_SECS", defaults.send_timeout)?,
            webhook_timeout: secs_or(&get, "GATEWAY_WEBHOOK_TIMEOUT_SECS", defaults.webhook_timeout)?,
            engine: EngineConfig {
                batch_size,
                concurrency,
                item_timeout: secs_or(&get, "GATEWAY_ITEM_TIMEOUT_SECS", defaults.engine.item_timeout)?,
                claim_lease: secs_or(&get, "GATEWAY_CLAIM_LEASE_SECS", defaults.engine.claim_lease)?,
            },
            log_dir: get("GATEWAY_LOG_DIR").map(PathBuf::from),
            twilio: None,
            smtp: None,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

/// Parse `token:user_id` pairs separated by commas.
fn parse_api_tokens(raw: &str) -> Result<Vec<ApiToken>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((token, user_id)) if !token.is_empty() && !user_id.is_empty() => Ok(ApiToken {
                token: SecretString::from(token.to_string()),
                user_id: user_id.to_string(),
            }),
            _ => Err(ConfigError::InvalidValue {
                key: "GATEWAY_API_TOKENS".into(),
                message: "expected comma-separated token:user_id pairs".into(),
            }),
        })
        .collect()
}
