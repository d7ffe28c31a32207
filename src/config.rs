//! Environment-driven configuration.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `EMAIL_PROVIDER` | auto | `smtp`, `local`, `logger`, `logger_full` |
//! | `EMAIL_FROM` | | Sender address |
//! | `EMAIL_FROM_NAME` | | Sender display name |
//! | `SMTP_HOST` | | SMTP server host |
//! | `SMTP_PORT` | `587` | SMTP server port |
//! | `SMTP_USERNAME` | | SMTP username |
//! | `SMTP_PASSWORD` | | SMTP password |
//! | `DISPATCH_WORKERS` | `4` | Concurrent delivery workers |
//! | `DISPATCH_QUEUE_CAPACITY` | `1024` | Ready-job queue size |
//! | `DELIVERY_MAX_ATTEMPTS` | `5` | Attempts per mail, first included |
//! | `DELIVERY_RETRY_DELAY_SECS` | `10` | Pause after a transient failure |
//! | `PUBLIC_KEY_STRATEGY` | `random` | `random` or `sortable` |
//! | `PUBLIC_KEY_MAX_RETRIES` | `10` | Key generation budget |
//! | `TRACKING_BASE_URL` | | Public tracking URL; enables the open pixel |
//! | `ATTACHMENT_ROOT` | `./media` | Directory for attachment blobs |
//! | `BIND_ADDR` | `0.0.0.0:8080` | HTTP listen address |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::compose::Composer;
use crate::dispatch::PoolConfig;
use crate::error::MailError;
use crate::identifier::{IdentifierIssuer, KeyStrategy};
use crate::mailer::Mailer;
use crate::providers;
use crate::worker::RetryPolicy;

/// SMTP connection settings.
#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit provider; auto-detected when unset.
    pub provider: Option<String>,
    pub from: Option<Address>,
    pub smtp: SmtpConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub key_strategy: KeyStrategy,
    pub key_max_retries: u32,
    pub tracking_base_url: Option<String>,
    pub attachment_root: PathBuf,
    pub bind_addr: String,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, MailError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MailError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let from = match get("EMAIL_FROM") {
            Some(email) => {
                let address = Address::parse(&email)
                    .map_err(|e| MailError::Configuration(format!("EMAIL_FROM: {}", e)))?;
                Some(match get("EMAIL_FROM_NAME") {
                    Some(name) => Address::with_name(name, address.email),
                    None => address,
                })
            }
            None => None,
        };

        let key_strategy = match get("PUBLIC_KEY_STRATEGY") {
            Some(value) => KeyStrategy::parse(&value).ok_or_else(|| {
                MailError::Configuration(format!(
                    "PUBLIC_KEY_STRATEGY must be 'random' or 'sortable', got '{}'",
                    value
                ))
            })?,
            None => KeyStrategy::default(),
        };

        Ok(Self {
            provider: get("EMAIL_PROVIDER").map(|p| p.to_lowercase()),
            from,
            smtp: SmtpConfig {
                host: get("SMTP_HOST"),
                port: parse(&get, "SMTP_PORT", 587)?,
                username: get("SMTP_USERNAME"),
                password: get("SMTP_PASSWORD"),
            },
            pool: PoolConfig {
                workers: positive(&get, "DISPATCH_WORKERS", 4)?,
                queue_capacity: positive(&get, "DISPATCH_QUEUE_CAPACITY", 1024)?,
            },
            retry: RetryPolicy {
                max_attempts: positive(&get, "DELIVERY_MAX_ATTEMPTS", 5)?,
                delay: Duration::from_secs(parse(&get, "DELIVERY_RETRY_DELAY_SECS", 10)?),
            },
            key_strategy,
            key_max_retries: positive(&get, "PUBLIC_KEY_MAX_RETRIES", 10)?,
            tracking_base_url: get("TRACKING_BASE_URL"),
            attachment_root: get("ATTACHMENT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./media")),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }

    /// Key issuer for the configured strategy and budget.
    pub fn issuer(&self) -> IdentifierIssuer {
        IdentifierIssuer::new(self.key_strategy).max_attempts(self.key_max_retries)
    }

    /// Composer with the configured sender and tracking URL.
    pub fn composer(&self) -> Result<Composer, MailError> {
        let mut composer = Composer::new();
        if let Some(from) = &self.from {
            composer = composer.from(from.clone());
        }
        match &self.tracking_base_url {
            Some(base) => composer.tracking_base_url(base),
            None => Ok(composer),
        }
    }

    /// Provider name after auto-detection.
    pub fn provider_name(&self) -> Result<String, MailError> {
        if let Some(provider) = &self.provider {
            return Ok(provider.clone());
        }
        if cfg!(feature = "smtp") && self.smtp.host.is_some() {
            return Ok("smtp".into());
        }
        if cfg!(feature = "local") {
            return Ok("local".into());
        }
        Ok("logger".into())
    }

    /// Build the configured transport.
    pub fn mailer(&self) -> Result<Arc<dyn Mailer>, MailError> {
        let provider = self.provider_name()?;
        tracing::debug!(provider = %provider, "Selecting email provider");

        match provider.as_str() {
            #[cfg(feature = "smtp")]
            "smtp" => {
                let host = self
                    .smtp
                    .host
                    .as_deref()
                    .ok_or_else(|| MailError::Configuration("SMTP_HOST not set".into()))?;
                let mut builder = providers::SmtpMailer::new(host, self.smtp.port);
                if let Some(username) = &self.smtp.username {
                    builder = builder.credentials(username, self.smtp.password.as_deref().unwrap_or(""));
                }
                Ok(Arc::new(builder.build()))
            }
            #[cfg(not(feature = "smtp"))]
            "smtp" => Err(MailError::Configuration(
                "EMAIL_PROVIDER=smtp but 'smtp' feature is not enabled. \
                Add `features = [\"smtp\"]` to Cargo.toml"
                    .into(),
            )),

            #[cfg(feature = "local")]
            "local" => Ok(Arc::new(providers::LocalMailer::new())),
            #[cfg(not(feature = "local"))]
            "local" => Err(MailError::Configuration(
                "EMAIL_PROVIDER=local but 'local' feature is not enabled. \
                Add `features = [\"local\"]` to Cargo.toml"
                    .into(),
            )),

            "logger" => Ok(Arc::new(providers::LoggerMailer::new())),
            "logger_full" => Ok(Arc::new(providers::LoggerMailer::full())),

            other => Err(MailError::Configuration(format!(
                "Unknown EMAIL_PROVIDER: '{}'. Valid options: smtp, local, logger, logger_full",
                other
            ))),
        }
    }
}

fn parse<G, T>(get: &G, name: &str, default: T) -> Result<T, MailError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(name) {
        Some(value) => value.parse().map_err(|_| {
            MailError::Configuration(format!("{} has an invalid value: '{}'", name, value))
        }),
        None => Ok(default),
    }
}

fn positive<G, T>(get: &G, name: &str, default: T) -> Result<T, MailError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    let value = parse(get, name, default)?;
    if value <= T::default() {
        return Err(MailError::Configuration(format!("{} must be positive", name)));
    }
    Ok(value)
}
