use crate::models::MailAccount;
use crate::retry::RetryPolicy;
use crate::store::StoreConfig;
use std::time::Duration;
use thiserror::Error;

/// Source of configuration values, keyed by variable name.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{present} is set but {missing} is not")]
    IncompleteAccount { present: String, missing: String },
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: String, value: String },
}

pub(crate) fn env_bool(lookup: Lookup<'_>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

pub(crate) fn env_usize(lookup: Lookup<'_>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_u32(lookup: Lookup<'_>, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_duration_millis(lookup: Lookup<'_>, key: &str, default_millis: u64) -> Duration {
    lookup(key)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

pub(crate) fn env_string(lookup: Lookup<'_>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_optional(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key).filter(|value| !value.trim().is_empty())
}

/// Batching knobs for the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    pub batch_size: usize,
    pub flush_delay: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_delay: Duration::from_millis(5_000),
        }
    }
}

impl IndexerConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Self {
        let batch_size = env_usize(lookup, "INDEXER_BATCH_SIZE", 50);
        if batch_size == 0 {
            log::warn!("INDEXER_BATCH_SIZE=0 is not usable; using 1");
        }

        Self {
            batch_size: batch_size.max(1),
            flush_delay: env_duration_millis(lookup, "INDEXER_FLUSH_DELAY_MS", 5_000),
        }
    }
}

/// Reconnect budget for every supervised account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5_000),
            max_attempts: 5,
        }
    }
}

impl SupervisorConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Self {
        Self {
            base_delay: env_duration_millis(lookup, "RECONNECT_BASE_DELAY_MS", 5_000),
            max_attempts: env_u32(lookup, "RECONNECT_MAX_ATTEMPTS", 5),
        }
    }
}

/// Mailbox session settings shared by all accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapConfig {
    pub folder: String,
    pub sync_days: i64,
    pub idle_timeout: Duration,
    /// Connect, read and write deadline for every command outside IDLE.
    pub socket_timeout: Duration,
}

/// Longest back-fill window accepted from `IMAP_SYNC_DAYS`.
pub const MAX_SYNC_DAYS: i64 = 36_500;

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            sync_days: 30,
            idle_timeout: Duration::from_millis(1_500_000),
            socket_timeout: Duration::from_millis(60_000),
        }
    }
}

impl ImapConfig {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let sync_days = match lookup("IMAP_SYNC_DAYS") {
            None => 30,
            Some(value) => value
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|days| (0..=MAX_SYNC_DAYS).contains(days))
                .ok_or_else(|| ConfigError::Invalid {
                    key: "IMAP_SYNC_DAYS".to_string(),
                    value: value.clone(),
                })?,
        };

        let socket_timeout = env_duration_millis(lookup, "IMAP_SOCKET_TIMEOUT_MS", 60_000);
        if socket_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "IMAP_SOCKET_TIMEOUT_MS".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            folder: env_string(lookup, "IMAP_FOLDER", "INBOX"),
            sync_days,
            idle_timeout: env_duration_millis(lookup, "IMAP_IDLE_TIMEOUT_MS", 1_500_000),
            socket_timeout,
        })
    }
}

/// Everything the service reads from its environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub accounts: Vec<MailAccount>,
    pub store: StoreConfig,
    pub indexer: IndexerConfig,
    pub retry: RetryPolicy,
    pub supervisor: SupervisorConfig,
    pub health_check_interval: Duration,
    pub imap: ImapConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let accounts = load_accounts(lookup)?;
        if accounts.is_empty() {
            log::warn!("no mail accounts configured (set IMAP_USER_1 / IMAP_PASS_1)");
        }

        let retry = RetryPolicy {
            max_attempts: env_u32(lookup, "STORE_RETRY_ATTEMPTS", 3).max(1),
            initial_delay: env_duration_millis(lookup, "STORE_RETRY_INITIAL_DELAY_MS", 1_000),
            max_delay: env_duration_millis(lookup, "STORE_RETRY_MAX_DELAY_MS", 10_000),
            ..RetryPolicy::default()
        };

        Ok(Self {
            accounts,
            store: StoreConfig::from_lookup(lookup),
            indexer: IndexerConfig::from_lookup(lookup),
            retry,
            supervisor: SupervisorConfig::from_lookup(lookup),
            health_check_interval: env_duration_millis(lookup, "HEALTH_CHECK_INTERVAL_MS", 300_000),
            imap: ImapConfig::from_lookup(lookup)?,
        })
    }
}

/// Read numbered accounts (`IMAP_USER_1`, `IMAP_USER_2`, ...) until the first gap.
fn load_accounts(lookup: Lookup<'_>) -> Result<Vec<MailAccount>, ConfigError> {
    let default_host = env_string(lookup, "IMAP_HOST", "imap.gmail.com");
    let default_port = lookup("IMAP_PORT")
        .map(|value| parse_port("IMAP_PORT", &value))
        .transpose()?
        .unwrap_or(993);
    let default_tls = env_bool(lookup, "IMAP_TLS", true);

    let mut accounts = Vec::new();
    for n in 1.. {
        let user_key = format!("IMAP_USER_{n}");
        let pass_key = format!("IMAP_PASS_{n}");

        let (user, password) = match (env_optional(lookup, &user_key), env_optional(lookup, &pass_key)) {
            (None, None) => break,
            (Some(user), Some(password)) => (user, password),
            (Some(_), None) => {
                return Err(ConfigError::IncompleteAccount {
                    present: user_key,
                    missing: pass_key,
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::IncompleteAccount {
                    present: pass_key,
                    missing: user_key,
                });
            }
        };

        let port_key = format!("IMAP_PORT_{n}");
        let port = lookup(&port_key)
            .map(|value| parse_port(&port_key, &value))
            .transpose()?
            .unwrap_or(default_port);

        accounts.push(MailAccount {
            id: format!("account-{n}"),
            email: user.clone(),
            host: env_string(lookup, &format!("IMAP_HOST_{n}"), &default_host),
            port,
            user,
            password,
            tls: env_bool(lookup, &format!("IMAP_TLS_{n}"), default_tls),
        });
    }

    Ok(accounts)
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}
