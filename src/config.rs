//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Daily quota reset policy.
///
/// Per-user timezones would need a profile field the connection record does
/// not carry today, so the choice is deployment-wide: either UTC midnight or a
/// fixed offset applied to every user. Product input pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaResetPolicy {
    /// New ledger day starts at 00:00 UTC.
    UtcMidnight,
    /// New ledger day starts at 00:00 at the given offset from UTC, in minutes.
    FixedOffsetMinutes(i32),
}

/// Quota ledger configuration.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Daily send allowance granted to users without an explicit override.
    pub default_daily_allowance: u32,
    /// When the ledger day rolls over.
    pub reset_policy: QuotaResetPolicy,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_daily_allowance: 50,
            reset_policy: QuotaResetPolicy::UtcMidnight,
        }
    }
}

/// Reply-monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between scheduled monitor passes.
    pub poll_interval: Duration,
    /// Poll windows start this far before `last_polled_at` — provider listing
    /// is not gap-free, and re-delivered messages are state-machine no-ops.
    pub overlap_margin: Duration,
    /// Time allowed for one user's poll + correlate + transition pipeline.
    pub per_user_timeout: Duration,
    /// Hard deadline for a whole run; users not yet started are abandoned and
    /// picked up next invocation.
    pub run_deadline: Duration,
    /// How many users are processed concurrently within one run.
    pub max_concurrent_users: usize,
    /// Threads awaiting a reply longer than this are swept to stale.
    pub stale_after: chrono::Duration,
    /// Cron expression gating the staleness sweep.
    pub sweep_schedule: String,
    /// A follow-up nudge is dispatched once a thread has waited this long
    /// (must be shorter than `stale_after` to ever fire).
    pub follow_up_after: chrono::Duration,
    /// Queued entries dispatched per user per pass.
    pub dispatch_batch_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300), // 5 minutes
            overlap_margin: Duration::from_secs(300),
            per_user_timeout: Duration::from_secs(60),
            run_deadline: Duration::from_secs(240),
            max_concurrent_users: 8,
            stale_after: chrono::Duration::days(14),
            sweep_schedule: "0 0 3 * * * *".to_string(), // daily, 03:00 UTC
            follow_up_after: chrono::Duration::days(4),
            dispatch_batch_size: 10,
        }
    }
}

impl MonitorConfig {
    /// Validate the sweep cron expression.
    pub fn validate(&self) -> Result<(), ConfigError> {
        cron::Schedule::from_str(&self.sweep_schedule).map_err(|e| {
            ConfigError::InvalidSchedule {
                expr: self.sweep_schedule.clone(),
                message: e.to_string(),
            }
        })?;
        Ok(())
    }
}

/// Mail-provider endpoints and OAuth client credentials.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the provider's mailbox REST API.
    pub api_base: String,
    /// OAuth token endpoint used for refresh grants.
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Page size for message listing.
    pub page_size: u32,
    /// Per-request timeout toward the provider.
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        // Local mail-bridge defaults; deployments point these at the real
        // provider bridge via environment.
        Self {
            api_base: "http://127.0.0.1:8025/api/v1".to_string(),
            token_url: "http://127.0.0.1:8025/oauth/token".to_string(),
            client_id: String::new(),
            client_secret: SecretString::from(String::new()),
            page_size: 100,
            request_timeout: Duration::from_secs(20),
        }
    }
}

/// Scheduled-trigger authentication.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Shared secret the trigger caller must present.
    pub secret: SecretString,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub bind_addr: String,
    pub log_dir: Option<String>,
    pub quota: QuotaConfig,
    pub monitor: MonitorConfig,
    pub provider: ProviderConfig,
    pub trigger: TriggerConfig,
}

impl AppConfig {
    /// Build config from environment variables.
    ///
    /// `REPLYLOOP_TRIGGER_SECRET` is required; everything else has defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = std::env::var("REPLYLOOP_TRIGGER_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("REPLYLOOP_TRIGGER_SECRET".to_string()))?;

        let db_path =
            std::env::var("REPLYLOOP_DB_PATH").unwrap_or_else(|_| "./data/replyloop.db".to_string());

        let bind_addr =
            std::env::var("REPLYLOOP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let log_dir = std::env::var("REPLYLOOP_LOG_DIR").ok();

        let mut quota = QuotaConfig::default();
        if let Some(allowance) = env_parse::<u32>("REPLYLOOP_DAILY_ALLOWANCE")? {
            quota.default_daily_allowance = allowance;
        }
        if let Some(offset) = env_parse::<i32>("REPLYLOOP_QUOTA_RESET_OFFSET_MIN")? {
            quota.reset_policy = QuotaResetPolicy::FixedOffsetMinutes(offset);
        }

        let mut monitor = MonitorConfig::default();
        if let Some(secs) = env_parse::<u64>("REPLYLOOP_POLL_INTERVAL_SECS")? {
            monitor.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("REPLYLOOP_PER_USER_TIMEOUT_SECS")? {
            monitor.per_user_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("REPLYLOOP_RUN_DEADLINE_SECS")? {
            monitor.run_deadline = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("REPLYLOOP_MAX_CONCURRENT_USERS")? {
            monitor.max_concurrent_users = n.max(1);
        }
        if let Some(days) = env_parse::<i64>("REPLYLOOP_STALE_AFTER_DAYS")? {
            monitor.stale_after = chrono::Duration::days(days);
        }
        if let Some(days) = env_parse::<i64>("REPLYLOOP_FOLLOW_UP_AFTER_DAYS")? {
            monitor.follow_up_after = chrono::Duration::days(days);
        }
        if let Ok(expr) = std::env::var("REPLYLOOP_SWEEP_SCHEDULE") {
            monitor.sweep_schedule = expr;
        }
        monitor.validate()?;

        let mut provider = ProviderConfig::default();
        if let Ok(base) = std::env::var("REPLYLOOP_PROVIDER_API_BASE") {
            provider.api_base = base;
        }
        if let Ok(url) = std::env::var("REPLYLOOP_PROVIDER_TOKEN_URL") {
            provider.token_url = url;
        }
        provider.client_id = std::env::var("REPLYLOOP_OAUTH_CLIENT_ID").unwrap_or_default();
        provider.client_secret =
            SecretString::from(std::env::var("REPLYLOOP_OAUTH_CLIENT_SECRET").unwrap_or_default());

        Ok(Self {
            db_path,
            bind_addr,
            log_dir,
            quota,
            monitor,
            provider,
            trigger: TriggerConfig {
                secret: SecretString::from(secret),
            },
        })
    }
}

/// Parse an optional env var, erroring on malformed values instead of
/// silently falling back.
fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(None),
    }
}
