//! Environment-driven configuration.
//!
//! The helper shape (`env_var`, `env_var_opt`, `env_var_or`, `env_var_parse`)
//! follows the DI container's environment helpers; here they surface
//! `CoreError::Infrastructure` instead of a DI-specific error, since a bad
//! environment is fatal at boot for every binary in this workspace.

use std::time::Duration;

use crate::error::CoreError;

/// Read a required environment variable.
pub fn env_var(name: &str) -> Result<String, CoreError> {
    std::env::var(name)
        .map_err(|_| CoreError::Infrastructure(format!("environment variable '{name}' not set")))
}

/// Read an optional environment variable.
pub fn env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Read an environment variable, falling back to `default` when unset.
pub fn env_var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable, falling back to `default` when
/// unset or unparsable.
pub fn env_var_parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Optional TLS material for the broker connection (§4.3: "TLS optional
/// (CA, cert, key; mTLS supported)"). Activated whenever `url` uses the
/// `amqps://` scheme or any of the three paths below is set.
#[derive(Debug, Clone, Default)]
pub struct BrokerTlsConfig {
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    /// Overrides the hostname used for certificate verification; defaults
    /// to the broker URL's own host.
    pub domain: Option<String>,
}

impl BrokerTlsConfig {
    fn from_env() -> Self {
        Self {
            ca_cert_path: env_var_opt("RABBITMQ_TLS_CA_CERT").filter(|s| !s.is_empty()),
            client_cert_path: env_var_opt("RABBITMQ_TLS_CLIENT_CERT").filter(|s| !s.is_empty()),
            client_key_path: env_var_opt("RABBITMQ_TLS_CLIENT_KEY").filter(|s| !s.is_empty()),
            domain: env_var_opt("RABBITMQ_TLS_DOMAIN").filter(|s| !s.is_empty()),
        }
    }

    pub fn is_mutual(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }
}

/// Broker connection tuning, shared by the consumer and collector binaries.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
    pub prefetch: u16,
    pub exchange: String,
    pub exchange_type: String,
    pub queue_base: String,
    pub retry_queue_base: String,
    pub dlq_base: String,
    pub retry_ttl_ms: u32,
    pub routing_key_prefix: String,
    pub alerts_queue_base: String,
    pub alerts_retry_queue_base: String,
    pub alerts_dlq_base: String,
    pub sites: Vec<String>,
    pub consumer_area_slug: Option<String>,
    pub max_retries: u32,
    pub tls: BrokerTlsConfig,
}

impl BrokerConfig {
    /// Build from the environment variables listed in the external
    /// interfaces section.
    pub fn from_env() -> Result<Self, CoreError> {
        let url = env_var("RABBITMQ_URL")?;
        let sites_raw = env_var_or("RABBITMQ_SITES", "");
        let sites = sites_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            url,
            vhost: env_var_or("RABBITMQ_VHOST", "/"),
            heartbeat_secs: env_var_parse_or("RABBITMQ_HEARTBEAT", 60),
            prefetch: env_var_parse_or("RABBITMQ_PREFETCH", 50),
            exchange: env_var_or("RABBITMQ_EXCHANGE", "plant.telemetry"),
            exchange_type: env_var_or("RABBITMQ_EXCHANGE_TYPE", "topic"),
            queue_base: env_var_or("RABBITMQ_QUEUE", "queue"),
            retry_queue_base: env_var_or("RABBITMQ_RETRY_QUEUE", "retry"),
            dlq_base: env_var_or("RABBITMQ_DLQ", "dlq"),
            retry_ttl_ms: env_var_parse_or("RABBITMQ_RETRY_TTL_MS", 30_000),
            routing_key_prefix: env_var_or("RABBIT_ROUTING_KEY_PREFIX", "telemetry"),
            alerts_queue_base: env_var_or("ALERTS_QUEUE", "alertQueue"),
            alerts_retry_queue_base: env_var_or("ALERTS_RETRY_QUEUE", "retry.alerts"),
            alerts_dlq_base: env_var_or("ALERTS_DLQ", "alertDlq"),
            sites,
            consumer_area_slug: env_var_opt("CONSUMER_AREA_SLUG").filter(|s| !s.is_empty()),
            max_retries: env_var_parse_or("CONSUMER_MAX_RETRIES", 5),
            tls: BrokerTlsConfig::from_env(),
        })
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs as u64)
    }

    pub fn retry_ttl(&self) -> Duration {
        Duration::from_millis(self.retry_ttl_ms as u64)
    }

    /// TLS is active when the URL says so or any cert/key material is
    /// configured, so `amqp://` deployments with no TLS env vars pay
    /// nothing extra.
    pub fn tls_enabled(&self) -> bool {
        self.url.starts_with("amqps://")
            || self.tls.ca_cert_path.is_some()
            || self.tls.is_mutual()
    }
}

/// Per-area database connection profile, per `AreaDBTarget`.
#[derive(Debug, Clone)]
pub struct AreaDbTarget {
    pub slug: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub schema: String,
    pub user: String,
    pub password: String,
}

impl AreaDbTarget {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?options=-c%20search_path%3D{}",
            self.user, self.password, self.host, self.port, self.database, self.schema
        )
    }
}

/// Resolve the set of configured per-area database targets from the
/// environment: `ALERTS_DB_<AREA>_HOST/PORT/NAME`, shared `ALERTS_DB_USER`,
/// `ALERTS_DB_PASS`, `ALERTS_DB_SCHEMA`.
pub fn area_db_targets_from_env(slugs: &[String]) -> Vec<AreaDbTarget> {
    let user = env_var_or("ALERTS_DB_USER", "postgres");
    let password = env_var_or("ALERTS_DB_PASS", "");
    let schema = env_var_or("ALERTS_DB_SCHEMA", "public");

    slugs
        .iter()
        .filter_map(|slug| {
            let upper = slug.to_uppercase();
            let host = env_var_opt(&format!("ALERTS_DB_{upper}_HOST"))?;
            let port = env_var_parse_or(&format!("ALERTS_DB_{upper}_PORT"), 5432);
            let database = env_var_or(&format!("ALERTS_DB_{upper}_NAME"), slug);
            Some(AreaDbTarget {
                slug: slug.clone(),
                host,
                port,
                database,
                schema: schema.clone(),
                user: user.clone(),
                password: password.clone(),
            })
        })
        .collect()
}

/// Whether multi-DB fan-out reads are enabled (default on).
pub fn multi_db_read_enabled() -> bool {
    env_var_or("ALERTS_MULTI_DB_READ", "true")
        .eq_ignore_ascii_case("true")
}

/// Default alert dedup window, per `ALERT_DEDUP_MS` (default 5 minutes).
pub fn default_dedup_window_ms() -> i64 {
    env_var_parse_or("ALERT_DEDUP_MS", 300_000)
}

/// Default notification recipients when a payload doesn't carry any.
pub fn default_recipients() -> Vec<String> {
    env_var_opt("ALERT_DEFAULT_RECIPIENTS")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Scheduler tick interval, per `SCHED_INTERVAL` seconds (default 5 min).
pub fn scheduler_interval() -> Duration {
    Duration::from_secs(env_var_parse_or("SCHED_INTERVAL_SECS", 300))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_or_falls_back() {
        assert_eq!(env_var_or("PLANTBUS_DOES_NOT_EXIST", "fallback"), "fallback");
    }

    #[test]
    fn env_var_parse_or_falls_back_on_bad_value() {
        std::env::set_var("PLANTBUS_TEST_PARSE", "not-a-number");
        let v: u32 = env_var_parse_or("PLANTBUS_TEST_PARSE", 42);
        assert_eq!(v, 42);
        std::env::remove_var("PLANTBUS_TEST_PARSE");
    }
}
