// =============================================
// Runtime configuration
// =============================================
// Env:
//   TABLE_LINKS / TABLE_TOKENS / TABLE_ACCESS_LOGS : DynamoDB tables (required)
//   TICKET_KEY                 : HMAC key for gate tickets (required)
//   PUBLIC_DOMAIN              : host serving the gate page
//   TOKEN_DEFAULT_TTL_MINUTES  : e.g. 30
//   TOKEN_MAX_TTL_MINUTES      : e.g. 1440
//   TOKEN_RETENTION_HOURS      : sweep tokens expired longer than this, e.g. 24
//   ACCESS_LOG_RETENTION_DAYS  : e.g. 30
//   SUSPICION_THRESHOLD        : e.g. 50
//   CRITICAL_CHECKS            : e.g. referrer,javascript,token
//   ALLOWED_REFERRERS          : comma separated shortener domains
//   REVISIT_COOLDOWN_SECS      : e.g. 5
//   TICKET_MAX_AGE_HOURS       : e.g. 24
//   SIGNAL_WEIGHTS             : overrides, e.g. no_referrer=30,tooling_detected=10

use chrono::Duration;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::signals::{Check, SignalPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub table_links: String,
    pub table_tokens: String,
    pub table_access_logs: String,
    pub public_domain: String,
    pub ticket_key: Vec<u8>,
    pub default_ttl_minutes: u32,
    pub max_ttl_minutes: u32,
    pub token_retention: Duration,
    pub log_retention: Duration,
    pub signals: SignalPolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            table_links: "gatelink-links".into(),
            table_tokens: "gatelink-tokens".into(),
            table_access_logs: "gatelink-access-logs".into(),
            public_domain: "gate.example.com".into(),
            ticket_key: b"local-dev-ticket-key".to_vec(),
            default_ttl_minutes: 30,
            max_ttl_minutes: 1440,
            token_retention: Duration::hours(24),
            log_retention: Duration::days(30),
            signals: SignalPolicy::default(),
        }
    }
}

fn env_required(k: &'static str) -> Result<String, ConfigError> {
    std::env::var(k)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .ok_or(ConfigError::Missing(k))
}

fn env_parse<T: std::str::FromStr>(k: &str, d: T) -> T {
    std::env::var(k)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(d)
}

/// Non-negative whole units; out-of-range or negative values keep the default.
fn env_duration(k: &str, unit: fn(i64) -> Option<Duration>, d: Duration) -> Duration {
    std::env::var(k)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .and_then(unit)
        .unwrap_or(d)
}

fn env_list(k: &str) -> Option<Vec<String>> {
    let raw = std::env::var(k).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}

impl GateConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();

        let mut signals = SignalPolicy {
            threshold: env_parse("SUSPICION_THRESHOLD", d.signals.threshold),
            revisit_cooldown: env_duration(
                "REVISIT_COOLDOWN_SECS",
                Duration::try_seconds,
                d.signals.revisit_cooldown,
            ),
            ticket_max_age: env_duration(
                "TICKET_MAX_AGE_HOURS",
                Duration::try_hours,
                d.signals.ticket_max_age,
            ),
            ..d.signals
        };
        if let Some(domains) = env_list("ALLOWED_REFERRERS") {
            signals.allowed_referrers = domains;
        }
        if let Some(names) = env_list("CRITICAL_CHECKS") {
            let mut critical = BTreeSet::new();
            for n in names {
                match Check::from_name(&n) {
                    Some(c) => {
                        critical.insert(c);
                    }
                    None => tracing::warn!(check = %n, "unknown check in CRITICAL_CHECKS"),
                }
            }
            signals.critical = critical;
        }
        if let Ok(raw) = std::env::var("SIGNAL_WEIGHTS") {
            signals.weights.apply_overrides(&raw);
        }

        let default_ttl_minutes = env_parse("TOKEN_DEFAULT_TTL_MINUTES", d.default_ttl_minutes);
        let max_ttl_minutes =
            env_parse("TOKEN_MAX_TTL_MINUTES", d.max_ttl_minutes).max(default_ttl_minutes.max(1));

        Ok(Self {
            table_links: env_required("TABLE_LINKS")?,
            table_tokens: env_required("TABLE_TOKENS")?,
            table_access_logs: env_required("TABLE_ACCESS_LOGS")?,
            ticket_key: env_required("TICKET_KEY")?.into_bytes(),
            public_domain: std::env::var("PUBLIC_DOMAIN").unwrap_or(d.public_domain),
            default_ttl_minutes,
            max_ttl_minutes,
            token_retention: env_duration(
                "TOKEN_RETENTION_HOURS",
                Duration::try_hours,
                d.token_retention,
            ),
            log_retention: env_duration(
                "ACCESS_LOG_RETENTION_DAYS",
                Duration::try_days,
                d.log_retention,
            ),
            signals,
        })
    }

    /// Clamps a requested ttl into `1..=max_ttl_minutes`.
    pub fn ttl_minutes(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_ttl_minutes)
            .clamp(1, self.max_ttl_minutes.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    // tiny RAII guard to restore env at the end of each test
    struct EnvGuard {
        k: String,
        v: Option<String>,
    }
    impl EnvGuard {
        fn set(k: &str, v: &str) -> Self {
            let old = env::var(k).ok();
            env::set_var(k, v);
            Self {
                k: k.to_string(),
                v: old,
            }
        }
    }
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.v {
                Some(val) => env::set_var(&self.k, val),
                None => env::remove_var(&self.k),
            }
        }
    }

    fn required() -> Vec<EnvGuard> {
        vec![
            EnvGuard::set("TABLE_LINKS", "links"),
            EnvGuard::set("TABLE_TOKENS", "tokens"),
            EnvGuard::set("TABLE_ACCESS_LOGS", "logs"),
            EnvGuard::set("TICKET_KEY", "secret"),
        ]
    }

    #[test]
    #[serial(env)]
    fn defaults_apply_when_only_required_vars_set() {
        let _g = required();
        let cfg = GateConfig::from_env().unwrap();
        assert_eq!(cfg.table_tokens, "tokens");
        assert_eq!(cfg.ticket_key, b"secret".to_vec());
        assert_eq!(cfg.default_ttl_minutes, 30);
        assert_eq!(cfg.max_ttl_minutes, 1440);
        assert_eq!(cfg.signals.threshold, 50);
        assert_eq!(
            cfg.signals.critical,
            BTreeSet::from([Check::Referrer, Check::Script, Check::Token])
        );
    }

    #[test]
    #[serial(env)]
    fn out_of_range_durations_fall_back_to_defaults() {
        let _g = required();
        let _a = EnvGuard::set("TICKET_MAX_AGE_HOURS", "99999999999999999");
        let _b = EnvGuard::set("ACCESS_LOG_RETENTION_DAYS", "-3");
        let _c = EnvGuard::set("REVISIT_COOLDOWN_SECS", "soon");
        let _d = EnvGuard::set("TOKEN_RETENTION_HOURS", "48");

        let cfg = GateConfig::from_env().unwrap();
        assert_eq!(cfg.signals.ticket_max_age, Duration::hours(24));
        assert_eq!(cfg.log_retention, Duration::days(30));
        assert_eq!(cfg.signals.revisit_cooldown, Duration::seconds(5));
        assert_eq!(cfg.token_retention, Duration::hours(48));
    }

    #[test]
    #[serial(env)]
    fn missing_table_is_an_error() {
        let _g = EnvGuard::set("TABLE_LINKS", "");
        assert_eq!(
            GateConfig::from_env().unwrap_err(),
            ConfigError::Missing("TABLE_LINKS")
        );
    }

    #[test]
    #[serial(env)]
    fn policy_overrides_are_read() {
        let _g = required();
        let _t = EnvGuard::set("SUSPICION_THRESHOLD", "70");
        let _c = EnvGuard::set("CRITICAL_CHECKS", "referrer, integrity, bogus");
        let _r = EnvGuard::set("ALLOWED_REFERRERS", "Short.example, ,other.example");
        let _w = EnvGuard::set("SIGNAL_WEIGHTS", "no_referrer=12");
        let _ttl = EnvGuard::set("TOKEN_MAX_TTL_MINUTES", "not-a-number");

        let cfg = GateConfig::from_env().unwrap();
        assert_eq!(cfg.signals.threshold, 70);
        assert_eq!(
            cfg.signals.critical,
            BTreeSet::from([Check::Referrer, Check::Integrity])
        );
        assert_eq!(
            cfg.signals.allowed_referrers,
            vec!["short.example".to_string(), "other.example".to_string()]
        );
        assert_eq!(
            cfg.signals
                .weights
                .of(crate::signals::Failure::NoReferrer),
            12
        );
        assert_eq!(cfg.max_ttl_minutes, 1440);
    }

    #[test]
    fn ttl_is_clamped() {
        let cfg = GateConfig::default();
        assert_eq!(cfg.ttl_minutes(None), 30);
        assert_eq!(cfg.ttl_minutes(Some(0)), 1);
        assert_eq!(cfg.ttl_minutes(Some(90)), 90);
        assert_eq!(cfg.ttl_minutes(Some(100_000)), 1440);
    }
}
