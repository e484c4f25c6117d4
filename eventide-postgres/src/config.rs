//! PostgreSQL 存储配置
//!
//! 默认值可被环境变量覆盖：
//! - `EVENTIDE_POLL_INTERVAL_MS`：主循环空闲轮询间隔（默认 500ms）
//! - `EVENTIDE_TIMEOUT_POLL_INTERVAL_MS`：超时循环轮询间隔（默认 500ms）
//! - `EVENTIDE_CLAIM_TIMEOUT_MS`：单次认领往返的上限（默认 1s）
//! - `EVENTIDE_CREATE_SCHEMA`：启动时是否创建命名空间（默认 true）
//! - `EVENTIDE_SCHEMA`：命名空间名称（默认 `eventide`）
//!
use bon::Builder;
use eventide_core::{EventError, EventResult};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SCHEMA: &str = "eventide";

pub const POLL_INTERVAL_ENV: &str = "EVENTIDE_POLL_INTERVAL_MS";
pub const TIMEOUT_POLL_INTERVAL_ENV: &str = "EVENTIDE_TIMEOUT_POLL_INTERVAL_MS";
pub const CLAIM_TIMEOUT_ENV: &str = "EVENTIDE_CLAIM_TIMEOUT_MS";
pub const CREATE_SCHEMA_ENV: &str = "EVENTIDE_CREATE_SCHEMA";
pub const SCHEMA_ENV: &str = "EVENTIDE_SCHEMA";

#[derive(Builder, Debug, Clone, PartialEq, Eq)]
pub struct PgStoreConfig {
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    pub timeout_poll_interval: Duration,
    #[builder(default = DEFAULT_CLAIM_TIMEOUT)]
    pub claim_timeout: Duration,
    #[builder(default = true)]
    pub create_schema: bool,
    #[builder(into, default = DEFAULT_SCHEMA.to_string())]
    pub schema: String,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PgStoreConfig {
    pub fn from_env() -> EventResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 以任意键值来源覆盖默认值（便于测试）
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EventResult<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup(POLL_INTERVAL_ENV) {
            config.poll_interval = Duration::from_millis(v.trim().parse()?);
        }
        if let Some(v) = lookup(TIMEOUT_POLL_INTERVAL_ENV) {
            config.timeout_poll_interval = Duration::from_millis(v.trim().parse()?);
        }
        if let Some(v) = lookup(CLAIM_TIMEOUT_ENV) {
            config.claim_timeout = Duration::from_millis(v.trim().parse()?);
        }
        if let Some(v) = lookup(CREATE_SCHEMA_ENV) {
            config.create_schema = v.trim().parse()?;
        }
        if let Some(v) = lookup(SCHEMA_ENV) {
            config.schema = v.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EventResult<()> {
        if self.poll_interval.is_zero() || self.timeout_poll_interval.is_zero() {
            return Err(EventError::invalid_config("poll intervals must be positive"));
        }
        if self.claim_timeout.is_zero() {
            return Err(EventError::invalid_config("claim timeout must be positive"));
        }
        validate_identifier(&self.schema)
    }
}

// 命名空间会被拼接进 SQL，仅接受小写标识符
fn validate_identifier(name: &str) -> EventResult<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_head && valid_tail && name.len() <= 63 {
        Ok(())
    } else {
        Err(EventError::invalid_config(format!(
            "invalid schema name: {name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PgStoreConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.timeout_poll_interval, Duration::from_millis(500));
        assert!(config.create_schema);
        assert_eq!(config.schema, "eventide");
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_defaults() {
        let config = PgStoreConfig::from_lookup(lookup(&[
            (POLL_INTERVAL_ENV, "50"),
            (CREATE_SCHEMA_ENV, "false"),
            (SCHEMA_ENV, "events_v2"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert!(!config.create_schema);
        assert_eq!(config.schema, "events_v2");
    }

    #[test]
    fn rejects_bad_values() {
        for pairs in [
            [(POLL_INTERVAL_ENV, "soon")],
            [(CREATE_SCHEMA_ENV, "yes")],
            [(SCHEMA_ENV, "public; drop table x")],
            [(SCHEMA_ENV, "1abc")],
            [(TIMEOUT_POLL_INTERVAL_ENV, "0")],
        ] {
            let err = PgStoreConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, EventError::InvalidConfig { .. }), "{pairs:?}");
        }
    }
}
