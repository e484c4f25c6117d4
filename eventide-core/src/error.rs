//! 事件引擎统一错误定义
//!
//! 覆盖发布期（序列化、无消费者、存储写入）、消费期（解码、处理失败、超时）
//! 以及基础设施（数据库、模式初始化、配置）等最小必要集合，
//! 便于各存储实现统一转换为 `EventError`。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventError {
    // --- 序列化/解码 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("decode failed: consumer={consumer}, event={event_name}, reason={reason}")]
    Decode {
        consumer: String,
        event_name: String,
        reason: String,
    },

    // --- 注册/路由 ---
    #[error("no consumer found for event: {event_name}")]
    NoConsumer { event_name: String },
    #[error("consumer not found: event={event_name}, consumer={consumer}")]
    ConsumerNotFound {
        event_name: String,
        consumer: String,
    },
    #[error("consumer already registered: event={event_name}, consumer={consumer}")]
    AlreadyRegistered {
        event_name: String,
        consumer: String,
    },

    // --- 消费执行 ---
    #[error("consumer error: consumer={consumer}, reason={reason}")]
    Consumer { consumer: String, reason: String },
    #[error("consumer timeout reached: consumer={consumer}, timeout_ms={timeout_ms}")]
    Timeout { consumer: String, timeout_ms: u64 },

    // --- 存储/基础设施 ---
    #[error("database error: {reason}")]
    Database { reason: String },
    #[error("schema error: {reason}")]
    Schema { reason: String },
    #[error("store not found: {name}, available: {available}")]
    StoreNotFound { name: String, available: String },
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
}

/// 统一 Result 类型别名
pub type EventResult<T> = Result<T, EventError>;

impl EventError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        EventError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

// 允许在基础设施层直接使用 `?` 将 sqlx 错误转换为 EventError
#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for EventError {
    fn from(err: sqlx::Error) -> Self {
        EventError::Database {
            reason: err.to_string(),
        }
    }
}

impl From<std::num::ParseIntError> for EventError {
    fn from(err: std::num::ParseIntError) -> Self {
        EventError::InvalidConfig {
            reason: err.to_string(),
        }
    }
}

impl From<std::str::ParseBoolError> for EventError {
    fn from(err: std::str::ParseBoolError) -> Self {
        EventError::InvalidConfig {
            reason: err.to_string(),
        }
    }
}
