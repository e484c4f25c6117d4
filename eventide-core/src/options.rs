//! 消费/生产选项（ConsumerOptions / ProducerOptions）
//!
//! - `ConsumerOptions`：消费者级别的重试与超时策略；
//! - `ProducerOptions`：单次发布的元数据、计划时间与本地重试计数。
//!
use bon::Builder;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// 默认单次消费超时
pub const DEFAULT_CONSUME_TIMEOUT: Duration = Duration::from_secs(60);

/// 重试间隔与消费超时的上限，超出按上限处理
pub const MAX_POLICY_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// 元数据中关联 ID 的键
pub const CORRELATION_ID_KEY: &str = "id";

/// 消费者策略
///
/// `max_retries` 为总尝试预算（含首次），`None` 表示仅尝试一次。
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    max_retries: Option<u32>,
    retry_interval: Option<Duration>,
    #[builder(default = DEFAULT_CONSUME_TIMEOUT)]
    consume_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry_interval: None,
            consume_timeout: DEFAULT_CONSUME_TIMEOUT,
        }
    }
}

impl ConsumerOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }

    pub fn with_consume_timeout(mut self, consume_timeout: Duration) -> Self {
        self.consume_timeout = consume_timeout;
        self
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval.map(|d| d.min(MAX_POLICY_DURATION))
    }

    /// `Duration::MAX` 等超大值视为上限
    pub fn consume_timeout(&self) -> Duration {
        self.consume_timeout.min(MAX_POLICY_DURATION)
    }

    /// 实际生效的尝试预算，至少为 1
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.unwrap_or(1).max(1)
    }

    /// 重试间隔（毫秒），未设置为 0
    pub fn retry_interval_ms(&self) -> i64 {
        self.retry_interval().map(duration_ms).unwrap_or(0)
    }

    /// 消费超时（毫秒）
    pub fn consume_timeout_ms(&self) -> i64 {
        duration_ms(self.consume_timeout())
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// 单次发布选项
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    metadata: HashMap<String, Value>,
    produce_at: Option<DateTime<Utc>>,
    retry_count: u32,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerOptions {
    /// 新建选项，元数据中总会写入一个新生成的关联 ID
    pub fn new() -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            CORRELATION_ID_KEY.to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );

        Self {
            metadata,
            produce_at: None,
            retry_count: 0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_produce_at(mut self, produce_at: DateTime<Utc>) -> Self {
        self.produce_at = Some(produce_at);
        self
    }

    pub fn with_retry_count_incremented(mut self) -> Self {
        self.retry_count += 1;
        self
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(CORRELATION_ID_KEY).and_then(Value::as_str)
    }

    pub fn produce_at(&self) -> Option<DateTime<Utc>> {
        self.produce_at
    }

    /// 计划时间，未设置则为当前时间
    pub fn produce_at_or_now(&self) -> DateTime<Utc> {
        self.produce_at.unwrap_or_else(Utc::now)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub(crate) fn increment_retry_count(&mut self) {
        self.retry_count += 1;
    }
}
