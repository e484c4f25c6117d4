//! 持久化模型
//!
//! - `EventRecord`：每次发布一行，写入后不再修改；
//! - `ProcessingState`：每个 (事件, 消费者) 的一次尝试，重试即新增一行。
//!
use chrono::{DateTime, Utc};
use eventide_core::options::MAX_POLICY_DURATION;
use eventide_core::{ConsumerOptions, EventError, EventResult};
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgRow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 行内策略毫秒数的上限（旧数据或手工写入的行同样按此截断）
pub(crate) const MAX_POLICY_MS: i64 = MAX_POLICY_DURATION.as_millis() as i64;

/// `base + ms`，毫秒数截断到 `[0, MAX_POLICY_MS]`，结果溢出时取最大时刻
fn after_millis(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
    chrono::TimeDelta::try_milliseconds(ms.clamp(0, MAX_POLICY_MS))
        .and_then(|d| base.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub payload: Value,
    pub event_name: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRecord {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            event_name: row.try_get("event_name")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Available,
    Pending,
    Success,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// 终态行不再被引擎修改
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = EventError;

    fn from_str(s: &str) -> EventResult<Self> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(EventError::InvalidState {
                reason: format!("unknown processing status: {other}"),
            }),
        }
    }
}

/// 一次 (事件, 消费者) 尝试
///
/// 策略字段（`max_retries`、`retry_interval_ms`、`consume_timeout_ms`）在发布时
/// 从 `ConsumerOptions` 复制，之后与消费者配置变更无关。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingState {
    /// 尚未写入时为 0
    pub id: i64,
    pub event_id: i64,
    pub consumer_name: String,
    pub status: ProcessingStatus,
    pub error: Option<String>,
    pub retry_number: i32,
    pub max_retries: i32,
    pub retry_interval_ms: i64,
    pub consume_timeout_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processable_at: DateTime<Utc>,
    pub run_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub failed_at: Option<DateTime<Utc>>,
    pub success_at: Option<DateTime<Utc>>,
    pub pending_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ProcessingState {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<ProcessingStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(ProcessingState {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            consumer_name: row.try_get("consumer_name")?,
            status,
            error: row.try_get("error")?,
            retry_number: row.try_get("retry_number")?,
            max_retries: row.try_get("max_retries")?,
            retry_interval_ms: row.try_get("retry_interval_ms")?,
            consume_timeout_ms: row.try_get("consume_timeout_ms")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processable_at: row.try_get("processable_at")?,
            run_at: row.try_get("run_at")?,
            duration_ms: row.try_get("duration_ms")?,
            failed_at: row.try_get("failed_at")?,
            success_at: row.try_get("success_at")?,
            pending_at: row.try_get("pending_at")?,
        })
    }
}

impl ProcessingState {
    /// 发布时为某消费者创建的首次尝试
    pub fn initial(
        event_id: i64,
        consumer_name: impl Into<String>,
        options: &ConsumerOptions,
        processable_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            event_id,
            consumer_name: consumer_name.into(),
            status: ProcessingStatus::Available,
            error: None,
            retry_number: 1,
            max_retries: i32::try_from(options.attempt_budget()).unwrap_or(i32::MAX),
            retry_interval_ms: options.retry_interval_ms(),
            consume_timeout_ms: options.consume_timeout_ms(),
            created_at: now,
            updated_at: now,
            processable_at,
            run_at: None,
            duration_ms: 0,
            failed_at: None,
            success_at: None,
            pending_at: None,
        }
    }

    /// 重试行：沿用事件、消费者与策略，尝试序号加一，
    /// 在 `now + retry_interval` 之后才可被认领
    pub fn next(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            event_id: self.event_id,
            consumer_name: self.consumer_name.clone(),
            status: ProcessingStatus::Available,
            error: None,
            retry_number: self.retry_number + 1,
            max_retries: self.max_retries,
            retry_interval_ms: self.retry_interval_ms,
            consume_timeout_ms: self.consume_timeout_ms,
            created_at: now,
            updated_at: now,
            processable_at: after_millis(now, self.retry_interval_ms),
            run_at: None,
            duration_ms: 0,
            failed_at: None,
            success_at: None,
            pending_at: None,
        }
    }

    pub fn mark_success(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.status = ProcessingStatus::Success;
        self.error = None;
        self.success_at = Some(now);
        self.updated_at = now;
        self.finish(now, duration);
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, duration: Duration, error: impl Into<String>) {
        self.status = ProcessingStatus::Failed;
        self.error = Some(error.into());
        self.failed_at = Some(now);
        self.updated_at = now;
        self.finish(now, duration);
    }

    fn finish(&mut self, now: DateTime<Utc>, duration: Duration) {
        let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        self.run_at = Some(now.checked_sub_signed(duration).unwrap_or(now));
        self.duration_ms = duration.num_milliseconds();
    }

    pub fn should_retry(&self) -> bool {
        self.retry_number < self.max_retries
    }

    pub fn consume_timeout(&self) -> Duration {
        let ms = self.consume_timeout_ms.clamp(0, MAX_POLICY_MS);
        Duration::from_millis(u64::try_from(ms).unwrap_or(0))
    }

    /// 认领时刻（缺失时退化为创建时刻）加上消费超时
    pub fn timeout_at(&self) -> DateTime<Utc> {
        after_millis(self.pending_at.unwrap_or(self.created_at), self.consume_timeout_ms)
    }
}
