//! 事件与处理状态的数据库访问
//!
//! 并发认领依赖 `FOR UPDATE SKIP LOCKED`：多个进程同时轮询同一数据库时，
//! 每一行至多被一个事务锁定，其余事务直接跳过而不阻塞。
//! 认领与结果写回是两个独立的短事务，消费者执行期间不持有任何行锁。
//!
use crate::models::{EventRecord, MAX_POLICY_MS, ProcessingState, ProcessingStatus};
use chrono::{DateTime, Utc};
use eventide_core::dispatch::TIMEOUT_REASON;
use eventide_core::{ConsumerOptions, EventResult};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};

const STATE_COLUMNS: &str = "id, event_id, consumer_name, status, error, retry_number, \
     max_retries, retry_interval_ms, consume_timeout_ms, created_at, updated_at, \
     processable_at, run_at, duration_ms, failed_at, success_at, pending_at";

const EVENT_COLUMNS: &str = "id, payload, event_name, metadata, created_at, updated_at";

/// 结果写回的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeWrite {
    Saved { successor_id: Option<i64> },
    /// 该行已不在 `PENDING`（被超时循环处理），未做任何写入
    AlreadyResolved,
}

/// 超时循环一次处理的结果
#[derive(Debug, Clone)]
pub struct TimedOut {
    pub failed: ProcessingState,
    pub successor: Option<ProcessingState>,
}

#[derive(Debug, Clone)]
pub struct Repository {
    pool: PgPool,
    events: String,
    states: String,
}

impl Repository {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            events: format!("{schema}.events"),
            states: format!("{schema}.processing_states"),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 在同一事务中写入事件与每个消费者的首个处理状态
    pub async fn insert_event(
        &self,
        event_name: &str,
        payload: &Value,
        metadata: &Value,
        consumers: &[(String, ConsumerOptions)],
        processable_at: DateTime<Utc>,
    ) -> EventResult<(EventRecord, Vec<ProcessingState>)> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, EventRecord>(&format!(
            r#"
            INSERT INTO {events} (payload, event_name, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING {EVENT_COLUMNS}
            "#,
            events = self.events,
        ))
        .bind(payload)
        .bind(event_name)
        .bind(metadata)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let mut states = Vec::with_capacity(consumers.len());
        for (consumer_name, options) in consumers {
            let mut state =
                ProcessingState::initial(record.id, consumer_name, options, processable_at, now);
            state.id = self.insert_state(&mut *tx, &state).await?;
            states.push(state);
        }

        tx.commit().await?;
        Ok((record, states))
    }

    /// 认领一条到期的 `AVAILABLE` 行并在同一事务中读取其事件
    pub async fn claim_available(&self) -> EventResult<Option<(ProcessingState, EventRecord)>> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query_as::<_, ProcessingState>(&format!(
            r#"
            UPDATE {states}
            SET status = 'PENDING', pending_at = now(), updated_at = now()
            WHERE id = (
                SELECT id FROM {states}
                WHERE status = 'AVAILABLE' AND processable_at <= now()
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {STATE_COLUMNS}
            "#,
            states = self.states,
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(state) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let event = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM {events} WHERE id = $1",
            events = self.events,
        ))
        .bind(state.event_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some((state, event)))
    }

    /// 写回结果（仅当该行仍为 `PENDING`），并在同一事务中插入重试行
    pub async fn save_outcome(
        &self,
        state: &ProcessingState,
        successor: Option<&ProcessingState>,
    ) -> EventResult<OutcomeWrite> {
        let mut tx = self.pool.begin().await?;

        let updated = self.update_if_pending(&mut *tx, state).await?;
        if !updated {
            tx.rollback().await?;
            return Ok(OutcomeWrite::AlreadyResolved);
        }

        let successor_id = match successor {
            Some(next) => Some(self.insert_state(&mut *tx, next).await?),
            None => None,
        };

        tx.commit().await?;
        Ok(OutcomeWrite::Saved { successor_id })
    }

    /// 认领一条已超过截止时间的 `PENDING` 行，标记失败并按预算插入重试行
    pub async fn fail_timed_out(&self) -> EventResult<Option<TimedOut>> {
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query_as::<_, ProcessingState>(&format!(
            r#"
            SELECT {STATE_COLUMNS} FROM {states}
            WHERE status = 'PENDING'
              AND coalesce(pending_at, created_at)
                  + least(greatest(consume_timeout_ms, 0), {MAX_POLICY_MS})
                    * interval '1 millisecond' <= now()
            ORDER BY id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            states = self.states,
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut failed) = expired else {
            tx.rollback().await?;
            return Ok(None);
        };

        let now = Utc::now();
        let ran_for = (now - failed.pending_at.unwrap_or(failed.created_at))
            .to_std()
            .unwrap_or_default();
        failed.mark_failed(now, ran_for, TIMEOUT_REASON);
        self.update_if_pending(&mut *tx, &failed).await?;

        let successor = if failed.should_retry() {
            let mut next = failed.next(now);
            next.id = self.insert_state(&mut *tx, &next).await?;
            Some(next)
        } else {
            None
        };

        tx.commit().await?;
        Ok(Some(TimedOut { failed, successor }))
    }

    pub async fn find_event(&self, id: i64) -> EventResult<Option<EventRecord>> {
        let record = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM {events} WHERE id = $1",
            events = self.events,
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// 某事件的全部处理状态（按 id 升序）
    pub async fn states_for_event(&self, event_id: i64) -> EventResult<Vec<ProcessingState>> {
        let states = sqlx::query_as::<_, ProcessingState>(&format!(
            "SELECT {STATE_COLUMNS} FROM {states} WHERE event_id = $1 ORDER BY id",
            states = self.states,
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    /// 某 (事件, 消费者) 的尝试链，按尝试序号排列
    pub async fn lineage(
        &self,
        event_id: i64,
        consumer_name: &str,
    ) -> EventResult<Vec<ProcessingState>> {
        let states = sqlx::query_as::<_, ProcessingState>(&format!(
            r#"
            SELECT {STATE_COLUMNS} FROM {states}
            WHERE event_id = $1 AND consumer_name = $2
            ORDER BY retry_number, id
            "#,
            states = self.states,
        ))
        .bind(event_id)
        .bind(consumer_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    /// 统计某状态的行数
    pub async fn count_with_status(&self, status: ProcessingStatus) -> EventResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT count(*) FROM {states} WHERE status = $1",
            states = self.states,
        ))
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn insert_state<'e, E>(&self, executor: E, state: &ProcessingState) -> EventResult<i64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id: i64 = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {states} (
                event_id, consumer_name, status, error, retry_number, max_retries,
                retry_interval_ms, consume_timeout_ms, created_at, updated_at,
                processable_at, run_at, duration_ms, failed_at, success_at, pending_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16
            )
            RETURNING id
            "#,
            states = self.states,
        ))
        .bind(state.event_id)
        .bind(&state.consumer_name)
        .bind(state.status.as_str())
        .bind(&state.error)
        .bind(state.retry_number)
        .bind(state.max_retries)
        .bind(state.retry_interval_ms)
        .bind(state.consume_timeout_ms)
        .bind(state.created_at)
        .bind(state.updated_at)
        .bind(state.processable_at)
        .bind(state.run_at)
        .bind(state.duration_ms)
        .bind(state.failed_at)
        .bind(state.success_at)
        .bind(state.pending_at)
        .fetch_one(executor)
        .await?;
        Ok(id)
    }

    async fn update_if_pending<'e, E>(&self, executor: E, state: &ProcessingState) -> EventResult<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {states}
            SET status = $2, error = $3, updated_at = $4, run_at = $5,
                duration_ms = $6, failed_at = $7, success_at = $8
            WHERE id = $1 AND status = 'PENDING'
            "#,
            states = self.states,
        ))
        .bind(state.id)
        .bind(state.status.as_str())
        .bind(&state.error)
        .bind(state.updated_at)
        .bind(state.run_at)
        .bind(state.duration_ms)
        .bind(state.failed_at)
        .bind(state.success_at)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
