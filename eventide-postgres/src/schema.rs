//! 模式初始化
//!
//! 幂等 DDL：可在多个进程并发启动时重复执行。
//! 超时截止时间不持久化，而是在查询中计算
//! （`timestamptz + interval` 不是 immutable，无法用于生成列）。
//!
use crate::config::PgStoreConfig;
use eventide_core::{EventError, EventResult};
use sqlx::PgPool;
use tracing::info;

/// 指定命名空间下的建表语句
pub fn statements(schema: &str) -> Vec<String> {
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.events (
                id          BIGSERIAL    PRIMARY KEY,
                payload     JSONB        NOT NULL,
                event_name  TEXT         NOT NULL,
                metadata    JSONB        NOT NULL DEFAULT '{{}}'::jsonb,
                created_at  TIMESTAMPTZ  NOT NULL DEFAULT now(),
                updated_at  TIMESTAMPTZ  NOT NULL DEFAULT now()
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.processing_states (
                id                  BIGSERIAL    PRIMARY KEY,
                event_id            BIGINT       NOT NULL REFERENCES {schema}.events(id),
                consumer_name       TEXT         NOT NULL,
                status              TEXT         NOT NULL,
                error               TEXT,
                retry_number        INTEGER      NOT NULL DEFAULT 1,
                max_retries         INTEGER      NOT NULL DEFAULT 1,
                retry_interval_ms   BIGINT       NOT NULL DEFAULT 0,
                consume_timeout_ms  BIGINT       NOT NULL,
                created_at          TIMESTAMPTZ  NOT NULL DEFAULT now(),
                updated_at          TIMESTAMPTZ  NOT NULL DEFAULT now(),
                processable_at      TIMESTAMPTZ  NOT NULL DEFAULT now(),
                run_at              TIMESTAMPTZ,
                duration_ms         BIGINT       NOT NULL DEFAULT 0,
                failed_at           TIMESTAMPTZ,
                success_at          TIMESTAMPTZ,
                pending_at          TIMESTAMPTZ,
                CONSTRAINT processing_states_status_check
                    CHECK (status IN ('AVAILABLE', 'PENDING', 'SUCCESS', 'FAILED'))
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS processing_states_status_processable_idx \
             ON {schema}.processing_states (status, processable_at)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS processing_states_event_id_idx \
             ON {schema}.processing_states (event_id)"
        ),
    ]
}

/// 创建命名空间（按配置）并执行建表语句；任何失败都视为启动失败
///
/// 语句在同一事务内执行，并以咨询锁串行化并发启动的进程。
pub async fn migrate(pool: &PgPool, config: &PgStoreConfig) -> EventResult<()> {
    config.validate()?;
    let schema = config.schema.as_str();
    let fail = |e: sqlx::Error| EventError::Schema {
        reason: format!("failed to apply migration in {schema}: {e}"),
    };

    let mut tx = pool.begin().await.map_err(fail)?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("eventide:{schema}"))
        .execute(&mut *tx)
        .await
        .map_err(fail)?;

    if config.create_schema {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| EventError::Schema {
                reason: format!("failed to create schema {schema}: {e}"),
            })?;
    }

    for statement in statements(schema) {
        sqlx::query(&statement).execute(&mut *tx).await.map_err(fail)?;
    }

    tx.commit().await.map_err(fail)?;

    info!(schema, "event store schema ready");
    Ok(())
}
