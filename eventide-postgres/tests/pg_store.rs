use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use eventide_core::{
    ConsumeContext, Consumer, ConsumerOptions, ConsumerRegistry, Event, EventError, ProducerExt,
    ProducerOptions, RawEvent, Store,
};
use eventide_macros::event;
use eventide_postgres::repository::OutcomeWrite;
use eventide_postgres::schema;
use eventide_postgres::{PgEventStore, PgStoreConfig, ProcessingState, ProcessingStatus};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[event(name = "invoice.issued")]
#[derive(PartialEq)]
struct InvoiceIssued {
    invoice_id: String,
    amount_cents: i64,
    tags: Vec<String>,
}

fn invoice() -> InvoiceIssued {
    InvoiceIssued {
        invoice_id: "inv-1".into(),
        amount_cents: 12_50,
        tags: vec!["b2b".into(), "eu".into()],
    }
}

/// 前 `fail_first` 次失败，可选地在每次调用中休眠
struct Scripted {
    name: &'static str,
    fail_first: usize,
    sleep: Option<Duration>,
    options: ConsumerOptions,
    calls: Arc<AtomicUsize>,
}

impl Scripted {
    fn new(name: &'static str, options: ConsumerOptions) -> Self {
        Self {
            name,
            fail_first: 0,
            sleep: None,
            options,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Consumer for Scripted {
    type Event = InvoiceIssued;

    fn name(&self) -> &str {
        self.name
    }

    fn options(&self) -> ConsumerOptions {
        self.options.clone()
    }

    async fn consume(&self, ctx: &ConsumeContext, _event: InvoiceIssued) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(sleep) = self.sleep {
            // 仅首次调用超时
            if call == 1 {
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = ctx.cancelled() => {}
                }
                return Ok(());
            }
        }
        if call <= self.fail_first {
            anyhow::bail!("{} failed attempt {}", self.name, call);
        }
        Ok(())
    }
}

/// 未设置 `DATABASE_TEST_URL` 时跳过；每个测试使用独立 schema，结束时删除
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    PgPoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .ok()
}

fn test_config() -> PgStoreConfig {
    PgStoreConfig::builder()
        .schema(format!("eventide_test_{}", uuid::Uuid::new_v4().simple()))
        .poll_interval(Duration::from_millis(20))
        .timeout_poll_interval(Duration::from_millis(20))
        .build()
}

async fn drop_schema(pool: &PgPool, config: &PgStoreConfig) {
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", config.schema))
        .execute(pool)
        .await;
}

/// 轮询重试链直至满足条件或超时
async fn wait_for_lineage(
    store: &PgEventStore,
    event_id: i64,
    consumer: &str,
    done: impl Fn(&[ProcessingState]) -> bool,
) -> AnyResult<Vec<ProcessingState>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let lineage = store.repository().lineage(event_id, consumer).await?;
        if done(&lineage) || tokio::time::Instant::now() >= deadline {
            return Ok(lineage);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn statuses(lineage: &[ProcessingState]) -> Vec<(i32, ProcessingStatus)> {
    lineage.iter().map(|s| (s.retry_number, s.status)).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn produce_creates_one_available_row_per_consumer() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    schema::migrate(&pool, &config).await?;

    let store = PgEventStore::new(pool.clone(), config.clone())?;
    for name in ["mailer", "ledger", "audit"] {
        store.registry().register(Scripted::new(name, ConsumerOptions::default()))?;
    }

    let event_id = store
        .produce_with_id(RawEvent::from_event(&invoice())?, ProducerOptions::new())
        .await?;

    let states = store.repository().states_for_event(event_id).await?;
    assert_eq!(states.len(), 3);
    assert!(states.iter().all(|s| s.status == ProcessingStatus::Available));
    assert!(states.iter().all(|s| s.retry_number == 1));
    let names: HashSet<_> = states.iter().map(|s| s.consumer_name.as_str()).collect();
    assert_eq!(names, HashSet::from(["mailer", "ledger", "audit"]));

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn payload_and_metadata_round_trip() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    schema::migrate(&pool, &config).await?;

    let store = PgEventStore::new(pool.clone(), config.clone())?;
    store.registry().register(Scripted::new("c", ConsumerOptions::default()))?;

    let opts = ProducerOptions::new().with_metadata("tenant", "t-9");
    let correlation = opts.correlation_id().map(str::to_string);
    let event_id = store
        .produce_with_id(RawEvent::from_event(&invoice())?, opts)
        .await?;

    let record = store.repository().find_event(event_id).await?.expect("event row");
    assert_eq!(record.event_name, InvoiceIssued::NAME);
    let back: InvoiceIssued = serde_json::from_value(record.payload)?;
    assert_eq!(back, invoice());
    assert_eq!(record.metadata["tenant"], json!("t-9"));
    assert_eq!(record.metadata["id"].as_str().map(str::to_string), correlation);

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn produce_without_consumer_is_rejected() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    let store = PgEventStore::new(pool.clone(), config.clone())?;

    let err = store.produce(&invoice(), None).await.unwrap_err();
    assert!(matches!(err, EventError::NoConsumer { .. }));
    assert!(err.to_string().contains("no consumer found"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_claimers_never_share_a_row() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    schema::migrate(&pool, &config).await?;

    let store = Arc::new(PgEventStore::new(pool.clone(), config.clone())?);
    store.registry().register(Scripted::new("c", ConsumerOptions::default()))?;
    for _ in 0..60 {
        store.produce(&invoice(), None).await?;
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some((state, _event)) = store.repository().claim_available().await? {
                assert_eq!(state.status, ProcessingStatus::Pending);
                assert!(state.pending_at.is_some());
                claimed.push(state.id);
            }
            Ok::<_, EventError>(claimed)
        }));
    }

    let mut all = Vec::new();
    for w in workers {
        all.extend(w.await??);
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 60);
    assert_eq!(unique.len(), 60);

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn future_produce_at_is_not_claimable_early() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    schema::migrate(&pool, &config).await?;

    let store = PgEventStore::new(pool.clone(), config.clone())?;
    store.registry().register(Scripted::new("c", ConsumerOptions::default()))?;

    let later = Utc::now() + chrono::Duration::hours(1);
    store
        .produce(&invoice(), Some(ProducerOptions::new().with_produce_at(later)))
        .await?;

    assert!(store.repository().claim_available().await?.is_none());
    assert_eq!(
        store
            .repository()
            .count_with_status(ProcessingStatus::Available)
            .await?,
        1
    );

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn always_failing_consumer_spends_its_budget() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    let store = PgEventStore::new(pool.clone(), config.clone())?;
    let mut broken = Scripted::new("broken", ConsumerOptions::default().with_max_retries(3));
    broken.fail_first = usize::MAX;
    let calls = broken.calls.clone();
    store.registry().register(broken)?;

    store.on_start().await?;
    let event_id = store
        .produce_with_id(RawEvent::from_event(&invoice())?, ProducerOptions::new())
        .await?;

    let lineage = wait_for_lineage(&store, event_id, "broken", |l| {
        l.len() == 3 && l.iter().all(|s| s.status.is_terminal())
    })
    .await?;
    store.on_stop().await?;

    assert_eq!(
        statuses(&lineage),
        vec![
            (1, ProcessingStatus::Failed),
            (2, ProcessingStatus::Failed),
            (3, ProcessingStatus::Failed),
        ]
    );
    assert!(lineage.iter().all(|s| s.error.as_deref().is_some_and(|e| e.contains("broken failed"))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fail_twice_then_succeed() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    let store = PgEventStore::new(pool.clone(), config.clone())?;
    let mut flaky = Scripted::new(
        "flaky",
        ConsumerOptions::default()
            .with_max_retries(3)
            .with_retry_interval(Duration::from_millis(50)),
    );
    flaky.fail_first = 2;
    store.registry().register(flaky)?;

    store.on_start().await?;
    let event_id = store
        .produce_with_id(RawEvent::from_event(&invoice())?, ProducerOptions::new())
        .await?;

    let lineage = wait_for_lineage(&store, event_id, "flaky", |l| {
        l.last().is_some_and(|s| s.status == ProcessingStatus::Success)
    })
    .await?;
    store.on_stop().await?;

    assert_eq!(
        statuses(&lineage),
        vec![
            (1, ProcessingStatus::Failed),
            (2, ProcessingStatus::Failed),
            (3, ProcessingStatus::Success),
        ]
    );
    // 重试行在失败之后至少 retry_interval 才可被认领
    assert!(lineage[1].processable_at >= lineage[0].failed_at.expect("failed_at"));
    assert!(lineage[2].success_at.is_some());

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_row_is_failed_and_retried() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    let store = PgEventStore::new(pool.clone(), config.clone())?;
    let mut slow = Scripted::new(
        "slow",
        ConsumerOptions::default()
            .with_max_retries(2)
            .with_consume_timeout(Duration::from_millis(200)),
    );
    slow.sleep = Some(Duration::from_secs(5));
    store.registry().register(slow)?;

    store.on_start().await?;
    let event_id = store
        .produce_with_id(RawEvent::from_event(&invoice())?, ProducerOptions::new())
        .await?;

    let lineage = wait_for_lineage(&store, event_id, "slow", |l| {
        l.last().is_some_and(|s| s.status == ProcessingStatus::Success)
    })
    .await?;
    store.on_stop().await?;

    assert_eq!(
        statuses(&lineage),
        vec![(1, ProcessingStatus::Failed), (2, ProcessingStatus::Success)]
    );
    assert_eq!(lineage[0].error.as_deref(), Some("consumer timeout reached"));

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn late_outcome_does_not_overwrite_timeout() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    schema::migrate(&pool, &config).await?;

    let store = PgEventStore::new(pool.clone(), config.clone())?;
    store.registry().register(Scripted::new(
        "c",
        ConsumerOptions::default().with_consume_timeout(Duration::from_millis(10)),
    ))?;
    store.produce(&invoice(), None).await?;

    let (mut claimed, _event) = store
        .repository()
        .claim_available()
        .await?
        .expect("claimable row");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let timed_out = store.repository().fail_timed_out().await?.expect("expired row");
    assert_eq!(timed_out.failed.id, claimed.id);
    assert_eq!(timed_out.failed.status, ProcessingStatus::Failed);
    assert!(timed_out.successor.is_none());

    claimed.mark_success(Utc::now(), Duration::from_millis(90));
    let write = store.repository().save_outcome(&claimed, None).await?;
    assert_eq!(write, OutcomeWrite::AlreadyResolved);

    let lineage = store.repository().lineage(claimed.event_id, "c").await?;
    assert_eq!(statuses(&lineage), vec![(1, ProcessingStatus::Failed)]);

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn migration_is_idempotent() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    let registry = ConsumerRegistry::new();
    let store = PgEventStore::with_registry(pool.clone(), config.clone(), registry)?;

    store.on_start().await?;
    store.on_stop().await?;
    store.on_start().await?;
    store.on_stop().await?;
    schema::migrate(&pool, &config).await?;

    drop_schema(&pool, &config).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_retry_interval_does_not_stall_workers() -> AnyResult<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let config = test_config();
    let store = PgEventStore::new(pool.clone(), config.clone())?;
    let mut stalled = Scripted::new(
        "stalled",
        ConsumerOptions::default()
            .with_max_retries(2)
            .with_retry_interval(Duration::from_secs(u64::MAX / 2)),
    );
    stalled.fail_first = usize::MAX;
    let steady = Scripted::new("steady", ConsumerOptions::default());
    let steady_calls = steady.calls.clone();
    store.registry().register(stalled)?;
    store.registry().register(steady)?;

    store.on_start().await?;
    let first = store
        .produce_with_id(RawEvent::from_event(&invoice())?, ProducerOptions::new())
        .await?;
    let lineage = wait_for_lineage(&store, first, "stalled", |l| l.len() == 2).await?;
    assert_eq!(
        statuses(&lineage),
        vec![(1, ProcessingStatus::Failed), (2, ProcessingStatus::Available)]
    );
    assert!(lineage[1].processable_at > Utc::now() + chrono::Duration::days(300));

    // 之后发布的事件仍被处理
    let second = store
        .produce_with_id(RawEvent::from_event(&invoice())?, ProducerOptions::new())
        .await?;
    let lineage = wait_for_lineage(&store, second, "steady", |l| {
        l.first().is_some_and(|s| s.status == ProcessingStatus::Success)
    })
    .await?;
    store.on_stop().await?;

    assert_eq!(statuses(&lineage), vec![(1, ProcessingStatus::Success)]);
    assert_eq!(steady_calls.load(Ordering::SeqCst), 2);

    // 行内超大的超时毫秒数不会让清理查询溢出
    sqlx::query(&format!(
        "UPDATE {}.processing_states SET status = 'PENDING', pending_at = now(), consume_timeout_ms = $1 \
         WHERE status = 'AVAILABLE'",
        config.schema
    ))
    .bind(i64::MAX)
    .execute(&pool)
    .await?;
    assert!(store.repository().fail_timed_out().await?.is_none());

    drop_schema(&pool, &config).await;
    Ok(())
}
