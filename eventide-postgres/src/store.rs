//! PostgreSQL 事件存储（PgEventStore）
//!
//! 发布即持久化：事件与每个消费者的首个处理状态在同一事务中写入，
//! 之后由任意进程中的主循环认领执行，超时循环负责回收卡住的行。
//!
use crate::config::PgStoreConfig;
use crate::repository::Repository;
use crate::schema;
use crate::worker::{WorkerHandle, Workers};
use async_trait::async_trait;
use eventide_core::dispatch::invoke_locally;
use eventide_core::{
    ConsumerRegistry, EventError, EventName, EventResult, Producer, ProducerOptions, RawEvent,
    RegisteredConsumer, Store,
};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// PostgreSQL 存储的实现名
pub const POSTGRES_STORE_NAME: &str = "postgres";

pub struct PgEventStore {
    repo: Repository,
    config: PgStoreConfig,
    registry: ConsumerRegistry,
    workers: Mutex<Option<WorkerHandle>>,
}

impl PgEventStore {
    pub fn new(pool: PgPool, config: PgStoreConfig) -> EventResult<Self> {
        Self::with_registry(pool, config, ConsumerRegistry::new())
    }

    /// 共享外部注册表
    pub fn with_registry(
        pool: PgPool,
        config: PgStoreConfig,
        registry: ConsumerRegistry,
    ) -> EventResult<Self> {
        config.validate()?;
        Ok(Self {
            repo: Repository::new(pool, &config.schema),
            config,
            registry,
            workers: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PgStoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    /// 只读查询（事件、处理状态、重试链）
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// 发布并返回事件 id
    pub async fn produce_with_id(&self, event: RawEvent, opts: ProducerOptions) -> EventResult<i64> {
        let consumers: Vec<_> = self
            .registry
            .consumers_for(event.name())
            .iter()
            .map(|c| (c.name().to_string(), c.options().clone()))
            .collect();

        if consumers.is_empty() {
            return Err(EventError::NoConsumer {
                event_name: event.name().to_string(),
            });
        }

        let metadata = serde_json::to_value(opts.metadata())?;
        let (record, states) = self
            .repo
            .insert_event(
                event.name().as_str(),
                event.payload(),
                &metadata,
                &consumers,
                opts.produce_at_or_now(),
            )
            .await?;

        debug!(
            store = POSTGRES_STORE_NAME,
            event_id = record.id,
            event_name = %event.name(),
            states = states.len(),
            "event persisted"
        );
        Ok(record.id)
    }
}

#[async_trait]
impl Producer for PgEventStore {
    async fn produce_raw(&self, event: RawEvent, opts: ProducerOptions) -> EventResult<()> {
        self.produce_with_id(event, opts).await.map(|_| ())
    }

    async fn produce_sync_raw(&self, event: RawEvent, opts: ProducerOptions) -> EventResult<()> {
        let consumer = self
            .registry
            .first_for(event.name())
            .ok_or_else(|| EventError::NoConsumer {
                event_name: event.name().to_string(),
            })?;

        invoke_locally(&consumer, &event, opts).await
    }
}

#[async_trait]
impl Store for PgEventStore {
    fn name(&self) -> &str {
        POSTGRES_STORE_NAME
    }

    fn add_consumer(&self, event_name: EventName, consumer: RegisteredConsumer) -> EventResult<()> {
        self.registry.add_consumer(event_name, consumer)
    }

    async fn on_start(&self) -> EventResult<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return Ok(());
        }

        schema::migrate(self.repo.pool(), &self.config).await?;

        *workers = Some(
            Workers {
                repo: self.repo.clone(),
                registry: self.registry.clone(),
                poll_interval: self.config.poll_interval,
                timeout_poll_interval: self.config.timeout_poll_interval,
                claim_timeout: self.config.claim_timeout,
            }
            .start(),
        );

        info!(
            store = POSTGRES_STORE_NAME,
            schema = %self.config.schema,
            consumers = self.registry.len(),
            "event store started"
        );
        Ok(())
    }

    async fn on_stop(&self) -> EventResult<()> {
        let handle = self.workers.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown();
            handle.join().await;
            info!(store = POSTGRES_STORE_NAME, "event store stopped");
        }
        Ok(())
    }
}
