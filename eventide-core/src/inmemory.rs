//! 内存事件存储（InMemoryStore）
//!
//! 无持久化的即发即弃实现：
//! - `produce_raw` 派生受跟踪的任务，等待至 `produce_at` 后依次调用各消费者；
//! - 失败的消费者在尝试预算内单独重试（间隔 `retry_interval`）；
//! - `on_stop` 取消尚未开始的等待并等待所有已派生任务结束；
//!   之后的 `on_start` 换用新的取消令牌并重新打开任务跟踪，存储可再次发布。
//!
use crate::consumer::{ConsumeContext, RegisteredConsumer};
use crate::dispatch::{invoke_locally, resolve_and_dispatch};
use crate::error::{EventError, EventResult};
use crate::event::{EventName, RawEvent};
use crate::options::ProducerOptions;
use crate::registry::ConsumerRegistry;
use crate::store::{Producer, Store};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 内存存储的实现名
pub const IN_MEMORY_STORE_NAME: &str = "in-memory";

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    registry: ConsumerRegistry,
    tracker: TaskTracker,
    token: Arc<RwLock<CancellationToken>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 共享外部注册表
    pub fn with_registry(registry: ConsumerRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    /// 尚未结束的投递任务数
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    fn token(&self) -> CancellationToken {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn deliver(
        consumers: Vec<Arc<RegisteredConsumer>>,
        event: RawEvent,
        metadata: HashMap<String, Value>,
        token: CancellationToken,
    ) {
        for consumer in consumers {
            let options = consumer.options().clone();
            let budget = options.attempt_budget();
            let mut retry_number = 1;

            loop {
                let ctx = ConsumeContext::new(retry_number, metadata.clone());
                let outcome = resolve_and_dispatch(
                    &consumer,
                    event.payload(),
                    ctx,
                    options.consume_timeout(),
                )
                .await;

                let Some(reason) = outcome.error() else {
                    debug!(
                        store = IN_MEMORY_STORE_NAME,
                        consumer = consumer.name(),
                        event_name = %event.name(),
                        retry_number,
                        duration_ms = outcome.duration().as_millis() as u64,
                        "consumer succeeded"
                    );
                    break;
                };

                if retry_number >= budget {
                    error!(
                        store = IN_MEMORY_STORE_NAME,
                        consumer = consumer.name(),
                        event_name = %event.name(),
                        error = %reason,
                        retry_number,
                        max_retries = budget,
                        "unable to execute event, reached max retries"
                    );
                    break;
                }

                warn!(
                    store = IN_MEMORY_STORE_NAME,
                    consumer = consumer.name(),
                    event_name = %event.name(),
                    error = %reason,
                    retry_number,
                    max_retries = budget,
                    retry_interval_ms = options.retry_interval_ms(),
                    "will retry event because consumer returned an error"
                );

                if let Some(interval) = options.retry_interval() {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(
                                store = IN_MEMORY_STORE_NAME,
                                consumer = consumer.name(),
                                event_name = %event.name(),
                                "store stopped, retry abandoned"
                            );
                            return;
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                retry_number += 1;
            }
        }
    }
}

#[async_trait]
impl Producer for InMemoryStore {
    async fn produce_raw(&self, event: RawEvent, opts: ProducerOptions) -> EventResult<()> {
        let token = self.token();
        if token.is_cancelled() {
            return Err(EventError::InvalidState {
                reason: format!("store {IN_MEMORY_STORE_NAME} is stopped"),
            });
        }

        let consumers = self.registry.consumers_for(event.name());
        if consumers.is_empty() {
            return Err(EventError::NoConsumer {
                event_name: event.name().to_string(),
            });
        }

        let delay = (opts.produce_at_or_now() - Utc::now()).to_std().ok();
        let metadata = opts.metadata().clone();

        self.tracker.spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(
                            store = IN_MEMORY_STORE_NAME,
                            event_name = %event.name(),
                            "store stopped before scheduled delivery"
                        );
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Self::deliver(consumers, event, metadata, token).await;
        });

        Ok(())
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
impl Store for InMemoryStore {
    fn name(&self) -> &str {
        IN_MEMORY_STORE_NAME
    }

    fn add_consumer(&self, event_name: EventName, consumer: RegisteredConsumer) -> EventResult<()> {
        self.registry.add_consumer(event_name, consumer)
    }

    async fn on_start(&self) -> EventResult<()> {
        {
            let mut token = self.token.write().unwrap_or_else(PoisonError::into_inner);
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        self.tracker.reopen();

        info!(
            store = IN_MEMORY_STORE_NAME,
            consumers = self.registry.len(),
            "event store started"
        );
        Ok(())
    }

    async fn on_stop(&self) -> EventResult<()> {
        self.token().cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(store = IN_MEMORY_STORE_NAME, "event store stopped");
        Ok(())
    }
}
