//! 运行时装配（EventRuntime）
//!
//! - `select_store`：按配置名从候选实现中选取存储；
//! - `RuntimeConfig`：选取所用的配置（环境变量 `EVENTIDE_STORE`）；
//! - `EventRuntime`：持有选中的存储与注册表，负责登记消费者与启停，
//!   自身即为 `Producer`。
//!
use crate::error::{EventError, EventResult};
use crate::event::RawEvent;
use crate::inmemory::IN_MEMORY_STORE_NAME;
use crate::options::ProducerOptions;
use crate::registry::ConsumerRegistry;
use crate::store::{Producer, Store};
use async_trait::async_trait;
use bon::Builder;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// 存储选择的环境变量
pub const STORE_ENV: &str = "EVENTIDE_STORE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub store_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_name: IN_MEMORY_STORE_NAME.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 以任意键值来源构造（便于测试）
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup(STORE_ENV) {
            Some(name) if !name.trim().is_empty() => Self {
                store_name: name.trim().to_string(),
            },
            _ => Self::default(),
        }
    }
}

/// 按名称选取存储实现
pub fn select_store(stores: &[Arc<dyn Store>], name: &str) -> EventResult<Arc<dyn Store>> {
    stores
        .iter()
        .find(|s| s.name() == name)
        .cloned()
        .ok_or_else(|| EventError::StoreNotFound {
            name: name.to_string(),
            available: stores
                .iter()
                .map(|s| s.name().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

#[derive(Builder)]
pub struct EventRuntime {
    store: Arc<dyn Store>,
    #[builder(default)]
    registry: ConsumerRegistry,
    #[builder(skip)]
    started: AtomicBool,
}

impl EventRuntime {
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    /// 将注册表中的消费者登记到存储并启动；已启动时无效果
    pub async fn start(&self) -> EventResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (event_name, consumer) in self.registry.entries() {
            match self.store.add_consumer(event_name, (*consumer).clone()) {
                // 存储与运行时共享注册表，或重启后再次登记
                Ok(()) | Err(EventError::AlreadyRegistered { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.store.on_start().await?;

        info!(
            store = self.store.name(),
            consumers = self.registry.len(),
            "event runtime started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> EventResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.on_stop().await?;
        info!(store = self.store.name(), "event runtime stopped");
        Ok(())
    }
}

#[async_trait]
impl Producer for EventRuntime {
    async fn produce_raw(&self, event: RawEvent, opts: ProducerOptions) -> EventResult<()> {
        self.store.produce_raw(event, opts).await
    }

    async fn produce_sync_raw(&self, event: RawEvent, opts: ProducerOptions) -> EventResult<()> {
        self.store.produce_sync_raw(event, opts).await
    }
}
