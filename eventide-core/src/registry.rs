//! 消费者注册表（ConsumerRegistry）
//!
//! 显式构造、通过装配传递的注册表对象（无进程级全局状态）：
//! `EventName -> [RegisteredConsumer]`，同一事件名下保持注册顺序。
//!
use crate::consumer::{Consumer, RegisteredConsumer};
use crate::error::{EventError, EventResult};
use crate::event::{Event, EventName};
use dashmap::DashMap;
use std::sync::Arc;

/// 消费者注册表，克隆后共享同一份数据
#[derive(Clone, Default, Debug)]
pub struct ConsumerRegistry {
    by_name: Arc<DashMap<EventName, Vec<Arc<RegisteredConsumer>>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以消费者声明的事件类型注册
    pub fn register<C: Consumer>(&self, consumer: C) -> EventResult<&Self> {
        self.add_consumer(
            EventName::from_static(<C::Event as Event>::NAME),
            RegisteredConsumer::new(consumer),
        )?;
        Ok(self)
    }

    /// 为指定事件名注册消费者；同一事件名下消费者名称不可重复
    pub fn add_consumer(&self, event_name: EventName, consumer: RegisteredConsumer) -> EventResult<()> {
        let mut entry = self.by_name.entry(event_name.clone()).or_default();

        if entry.iter().any(|c| c.name() == consumer.name()) {
            return Err(EventError::AlreadyRegistered {
                event_name: event_name.to_string(),
                consumer: consumer.name().to_string(),
            });
        }

        entry.push(Arc::new(consumer));
        Ok(())
    }

    /// 某事件名下的全部消费者（按注册顺序）
    pub fn consumers_for(&self, event_name: &EventName) -> Vec<Arc<RegisteredConsumer>> {
        self.by_name
            .get(event_name)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// 按事件名 + 消费者名定位
    pub fn find(&self, event_name: &EventName, consumer_name: &str) -> Option<Arc<RegisteredConsumer>> {
        self.by_name
            .get(event_name)
            .and_then(|list| list.iter().find(|c| c.name() == consumer_name).cloned())
    }

    /// 某事件名下最先注册的消费者
    pub fn first_for(&self, event_name: &EventName) -> Option<Arc<RegisteredConsumer>> {
        self.by_name
            .get(event_name)
            .and_then(|list| list.first().cloned())
    }

    pub fn event_names(&self) -> Vec<EventName> {
        let mut names: Vec<EventName> = self.by_name.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// 全部 (事件名, 消费者) 对
    pub fn entries(&self) -> Vec<(EventName, Arc<RegisteredConsumer>)> {
        let mut out = Vec::new();
        for name in self.event_names() {
            for c in self.consumers_for(&name) {
                out.push((name.clone(), c));
            }
        }
        out
    }

    /// 已注册消费者总数
    pub fn len(&self) -> usize {
        self.by_name.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
