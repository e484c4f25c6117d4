//! 发布端与存储抽象（Producer / Store）
//!
//! - `Producer`：对象安全的发布接口，负载为类型擦除的 `RawEvent`；
//! - `ProducerExt`：强类型便捷方法（自动序列化）；
//! - `Store`：在 `Producer` 之上增加消费者登记与生命周期。
//!
use crate::consumer::RegisteredConsumer;
use crate::error::EventResult;
use crate::event::{Event, EventName, RawEvent};
use crate::options::ProducerOptions;
use async_trait::async_trait;

#[async_trait]
pub trait Producer: Send + Sync {
    /// 异步发布：事件被接收（内存调度或持久化）后即返回
    async fn produce_raw(&self, event: RawEvent, opts: ProducerOptions) -> EventResult<()>;

    /// 同步发布：仅调用第一个匹配的消费者，在本进程内执行并返回其结果
    async fn produce_sync_raw(&self, event: RawEvent, opts: ProducerOptions) -> EventResult<()>;
}

/// 强类型发布
#[async_trait]
pub trait ProducerExt: Producer {
    async fn produce<E: Event>(&self, event: &E, opts: Option<ProducerOptions>) -> EventResult<()> {
        let raw = RawEvent::from_event(event)?;
        self.produce_raw(raw, opts.unwrap_or_default()).await
    }

    async fn produce_sync<E: Event>(
        &self,
        event: &E,
        opts: Option<ProducerOptions>,
    ) -> EventResult<()> {
        let raw = RawEvent::from_event(event)?;
        self.produce_sync_raw(raw, opts.unwrap_or_default()).await
    }
}

impl<P: Producer + ?Sized> ProducerExt for P {}

/// 事件存储：发布 + 消费者登记 + 生命周期
#[async_trait]
pub trait Store: Producer {
    /// 实现名称（用于按配置选择）
    fn name(&self) -> &str;

    /// 为事件名登记消费者
    fn add_consumer(&self, event_name: EventName, consumer: RegisteredConsumer) -> EventResult<()>;

    /// 启动后台任务（如轮询循环）
    async fn on_start(&self) -> EventResult<()>;

    /// 停止后台任务并等待其退出
    async fn on_stop(&self) -> EventResult<()>;
}
