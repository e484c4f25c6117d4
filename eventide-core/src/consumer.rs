//! 事件消费者（Consumer）
//!
//! 以显式的类型化注册代替运行时反射：每个消费者在注册时同时提供
//! 解码函数（`Value -> 事件`）与处理函数，调度端只面对类型擦除后的
//! `RegisteredConsumer`。
//!
use crate::error::{EventError, EventResult};
use crate::event::{Event, EventName};
use crate::options::{CORRELATION_ID_KEY, ConsumerOptions};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 事件消费者：处理某一类型的事件
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// 接受的事件类型
    type Event: Event;

    /// 消费者名称（用于处理状态与审计，同一事件名下需唯一）
    fn name(&self) -> &str;

    /// 重试与超时策略
    fn options(&self) -> ConsumerOptions {
        ConsumerOptions::default()
    }

    /// 处理事件；应在 `ctx` 被取消时尽快返回
    async fn consume(&self, ctx: &ConsumeContext, event: Self::Event) -> anyhow::Result<()>;
}

/// 单次消费的上下文
#[derive(Clone, Debug)]
pub struct ConsumeContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    retry_number: u32,
    metadata: Arc<HashMap<String, Value>>,
}

impl Default for ConsumeContext {
    fn default() -> Self {
        Self::new(1, HashMap::new())
    }
}

impl ConsumeContext {
    pub fn new(retry_number: u32, metadata: HashMap<String, Value>) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            retry_number,
            metadata: Arc::new(metadata),
        }
    }

    /// 溢出时不设截止时间
    pub(crate) fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待直至截止时间到达（或调度端放弃本次调用）
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 距截止时间的剩余时长
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// 当前尝试序号（从 1 开始）
    pub fn retry_number(&self) -> u32 {
        self.retry_number
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(CORRELATION_ID_KEY).and_then(Value::as_str)
    }
}

/// 解码后的事件（类型擦除）
pub type DecodedEvent = Box<dyn Any + Send>;

type DecodeFn = Arc<dyn Fn(&Value) -> EventResult<DecodedEvent> + Send + Sync>;

type HandleFn =
    Arc<dyn Fn(ConsumeContext, DecodedEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 已注册的消费者：名称、策略、解码函数与处理函数
#[derive(Clone)]
pub struct RegisteredConsumer {
    name: String,
    declared_event: EventName,
    options: ConsumerOptions,
    decode: DecodeFn,
    handle: HandleFn,
}

impl fmt::Debug for RegisteredConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredConsumer")
            .field("name", &self.name)
            .field("declared_event", &self.declared_event)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RegisteredConsumer {
    pub fn new<C: Consumer>(consumer: C) -> Self {
        Self::from_arc(Arc::new(consumer))
    }

    pub fn from_arc<C: Consumer>(consumer: Arc<C>) -> Self {
        let name = consumer.name().to_string();
        let options = consumer.options();

        let decode: DecodeFn = {
            let name = name.clone();
            Arc::new(move |payload: &Value| {
                serde_json::from_value::<C::Event>(payload.clone())
                    .map(|ev| Box::new(ev) as DecodedEvent)
                    .map_err(|e| EventError::Decode {
                        consumer: name.clone(),
                        event_name: C::Event::NAME.to_string(),
                        reason: e.to_string(),
                    })
            })
        };

        let handle: HandleFn = Arc::new(move |ctx: ConsumeContext, decoded: DecodedEvent| {
            let consumer = consumer.clone();

            let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(async move {
                // 解码函数与处理函数由同一泛型 C 生成，正常情况下不会失败
                match decoded.downcast::<C::Event>() {
                    Ok(event) => consumer.consume(&ctx, *event).await,
                    Err(_) => Err(anyhow::anyhow!(
                        "type mismatch: expected={}, consumer={}",
                        C::Event::NAME,
                        consumer.name()
                    )),
                }
            });
            fut
        });

        Self {
            name,
            declared_event: EventName::from_static(C::Event::NAME),
            options,
            decode,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// 将负载解码为消费者声明的事件类型
    pub fn decode(&self, payload: &Value) -> EventResult<DecodedEvent> {
        (self.decode)(payload)
    }

    /// 调用处理函数；返回的 future 为 'static，可独立 spawn
    pub fn invoke(
        &self,
        ctx: ConsumeContext,
        event: DecodedEvent,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.handle)(ctx, event)
    }
}
