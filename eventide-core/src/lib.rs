//! 持久化事件分发引擎核心（eventide-core）
//!
//! 提供与存储无关的事件分发抽象与运行时：
//! - 事件模型（`event`）与发布/消费选项（`options`）
//! - 消费者协议与类型化注册（`consumer`、`registry`）
//! - 有界截止时间的调度执行器与本地重试（`dispatch`）
//! - 发布端与存储生命周期协议（`store`）
//! - 无持久化的内存实现（`inmemory`）
//! - 按名称选择存储并统一启停的运行时（`runtime`）
//!
//! 持久化实现（如 PostgreSQL）位于独立 crate，仅依赖本 crate 暴露的协议。
//!
//! 典型用法：
//! 1. 为事件类型实现 `Event`（或使用 `#[event(name = "...")]`）；
//! 2. 为处理逻辑实现 `Consumer` 并注册到 `ConsumerRegistry`；
//! 3. 选择存储，构建 `EventRuntime` 并 `start()`；
//! 4. 通过 `ProducerExt::produce` / `produce_sync` 发布事件。
//!
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod inmemory;
pub mod options;
pub mod registry;
pub mod runtime;
pub mod store;

pub use consumer::{ConsumeContext, Consumer, RegisteredConsumer};
pub use dispatch::DispatchOutcome;
pub use error::{EventError, EventResult};
pub use event::{Event, EventName, RawEvent};
pub use inmemory::InMemoryStore;
pub use options::{ConsumerOptions, ProducerOptions};
pub use registry::ConsumerRegistry;
pub use runtime::{EventRuntime, RuntimeConfig, select_store};
pub use store::{Producer, ProducerExt, Store};

// 允许在本 crate 内部通过 ::eventide_core 进行自引用，
// 以便过程宏在本 crate 的测试中也能解析到 ::eventide_core 路径。
extern crate self as eventide_core;
