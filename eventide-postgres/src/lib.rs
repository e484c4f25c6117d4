//! PostgreSQL 事件存储（eventide-postgres）
//!
//! 持久化事件与逐消费者的处理状态，支持多进程并发轮询同一数据库：
//! - `config`：轮询间隔、命名空间等配置（可由环境变量覆盖）
//! - `schema`：幂等的建表语句与启动时迁移
//! - `models`：`EventRecord` / `ProcessingState` 及其状态迁移
//! - `repository`：基于 `FOR UPDATE SKIP LOCKED` 的认领、写回与超时回收
//! - `store`：实现 `eventide_core::Store` 的 `PgEventStore`
//!
//! 投递语义为每个 (事件, 消费者) 至少一次、有界重试；
//! 消费者需自行保证幂等。
//!
pub mod config;
pub mod models;
pub mod repository;
pub mod schema;
pub mod store;
mod worker;

pub use config::PgStoreConfig;
pub use models::{EventRecord, ProcessingState, ProcessingStatus};
pub use repository::{OutcomeWrite, Repository, TimedOut};
pub use store::{POSTGRES_STORE_NAME, PgEventStore};
