//! 后台循环
//!
//! - 主循环：认领一条到期行 → 调度 → 写回结果；空闲时按 `poll_interval` 休眠；
//! - 超时循环：按 `timeout_poll_interval` 周期清理超过截止时间的 `PENDING` 行。
//!
//! 两个循环都在各自的数据库往返结束后检查取消信号；正在执行的消费者不会被中止。
//! 循环内的存储错误只记录日志，下一轮继续；单行处理或单次清理中的 panic
//! 同样被捕获并记录，不会终止循环。
//!
use crate::models::{EventRecord, ProcessingState};
use crate::repository::{OutcomeWrite, Repository};
use crate::store::POSTGRES_STORE_NAME;
use chrono::Utc;
use eventide_core::dispatch::{DispatchOutcome, resolve_and_dispatch};
use eventide_core::{ConsumeContext, ConsumerRegistry, EventError, EventName};
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 后台循环句柄
pub(crate) struct WorkerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn shutdown(&self) {
        self.token.cancel();
    }

    pub(crate) async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            if let Err(e) = t.await {
                error!(store = POSTGRES_STORE_NAME, error = %e, "worker task ended abnormally");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
pub(crate) struct Workers {
    pub(crate) repo: Repository,
    pub(crate) registry: ConsumerRegistry,
    pub(crate) poll_interval: Duration,
    pub(crate) timeout_poll_interval: Duration,
    pub(crate) claim_timeout: Duration,
}

impl Workers {
    pub(crate) fn start(self) -> WorkerHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2);

        tasks.push(tokio::spawn(self.clone().main_loop(token.clone())));

        {
            let workers = self.clone();
            tasks.push(spawn_periodic(
                token.clone(),
                self.timeout_poll_interval,
                move || {
                    let workers = workers.clone();
                    async move {
                        if let Err(panic) = guarded(workers.sweep_timeouts()).await {
                            error!(store = POSTGRES_STORE_NAME, panic = %panic, "timeout sweep panicked");
                        }
                    }
                },
            ));
        }

        info!(
            store = POSTGRES_STORE_NAME,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            timeout_poll_interval_ms = self.timeout_poll_interval.as_millis() as u64,
            "event store workers started"
        );

        WorkerHandle { token, tasks }
    }

    async fn main_loop(self, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }

            match time::timeout(self.claim_timeout, self.repo.claim_available()).await {
                Ok(Ok(Some((state, event)))) => {
                    let (event_id, state_id) = (state.event_id, state.id);
                    if let Err(panic) = guarded(self.process(state, event)).await {
                        // 该行保持 PENDING，由超时循环回收
                        error!(
                            store = POSTGRES_STORE_NAME,
                            event_id,
                            state_id,
                            panic = %panic,
                            "processing panicked"
                        );
                    }
                    continue;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    error!(store = POSTGRES_STORE_NAME, error = %e, "failed to claim processing state");
                }
                Err(_) => {
                    warn!(
                        store = POSTGRES_STORE_NAME,
                        claim_timeout_ms = self.claim_timeout.as_millis() as u64,
                        "claim round-trip timed out"
                    );
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = time::sleep(self.poll_interval) => {}
            }
        }

        debug!(store = POSTGRES_STORE_NAME, "main loop stopped");
    }

    async fn process(&self, mut state: ProcessingState, event: EventRecord) {
        let event_name = EventName::new(event.event_name.clone());

        let outcome = match self.registry.find(&event_name, &state.consumer_name) {
            Some(consumer) => {
                let ctx = ConsumeContext::new(
                    u32::try_from(state.retry_number).unwrap_or(1),
                    metadata_map(&event.metadata),
                );
                resolve_and_dispatch(&consumer, &event.payload, ctx, state.consume_timeout()).await
            }
            None => DispatchOutcome::Failed {
                error: EventError::ConsumerNotFound {
                    event_name: event.event_name.clone(),
                    consumer: state.consumer_name.clone(),
                }
                .to_string(),
                duration: Duration::ZERO,
            },
        };

        let now = Utc::now();
        let successor = match &outcome {
            DispatchOutcome::Succeeded { duration } => {
                state.mark_success(now, *duration);
                None
            }
            DispatchOutcome::Failed { error, duration } => {
                state.mark_failed(now, *duration, error.clone());
                state.should_retry().then(|| state.next(now))
            }
            DispatchOutcome::DeadlineExceeded { duration } => {
                // 交由超时循环处理，避免两处同时写回
                warn!(
                    store = POSTGRES_STORE_NAME,
                    event_id = state.event_id,
                    state_id = state.id,
                    consumer = %state.consumer_name,
                    duration_ms = duration.as_millis() as u64,
                    "consumer deadline exceeded, leaving row to the timeout loop"
                );
                return;
            }
        };

        match self.repo.save_outcome(&state, successor.as_ref()).await {
            Ok(OutcomeWrite::Saved { successor_id }) => log_outcome(&state, &event, successor_id),
            Ok(OutcomeWrite::AlreadyResolved) => {
                warn!(
                    store = POSTGRES_STORE_NAME,
                    event_id = state.event_id,
                    state_id = state.id,
                    consumer = %state.consumer_name,
                    "processing state already resolved, outcome discarded"
                );
            }
            Err(e) => {
                error!(
                    store = POSTGRES_STORE_NAME,
                    event_id = state.event_id,
                    state_id = state.id,
                    consumer = %state.consumer_name,
                    error = %e,
                    "failed to save processing outcome"
                );
            }
        }
    }

    async fn sweep_timeouts(&self) {
        loop {
            match self.repo.fail_timed_out().await {
                Ok(Some(timed_out)) => {
                    let failed = &timed_out.failed;
                    warn!(
                        store = POSTGRES_STORE_NAME,
                        event_id = failed.event_id,
                        state_id = failed.id,
                        consumer = %failed.consumer_name,
                        retry_number = failed.retry_number,
                        max_retries = failed.max_retries,
                        successor_id = timed_out.successor.as_ref().map(|s| s.id),
                        "consumer timeout reached"
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    error!(store = POSTGRES_STORE_NAME, error = %e, "failed to sweep timed out states");
                    break;
                }
            }
        }
    }
}

fn log_outcome(state: &ProcessingState, event: &EventRecord, successor_id: Option<i64>) {
    match (&state.error, successor_id) {
        (None, _) => debug!(
            store = POSTGRES_STORE_NAME,
            event_id = state.event_id,
            state_id = state.id,
            consumer = %state.consumer_name,
            event_name = %event.event_name,
            retry_number = state.retry_number,
            duration_ms = state.duration_ms,
            "consumer succeeded"
        ),
        (Some(e), Some(next_id)) => warn!(
            store = POSTGRES_STORE_NAME,
            event_id = state.event_id,
            state_id = state.id,
            successor_id = next_id,
            consumer = %state.consumer_name,
            event_name = %event.event_name,
            retry_number = state.retry_number,
            max_retries = state.max_retries,
            retry_interval_ms = state.retry_interval_ms,
            error = %e,
            "consumer failed, retry scheduled"
        ),
        (Some(e), None) => error!(
            store = POSTGRES_STORE_NAME,
            event_id = state.event_id,
            state_id = state.id,
            consumer = %state.consumer_name,
            event_name = %event.event_name,
            retry_number = state.retry_number,
            max_retries = state.max_retries,
            error = %e,
            "consumer failed, reached max retries"
        ),
    }
}

/// 运行一次迭代，panic 转为其消息
async fn guarded<F: Future<Output = ()>>(fut: F) -> Result<(), String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(panic.as_ref()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn metadata_map(metadata: &Value) -> HashMap<String, Value> {
    match metadata {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => HashMap::new(),
    }
}

fn spawn_periodic<F, Fut>(token: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => f().await,
            }
        }
    })
}
