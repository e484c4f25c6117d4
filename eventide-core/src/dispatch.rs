//! 调度执行器（Dispatch Executor）
//!
//! 在有界截止时间内调用已解析的消费者并归类结果：
//! - 调用以独立任务运行，与计时器赛跑；
//! - 计时器先到则取消上下文令牌并放弃该任务（不等待其结束）。
//!
//! 注意：被放弃的任务仍会继续运行直至消费者自行返回；
//! 忽略 `ConsumeContext` 取消信号的消费者会因此泄漏任务。
//!
use crate::consumer::{ConsumeContext, DecodedEvent, RegisteredConsumer};
use crate::error::{EventError, EventResult};
use crate::event::RawEvent;
use crate::options::ProducerOptions;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// 单次调用的结果分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded { duration: Duration },
    Failed { error: String, duration: Duration },
    DeadlineExceeded { duration: Duration },
}

impl DispatchOutcome {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Succeeded { duration }
            | Self::Failed { duration, .. }
            | Self::DeadlineExceeded { duration } => *duration,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// 失败原因；超时返回固定文案
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { error, .. } => Some(error),
            Self::DeadlineExceeded { .. } => Some(TIMEOUT_REASON),
        }
    }
}

/// 超时导致失败时记录的原因
pub const TIMEOUT_REASON: &str = "consumer timeout reached";

/// 在 `timeout` 内调用消费者
pub async fn dispatch(
    consumer: &RegisteredConsumer,
    event: DecodedEvent,
    ctx: ConsumeContext,
    timeout: Duration,
) -> DispatchOutcome {
    let started = Instant::now();
    let ctx = ctx.with_deadline(timeout);
    let mut task = tokio::spawn(consumer.invoke(ctx.clone(), event));

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(()))) => DispatchOutcome::Succeeded {
            duration: started.elapsed(),
        },
        Ok(Ok(Err(err))) => DispatchOutcome::Failed {
            error: format!("{err:#}"),
            duration: started.elapsed(),
        },
        Ok(Err(join_err)) => DispatchOutcome::Failed {
            error: if join_err.is_panic() {
                format!("consumer panicked: {join_err}")
            } else {
                format!("consumer task aborted: {join_err}")
            },
            duration: started.elapsed(),
        },
        Err(_elapsed) => {
            ctx.cancel();
            // 丢弃 JoinHandle 即分离任务
            drop(task);
            DispatchOutcome::DeadlineExceeded {
                duration: started.elapsed(),
            }
        }
    }
}

/// 解码负载后调用；解码失败视为一次失败的尝试
pub async fn resolve_and_dispatch(
    consumer: &RegisteredConsumer,
    payload: &Value,
    ctx: ConsumeContext,
    timeout: Duration,
) -> DispatchOutcome {
    match consumer.decode(payload) {
        Ok(decoded) => dispatch(consumer, decoded, ctx, timeout).await,
        Err(err) => DispatchOutcome::Failed {
            error: err.to_string(),
            duration: Duration::ZERO,
        },
    }
}

/// 进程内调用（同步发布路径）
///
/// 失败后在尝试预算内递增 `retry_count`，等待 `retry_interval` 后重试；
/// 预算耗尽则返回最后一次错误。解码失败不重试。
pub async fn invoke_locally(
    consumer: &RegisteredConsumer,
    event: &RawEvent,
    mut opts: ProducerOptions,
) -> EventResult<()> {
    let options = consumer.options().clone();
    let budget = options.attempt_budget();

    loop {
        let decoded = consumer.decode(event.payload())?;
        let ctx = ConsumeContext::new(opts.retry_count() + 1, opts.metadata().clone());
        let outcome = dispatch(consumer, decoded, ctx, options.consume_timeout()).await;

        let reason = match &outcome {
            DispatchOutcome::Succeeded { .. } => return Ok(()),
            DispatchOutcome::Failed { error, .. } => error.clone(),
            DispatchOutcome::DeadlineExceeded { .. } => TIMEOUT_REASON.to_string(),
        };

        let current = opts.retry_count();
        opts.increment_retry_count();

        if opts.retry_count() < budget {
            warn!(
                consumer = consumer.name(),
                event_name = %event.name(),
                error = %reason,
                current_retry_count = current,
                max_retries = budget,
                "will retry event because consumer returned an error"
            );
            if let Some(interval) = options.retry_interval() {
                tokio::time::sleep(interval).await;
            }
            continue;
        }

        error!(
            consumer = consumer.name(),
            event_name = %event.name(),
            error = %reason,
            retry_count = current,
            max_retries = budget,
            "unable to execute event, reached max retries"
        );

        return Err(match outcome {
            DispatchOutcome::DeadlineExceeded { .. } => EventError::Timeout {
                consumer: consumer.name().to_string(),
                timeout_ms: u64::try_from(options.consume_timeout().as_millis()).unwrap_or(u64::MAX),
            },
            _ => EventError::Consumer {
                consumer: consumer.name().to_string(),
                reason,
            },
        });
    }
}
