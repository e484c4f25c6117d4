use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use eventide_core::{
    ConsumeContext, Consumer, ConsumerOptions, ConsumerRegistry, EventRuntime, InMemoryStore,
    ProducerExt, ProducerOptions, RuntimeConfig, Store, select_store,
};
use eventide_macros::event;
use eventide_postgres::{PgEventStore, PgStoreConfig};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[event(name = "account.opened")]
struct AccountOpened {
    account_id: String,
    owner: String,
}

#[event(name = "account.deposited")]
struct AccountDeposited {
    account_id: String,
    amount: i64,
}

/// 首次投递失败，演示重试
#[derive(Default)]
struct WelcomeMailer {
    attempts: AtomicUsize,
}

#[async_trait]
impl Consumer for WelcomeMailer {
    type Event = AccountOpened;

    fn name(&self) -> &str {
        "welcome-mailer"
    }

    fn options(&self) -> ConsumerOptions {
        ConsumerOptions::default()
            .with_max_retries(3)
            .with_retry_interval(Duration::from_millis(200))
            .with_consume_timeout(Duration::from_secs(5))
    }

    async fn consume(&self, ctx: &ConsumeContext, event: AccountOpened) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            anyhow::bail!("smtp relay unavailable");
        }
        info!(
            account_id = %event.account_id,
            owner = %event.owner,
            retry_number = ctx.retry_number(),
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            "welcome mail sent"
        );
        Ok(())
    }
}

struct LedgerProjector;

#[async_trait]
impl Consumer for LedgerProjector {
    type Event = AccountDeposited;

    fn name(&self) -> &str {
        "ledger-projector"
    }

    async fn consume(&self, _ctx: &ConsumeContext, event: AccountDeposited) -> anyhow::Result<()> {
        info!(account_id = %event.account_id, amount = event.amount, "ledger updated");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let registry = ConsumerRegistry::new();
    registry.register(WelcomeMailer::default())?;
    registry.register(LedgerProjector)?;

    let mut stores: Vec<Arc<dyn Store>> = vec![Arc::new(InMemoryStore::new())];
    if let Ok(url) = std::env::var("DATABASE_URL") {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .context("failed to connect to DATABASE_URL")?;
        stores.push(Arc::new(PgEventStore::new(pool, PgStoreConfig::from_env()?)?));
    }

    let config = RuntimeConfig::from_env();
    let runtime = EventRuntime::builder()
        .store(select_store(&stores, &config.store_name)?)
        .registry(registry)
        .build();
    runtime.start().await?;

    runtime
        .produce(
            &AccountOpened {
                account_id: "acc-1".into(),
                owner: "ada".into(),
            },
            Some(ProducerOptions::new().with_metadata("source", "demo")),
        )
        .await?;

    runtime
        .produce(
            &AccountDeposited {
                account_id: "acc-1".into(),
                amount: 500,
            },
            Some(ProducerOptions::new().with_produce_at(Utc::now() + chrono::Duration::seconds(1))),
        )
        .await?;

    runtime
        .produce_sync(
            &AccountDeposited {
                account_id: "acc-1".into(),
                amount: 25,
            },
            None,
        )
        .await?;

    info!(store = runtime.store().name(), "events produced, press ctrl-c to stop");
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
    }

    runtime.stop().await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,eventide_core=debug,eventide_postgres=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
