//! Mail queue worker on PostgreSQL
//!
//! Run with: DATABASE_URL=postgres://... cargo run -p dbqueue --example postgres_worker
//!
//! Queue settings come from `MAIL_QUEUE_*` variables, e.g.
//! `MAIL_QUEUE_NO_TASK_TIMEOUT_MS=1000` and `MAIL_QUEUE_BETWEEN_TASK_TIMEOUT_MS=10`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbqueue::api::{
    EnqueueParams, JsonPayloadTransformer, LoggingTaskLifecycleListener,
    LoggingThreadLifecycleListener, QueueConsumer, QueueProducer, QueueShardRouter,
    ShardedQueueProducer, SingleShardRouter, Task, TaskExecutionResult, TaskPayloadTransformer,
};
use dbqueue::registry::QueueRegistry;
use dbqueue::settings::{QueueConfig, QueueLocation, QueueSettings, QueueShardId};
use dbqueue::storage::{PostgresQueueStore, QueueStore};
use dbqueue::worker::{ExecutionPoolConfig, QueueExecutionPool};

#[derive(Debug, Serialize, Deserialize)]
struct Mail {
    to: String,
    subject: String,
}

struct MailConsumer {
    config: QueueConfig,
}

#[async_trait]
impl QueueConsumer<Mail> for MailConsumer {
    fn queue_config(&self) -> &QueueConfig {
        &self.config
    }

    fn payload_transformer(&self) -> Arc<dyn TaskPayloadTransformer<Mail>> {
        Arc::new(JsonPayloadTransformer::<Mail>::new())
    }

    fn shard_router(&self) -> Arc<dyn QueueShardRouter<Mail>> {
        Arc::new(SingleShardRouter::new(QueueShardId::new("main")))
    }

    async fn execute(&self, task: Task<Mail>) -> Result<TaskExecutionResult> {
        let mail = task.payload_or_err()?;
        tracing::info!(
            to = %mail.to,
            subject = %mail.subject,
            attempt = task.attempts_count(),
            "sending mail"
        );
        Ok(TaskExecutionResult::finish())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbqueue=debug,postgres_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&database_url).await?;

    let location = QueueLocation::new("queue_tasks", "mail")?;
    let config = QueueConfig::new(location.clone(), QueueSettings::from_env("MAIL_QUEUE")?);

    let store = Arc::new(PostgresQueueStore::new(QueueShardId::new("main"), pool));
    store.ensure_schema(&location).await?;
    let store: Arc<dyn QueueStore> = store;

    let producer = Arc::new(ShardedQueueProducer::new(
        config.clone(),
        Arc::new(JsonPayloadTransformer::<Mail>::new()),
        Arc::new(SingleShardRouter::new(QueueShardId::new("main"))),
        [store.clone()],
    ));
    let consumer = Arc::new(MailConsumer {
        config: config.clone(),
    });

    let mut registry = QueueRegistry::new();
    registry
        .register_shard(store)
        .register_queue::<Mail>(consumer, producer.clone())
        .register_task_lifecycle_listener(location.clone(), Arc::new(LoggingTaskLifecycleListener))
        .register_thread_lifecycle_listener(location, Arc::new(LoggingThreadLifecycleListener));
    let registered = registry.finish_registration()?;

    let queue_pool = QueueExecutionPool::new(registered, ExecutionPoolConfig::from_env());
    queue_pool.start()?;

    let enqueued = producer
        .enqueue(
            EnqueueParams::new(Mail {
                to: "ops@example.com".to_string(),
                subject: "worker started".to_string(),
            })
            .with_correlation_id("startup"),
        )
        .await?;
    tracing::info!(task_id = enqueued.enqueue_id, shard = %enqueued.shard_id, "enqueued mail");

    tracing::info!("worker ready, waiting for shutdown signal...");
    tokio::signal::ctrl_c().await?;

    queue_pool.shutdown().await?;
    tracing::info!("worker shutdown complete");
    Ok(())
}
