//! Broker-queue development harness.
//!
//! Spins up a `Supervisor`, declares one demo queue, registers a single
//! acking consumer against it, and publishes a batch of messages through
//! the same `QueueHandle` API a connection handler would use. Useful for
//! poking at dispatch/flow-control behavior without a wire protocol in
//! front of it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::oneshot;
use tracing::info;

use bq_common::{Channel, ChannelId, ConsumerTag, Delivery, Persister, QueueConfig};
use bq_persist::{MemoryPersister, SqlitePersister};
use bq_queue::{Message, QueueDescriptor, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "bq-dev")]
#[command(about = "broker-queue development harness")]
struct Args {
    /// Name of the demo queue to declare.
    #[arg(long, env = "BQ_QUEUE", default_value = "demo")]
    queue: String,

    /// Number of messages the demo publisher sends.
    #[arg(long, env = "BQ_MESSAGE_COUNT", default_value = "10")]
    message_count: usize,

    /// Persistence backend: "memory" or "sqlite".
    #[arg(long, env = "BQ_BACKEND", default_value = "memory")]
    backend: String,

    /// SQLite connection string, only used when --backend=sqlite.
    #[arg(long, env = "BQ_SQLITE_URL", default_value = "sqlite::memory:")]
    sqlite_url: String,
}

/// A `Channel` that prints and immediately acks everything it receives,
/// standing in for a real connection during local poking.
struct PrintingChannel {
    handle: tokio::sync::OnceCell<bq_queue::QueueHandle>,
    channel_id: ChannelId,
    received: AtomicUsize,
}

impl PrintingChannel {
    fn new(channel_id: ChannelId) -> Arc<Self> {
        Arc::new(Self {
            handle: tokio::sync::OnceCell::new(),
            channel_id,
            received: AtomicUsize::new(0),
        })
    }

    fn attach(&self, handle: bq_queue::QueueHandle) {
        let _ = self.handle.set(handle);
    }

    fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for PrintingChannel {
    async fn deliver(&self, tag: &ConsumerTag, delivery: Delivery) {
        info!(
            tag = %tag.0,
            delivery_id = %delivery.delivery_id,
            redelivered = delivery.redelivered,
            payload = %String::from_utf8_lossy(&delivery.message.payload),
            "received message"
        );
        self.received.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.get() {
            let _ = handle.ack(None, self.channel_id, vec![delivery.delivery_id]).await;
        }
    }

    async fn consumer_cancelled(&self, tag: ConsumerTag) {
        info!(tag = %tag.0, "consumer cancelled");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    bq_common::logging::init_default_logging();

    let args = Args::parse();
    info!(queue = %args.queue, backend = %args.backend, "starting bq-dev");

    let persister: Arc<dyn Persister> = match args.backend.as_str() {
        "memory" => Arc::new(MemoryPersister::new()),
        "sqlite" => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&args.sqlite_url)
                .await
                .context("connecting to sqlite backend")?;
            let persister = SqlitePersister::new(pool);
            persister.init_schema().await.context("initializing WAL schema")?;
            Arc::new(persister)
        }
        other => anyhow::bail!("unknown backend {other:?}, expected \"memory\" or \"sqlite\""),
    };

    let supervisor = Arc::new(Supervisor::new(persister, QueueConfig::default()));
    let handle = supervisor.declare(QueueDescriptor::new(args.queue.clone()));

    let channel_id = ChannelId(1);
    let channel = PrintingChannel::new(channel_id);
    channel.attach(handle.clone());

    let (_keepalive, liveness) = oneshot::channel();
    handle
        .register_consumer(
            channel_id,
            channel.clone(),
            liveness,
            None,
            ConsumerTag("bq-dev".to_string()),
            true,
            false,
        )
        .await
        .context("registering demo consumer")?;

    for i in 0..args.message_count {
        let payload = format!("message-{i}");
        handle
            .deliver(None, ChannelId(0), Message::new(payload), false)
            .await
            .context("publishing demo message")?;
    }

    for _ in 0..200 {
        if channel.received() >= args.message_count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    info!(received = channel.received(), sent = args.message_count, "demo run complete");

    supervisor.terminate_all().await;
    Ok(())
}
