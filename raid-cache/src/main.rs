use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use raid_cache::config::Config;
use raid_cache::events::{EventHandler, EventSubscriber, InvalidationHandler, LoggingHandler};
use raid_cache::Cache;

async fn shutdown() -> std::io::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base_layer = fmt::layer().with_target(true).with_level(true);

    let log_layer = if json {
        base_layer.json().with_filter(filter).boxed()
    } else {
        base_layer.with_filter(filter).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env()?;
    init_logging(config.log_json);

    let client = Arc::new(config.redis_client().await?);
    let cache: Arc<dyn Cache> = Arc::new(config.redis_cache(client.clone())?);

    let invalidation: Arc<dyn EventHandler> = Arc::new(InvalidationHandler::new(cache));
    let logging: Arc<dyn EventHandler> = Arc::new(LoggingHandler);

    let channels = config.channels();
    let mut subscribers = Vec::with_capacity(channels.len());
    for channel in &channels {
        let subscriber = EventSubscriber::new(client.clone(), channel.clone());
        subscriber.subscribe(invalidation.clone()).await?;
        subscriber.subscribe(logging.clone()).await?;
        subscribers.push(subscriber);
    }

    info!(
        channels = ?channels,
        prefix = %config.cache_prefix,
        "Listening for change events"
    );

    shutdown().await?;

    for subscriber in &subscribers {
        subscriber.unsubscribe(None).await;
    }
    Ok(())
}
