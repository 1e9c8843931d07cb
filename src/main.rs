use std::sync::Arc;

use triage::classifier::ClassifierClient;
use triage::config::Config;
use triage::store::RedisStore;
use triage::supervisor::Supervisor;
use triage::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!(cities = config.cities.len(), "configuration loaded");

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let upstream = Arc::new(UpstreamClient::new()?);
    let classifier = Arc::new(ClassifierClient::new(&config)?);

    let supervisor = Supervisor::spawn_all(config, store, upstream, classifier);
    let cancellation = supervisor.cancellation();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
        _ = cancellation.cancelled() => {}
    }

    supervisor.shutdown().await;
    Ok(())
}
