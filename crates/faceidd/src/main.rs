use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use faceidd::cache::GalleryCache;
use faceidd::config::Config;
use faceidd::host::{ModelHost, OnnxModelProvider};
use faceidd::pipeline::RecognitionPipeline;
use faceidd::store::{GalleryStore, SqliteGalleryStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceidd starting");

    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    let store = Arc::new(SqliteGalleryStore::open(&config.db_path).await?);
    let cache = Arc::new(GalleryCache::new(
        Arc::clone(&store) as Arc<dyn GalleryStore>
    ));

    // A failed initial refresh is survivable: the cache starts degraded on an
    // empty snapshot and the periodic task keeps retrying.
    match cache.refresh().await {
        Ok(stats) => tracing::info!(loaded = stats.loaded, skipped = stats.skipped, "gallery loaded"),
        Err(error) => tracing::warn!(%error, "initial gallery refresh failed; starting degraded"),
    }
    Arc::clone(&cache).spawn_refresh_task(config.refresh_interval());

    // Models are constructed lazily on the first inference request.
    let provider = Arc::new(OnnxModelProvider::new(
        config.detector_model_path(),
        config.embedder_model_path(),
        config.embedding_dim,
    ));
    let host = Arc::new(ModelHost::new(provider, config.device));

    // The transport layer (out of tree) dispatches commands into the pipeline.
    let _pipeline = RecognitionPipeline::new(host, cache, store as Arc<dyn GalleryStore>);

    tracing::info!("faceidd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceidd shutting down");

    Ok(())
}
