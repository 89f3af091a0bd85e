use crate::auth::CredentialCache;
use crate::cache::BoundedPersistentCache;
use crate::config::Config;
use crate::share::ShareLinkResolver;
use crate::video::{VideoCache, VideoConversionPipeline};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling
    pub http_client: Client,
    pub resolver: Arc<ShareLinkResolver>,
    pub pipeline: Arc<VideoConversionPipeline>,
    pub started_at: Instant,
}

impl AppState {
    /// Create a new AppState, loading both persistent caches from disk.
    pub async fn new(config: Config) -> Self {
        let http_client = Client::builder()
            .user_agent(config.user_agent.clone())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to create HTTP client");

        let auth = config.oauth.as_ref().map(|oauth| {
            Arc::new(CredentialCache::new(
                http_client.clone(),
                oauth,
                config.token_url.clone(),
            ))
        });

        let link_cache = BoundedPersistentCache::load(
            config.link_cache_file(),
            config.link_cache_capacity,
            config.link_cache_save_every,
        )
        .await;
        let resolver = Arc::new(ShareLinkResolver::new(
            http_client.clone(),
            link_cache,
            auth,
            config.reddit_base_url.clone(),
        ));

        let video_cache =
            VideoCache::load(config.video_cache_file(), config.video_cache_capacity).await;
        let pipeline = Arc::new(VideoConversionPipeline::new(
            http_client.clone(),
            video_cache,
            &config,
        ));

        Self {
            config: Arc::new(config),
            http_client,
            resolver,
            pipeline,
            started_at: Instant::now(),
        }
    }

    /// Flush both persistent caches, best-effort and time-bounded.
    pub async fn flush_caches(&self) {
        const FLUSH_BUDGET: Duration = Duration::from_secs(5);
        if tokio::time::timeout(FLUSH_BUDGET, self.resolver.flush_cache())
            .await
            .is_err()
        {
            warn!("Timed out flushing share-link cache");
        }
        if tokio::time::timeout(FLUSH_BUDGET, self.pipeline.flush_cache())
            .await
            .is_err()
        {
            warn!("Timed out flushing video cache");
        }
    }
}
