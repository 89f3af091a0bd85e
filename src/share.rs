//! Share-link resolution.
//!
//! Share links (`/r/<subreddit>/s/<id>`) are tokenized short URLs that
//! redirect to a canonical post URL carrying tracking parameters. Resolution
//! follows the redirect once, strips the tracking parameters, and caches the
//! result; failures are returned as `None` and never cached, since they are
//! usually transient.

use crate::auth::CredentialCache;
use crate::cache::BoundedPersistentCache;
use crate::metrics;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Query parameters removed from resolved URLs; everything else is preserved.
const TRACKING_PARAMS: &[&str] = &[
    "share_id",
    "utm_content",
    "utm_medium",
    "utm_name",
    "utm_source",
    "utm_term",
];

type ResolveFuture = Shared<BoxFuture<'static, Option<String>>>;

/// Resolver for tokenized share links, backed by a bounded persistent cache.
pub struct ShareLinkResolver {
    http: Client,
    cache: BoundedPersistentCache<String>,
    auth: Option<Arc<CredentialCache>>,
    base_url: String,
    inflight: Arc<DashMap<String, ResolveFuture>>,
}

impl ShareLinkResolver {
    pub fn new(
        http: Client,
        cache: BoundedPersistentCache<String>,
        auth: Option<Arc<CredentialCache>>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            cache,
            auth,
            base_url: base_url.into(),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Resolve a share link to its canonical URL.
    ///
    /// Returns `None` when no resolved location is produced; that outcome is
    /// not cached. With `strip_tracking` the resolved URL has the tracking
    /// parameters removed and is cached; without it, the raw resolved URL is
    /// returned uncached. Concurrent stripped calls for the same key share
    /// one lookup.
    pub async fn resolve(
        &self,
        subreddit: &str,
        share_id: &str,
        strip_tracking: bool,
    ) -> Option<String> {
        let cache_key = format!("{subreddit}:{share_id}");
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!("Cache hit for {} -> {}", cache_key, cached);
            metrics::record_cache_hit("share_link");
            return Some(cached);
        }
        metrics::record_cache_miss("share_link");

        let share_url = format!("{}/r/{}/s/{}", self.base_url, subreddit, share_id);

        // Raw resolutions are never cached and must return the tracking
        // parameters intact, so they cannot join a stripped in-flight job;
        // each one performs its own lookup.
        if !strip_tracking {
            return Self::fetch_resolved(&self.http, self.auth.as_deref(), &share_url, &cache_key)
                .await
                .map(|url| url.to_string());
        }

        let fut = match self.inflight.entry(cache_key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let fut = Self::resolve_and_cache(
                    self.http.clone(),
                    self.cache.clone(),
                    self.auth.clone(),
                    Arc::clone(&self.inflight),
                    share_url,
                    cache_key,
                )
                .boxed()
                .shared();
                entry.insert(fut.clone());
                fut
            }
        };
        fut.await
    }

    async fn resolve_and_cache(
        http: Client,
        cache: BoundedPersistentCache<String>,
        auth: Option<Arc<CredentialCache>>,
        inflight: Arc<DashMap<String, ResolveFuture>>,
        share_url: String,
        cache_key: String,
    ) -> Option<String> {
        let result = Self::fetch_resolved(&http, auth.as_deref(), &share_url, &cache_key)
            .await
            .map(|mut url| {
                strip_tracking_params(&mut url);
                let canonical = url.to_string();
                // Cached before the in-flight entry is dropped, so the next
                // caller sees a clean cache hit.
                cache.set(&cache_key, canonical.clone());
                canonical
            });

        inflight.remove(&cache_key);
        result
    }

    /// Follow the share link's redirect and return the final URL, or `None`
    /// when no resolved location is produced.
    async fn fetch_resolved(
        http: &Client,
        auth: Option<&CredentialCache>,
        share_url: &str,
        cache_key: &str,
    ) -> Option<Url> {
        let mut request = http.head(share_url);
        if let Some(auth) = auth {
            match auth.token().await {
                Ok(token) => request = request.bearer_auth(token),
                Err(e) => warn!("Resolving {} without auth: {}", cache_key, e),
            }
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let final_url = response.url().clone();
                // No redirect happened: the short link did not resolve.
                if final_url.as_str() == share_url {
                    None
                } else {
                    Some(final_url)
                }
            }
            Ok(response) => {
                debug!(
                    "Share link {} resolution returned {}",
                    cache_key,
                    response.status()
                );
                None
            }
            Err(e) => {
                warn!("Error resolving share link {}: {}", cache_key, e);
                None
            }
        }
    }

    /// Number of cached share links (health reporting).
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub async fn flush_cache(&self) {
        self.cache.flush_on_shutdown().await;
    }
}

/// Remove the known tracking parameters, preserving all others verbatim.
fn strip_tracking_params(url: &mut Url) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if retained.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(retained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn resolver_for(server: &MockServer, dir: &tempfile::TempDir) -> ShareLinkResolver {
        let cache = BoundedPersistentCache::load(dir.path().join("cache.json"), 100, 1000).await;
        ShareLinkResolver::new(Client::new(), cache, None, server.uri())
    }

    async fn mount_share_redirect(server: &MockServer, expect: u64) {
        Mock::given(method("HEAD"))
            .and(path("/r/pics/s/abc123"))
            .respond_with(ResponseTemplate::new(302).insert_header(
                "location",
                format!(
                    "{}/r/pics/comments/xyz/a_title/?share_id=x&utm_source=ios&foo=bar",
                    server.uri()
                )
                .as_str(),
            ))
            .expect(expect)
            .mount(server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/r/pics/comments/xyz/a_title/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn resolves_and_strips_tracking_params() {
        let server = MockServer::start().await;
        mount_share_redirect(&server, 1).await;
        let dir = tempdir().unwrap();
        let resolver = resolver_for(&server, &dir).await;

        let url = resolver.resolve("pics", "abc123", true).await.unwrap();
        assert!(url.contains("foo=bar"), "unknown params must be preserved: {url}");
        assert!(!url.contains("share_id"), "share_id must be stripped: {url}");
        assert!(!url.contains("utm_source"), "utm_source must be stripped: {url}");
    }

    #[tokio::test]
    async fn second_resolve_is_a_cache_hit() {
        let server = MockServer::start().await;
        mount_share_redirect(&server, 1).await;
        let dir = tempdir().unwrap();
        let resolver = resolver_for(&server, &dir).await;

        let first = resolver.resolve("pics", "abc123", true).await.unwrap();
        let second = resolver.resolve("pics", "abc123", true).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.cache_len(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/r/pics/s/abc123"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header(
                        "location",
                        format!("{}/r/pics/comments/xyz/a_title/", server.uri()).as_str(),
                    )
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/r/pics/comments/xyz/a_title/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let resolver = resolver_for(&server, &dir).await;

        let (a, b) = tokio::join!(
            resolver.resolve("pics", "abc123", true),
            resolver.resolve("pics", "abc123", true)
        );
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[tokio::test]
    async fn unresolved_link_returns_none_and_is_not_cached() {
        let server = MockServer::start().await;
        // 200 with no redirect: no resolved location was produced.
        Mock::given(method("HEAD"))
            .and(path("/r/pics/s/dead"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let resolver = resolver_for(&server, &dir).await;

        assert_eq!(resolver.resolve("pics", "dead", true).await, None);
        // Failure was not cached: the second call goes upstream again.
        assert_eq!(resolver.resolve("pics", "dead", true).await, None);
        assert_eq!(resolver.cache_len(), 0);
    }

    #[tokio::test]
    async fn error_status_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let resolver = resolver_for(&server, &dir).await;

        assert_eq!(resolver.resolve("pics", "broken", true).await, None);
    }

    #[tokio::test]
    async fn unstripped_resolution_is_not_cached() {
        let server = MockServer::start().await;
        mount_share_redirect(&server, 2).await;
        let dir = tempdir().unwrap();
        let resolver = resolver_for(&server, &dir).await;

        let raw = resolver.resolve("pics", "abc123", false).await.unwrap();
        assert!(raw.contains("share_id=x"), "raw URL keeps tracking params: {raw}");
        assert_eq!(resolver.cache_len(), 0);

        // Second unstripped call goes upstream again.
        resolver.resolve("pics", "abc123", false).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_mixed_flag_calls_each_honor_their_flag() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/r/pics/s/abc123"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header(
                        "location",
                        format!(
                            "{}/r/pics/comments/xyz/a_title/?share_id=x&utm_source=ios&foo=bar",
                            server.uri()
                        )
                        .as_str(),
                    )
                    .set_delay(Duration::from_millis(50)),
            )
            // The raw call must not piggyback on the stripped lookup.
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/r/pics/comments/xyz/a_title/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let resolver = resolver_for(&server, &dir).await;

        let (stripped, raw) = tokio::join!(
            resolver.resolve("pics", "abc123", true),
            resolver.resolve("pics", "abc123", false)
        );

        let stripped = stripped.unwrap();
        assert!(!stripped.contains("share_id"), "stripped call lost its flag: {stripped}");
        assert!(stripped.contains("foo=bar"), "{stripped}");

        let raw = raw.unwrap();
        assert!(raw.contains("share_id=x"), "raw call lost its flag: {raw}");
        assert!(raw.contains("utm_source=ios"), "{raw}");

        assert_eq!(resolver.cache_len(), 1, "only the stripped result is cached");
    }

    #[test]
    fn strip_removes_exactly_the_tracking_params() {
        let mut url = Url::parse(
            "https://example.com/r/a/s/abc?share_id=x&utm_content=c&utm_medium=m&utm_name=n&utm_source=s&utm_term=t&keep=1",
        )
        .unwrap();
        strip_tracking_params(&mut url);
        assert_eq!(url.query(), Some("keep=1"));
    }

    #[test]
    fn strip_clears_query_when_nothing_remains() {
        let mut url = Url::parse("https://example.com/post?share_id=x&utm_source=s").unwrap();
        strip_tracking_params(&mut url);
        assert_eq!(url.query(), None);
        assert_eq!(url.as_str(), "https://example.com/post");
    }
}
