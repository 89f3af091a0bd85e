use crate::error::Result;
use crate::metrics;
use crate::server::state::AppState;
use crate::server::validation::validate_media_id;
use axum::extract::{Path, State};
use axum::response::Redirect;
use std::time::Instant;
use tracing::info;

/// Resolve a tokenized share link and redirect to the canonical post URL.
///
/// An unresolved link falls back to the upstream share URL itself, so the
/// consumer still lands on the post even when resolution fails.
pub async fn resolve_share_link(
    Path((subreddit, share_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Redirect> {
    let start = Instant::now();
    let result = resolve_redirect(&subreddit, &share_id, &state).await;

    // Errors count too, under the status they surface as.
    let status = match &result {
        Ok(_) => 307,
        Err(e) => e.status_code().as_u16(),
    };
    metrics::record_request("share", status);
    metrics::record_duration("share", start);

    result
}

async fn resolve_redirect(
    subreddit: &str,
    share_id: &str,
    state: &AppState,
) -> Result<Redirect> {
    validate_media_id(subreddit)?;
    validate_media_id(share_id)?;

    info!("Resolving share link /r/{}/s/{}", subreddit, share_id);

    let target = match state.resolver.resolve(subreddit, share_id, true).await {
        Some(url) => url,
        None => format!(
            "{}/r/{}/s/{}",
            state.config.reddit_base_url, subreddit, share_id
        ),
    };

    Ok(Redirect::temporary(&target))
}
