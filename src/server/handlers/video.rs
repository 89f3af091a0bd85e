use crate::error::Result;
use crate::metrics;
use crate::server::state::AppState;
use crate::server::validation::validate_media_id;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use std::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::info;

/// Serve a muxed video file, converting it first if necessary.
///
/// Assets without a companion audio stream are redirected straight to the
/// raw video stream instead of being muxed.
pub async fn serve_video(
    Path((video_id, video_name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    let result = convert_response(&video_id, &video_name, &state).await;

    // Errors count too, under the status they surface as.
    let status = match &result {
        Ok(response) => response.status().as_u16(),
        Err(e) => e.status_code().as_u16(),
    };
    metrics::record_request("video", status);
    metrics::record_duration("video", start);

    result
}

async fn convert_response(video_id: &str, video_name: &str, state: &AppState) -> Result<Response> {
    validate_media_id(video_id)?;
    validate_media_id(video_name)?;

    info!("Serving video {} ({})", video_id, video_name);

    match state.pipeline.convert(video_id, video_name).await? {
        crate::video::Converted::File(path) => {
            let file = tokio::fs::File::open(&path).await?;
            let stream = ReaderStream::new(file);

            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "video/mp4"),
                    (header::CACHE_CONTROL, "max-age=14400"),
                ],
                Body::from_stream(stream),
            )
                .into_response())
        }
        crate::video::Converted::RedirectToSource(url) => {
            Ok(Redirect::temporary(&url).into_response())
        }
    }
}
