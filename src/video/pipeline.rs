//! Conversion pipeline for v.redd.it assets.
//!
//! Reddit serves video and audio as separate DASH streams. The pipeline
//! probes for a companion audio stream, muxes both into one mp4 with an
//! external transcoder (stream copy, no re-encode), and caches the result
//! for 24 hours. Concurrent requests for the same asset coalesce onto a
//! single subprocess via the in-flight map.

use crate::config::Config;
use crate::error::{EmbedditError, Result};
use crate::metrics;
use crate::video::cache::VideoCache;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use reqwest::Client;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Known audio stream candidates, highest bitrate first.
const AUDIO_STREAM_PATTERNS: &[&str] =
    &["DASH_AUDIO_128.mp4", "DASH_AUDIO_64.mp4", "DASH_audio.mp4"];

/// Cloneable failure shared between coalesced waiters.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct ConversionFailed(String);

type ConversionFuture = Shared<BoxFuture<'static, std::result::Result<PathBuf, ConversionFailed>>>;

/// Outcome of [`VideoConversionPipeline::convert`].
#[derive(Debug)]
pub enum Converted {
    /// A muxed file ready to stream.
    File(PathBuf),
    /// No companion audio exists (silent clips/GIFs): send the caller
    /// straight to the raw video stream, nothing cached.
    RedirectToSource(String),
}

pub struct VideoConversionPipeline {
    http: Client,
    cache: VideoCache,
    inflight: Arc<DashMap<String, ConversionFuture>>,
    output_dir: PathBuf,
    base_url: String,
    ffmpeg: String,
    probe_timeout: Duration,
    ttl: Duration,
}

impl VideoConversionPipeline {
    pub fn new(http: Client, cache: VideoCache, config: &Config) -> Self {
        Self {
            http,
            cache,
            inflight: Arc::new(DashMap::new()),
            output_dir: config.video_dir.clone(),
            base_url: config.video_base_url.clone(),
            ffmpeg: config.ffmpeg_path.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            ttl: Duration::from_secs(config.video_ttl_secs),
        }
    }

    /// Produce (or reuse) a muxed video file for `video_id`.
    pub async fn convert(&self, video_id: &str, video_name: &str) -> Result<Converted> {
        if let Some(path) = self.cache.get_valid(video_id).await {
            debug!("Found cached video for ID {}", video_id);
            metrics::record_cache_hit("video");
            return Ok(Converted::File(path));
        }
        metrics::record_cache_miss("video");

        if let Some(fut) = self.inflight.get(video_id).map(|f| f.value().clone()) {
            debug!("Awaiting in-flight conversion for {}", video_id);
            let path = fut
                .await
                .map_err(|e| EmbedditError::TranscodeError(e.to_string()))?;
            return Ok(Converted::File(path));
        }

        let base = format!("{}/{}", self.base_url, video_id);
        let video_url = format!("{base}/{video_name}.mp4");
        let Some(audio_url) = self.probe_audio_url(&base).await else {
            debug!(
                "No audio stream found for video {}, passing video back directly",
                video_id
            );
            metrics::record_conversion("redirected");
            return Ok(Converted::RedirectToSource(video_url));
        };

        // The probe suspends, so two callers can reach this point for the
        // same id; the entry API makes registration atomic and the loser
        // joins the winner's job.
        let fut = match self.inflight.entry(video_id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let job = ConversionJob {
                    video_id: video_id.to_string(),
                    output_file: self.output_dir.join(format!("{video_id}.mp4")),
                    video_url,
                    audio_url,
                    ffmpeg: self.ffmpeg.clone(),
                    cache: self.cache.clone(),
                    inflight: Arc::clone(&self.inflight),
                    ttl: self.ttl,
                };
                // Detached: an abandoned request must not cancel the
                // transcode, so the result still lands in the cache.
                let handle = tokio::spawn(run_conversion(job));
                let fut: ConversionFuture = async move {
                    handle
                        .await
                        .map_err(|e| ConversionFailed(format!("conversion task failed: {e}")))?
                }
                .boxed()
                .shared();
                entry.insert(fut.clone());
                fut
            }
        };

        let path = fut
            .await
            .map_err(|e| EmbedditError::TranscodeError(e.to_string()))?;
        Ok(Converted::File(path))
    }

    /// Probe the known audio stream URLs concurrently with a short timeout
    /// each; the first success in priority order wins.
    async fn probe_audio_url(&self, base_url: &str) -> Option<String> {
        let candidates: Vec<String> = AUDIO_STREAM_PATTERNS
            .iter()
            .map(|pattern| format!("{base_url}/{pattern}?source=fallback"))
            .collect();

        let checks = candidates
            .iter()
            .map(|url| self.http.head(url).timeout(self.probe_timeout).send());
        let results = join_all(checks).await;

        candidates
            .iter()
            .zip(results)
            .find(|(_, result)| {
                matches!(result, Ok(response) if response.status().is_success())
            })
            .map(|(url, _)| url.clone())
    }

    /// Number of cached videos (health reporting).
    pub async fn cache_len(&self) -> usize {
        self.cache.len().await
    }

    pub async fn flush_cache(&self) {
        self.cache.flush_on_shutdown().await;
    }
}

struct ConversionJob {
    video_id: String,
    output_file: PathBuf,
    video_url: String,
    audio_url: String,
    ffmpeg: String,
    cache: VideoCache,
    inflight: Arc<DashMap<String, ConversionFuture>>,
    ttl: Duration,
}

async fn run_conversion(job: ConversionJob) -> std::result::Result<PathBuf, ConversionFailed> {
    let result = transcode(&job).await;
    match &result {
        Ok(_) => {
            job.cache
                .insert(&job.video_id, job.output_file.clone(), SystemTime::now() + job.ttl)
                .await;
            // Cache entry lands before the in-flight job disappears, so the
            // next caller observes a clean cache hit instead of racing.
            job.inflight.remove(&job.video_id);
            metrics::record_conversion("completed");
        }
        Err(e) => {
            if let Err(unlink_err) = tokio::fs::remove_file(&job.output_file).await {
                if unlink_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Error deleting partial output {}: {}",
                        job.output_file.display(),
                        unlink_err
                    );
                }
            }
            job.inflight.remove(&job.video_id);
            metrics::record_conversion("failed");
            error!("Video conversion failed for {}: {}", job.video_id, e);
        }
    }
    result
}

async fn transcode(job: &ConversionJob) -> std::result::Result<PathBuf, ConversionFailed> {
    if let Some(parent) = job.output_file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ConversionFailed(format!("failed to create output directory: {e}")))?;
    }

    let start = Instant::now();
    let mut child = Command::new(&job.ffmpeg)
        .arg("-i")
        .arg(&job.video_url)
        .arg("-i")
        .arg(&job.audio_url)
        .args(["-c", "copy", "-f", "mp4", "-progress", "pipe:1", "-y"])
        .arg(&job.output_file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ConversionFailed(format!("failed to spawn {}: {e}", job.ffmpeg)))?;

    // Progress reporting is observability only: both readers run alongside
    // the child and any parse failure simply produces no log line.
    let duration_secs = Arc::new(std::sync::Mutex::new(None::<f64>));

    if let Some(stderr) = child.stderr.take() {
        let duration_secs = Arc::clone(&duration_secs);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut duration = duration_secs.lock().unwrap_or_else(|p| p.into_inner());
                if duration.is_none() {
                    if let Some(secs) = parse_duration_line(&line) {
                        debug!("Video duration: {} seconds", secs);
                        *duration = Some(secs);
                    }
                }
            }
        });
    }

    if let Some(stdout) = child.stdout.take() {
        let duration_secs = Arc::clone(&duration_secs);
        let video_id = job.video_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let total = *duration_secs.lock().unwrap_or_else(|p| p.into_inner());
                if let (Some(total), Some(out_time_us)) = (total, parse_out_time_us(&line)) {
                    if total > 0.0 {
                        let percent = (out_time_us as f64 / 1_000_000.0) / total * 100.0;
                        debug!("Conversion progress for {}: {:.2}%", video_id, percent);
                    }
                }
            }
        });
    }

    let status = child
        .wait()
        .await
        .map_err(|e| ConversionFailed(format!("failed to wait on transcoder: {e}")))?;

    if status.success() {
        info!(
            "Video conversion completed successfully, took {:.1}s",
            start.elapsed().as_secs_f64()
        );
        Ok(job.output_file.clone())
    } else {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(ConversionFailed(format!(
            "transcoder exited with code {code}"
        )))
    }
}

/// Parse the human-readable `Duration: H:MM:SS.cc` line from the
/// transcoder's diagnostic stream.
fn parse_duration_line(line: &str) -> Option<f64> {
    let rest = line.split("Duration:").nth(1)?.trim_start();
    let field = rest.split([',', ' ']).next()?;
    parse_clock(field)
}

fn parse_clock(clock: &str) -> Option<f64> {
    let mut total = 0.0;
    for part in clock.split(':') {
        total = total * 60.0 + part.trim().parse::<f64>().ok()?;
    }
    Some(total)
}

/// Parse a `key=value` progress line; the consumed key carries the output
/// timestamp in microseconds.
fn parse_out_time_us(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    if key == "out_time_ms" {
        value.trim().parse().ok()
    } else {
        None
    }
}
