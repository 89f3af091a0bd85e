//! Integration tests for the video conversion pipeline.
//!
//! The external transcoder is replaced with a shell stub that records its
//! invocations next to the output file, so coalescing and failure handling
//! can be asserted without a real ffmpeg.

#![cfg(unix)]

use embeddit::config::Config;
use embeddit::video::{Converted, VideoCache, VideoConversionPipeline};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STUB_OK: &str = r#"#!/bin/sh
for out in "$@"; do :; done
echo "$@" >> "${out}.invocations"
printf 'Duration: 0:00:10.00\n' >&2
printf 'out_time_ms=5000000\nprogress=end\n'
sleep 0.3
printf 'muxed' > "$out"
exit 0
"#;

const STUB_FAIL: &str = r#"#!/bin/sh
for out in "$@"; do :; done
echo "$@" >> "${out}.invocations"
printf 'partial' > "$out"
exit 1
"#;

fn write_stub_transcoder(dir: &TempDir, script: &str) -> PathBuf {
    let path = dir.path().join("transcoder.sh");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(upstream: &MockServer, dir: &TempDir, transcoder: &Path) -> Config {
    Config {
        port: 0,
        base_url: "http://localhost:3000".to_string(),
        is_dev: true,
        user_agent: "backend:embeddit:test".to_string(),
        oauth: None,
        token_url: format!("{}/api/v1/access_token", upstream.uri()),
        reddit_base_url: upstream.uri(),
        video_base_url: upstream.uri(),
        data_dir: dir.path().join("data"),
        video_dir: dir.path().join("video_output"),
        link_cache_capacity: 100,
        link_cache_save_every: 1000,
        video_cache_capacity: 10,
        video_ttl_secs: 86400,
        probe_timeout_secs: 5,
        ffmpeg_path: transcoder.to_string_lossy().into_owned(),
    }
}

async fn pipeline_for(config: &Config) -> VideoConversionPipeline {
    let cache = VideoCache::load(config.video_cache_file(), config.video_cache_capacity).await;
    VideoConversionPipeline::new(reqwest::Client::new(), cache, config)
}

async fn mount_audio_probe(server: &MockServer, video_id: &str, pattern: &str) {
    Mock::given(method("HEAD"))
        .and(path(format!("/{video_id}/{pattern}")))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

fn invocation_count(output_file: &Path) -> usize {
    let log = output_file.with_extension("mp4.invocations");
    match std::fs::read_to_string(log) {
        Ok(contents) => contents.lines().count(),
        Err(_) => 0,
    }
}

fn expect_file(result: embeddit::error::Result<Converted>) -> PathBuf {
    match result.expect("conversion should succeed") {
        Converted::File(path) => path,
        other => panic!("expected a muxed file, got {other:?}"),
    }
}

#[tokio::test]
async fn converts_and_serves_from_cache_afterwards() {
    let upstream = MockServer::start().await;
    mount_audio_probe(&upstream, "vid1", "DASH_AUDIO_128.mp4").await;
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcoder(&dir, STUB_OK);
    let config = test_config(&upstream, &dir, &stub);
    let pipeline = pipeline_for(&config).await;

    let path = expect_file(pipeline.convert("vid1", "DASH_720").await);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "muxed");
    assert_eq!(invocation_count(&config.video_dir.join("vid1")), 1);

    // Second call is a pure cache hit: no new subprocess.
    let cached = expect_file(pipeline.convert("vid1", "DASH_720").await);
    assert_eq!(cached, path);
    assert_eq!(invocation_count(&config.video_dir.join("vid1")), 1);
}

#[tokio::test]
async fn concurrent_conversions_spawn_exactly_one_transcoder() {
    let upstream = MockServer::start().await;
    mount_audio_probe(&upstream, "vid2", "DASH_AUDIO_128.mp4").await;
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcoder(&dir, STUB_OK);
    let config = test_config(&upstream, &dir, &stub);
    let pipeline = pipeline_for(&config).await;

    let (a, b) = tokio::join!(
        pipeline.convert("vid2", "DASH_720"),
        pipeline.convert("vid2", "DASH_720")
    );

    let path_a = expect_file(a);
    let path_b = expect_file(b);
    assert_eq!(path_a, path_b, "both callers receive the same output file");
    assert_eq!(invocation_count(&config.video_dir.join("vid2")), 1);
}

#[tokio::test]
async fn no_audio_redirects_without_spawning() {
    let upstream = MockServer::start().await;
    // No probe mocks: all audio candidates 404.
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcoder(&dir, STUB_OK);
    let config = test_config(&upstream, &dir, &stub);
    let pipeline = pipeline_for(&config).await;

    match pipeline.convert("silent", "DASH_480").await.unwrap() {
        Converted::RedirectToSource(url) => {
            assert_eq!(url, format!("{}/silent/DASH_480.mp4", upstream.uri()));
        }
        other => panic!("expected redirect, got {other:?}"),
    }
    assert_eq!(invocation_count(&config.video_dir.join("silent")), 0);
    assert_eq!(pipeline.cache_len().await, 0, "redirect path caches nothing");
}

#[tokio::test]
async fn failed_conversion_cleans_up_and_next_call_retries() {
    let upstream = MockServer::start().await;
    mount_audio_probe(&upstream, "vid3", "DASH_AUDIO_128.mp4").await;
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcoder(&dir, STUB_FAIL);
    let config = test_config(&upstream, &dir, &stub);
    let pipeline = pipeline_for(&config).await;

    let err = pipeline.convert("vid3", "DASH_720").await.unwrap_err();
    assert!(err.to_string().contains("conversion failed"), "{err}");

    let output = config.video_dir.join("vid3.mp4");
    assert!(!output.exists(), "partial output must be deleted");
    assert_eq!(pipeline.cache_len().await, 0, "failures are not cached");

    // Next request starts a fresh attempt rather than reusing the failure.
    pipeline.convert("vid3", "DASH_720").await.unwrap_err();
    assert_eq!(invocation_count(&config.video_dir.join("vid3")), 2);
}

#[tokio::test]
async fn audio_probe_prefers_highest_bitrate_candidate() {
    let upstream = MockServer::start().await;
    // 128k is absent; both lower-priority streams exist.
    mount_audio_probe(&upstream, "vid4", "DASH_AUDIO_64.mp4").await;
    mount_audio_probe(&upstream, "vid4", "DASH_audio.mp4").await;
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcoder(&dir, STUB_OK);
    let config = test_config(&upstream, &dir, &stub);
    let pipeline = pipeline_for(&config).await;

    expect_file(pipeline.convert("vid4", "DASH_720").await);

    let log = config.video_dir.join("vid4.mp4.invocations");
    let args = std::fs::read_to_string(log).unwrap();
    assert!(
        args.contains("DASH_AUDIO_64.mp4"),
        "first successful candidate in priority order should win: {args}"
    );
    assert!(!args.contains("DASH_audio.mp4"), "{args}");
}
