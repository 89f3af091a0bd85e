use std::env;
use std::path::PathBuf;

/// User agent sent on every upstream request
pub const DEFAULT_USER_AGENT: &str = "backend:embeddit:1.0.0";

/// OAuth client credentials for the upstream token endpoint
#[derive(Clone, Debug, PartialEq)]
pub struct OauthConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Public base URL of this service
    pub base_url: String,
    pub is_dev: bool,
    /// User agent for all upstream requests
    pub user_agent: String,
    /// OAuth credentials; `None` runs against the anonymous public API
    pub oauth: Option<OauthConfig>,
    /// Token endpoint (overridable in tests)
    pub token_url: String,
    /// Base URL for share links and the public site (overridable in tests)
    pub reddit_base_url: String,
    /// Base URL for the video CDN (overridable in tests)
    pub video_base_url: String,
    /// Directory holding the share-link cache file
    pub data_dir: PathBuf,
    /// Directory holding muxed video output and the video cache file
    pub video_dir: PathBuf,
    /// Max entries in the share-link cache
    pub link_cache_capacity: usize,
    /// Persist the link cache after this many writes
    pub link_cache_save_every: u32,
    /// Max entries in the video cache
    pub video_cache_capacity: usize,
    /// Seconds a muxed video stays cached
    pub video_ttl_secs: u64,
    /// Per-request timeout for audio stream probes, in seconds
    pub probe_timeout_secs: u64,
    /// Transcoder binary (overridable in tests)
    pub ffmpeg_path: String,
}

impl Config {
    /// Load configuration from environment variables.
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT, BASE_URL
    /// and OAuth credentials (unless DONT_USE_OAUTH is set) are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let base_url = if is_dev {
            env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
        } else {
            env::var("BASE_URL").map_err(|_| "BASE_URL is required in production")?
        };

        // The public API is rate-limited and blocks many commercial VPS IPs,
        // so production requires credentials unless explicitly opted out.
        let oauth = if env::var("DONT_USE_OAUTH").is_ok() {
            None
        } else {
            match (
                env::var("REDDIT_CLIENT_ID").ok(),
                env::var("REDDIT_CLIENT_SECRET").ok(),
            ) {
                (Some(client_id), Some(client_secret)) => Some(OauthConfig {
                    client_id,
                    client_secret,
                }),
                _ if is_dev => None,
                _ => {
                    return Err(
                        "REDDIT_CLIENT_ID and REDDIT_CLIENT_SECRET are required in production \
                         (set DONT_USE_OAUTH to use the anonymous public API)"
                            .into(),
                    );
                }
            }
        };

        let user_agent =
            env::var("USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
        let video_dir =
            PathBuf::from(env::var("VIDEO_DIR").unwrap_or_else(|_| "video_output".to_string()));

        let link_cache_capacity = env::var("LINK_CACHE_MAX_ENTRIES")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .unwrap_or(500);
        let link_cache_save_every = env::var("LINK_CACHE_SAVE_EVERY")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2);
        let video_cache_capacity = env::var("VIDEO_CACHE_MAX_ENTRIES")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);
        let video_ttl_secs = env::var("VIDEO_TTL_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .unwrap_or(86400);
        let probe_timeout_secs = env::var("PROBE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);
        let ffmpeg_path = env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string());

        Ok(Config {
            port,
            base_url,
            is_dev,
            user_agent,
            oauth,
            token_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            reddit_base_url: "https://www.reddit.com".to_string(),
            video_base_url: "https://v.redd.it".to_string(),
            data_dir,
            video_dir,
            link_cache_capacity,
            link_cache_save_every,
            video_cache_capacity,
            video_ttl_secs,
            probe_timeout_secs,
            ffmpeg_path,
        })
    }

    /// Path of the share-link cache file
    pub fn link_cache_file(&self) -> PathBuf {
        self.data_dir.join("cache.json")
    }

    /// Path of the video cache file
    pub fn video_cache_file(&self) -> PathBuf {
        self.video_dir.join("cache.json")
    }
}
