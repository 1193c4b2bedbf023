use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProctorError, Result};

pub struct Config {
    pub signaling: SignalingConfig,
    pub api: ApiConfig,
    pub reconnect: ReconnectConfig,
    pub proctor: ProctorConfig,
    pub media: MediaConfig,
    pub ice: IceConfig,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ProctorConfig {
    pub warning_interval: Duration,
    pub frame_interval: Duration,
    pub analysis_history: usize,
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSource {
    Device,
    Test,
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub source: MediaSource,
    pub video_device: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl Default for ProctorConfig {
    fn default() -> Self {
        Self {
            warning_interval: Duration::from_secs(10),
            frame_interval: Duration::from_secs(5),
            analysis_history: 10,
            state_dir: PathBuf::from("./.proctor"),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            source: MediaSource::Device,
            video_device: "/dev/video0".to_string(),
            width: 352,
            height: 240,
            framerate: 10,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
        }
    }
}

impl FromStr for MediaSource {
    type Err = ProctorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "device" | "camera" => Ok(MediaSource::Device),
            "test" => Ok(MediaSource::Test),
            other => Err(ProctorError::ConfigurationParseFailed(format!(
                "MEDIA_SOURCE must be 'device' or 'test', got '{}'",
                other
            ))),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let auth_token = env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty());

        let mut turn_servers = vec![];
        if let (Ok(turn_url), Ok(username), Ok(credential)) = (
            env::var("TURN_SERVER_URL"),
            env::var("TURN_USERNAME"),
            env::var("TURN_CREDENTIAL"),
        ) {
            turn_servers.push(TurnServer {
                urls: vec![turn_url],
                username,
                credential,
            });
        }

        let defaults = ProctorConfig::default();
        let reconnect_defaults = ReconnectConfig::default();
        let media_defaults = MediaConfig::default();

        Ok(Self {
            signaling: SignalingConfig {
                url: env::var("SIGNALING_URL")
                    .unwrap_or_else(|_| "ws://127.0.0.1:5000/socket".to_string()),
                auth_token: auth_token.clone(),
            },
            api: ApiConfig {
                base_url: env::var("API_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:5000/api".to_string()),
                auth_token,
            },
            reconnect: ReconnectConfig {
                max_attempts: parse_var("RECONNECT_MAX_ATTEMPTS", reconnect_defaults.max_attempts)?,
                base_delay: Duration::from_millis(parse_var(
                    "RECONNECT_BASE_DELAY_MS",
                    reconnect_defaults.base_delay.as_millis() as u64,
                )?),
                max_delay: Duration::from_millis(parse_var(
                    "RECONNECT_MAX_DELAY_MS",
                    reconnect_defaults.max_delay.as_millis() as u64,
                )?),
            },
            proctor: ProctorConfig {
                warning_interval: Duration::from_secs(parse_var(
                    "WARNING_INTERVAL_SECS",
                    defaults.warning_interval.as_secs(),
                )?),
                frame_interval: Duration::from_secs(parse_var(
                    "FRAME_INTERVAL_SECS",
                    defaults.frame_interval.as_secs(),
                )?),
                analysis_history: parse_var("ANALYSIS_HISTORY", defaults.analysis_history)?,
                state_dir: env::var("STATE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.state_dir),
            },
            media: MediaConfig {
                source: parse_var("MEDIA_SOURCE", media_defaults.source)?,
                video_device: env::var("VIDEO_DEVICE").unwrap_or(media_defaults.video_device),
                width: parse_var("VIDEO_WIDTH", media_defaults.width)?,
                height: parse_var("VIDEO_HEIGHT", media_defaults.height)?,
                framerate: parse_var("VIDEO_FRAMERATE", media_defaults.framerate)?,
            },
            ice: IceConfig {
                stun_servers: vec![env::var("STUN_SERVER_URL")
                    .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string())],
                turn_servers,
            },
        })
    }

    /// Checks values that parse fine but cannot drive a session
    pub fn validate(&self) -> Result<()> {
        if self.proctor.warning_interval.is_zero() {
            return Err(ProctorError::InvalidConfiguration(
                "WARNING_INTERVAL_SECS must be greater than zero".into(),
            ));
        }
        if self.proctor.frame_interval.is_zero() {
            return Err(ProctorError::InvalidConfiguration(
                "FRAME_INTERVAL_SECS must be greater than zero".into(),
            ));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            tracing::warn!(
                base_ms = self.reconnect.base_delay.as_millis() as u64,
                max_ms = self.reconnect.max_delay.as_millis() as u64,
                "Reconnect base delay exceeds the cap, every attempt will use the cap"
            );
        }
        if !self.signaling.url.starts_with("ws://") && !self.signaling.url.starts_with("wss://") {
            return Err(ProctorError::InvalidConfiguration(format!(
                "SIGNALING_URL must be a ws:// or wss:// URL, got '{}'",
                self.signaling.url
            )));
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| {
            ProctorError::ConfigurationParseFailed(format!("{}='{}': {}", key, raw, e))
        }),
        Err(_) => Ok(default),
    }
}
