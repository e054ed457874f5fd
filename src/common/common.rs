// SPDX-License-Identifier: GPL-2.0-or-later

pub mod time;

use crate::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::{fmt, path::PathBuf, sync::Arc};

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

pub type ArcLogger = Arc<dyn Logger + Send + Sync>;

pub trait Logger {
    /// Send log.
    fn log(&self, _: LogEntry) {}
}

/// Log entry. The timestamp is applied by the logger implementation.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: &'static str,
    pub stream_url: Option<String>,
    pub message: String,
}

impl LogEntry {
    #[must_use]
    pub fn new(
        level: LogLevel,
        source: &'static str,
        stream_url: Option<String>,
        message: String,
    ) -> Self {
        Self {
            level,
            source,
            stream_url,
            message,
        }
    }
}

/// Severity of the log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum LogLevel {
    /// Something requires attention.
    Error,

    /// Something may require attention.
    Warning,

    /// Standard information.
    Info,

    /// Verbose debugging information.
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
        }
    }
}

pub struct DummyLogger;

impl DummyLogger {
    #[must_use]
    pub fn new() -> ArcLogger {
        Arc::new(Self {})
    }
}

impl Logger for DummyLogger {
    fn log(&self, _: LogEntry) {}
}

pub type ArcMsgLogger = Arc<dyn MsgLogger + Send + Sync>;

pub trait MsgLogger {
    fn log(&self, level: LogLevel, msg: &str);
}

pub struct DummyMsgLogger;

impl MsgLogger for DummyMsgLogger {
    fn log(&self, _: LogLevel, _: &str) {}
}

/// Identity of one published stream, as reported by the ingest connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct StreamRequest {
    pub vhost: String,
    pub app: String,
    pub stream: String,

    /// Raw query parameters of the publish url.
    #[serde(default)]
    pub param: String,

    /// Peer address of the publisher.
    #[serde(default)]
    pub ip: String,

    /// Id the ingest layer assigned to the publishing connection.
    #[serde(default)]
    pub client_id: String,
}

impl StreamRequest {
    #[must_use]
    pub fn stream_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioCodecId {
    Aac,
    Mp3,
    Disabled,
}

impl AudioCodecId {
    /// Parses the `hls_acodec` configuration value.
    #[must_use]
    pub fn from_config(v: &str) -> Option<Self> {
        match v {
            "aac" => Some(Self::Aac),
            "mp3" => Some(Self::Mp3),
            "an" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for AudioCodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioCodecId::Aac => write!(f, "aac"),
            AudioCodecId::Mp3 => write!(f, "mp3"),
            AudioCodecId::Disabled => write!(f, "an"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodecId {
    H264,
    Disabled,
}

impl VideoCodecId {
    /// Parses the `hls_vcodec` configuration value.
    #[must_use]
    pub fn from_config(v: &str) -> Option<Self> {
        match v {
            "h264" => Some(Self::H264),
            "vn" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoFrameType {
    Key,
    Inter,
    /// Metadata-only frame, carries no picture.
    Info,
}

/// One demuxed audio frame. `codec` is None until the bitstream parser has
/// identified the codec.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// Source timestamp in milliseconds.
    pub timestamp: i64,
    pub codec: Option<AudioCodecId>,
    /// Sample rate declared by the codec descriptor, in Hz.
    pub sample_rate: u32,
    pub is_sequence_header: bool,
    pub payload: Bytes,
}

/// One demuxed video frame.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    /// Source timestamp (DTS) in milliseconds.
    pub timestamp: i64,
    pub codec: Option<VideoCodecId>,
    pub frame_type: VideoFrameType,
    /// Composition time offset in milliseconds, PTS = DTS + cts.
    pub cts: i64,
    pub is_sequence_header: bool,
    pub payload: Bytes,
}

pub type ArcSourceHub = Arc<dyn SourceHub + Send + Sync>;

/// The stream source owning the publisher. After a reload the muxer needs
/// the codec sequence headers re-delivered before the next segment is useful.
#[async_trait]
pub trait SourceHub {
    async fn request_sequence_header(&self) -> Result<(), DynError>;
}

pub type ArcConfigProvider = Arc<dyn ConfigProvider + Send + Sync>;

/// Read access to the per-vhost configuration. Values are re-read at publish
/// time; the muxer never caches a provider lookup across publishes.
pub trait ConfigProvider {
    fn hls(&self, vhost: &str) -> HlsConfig;
    fn hooks(&self, vhost: &str) -> HooksConfig;
}

/// Per-vhost HLS configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub enabled: bool,

    /// Target segment duration.
    #[serde(deserialize_with = "time::deserialize_secs")]
    pub fragment: Duration,

    /// Target total duration of segments kept in the playlist.
    #[serde(deserialize_with = "time::deserialize_secs")]
    pub window: Duration,

    /// Multiplier of `fragment` yielding the advertised target duration.
    pub td_ratio: f64,

    /// Multiplier of `fragment` at which pure-audio streams reap.
    pub aof_ratio: f64,

    /// Root directory for playlist and segment files.
    pub path: String,

    pub m3u8_file: String,
    pub ts_file: String,

    /// Prefix prepended to every segment uri in the playlist.
    pub entry_prefix: String,

    /// Unlink segment files once they leave the window.
    pub cleanup: bool,

    /// Only reap on IDR frames.
    pub wait_keyframe: bool,

    /// Number segments by wall-clock buckets of width `fragment`.
    pub ts_floor: bool,

    /// Unlink everything after this much idle time. Zero disables.
    #[serde(deserialize_with = "time::deserialize_secs")]
    pub dispose: Duration,

    /// `aac`, `mp3` or `an`.
    pub acodec: String,

    /// `h264` or `vn`.
    pub vcodec: String,

    /// Use the source timestamp as TS DTS instead of the AAC sample counter.
    pub dts_directly: bool,

    pub keys: bool,
    pub fragments_per_key: u64,
    pub key_file: String,
    /// Defaults to `path` when absent.
    pub key_file_path: Option<String>,
    pub key_url: String,

    /// Cap on the hook notify response size, in bytes.
    pub nb_notify: usize,
}

impl HlsConfig {
    #[must_use]
    pub fn key_file_path(&self) -> &str {
        self.key_file_path.as_deref().unwrap_or(&self.path)
    }
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fragment: Duration::from_secs(10),
            window: Duration::from_secs(60),
            td_ratio: 1.5,
            aof_ratio: 2.0,
            path: "./objs/nginx/html".to_owned(),
            m3u8_file: "[app]/[stream].m3u8".to_owned(),
            ts_file: "[app]/[stream]-[seq].ts".to_owned(),
            entry_prefix: String::new(),
            cleanup: true,
            wait_keyframe: true,
            ts_floor: false,
            dispose: Duration::from_secs(0),
            acodec: "aac".to_owned(),
            vcodec: "h264".to_owned(),
            dts_directly: true,
            keys: false,
            fragments_per_key: 5,
            key_file: "[app]/[stream]-[seq].key".to_owned(),
            key_file_path: None,
            key_url: String::new(),
            nb_notify: 64 * 1024,
        }
    }
}

/// Per-vhost HTTP callback configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub enabled: bool,
    pub on_hls: Vec<String>,
    pub on_hls_notify: Vec<String>,
}

/// Writes `content` to `temp_path` and renames it over `path`. Readers of
/// `path` observe either the previous or the new content, never a torn write.
pub async fn write_file_atomic(
    path: PathBuf,
    temp_path: PathBuf,
    content: Vec<u8>,
) -> std::io::Result<()> {
    if let Err(e) = tokio::fs::write(&temp_path, &content).await {
        _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
        _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_stream_url() {
        let req = StreamRequest {
            vhost: "media.example.com".to_owned(),
            app: "live".to_owned(),
            stream: "livestream".to_owned(),
            ..Default::default()
        };
        assert_eq!("media.example.com/live/livestream", req.stream_url());
    }

    #[test_case("aac", Some(AudioCodecId::Aac); "aac")]
    #[test_case("mp3", Some(AudioCodecId::Mp3); "mp3")]
    #[test_case("an", Some(AudioCodecId::Disabled); "disabled")]
    #[test_case("opus", None; "unknown")]
    fn test_parse_acodec(v: &str, want: Option<AudioCodecId>) {
        assert_eq!(want, AudioCodecId::from_config(v));
    }

    #[test]
    fn test_hls_config_defaults() {
        let config: HlsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(Duration::from_secs(10), config.fragment);
        assert_eq!(Duration::from_secs(60), config.window);
        assert_eq!("./objs/nginx/html", config.key_file_path());
        assert!(config.cleanup);
        assert!(!config.ts_floor);
    }

    #[test]
    fn test_hls_config_fractional_fragment() {
        let config: HlsConfig = serde_json::from_str(r#"{"fragment": 2.5}"#).unwrap();
        assert_eq!(Duration::from_millis(2500), config.fragment);
    }

    #[tokio::test]
    async fn test_write_file_atomic() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("file");
        let temp_path = temp_dir.path().join("file.temp");

        write_file_atomic(path.clone(), temp_path.clone(), b"a".to_vec())
            .await
            .unwrap();
        assert_eq!(b"a".to_vec(), std::fs::read(&path).unwrap());

        write_file_atomic(path.clone(), temp_path.clone(), b"b".to_vec())
            .await
            .unwrap();
        assert_eq!(b"b".to_vec(), std::fs::read(&path).unwrap());
        assert!(!temp_path.exists());
    }
}
