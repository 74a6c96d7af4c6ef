//! Remote media platform: metadata, play URLs and stream locators.

mod client;
pub mod wbi;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::link::{LinkError, VideoId};
use crate::quality::QualityLevel;

pub use client::{BilibiliClient, REFERER};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("network error: {0}")]
    Network(String),
    #[error("platform answered HTTP {status} for {endpoint}")]
    Http { status: u16, endpoint: String },
    #[error("platform error {code} from {endpoint}: {message}")]
    Api {
        code: i64,
        message: String,
        endpoint: String,
    },
    #[error("credentials rejected by {endpoint}")]
    AuthenticationRejected { endpoint: String },
    #[error("unexpected response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
    #[error("no playable streams: {0}")]
    MissingStreams(String),
    #[error("request signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl From<reqwest::Error> for PlatformError {
    fn from(error: reqwest::Error) -> Self {
        PlatformError::Network(error.to_string())
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Cookie pair sent to the platform. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    sessdata: Option<String>,
    buvid3: Option<String>,
}

impl Credentials {
    /// `None` when neither cookie is configured.
    pub fn new(sessdata: &str, buvid3: &str) -> Option<Self> {
        let non_empty = |value: &str| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };
        let credentials = Self {
            sessdata: non_empty(sessdata),
            buvid3: non_empty(buvid3),
        };
        (credentials.sessdata.is_some() || credentials.buvid3.is_some()).then_some(credentials)
    }

    pub fn is_authenticated(&self) -> bool {
        self.sessdata.is_some()
    }

    pub fn buvid3(&self) -> Option<&str> {
        self.buvid3.as_deref()
    }

    /// `Cookie` value for API calls. A lone buvid3 only feeds the `session`
    /// parameter and is never sent as a cookie.
    pub fn cookie_header(&self) -> Option<String> {
        let sessdata = self.sessdata.as_ref()?;
        Some(match &self.buvid3 {
            Some(buvid3) => format!("SESSDATA={sessdata}; buvid3={buvid3}"),
            None => format!("SESSDATA={sessdata}"),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("sessdata", &self.sessdata.as_ref().map(|_| "<redacted>"))
            .field("buvid3", &self.buvid3.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoInfo {
    pub aid: u64,
    pub bvid: Option<String>,
    pub cid: u64,
    pub page: u32,
    pub title: String,
    pub duration_seconds: u64,
}

impl VideoInfo {
    /// Identifier used in output file names.
    pub fn display_id(&self) -> String {
        match &self.bvid {
            Some(bvid) if !bvid.is_empty() => bvid.clone(),
            _ => format!("av{}", self.aid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoStream {
    pub quality_code: u32,
    pub codecs: String,
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
    pub urls: Vec<String>,
}

impl VideoStream {
    fn codec_rank(&self) -> u8 {
        let codecs = self.codecs.to_ascii_lowercase();
        if codecs.contains("avc") || codecs.contains("h264") {
            0
        } else if codecs.contains("hev") || codecs.contains("hvc") {
            1
        } else if codecs.contains("av01") {
            2
        } else {
            3
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioStream {
    pub id: u32,
    pub codecs: String,
    pub bandwidth: u64,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressiveFile {
    pub format: String,
    pub size_bytes: Option<u64>,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlaySource {
    /// Separate video and audio elementary streams.
    Dash {
        video: Vec<VideoStream>,
        audio: Vec<AudioStream>,
    },
    /// One combined file (first segment of a `durl` list).
    Progressive {
        quality_code: u32,
        file: ProgressiveFile,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayInfo {
    pub source: PlaySource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectedStreams {
    Dash {
        video: VideoStream,
        audio: Option<AudioStream>,
    },
    Progressive {
        file: ProgressiveFile,
    },
}

impl PlayInfo {
    /// Tiers this video actually offers, ascending. Unknown codes are dropped.
    pub fn available_levels(&self) -> Vec<QualityLevel> {
        let codes: BTreeSet<u32> = match &self.source {
            PlaySource::Dash { video, .. } => video.iter().map(|s| s.quality_code).collect(),
            PlaySource::Progressive { quality_code, .. } => BTreeSet::from([*quality_code]),
        };
        let mut levels: Vec<QualityLevel> = codes
            .into_iter()
            .filter_map(QualityLevel::from_code)
            .collect();
        levels.sort();
        levels
    }

    /// Best streams for `level`: AVC before HEVC before AV1, then the higher
    /// bandwidth; the highest-bandwidth audio track of any kind.
    pub fn select_streams(&self, level: QualityLevel) -> PlatformResult<SelectedStreams> {
        match &self.source {
            PlaySource::Dash { video, audio } => {
                let video = video
                    .iter()
                    .filter(|stream| stream.quality_code == level.code())
                    .min_by(|a, b| {
                        a.codec_rank()
                            .cmp(&b.codec_rank())
                            .then(b.bandwidth.cmp(&a.bandwidth))
                    })
                    .cloned()
                    .ok_or_else(|| {
                        PlatformError::MissingStreams(format!("no video stream for {level}"))
                    })?;
                let audio = audio.iter().max_by_key(|stream| stream.bandwidth).cloned();
                Ok(SelectedStreams::Dash { video, audio })
            }
            PlaySource::Progressive { quality_code, file } => {
                if *quality_code != level.code() {
                    return Err(PlatformError::MissingStreams(format!(
                        "progressive file is qn={quality_code}, not {level}"
                    )));
                }
                Ok(SelectedStreams::Progressive { file: file.clone() })
            }
        }
    }
}

/// Primary URL first, backups after, all on https, duplicates dropped.
pub fn normalize_stream_urls<'a>(
    primary: Option<&'a str>,
    backups: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for raw in primary.into_iter().chain(backups) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let normalized = match raw.strip_prefix("http://") {
            Some(rest) => format!("https://{rest}"),
            None => raw.to_string(),
        };
        if !urls.contains(&normalized) {
            urls.push(normalized);
        }
    }
    urls
}

/// The seam between the pipeline and the remote platform.
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    async fn resolve_short_link(&self, short: &Url) -> PlatformResult<Url>;

    async fn video_info(&self, id: &VideoId, page: u32) -> PlatformResult<VideoInfo>;

    async fn play_info(&self, video: &VideoInfo, level: QualityLevel) -> PlatformResult<PlayInfo>;

    /// Headers the CDN expects on stream downloads.
    fn download_headers(&self) -> HeaderMap {
        HeaderMap::new()
    }
}
