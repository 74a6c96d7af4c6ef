//! Finds Bilibili video links in free-form chat text.

mod resolver;

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use url::Url;

pub use resolver::{ShortLinkResolver, MAX_REDIRECT_HOPS, SHORT_LINK_USER_AGENT};

/// Characters chat clients glue onto the end of a pasted link.
const TRAILING_PUNCTUATION: &[char] = &[
    ')', '.', ',', '，', '。', '!', '！', '?', '？', '》', '】', '〕', '」', '"', '\'',
];

const CANONICAL_HOSTS: &[&str] = &["bilibili.com", "www.bilibili.com", "m.bilibili.com"];
const SHORT_HOSTS: &[&str] = &["b23.tv"];

fn url_candidates() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)https?://[A-Za-z0-9\-._~%!$&'()*+,;=:@/?#]+").expect("valid url regex")
    })
}

fn bare_quality_token() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:[?&]|\b)qn\s*=\s*(\d+)").expect("valid qn regex")
    })
}

fn video_segment() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(BV[0-9A-Za-z]{10})|(?i:av)(\d+))$").expect("valid video id regex")
    })
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{url} is not a video page")]
    NotAVideo { url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("short link request failed: {0}")]
    Network(String),
    #[error("short link answered {status} instead of a redirect")]
    NotRedirect { status: u16 },
    #[error("redirect from {url} carried no usable location")]
    MissingLocation { url: String },
    #[error("short link did not settle within {hops} redirects")]
    TooManyRedirects { hops: usize },
}

impl From<reqwest::Error> for LinkError {
    fn from(error: reqwest::Error) -> Self {
        LinkError::Network(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VideoId {
    Bv(String),
    Av(u64),
}

impl VideoId {
    fn parse(segment: &str) -> Option<Self> {
        let captures = video_segment().captures(segment)?;
        if let Some(bvid) = captures.get(1) {
            return Some(VideoId::Bv(bvid.as_str().to_string()));
        }
        captures
            .get(2)
            .and_then(|aid| aid.as_str().parse().ok())
            .map(VideoId::Av)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoId::Bv(bvid) => f.write_str(bvid),
            VideoId::Av(aid) => write!(f, "av{aid}"),
        }
    }
}

/// A canonical video link ready for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoRequest {
    pub raw_text: String,
    pub url: Url,
    pub id: VideoId,
    pub page: u32,
    pub quality_override: Option<u32>,
}

/// A `b23.tv` link that must be resolved before it names a video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShortLink {
    pub raw_text: String,
    pub url: Url,
}

impl ShortLink {
    /// Builds the request from the canonical URL the short link redirected to.
    pub fn into_request(self, resolved: Url) -> Result<VideoRequest, LinkError> {
        canonical_request(&self.raw_text, resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VideoLink {
    Canonical(VideoRequest),
    Short(ShortLink),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkExtractor;

impl LinkExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Returns the first video link in `text`. Short links win over canonical
    /// ones since a message carrying both usually quotes the share card.
    pub fn extract(&self, text: &str) -> Option<VideoLink> {
        let mut canonical = None;
        for candidate in url_candidates().find_iter(text) {
            let trimmed = candidate.as_str().trim_end_matches(TRAILING_PUNCTUATION);
            let Ok(url) = Url::parse(trimmed) else {
                continue;
            };
            if is_short_host(&url) {
                return Some(VideoLink::Short(ShortLink {
                    raw_text: text.to_string(),
                    url,
                }));
            }
            if canonical.is_none() {
                canonical = canonical_request(text, url).ok();
            }
        }
        canonical.map(VideoLink::Canonical)
    }
}

/// `qn=<n>` anywhere in the message; zero means no preference.
pub fn scan_quality_token(text: &str) -> Option<u32> {
    bare_quality_token()
        .captures_iter(text)
        .filter_map(|captures| captures.get(1)?.as_str().parse::<u32>().ok())
        .find(|code| *code != 0)
}

fn is_short_host(url: &Url) -> bool {
    url.host_str()
        .map(|host| SHORT_HOSTS.iter().any(|short| host.eq_ignore_ascii_case(short)))
        .unwrap_or(false)
}

pub(crate) fn is_canonical_video_url(url: &Url) -> bool {
    video_id_from_url(url).is_some()
}

fn video_id_from_url(url: &Url) -> Option<VideoId> {
    let host = url.host_str()?;
    if !CANONICAL_HOSTS
        .iter()
        .any(|known| host.eq_ignore_ascii_case(known))
    {
        return None;
    }
    let mut segments = url.path_segments()?;
    if segments.next()? != "video" {
        return None;
    }
    VideoId::parse(segments.next()?)
}

fn canonical_request(raw_text: &str, url: Url) -> Result<VideoRequest, LinkError> {
    let id = video_id_from_url(&url).ok_or_else(|| LinkError::NotAVideo {
        url: url.to_string(),
    })?;
    let mut page = 1;
    let mut url_quality = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "p" => page = value.parse::<u32>().ok().filter(|p| *p > 0).unwrap_or(1),
            "qn" => url_quality = value.parse::<u32>().ok().filter(|code| *code != 0),
            _ => {}
        }
    }
    let quality_override = url_quality.or_else(|| scan_quality_token(raw_text));
    Ok(VideoRequest {
        raw_text: raw_text.to_string(),
        url,
        id,
        page,
        quality_override,
    })
}
