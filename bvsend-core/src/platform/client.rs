use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, ORIGIN, REFERER as REFERER_HEADER, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BilibiliSection;
use crate::link::{ShortLinkResolver, VideoId};
use crate::quality::QualityLevel;

use super::wbi::{self, MixinKeyCache};
use super::{
    normalize_stream_urls, AudioStream, Credentials, MediaPlatform, PlatformError,
    PlatformResult, PlayInfo, PlaySource, ProgressiveFile, VideoInfo, VideoStream,
};

pub const REFERER: &str = "https://www.bilibili.com/";
const ORIGIN_VALUE: &str = "https://www.bilibili.com";

const VIEW_ENDPOINT: &str = "/x/web-interface/view";
const NAV_ENDPOINT: &str = "/x/web-interface/nav";
const WBI_PLAYURL_ENDPOINT: &str = "/x/player/wbi/playurl";
const PLAYURL_ENDPOINT: &str = "/x/player/playurl";

/// `fnval` bits: DASH, HDR, 4K, Dolby audio, Dolby Vision, 8K, AV1.
const FNVAL_ALL_FORMATS: u32 = 4048;
const NOT_LOGGED_IN: i64 = -101;

#[derive(Debug)]
pub struct BilibiliClient {
    http: Client,
    api_base: String,
    user_agent: String,
    credentials: Option<Credentials>,
    resolver: ShortLinkResolver,
    mixin_keys: MixinKeyCache,
}

impl BilibiliClient {
    pub fn new(section: &BilibiliSection) -> PlatformResult<Self> {
        let timeout = Duration::from_secs(section.request_timeout_seconds.max(1));
        let mut headers = HeaderMap::new();
        headers.insert(REFERER_HEADER, HeaderValue::from_static(REFERER));
        headers.insert(ORIGIN, HeaderValue::from_static(ORIGIN_VALUE));
        let http = Client::builder()
            .user_agent(section.user_agent.clone())
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_base: section.api_base.trim_end_matches('/').to_string(),
            user_agent: section.user_agent.clone(),
            credentials: section.credentials(),
            resolver: ShortLinkResolver::new(timeout)?,
            mixin_keys: MixinKeyCache::default(),
        })
    }

    pub fn with_resolver(mut self, resolver: ShortLinkResolver) -> Self {
        self.resolver = resolver;
        self
    }

    fn authenticated(&self) -> bool {
        self.credentials
            .as_ref()
            .map(Credentials::is_authenticated)
            .unwrap_or(false)
    }

    async fn get_envelope<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> PlatformResult<ApiEnvelope<T>> {
        let url = format!("{}{}", self.api_base, endpoint);
        let mut request = self.http.get(&url).query(query);
        if let Some(cookie) = self.credentials.as_ref().and_then(Credentials::cookie_header) {
            request = request.header(COOKIE, cookie);
        }
        let response = request.send().await?;
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) && self.authenticated()
        {
            return Err(PlatformError::AuthenticationRejected {
                endpoint: endpoint.to_string(),
            });
        }
        if !status.is_success() {
            return Err(PlatformError::Http {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| PlatformError::Decode {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        })
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> PlatformResult<T> {
        let envelope: ApiEnvelope<T> = self.get_envelope(endpoint, query).await?;
        if envelope.code != 0 {
            if envelope.code == NOT_LOGGED_IN && self.authenticated() {
                return Err(PlatformError::AuthenticationRejected {
                    endpoint: endpoint.to_string(),
                });
            }
            return Err(PlatformError::Api {
                code: envelope.code,
                message: envelope.message,
                endpoint: endpoint.to_string(),
            });
        }
        envelope.data.ok_or_else(|| PlatformError::Decode {
            endpoint: endpoint.to_string(),
            reason: "response carried no data".to_string(),
        })
    }

    async fn mixin_key(&self) -> PlatformResult<String> {
        if let Some(key) = self.mixin_keys.get() {
            return Ok(key);
        }
        // nav answers -101 for anonymous callers but still carries the keys.
        let envelope: ApiEnvelope<NavData> = self.get_envelope(NAV_ENDPOINT, &[]).await?;
        let images = envelope
            .data
            .and_then(|data| data.wbi_img)
            .ok_or_else(|| PlatformError::Signing("nav response had no wbi_img".to_string()))?;
        let img_key = wbi::key_from_url(&images.img_url);
        let sub_key = wbi::key_from_url(&images.sub_url);
        let key = img_key
            .zip(sub_key)
            .and_then(|(img, sub)| wbi::mixin_key(img, sub))
            .ok_or_else(|| PlatformError::Signing("wbi keys too short".to_string()))?;
        self.mixin_keys.store(key.clone());
        Ok(key)
    }

    fn playurl_params(&self, video: &VideoInfo, level: QualityLevel) -> Vec<(String, String)> {
        let mut params = vec![
            ("avid".to_string(), video.aid.to_string()),
            ("cid".to_string(), video.cid.to_string()),
            ("otype".to_string(), "json".to_string()),
            ("fnver".to_string(), "0".to_string()),
            ("fnval".to_string(), FNVAL_ALL_FORMATS.to_string()),
            ("fourk".to_string(), u8::from(level.needs_fourk()).to_string()),
            ("platform".to_string(), "pc".to_string()),
            ("qn".to_string(), level.code().to_string()),
        ];
        if let Some(buvid3) = self.credentials.as_ref().and_then(Credentials::buvid3) {
            let session = wbi::md5_hex(format!("{buvid3}{}", Utc::now().timestamp_millis()).as_bytes());
            params.push(("session".to_string(), session));
        }
        if !self.authenticated() {
            params.push(("gaia_source".to_string(), "view-card".to_string()));
        }
        params
    }
}

#[async_trait]
impl MediaPlatform for BilibiliClient {
    async fn resolve_short_link(&self, short: &Url) -> PlatformResult<Url> {
        Ok(self.resolver.resolve(short).await?)
    }

    async fn video_info(&self, id: &VideoId, page: u32) -> PlatformResult<VideoInfo> {
        let query = match id {
            VideoId::Bv(bvid) => vec![("bvid".to_string(), bvid.clone())],
            VideoId::Av(aid) => vec![("aid".to_string(), aid.to_string())],
        };
        let data: ViewData = self.get_data(VIEW_ENDPOINT, &query).await?;
        let page = page.max(1);
        let pages = data.pages.unwrap_or_default();
        let total = pages.len();
        let (index, selected) = match pages.get(page.saturating_sub(1) as usize) {
            Some(selected) => (page, selected),
            None => {
                if total > 0 {
                    warn!(%id, requested = page, total, "page out of range, using P1");
                }
                let first = pages.first().ok_or_else(|| PlatformError::Decode {
                    endpoint: VIEW_ENDPOINT.to_string(),
                    reason: "video has no pages".to_string(),
                })?;
                (1, first)
            }
        };
        let info = VideoInfo {
            aid: data.aid,
            bvid: (!data.bvid.is_empty()).then_some(data.bvid),
            cid: selected.cid,
            page: index,
            title: data.title,
            duration_seconds: selected.duration.unwrap_or(data.duration),
        };
        debug!(%id, aid = info.aid, cid = info.cid, page = info.page, "video info loaded");
        Ok(info)
    }

    async fn play_info(&self, video: &VideoInfo, level: QualityLevel) -> PlatformResult<PlayInfo> {
        let params = self.playurl_params(video, level);
        let (endpoint, query) = match self.mixin_key().await {
            Ok(key) => {
                let wts = Utc::now().timestamp().max(0) as u64;
                (WBI_PLAYURL_ENDPOINT, wbi::sign(&params, &key, wts))
            }
            Err(err) => {
                warn!(error = %err, "wbi signing failed, using the unsigned player endpoint");
                (PLAYURL_ENDPOINT, params)
            }
        };
        if !self.authenticated() {
            info!(qn = level.code(), "requesting play urls anonymously");
        }
        let data: PlayData = self.get_data(endpoint, &query).await?;
        play_info_from(data)
    }

    fn download_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(REFERER_HEADER, HeaderValue::from_static(REFERER));
        headers.insert(ORIGIN, HeaderValue::from_static(ORIGIN_VALUE));
        if let Ok(agent) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, agent);
        }
        headers
    }
}

fn play_info_from(data: PlayData) -> PlatformResult<PlayInfo> {
    if let Some(dash) = data.dash {
        let video: Vec<VideoStream> = dash
            .video
            .unwrap_or_default()
            .into_iter()
            .map(|stream| {
                let urls = stream.urls();
                VideoStream {
                    quality_code: stream.id,
                    codecs: stream.codecs,
                    bandwidth: stream.bandwidth,
                    width: stream.width,
                    height: stream.height,
                    urls,
                }
            })
            .filter(|stream| !stream.urls.is_empty())
            .collect();
        if video.is_empty() {
            return Err(PlatformError::MissingStreams(
                "dash response has no video streams".to_string(),
            ));
        }
        let dolby = dash.dolby.and_then(|dolby| dolby.audio).unwrap_or_default();
        let flac = dash.flac.and_then(|flac| flac.audio);
        let mut audio: Vec<AudioStream> = dash
            .audio
            .unwrap_or_default()
            .into_iter()
            .chain(dolby)
            .chain(flac)
            .map(|stream| {
                let urls = stream.urls();
                AudioStream {
                    id: stream.id,
                    codecs: stream.codecs,
                    bandwidth: stream.bandwidth,
                    urls,
                }
            })
            .filter(|stream| !stream.urls.is_empty())
            .collect();
        audio.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
        if audio.is_empty() {
            warn!("dash response has no audio streams, muxing video only");
        }
        debug!(video = video.len(), audio = audio.len(), "dash streams parsed");
        return Ok(PlayInfo {
            source: PlaySource::Dash { video, audio },
        });
    }

    let segments = data.durl.unwrap_or_default();
    if segments.len() > 1 {
        warn!(segments = segments.len(), "segmented progressive video, using the first segment");
    }
    let first = segments.into_iter().next().ok_or_else(|| {
        PlatformError::MissingStreams("response has neither dash nor durl streams".to_string())
    })?;
    let urls = normalize_stream_urls(
        first.url.as_deref(),
        first.backup_url.iter().flatten().map(String::as_str),
    );
    if urls.is_empty() {
        return Err(PlatformError::MissingStreams(
            "progressive segment has no url".to_string(),
        ));
    }
    let format = progressive_extension(&urls[0], &data.format);
    Ok(PlayInfo {
        source: PlaySource::Progressive {
            quality_code: data.quality,
            file: ProgressiveFile {
                format,
                size_bytes: first.size,
                urls,
            },
        },
    })
}

fn progressive_extension(url: &str, format: &str) -> String {
    let from_path = Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .and_then(|file| file.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
    });
    from_path
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| {
            let letters: String = format
                .chars()
                .take_while(|c| c.is_ascii_alphabetic())
                .collect();
            if letters.is_empty() {
                "flv".to_string()
            } else {
                letters.to_ascii_lowercase()
            }
        })
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ViewData {
    aid: u64,
    #[serde(default)]
    bvid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    pages: Option<Vec<ViewPage>>,
}

#[derive(Debug, Deserialize)]
struct ViewPage {
    cid: u64,
    #[serde(default)]
    duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NavData {
    wbi_img: Option<WbiImages>,
}

#[derive(Debug, Deserialize)]
struct WbiImages {
    #[serde(default)]
    img_url: String,
    #[serde(default)]
    sub_url: String,
}

#[derive(Debug, Deserialize)]
struct PlayData {
    #[serde(default)]
    quality: u32,
    #[serde(default)]
    format: String,
    dash: Option<DashData>,
    durl: Option<Vec<DurlSegment>>,
}

#[derive(Debug, Deserialize)]
struct DashData {
    video: Option<Vec<DashStream>>,
    audio: Option<Vec<DashStream>>,
    dolby: Option<DolbyAudio>,
    flac: Option<FlacAudio>,
}

#[derive(Debug, Deserialize)]
struct DolbyAudio {
    audio: Option<Vec<DashStream>>,
}

#[derive(Debug, Deserialize)]
struct FlacAudio {
    audio: Option<DashStream>,
}

/// The API sends both camelCase and snake_case copies of the URL fields.
#[derive(Debug, Deserialize)]
struct DashStream {
    id: u32,
    #[serde(rename = "baseUrl")]
    base_url_camel: Option<String>,
    base_url: Option<String>,
    #[serde(rename = "backupUrl")]
    backup_url_camel: Option<Vec<String>>,
    backup_url: Option<Vec<String>>,
    #[serde(default)]
    bandwidth: u64,
    #[serde(default)]
    codecs: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

impl DashStream {
    fn urls(&self) -> Vec<String> {
        let primary = self.base_url_camel.as_deref().or(self.base_url.as_deref());
        let backups = self
            .backup_url_camel
            .as_ref()
            .or(self.backup_url.as_ref())
            .into_iter()
            .flatten()
            .map(String::as_str);
        normalize_stream_urls(primary, backups)
    }
}

#[derive(Debug, Deserialize)]
struct DurlSegment {
    url: Option<String>,
    backup_url: Option<Vec<String>>,
    size: Option<u64>,
}
