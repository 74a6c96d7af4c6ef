use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::pathmap::EnvironmentProfile;
use crate::platform::Credentials;
use crate::quality::{QualityLevel, QualityPolicy, RequestedQuality};

pub const DEFAULT_API_BASE: &str = "https://api.bilibili.com";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36";

const MIN_COOKIE_LEN: usize = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SenderConfig {
    #[serde(default)]
    pub bilibili: BilibiliSection,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub muxer: MuxerSection,
    #[serde(default)]
    pub environment: EnvironmentProfile,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub compression: CompressionSection,
}

#[derive(Clone, Deserialize)]
pub struct BilibiliSection {
    #[serde(default)]
    pub sessdata: String,
    #[serde(default)]
    pub buvid3: String,
    #[serde(default)]
    pub qn: u32,
    #[serde(default)]
    pub qn_strict: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for BilibiliSection {
    fn default() -> Self {
        Self {
            sessdata: String::new(),
            buvid3: String::new(),
            qn: 0,
            qn_strict: false,
            api_base: default_api_base(),
            user_agent: default_user_agent(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl BilibiliSection {
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::new(&self.sessdata, &self.buvid3)
    }

    pub fn has_credentials(&self) -> bool {
        !self.sessdata.trim().is_empty()
    }
}

impl fmt::Debug for BilibiliSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BilibiliSection")
            .field("sessdata", &redacted(&self.sessdata))
            .field("buvid3", &redacted(&self.buvid3))
            .field("qn", &self.qn)
            .field("qn_strict", &self.qn_strict)
            .field("api_base", &self.api_base)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.trim().is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: [u32; 2],
    #[serde(default)]
    pub retry_jitter_ms: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_seconds: u64,
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            retry_jitter_ms: 0,
            stream_timeout_seconds: default_stream_timeout(),
            temp_root: None,
            output_dir: default_output_dir(),
        }
    }
}

impl DownloadSection {
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MuxerSection {
    #[serde(default = "default_muxer_command")]
    pub command: Vec<String>,
    #[serde(default = "default_muxer_timeout")]
    pub timeout_seconds: u64,
}

impl Default for MuxerSection {
    fn default() -> Self {
        Self {
            command: default_muxer_command(),
            timeout_seconds: default_muxer_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_true")]
    pub enable_duration_limit: bool,
    #[serde(default = "default_max_duration")]
    pub max_video_duration_seconds: u64,
    /// Upload ceiling for finished files; 0 disables the check.
    #[serde(default = "default_max_size_mb")]
    pub max_video_size_mb: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            enable_duration_limit: true,
            max_video_duration_seconds: default_max_duration(),
            max_video_size_mb: default_max_size_mb(),
        }
    }
}

impl LimitsSection {
    /// Duration ceiling in seconds, `None` when the limit is disabled.
    pub fn duration_limit(&self) -> Option<u64> {
        self.enable_duration_limit
            .then_some(self.max_video_duration_seconds)
    }

    pub fn size_limit_bytes(&self) -> Option<u64> {
        (self.max_video_size_mb > 0).then(|| self.max_video_size_mb.saturating_mul(1024 * 1024))
    }
}

/// Re-encode settings used when a finished file exceeds the size limit.
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Starting CRF-style quality; lower is better.
    #[serde(default = "default_compression_quality")]
    pub quality: u8,
    #[serde(default = "default_encoder")]
    pub encoder: String,
    #[serde(default = "default_compression_timeout")]
    pub timeout_seconds: u64,
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            quality: default_compression_quality(),
            encoder: default_encoder(),
            timeout_seconds: default_compression_timeout(),
        }
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> [u32; 2] {
    [1, 2]
}

fn default_stream_timeout() -> u64 {
    300
}

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("bvsend")
}

fn default_muxer_command() -> Vec<String> {
    vec!["ffmpeg".to_string()]
}

fn default_muxer_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_max_duration() -> u64 {
    600
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_compression_quality() -> u8 {
    23
}

fn default_encoder() -> String {
    "libx264".to_string()
}

fn default_compression_timeout() -> u64 {
    1800
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ConfigReport {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub recommendations: Vec<String>,
}

impl SenderConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            source,
            path: PathBuf::from("<inline>"),
        })
    }

    pub fn quality_policy(&self) -> QualityPolicy {
        QualityPolicy::from_code(
            self.bilibili.qn,
            self.bilibili.qn_strict,
            self.bilibili.has_credentials(),
        )
    }

    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport {
            valid: true,
            ..ConfigReport::default()
        };
        let sessdata = self.bilibili.sessdata.trim();
        let buvid3 = self.bilibili.buvid3.trim();

        if sessdata.is_empty() {
            report
                .warnings
                .push("SESSDATA not configured, requests run anonymously".to_string());
            report
                .recommendations
                .push("configure SESSDATA to unlock 720P and above".to_string());
        } else if sessdata.len() < MIN_COOKIE_LEN {
            report
                .errors
                .push("SESSDATA looks truncated, check the cookie value".to_string());
        }

        if buvid3.is_empty() {
            report.recommendations.push(
                "buvid3 not configured (optional, only used for the session parameter)"
                    .to_string(),
            );
        } else if buvid3.len() < MIN_COOKIE_LEN {
            report
                .warnings
                .push("buvid3 looks truncated (optional value)".to_string());
        }

        let requested = match RequestedQuality::from_code(self.bilibili.qn) {
            Some(requested) => requested,
            None => {
                report.warnings.push(format!(
                    "qn={} is not a known quality tier, auto is used instead",
                    self.bilibili.qn
                ));
                RequestedQuality::Auto
            }
        };
        let effective = requested.resolve(!sessdata.is_empty());
        if sessdata.is_empty() {
            anonymous_quality_warnings(effective, &mut report.warnings);
        }

        if self.download.max_retries == 0 {
            report
                .errors
                .push("download.max_retries must be greater than zero".to_string());
        }
        let [min_delay, max_delay] = self.download.retry_delay_seconds;
        if min_delay > max_delay {
            report.errors.push(format!(
                "download.retry_delay_seconds range is inverted ({min_delay} > {max_delay})"
            ));
        }
        if self
            .muxer
            .command
            .first()
            .map_or(true, |program| program.trim().is_empty())
        {
            report
                .errors
                .push("muxer.command must name an executable".to_string());
        }
        if self.muxer.timeout_seconds == 0 {
            report
                .errors
                .push("muxer.timeout_seconds must be greater than zero".to_string());
        }

        if self.compression.enabled {
            if !(1..=51).contains(&self.compression.quality) {
                report.errors.push(format!(
                    "compression.quality must be between 1 and 51, got {}",
                    self.compression.quality
                ));
            }
            if self.compression.timeout_seconds == 0 {
                report
                    .errors
                    .push("compression.timeout_seconds must be greater than zero".to_string());
            }
        }
        if self.limits.max_video_size_mb == 0 {
            report
                .warnings
                .push("limits.max_video_size_mb is 0, finished files are not size-checked".to_string());
        }

        if let EnvironmentProfile::Container {
            local_prefix,
            foreign_prefix,
        } = &self.environment
        {
            if local_prefix.as_os_str().is_empty() || foreign_prefix.as_os_str().is_empty() {
                report.errors.push(
                    "container profile requires both local_prefix and foreign_prefix".to_string(),
                );
            } else if !self.download.temp_root().starts_with(local_prefix) {
                report.warnings.push(format!(
                    "download temp root {} is outside the shared prefix {}",
                    self.download.temp_root().display(),
                    local_prefix.display()
                ));
            }
        }

        report.valid = report.errors.is_empty();
        report
    }
}

fn anonymous_quality_warnings(level: QualityLevel, warnings: &mut Vec<String>) {
    let label = level.label();
    if level.code() >= 64 {
        warnings.push(format!("{label} requested without cookies and may fail"));
    }
    if level.code() >= 80 {
        warnings.push(format!("{label} requires a logged-in account"));
    }
    if level.code() >= 116 {
        warnings.push(format!("{label} high frame rate requires a premium account"));
    }
    if level.code() >= 125 {
        warnings.push(format!("{label} requires a premium account"));
    }
}

pub fn load_sender_config<P: AsRef<Path>>(path: P) -> Result<SenderConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
