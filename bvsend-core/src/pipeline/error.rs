use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::error::ConfigError;
use crate::link::LinkError;
use crate::platform::PlatformError;
use crate::quality::QualityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
    Progressive,
}

impl StreamKind {
    pub fn file_stem(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
            StreamKind::Progressive => "source",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("short link resolution failed: {0}")]
    LinkResolution(#[from] LinkError),
    #[error(transparent)]
    QualityUnavailable(#[from] QualityError),
    #[error("{stream} download failed after {attempts} attempt(s): {reason}")]
    StreamFetch {
        stream: StreamKind,
        transient: bool,
        attempts: u32,
        reason: String,
    },
    #[error("credentials rejected at {endpoint}")]
    AuthenticationRejected { endpoint: String },
    #[error("muxer failed ({status}): {stderr}")]
    MuxProcess { status: String, stderr: String },
    #[error("muxer did not finish within {timeout:?}")]
    MuxTimeout { timeout: Duration },
    #[error("video lasts {duration_seconds}s, limit is {limit_seconds}s")]
    DurationLimitExceeded {
        duration_seconds: u64,
        limit_seconds: u64,
    },
    #[error("file is {size_bytes} bytes, limit is {limit_bytes} bytes")]
    FileTooLarge { size_bytes: u64, limit_bytes: u64 },
    #[error("platform request failed: {0}")]
    Platform(PlatformError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::StreamFetch {
                transient: true,
                ..
            }
        )
    }

    /// Reason reported back to the chat.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::LinkResolution(_) => {
                "Could not resolve the short link, please send the full video URL.".to_string()
            }
            PipelineError::QualityUnavailable(QualityError::Unavailable {
                requested,
                available,
            }) => {
                let offered = available
                    .iter()
                    .map(|level| level.label())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "Requested quality {} is not available for this video (available: {offered}).",
                    requested.label()
                )
            }
            PipelineError::QualityUnavailable(QualityError::NoTiers) => {
                "The platform offered no playable quality for this video.".to_string()
            }
            PipelineError::StreamFetch { stream, .. } => {
                format!("Downloading the {stream} stream failed, please try again later.")
            }
            PipelineError::AuthenticationRejected { .. } => {
                "The configured Bilibili login was rejected; it may have expired.".to_string()
            }
            PipelineError::MuxProcess { .. } | PipelineError::MuxTimeout { .. } => {
                "Combining the video and audio streams failed.".to_string()
            }
            PipelineError::DurationLimitExceeded {
                duration_seconds,
                limit_seconds,
            } => format!(
                "The video is {} long, longer than the allowed {}.",
                format_minutes(*duration_seconds),
                format_minutes(*limit_seconds)
            ),
            PipelineError::FileTooLarge {
                size_bytes,
                limit_bytes,
            } => format!(
                "The video is {} MB, above the {} MB upload limit.",
                format_megabytes(*size_bytes),
                format_megabytes(*limit_bytes)
            ),
            PipelineError::Platform(err) => format!("Bilibili request failed: {err}"),
            PipelineError::Io { .. } | PipelineError::Config(_) => {
                "The video could not be prepared because of a local error.".to_string()
            }
            PipelineError::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}

fn format_minutes(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn format_megabytes(bytes: u64) -> String {
    format!("{:.1}", bytes as f64 / (1024.0 * 1024.0))
}

impl From<PlatformError> for PipelineError {
    fn from(error: PlatformError) -> Self {
        match error {
            PlatformError::AuthenticationRejected { endpoint } => {
                PipelineError::AuthenticationRejected { endpoint }
            }
            PlatformError::Link(err) => PipelineError::LinkResolution(err),
            other => PipelineError::Platform(other),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(error: ConfigError) -> Self {
        PipelineError::Config(error.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
