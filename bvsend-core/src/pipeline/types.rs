use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::config::DownloadSection;
use crate::error::ConfigError;
use crate::platform::SelectedStreams;
use crate::quality::QualityLevel;

use super::error::StreamKind;

const FALLBACK_TITLE: &str = "bilibili_video";
const MAX_TITLE_CHARS: usize = 80;

/// One elementary stream: candidate locators and where it lands on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub kind: StreamKind,
    pub urls: Vec<String>,
    pub path: PathBuf,
}

/// Everything one run downloads. Lives inside the run's scoped work dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub video: StreamSource,
    pub audio: Option<StreamSource>,
    pub output: PathBuf,
}

impl DownloadJob {
    pub fn plan(work_dir: &Path, streams: SelectedStreams) -> Self {
        match streams {
            SelectedStreams::Dash { video, audio } => Self {
                video: StreamSource {
                    kind: StreamKind::Video,
                    urls: video.urls,
                    path: work_dir.join("video.m4s"),
                },
                audio: audio.map(|audio| StreamSource {
                    kind: StreamKind::Audio,
                    urls: audio.urls,
                    path: work_dir.join("audio.m4s"),
                }),
                output: work_dir.join("output.mp4"),
            },
            SelectedStreams::Progressive { file } => Self {
                video: StreamSource {
                    kind: StreamKind::Progressive,
                    path: work_dir.join(format!("{}.{}", StreamKind::Progressive, file.format)),
                    urls: file.urls,
                },
                audio: None,
                output: work_dir.join("output.mp4"),
            },
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = &StreamSource> {
        std::iter::once(&self.video).chain(self.audio.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MuxResult {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_seconds: u64,
    pub quality: QualityLevel,
    pub requested_quality: QualityLevel,
    pub title: String,
    pub video_id: String,
    /// Re-encoded to fit the size limit.
    pub compressed: bool,
    pub completed_at: DateTime<Utc>,
}

impl MuxResult {
    pub fn downgraded(&self) -> bool {
        self.quality != self.requested_quality
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_range: [u32; 2],
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Linear interpolation across `delay_range` plus up to `jitter`.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = if self.attempts <= 1 {
            Duration::from_secs(self.delay_range[0] as u64)
        } else {
            let min = self.delay_range[0] as f64;
            let max = self.delay_range[1] as f64;
            let ratio = (attempt.min(self.attempts - 1) as f64) / ((self.attempts - 1) as f64);
            Duration::from_secs((min + (max - min) * ratio).round() as u64)
        };
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }
}

impl TryFrom<&DownloadSection> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(section: &DownloadSection) -> Result<Self, Self::Error> {
        if section.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "download.max_retries",
                reason: "must be greater than zero".to_string(),
            });
        }
        let [min, max] = section.retry_delay_seconds;
        if min > max {
            return Err(ConfigError::Invalid {
                field: "download.retry_delay_seconds",
                reason: format!("range is inverted ({min} > {max})"),
            });
        }
        Ok(Self {
            attempts: section.max_retries,
            delay_range: section.retry_delay_seconds,
            jitter: Duration::from_millis(section.retry_jitter_ms),
        })
    }
}

/// `<title>_<id>_<qn>` with filesystem-hostile characters replaced. The
/// pipeline appends a per-run suffix and `.mp4`.
pub fn output_file_stem(title: &str, video_id: &str, quality: QualityLevel) -> String {
    format!(
        "{}_{}_{}",
        sanitize_title(title),
        sanitize_title(video_id),
        quality.code()
    )
}

fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_TITLE_CHARS)
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AudioStream, ProgressiveFile, VideoStream};

    #[test]
    fn retry_delay_interpolates_between_bounds() {
        let policy = RetryPolicy {
            attempts: 3,
            delay_range: [2, 6],
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.compute_delay(0), Duration::from_secs(2));
        assert_eq!(policy.compute_delay(1), Duration::from_secs(4));
        assert_eq!(policy.compute_delay(2), Duration::from_secs(6));
        assert_eq!(policy.compute_delay(9), Duration::from_secs(6));
    }

    #[test]
    fn retry_jitter_stays_within_bound() {
        let policy = RetryPolicy {
            attempts: 2,
            delay_range: [1, 1],
            jitter: Duration::from_millis(250),
        };
        for attempt in 0..20 {
            let delay = policy.compute_delay(attempt % 2);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn retry_policy_rejects_zero_attempts_and_inverted_ranges() {
        let section = DownloadSection {
            max_retries: 0,
            ..DownloadSection::default()
        };
        assert!(RetryPolicy::try_from(&section).is_err());
        let section = DownloadSection {
            retry_delay_seconds: [5, 1],
            ..DownloadSection::default()
        };
        assert!(RetryPolicy::try_from(&section).is_err());
        let policy = RetryPolicy::try_from(&DownloadSection::default()).unwrap();
        assert_eq!(policy.attempts, 3);
    }

    #[test]
    fn output_names_are_sanitized() {
        let level = QualityLevel::from_code(80).unwrap();
        assert_eq!(
            output_file_stem("a/b:c*d?e\"f<g>h|i", "BV1xx411c7mD", level),
            "a_b_c_d_e_f_g_h_i_BV1xx411c7mD_80"
        );
        assert_eq!(
            output_file_stem("   ", "av170001", level),
            "bilibili_video_av170001_80"
        );
    }

    #[test]
    fn dash_plan_places_streams_in_work_dir() {
        let work_dir = Path::new("/tmp/bvsend-x");
        let job = DownloadJob::plan(
            work_dir,
            SelectedStreams::Dash {
                video: VideoStream {
                    quality_code: 80,
                    codecs: "avc1".to_string(),
                    bandwidth: 1,
                    width: 1,
                    height: 1,
                    urls: vec!["https://cdn/v".to_string()],
                },
                audio: Some(AudioStream {
                    id: 30280,
                    codecs: "mp4a".to_string(),
                    bandwidth: 1,
                    urls: vec!["https://cdn/a".to_string()],
                }),
            },
        );
        assert_eq!(job.video.path, work_dir.join("video.m4s"));
        assert_eq!(job.audio.as_ref().unwrap().path, work_dir.join("audio.m4s"));
        assert_eq!(job.sources().count(), 2);
        assert!(job.sources().all(|source| source.path.starts_with(work_dir)));
    }

    #[test]
    fn progressive_plan_keeps_container_extension() {
        let job = DownloadJob::plan(
            Path::new("/tmp/w"),
            SelectedStreams::Progressive {
                file: ProgressiveFile {
                    format: "flv".to_string(),
                    size_bytes: None,
                    urls: vec!["https://cdn/v.flv".to_string()],
                },
            },
        );
        assert_eq!(job.video.path, Path::new("/tmp/w/source.flv"));
        assert!(job.audio.is_none());
    }
}
