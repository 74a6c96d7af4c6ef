mod error;
mod muxer;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use tempfile::TempDir;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SenderConfig;
use crate::link::{VideoLink, VideoRequest};
use crate::pathmap::PathTranslator;
use crate::platform::{MediaPlatform, VideoInfo};
use crate::quality::{NegotiatedQuality, QualityNegotiator};

pub use error::{PipelineError, PipelineResult, StreamKind};
pub use muxer::{
    CompressionSettings, Encoder, MuxExecutor, MuxInvocation, Muxer, SystemMuxExecutor,
};
pub use types::{output_file_stem, DownloadJob, MuxResult, RetryPolicy, StreamSource};

pub const WORK_DIR_PREFIX: &str = "bvsend-";

const MAX_COMPRESSION_QUALITY: u8 = 35;
const COMPRESSION_QUALITY_STEP: u8 = 5;

/// Why a single candidate URL failed.
#[derive(Debug)]
enum FetchFailure {
    /// Worth another attempt later.
    Transient(String),
    /// The locator no longer serves the stream.
    Gone(String),
    Auth(StatusCode),
    Local(PipelineError),
}

/// Fetch and mux for one negotiated request. Each `run` owns a fresh scoped
/// work directory that is gone by the time it returns or is dropped.
pub struct Pipeline {
    http_client: Client,
    retry_policy: RetryPolicy,
    retry_sleep_cap: Duration,
    temp_root: PathBuf,
    output_dir: PathBuf,
    duration_limit: Option<u64>,
    size_limit: Option<u64>,
    compression: Option<CompressionSettings>,
    muxer: Muxer,
}

impl Pipeline {
    pub fn new(config: &SenderConfig) -> PipelineResult<Self> {
        let http_client = Client::builder()
            .user_agent(config.bilibili.user_agent.clone())
            .connect_timeout(Duration::from_secs(
                config.bilibili.request_timeout_seconds.max(1),
            ))
            .timeout(Duration::from_secs(config.download.stream_timeout_seconds.max(1)))
            .build()
            .map_err(|err| PipelineError::Config(err.to_string()))?;
        let retry_policy = RetryPolicy::try_from(&config.download)?;
        let muxer = Muxer::new(
            &config.muxer,
            PathTranslator::new(config.environment.clone()),
        )?;
        let temp_root = muxer
            .translator()
            .native_form(&config.download.temp_root());
        Ok(Self {
            http_client,
            retry_policy,
            retry_sleep_cap: Duration::from_secs(60),
            temp_root,
            output_dir: config.download.output_dir.clone(),
            duration_limit: config.limits.duration_limit(),
            size_limit: config.limits.size_limit_bytes(),
            compression: config
                .compression
                .enabled
                .then(|| CompressionSettings::from(&config.compression)),
            muxer,
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn MuxExecutor>) -> Self {
        self.muxer = self.muxer.with_executor(executor);
        self
    }

    pub fn with_retry_sleep_cap(mut self, cap: Duration) -> Self {
        self.retry_sleep_cap = cap;
        self
    }

    pub fn muxer(&self) -> &Muxer {
        &self.muxer
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Turns an extracted link into a request, resolving short links first.
    pub async fn resolve_link(
        &self,
        platform: &dyn MediaPlatform,
        link: VideoLink,
    ) -> PipelineResult<VideoRequest> {
        match link {
            VideoLink::Canonical(request) => Ok(request),
            VideoLink::Short(short) => {
                let resolved = platform.resolve_short_link(&short.url).await?;
                info!(short = %short.url, resolved = %resolved, "short link resolved");
                Ok(short.into_request(resolved)?)
            }
        }
    }

    pub async fn run(
        &self,
        platform: &dyn MediaPlatform,
        request: &VideoRequest,
        negotiator: &QualityNegotiator,
    ) -> PipelineResult<MuxResult> {
        let video = platform.video_info(&request.id, request.page).await?;
        self.check_duration(&video)?;

        let target = negotiator.target(request.quality_override);
        info!(
            id = %request.id,
            qn = target.level.code(),
            strict = target.strict,
            "requesting play info"
        );
        let play = platform.play_info(&video, target.level).await?;
        let negotiated = negotiator.select(target, &play.available_levels())?;
        let streams = play.select_streams(negotiated.selected)?;

        let work_dir = self.allocate_work_dir().await?;
        let job = DownloadJob::plan(work_dir.path(), streams);
        let outcome = self
            .fetch_and_mux(platform.download_headers(), &job, &video, negotiated)
            .await;
        cleanup_work_dir(work_dir);
        outcome
    }

    fn check_duration(&self, video: &VideoInfo) -> PipelineResult<()> {
        match self.duration_limit {
            Some(limit) if video.duration_seconds > limit => {
                Err(PipelineError::DurationLimitExceeded {
                    duration_seconds: video.duration_seconds,
                    limit_seconds: limit,
                })
            }
            _ => Ok(()),
        }
    }

    async fn allocate_work_dir(&self) -> PipelineResult<TempDir> {
        fs::create_dir_all(&self.temp_root)
            .await
            .map_err(|source| PipelineError::Io {
                path: self.temp_root.clone(),
                source,
            })?;
        let work_dir = tempfile::Builder::new()
            .prefix(WORK_DIR_PREFIX)
            .tempdir_in(&self.temp_root)
            .map_err(|source| PipelineError::Io {
                path: self.temp_root.clone(),
                source,
            })?;
        debug!(path = %work_dir.path().display(), "allocated work directory");
        Ok(work_dir)
    }

    async fn fetch_and_mux(
        &self,
        headers: HeaderMap,
        job: &DownloadJob,
        video: &VideoInfo,
        negotiated: NegotiatedQuality,
    ) -> PipelineResult<MuxResult> {
        let video_download = self.download_stream(&job.video, &headers);
        match &job.audio {
            Some(audio) => {
                tokio::try_join!(video_download, self.download_stream(audio, &headers))?;
            }
            None => {
                video_download.await?;
            }
        }

        let already_mp4 = job.audio.is_none()
            && job.video.kind == StreamKind::Progressive
            && job
                .video
                .path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("mp4"));
        let muxed = if already_mp4 {
            job.video.path.as_path()
        } else {
            self.muxer
                .mux(
                    &job.video.path,
                    job.audio.as_ref().map(|audio| audio.path.as_path()),
                    &job.output,
                )
                .await?;
            job.output.as_path()
        };

        let (ready, compressed) = self.enforce_size_limit(muxed, job).await?;

        let video_id = video.display_id();
        let stem = output_file_stem(&video.title, &video_id, negotiated.selected);
        let path = self.finalize(&ready, &stem).await?;
        let size_bytes = file_size(&path).await?;
        info!(
            id = %video_id,
            qn = negotiated.selected.code(),
            size_bytes,
            compressed,
            path = %path.display(),
            "video ready"
        );
        Ok(MuxResult {
            path,
            size_bytes,
            duration_seconds: video.duration_seconds,
            quality: negotiated.selected,
            requested_quality: negotiated.target.level,
            title: video.title.clone(),
            video_id,
            compressed,
            completed_at: Utc::now(),
        })
    }

    /// Re-encodes files above the size limit, raising the quality value by
    /// a fixed step until the result fits or the ceiling is reached.
    async fn enforce_size_limit(
        &self,
        muxed: &Path,
        job: &DownloadJob,
    ) -> PipelineResult<(PathBuf, bool)> {
        let Some(limit) = self.size_limit else {
            return Ok((muxed.to_path_buf(), false));
        };
        let size = file_size(muxed).await?;
        if size <= limit {
            return Ok((muxed.to_path_buf(), false));
        }
        let Some(settings) = &self.compression else {
            return Err(PipelineError::FileTooLarge {
                size_bytes: size,
                limit_bytes: limit,
            });
        };

        info!(
            size_bytes = size,
            limit_bytes = limit,
            encoder = settings.encoder.name(),
            "file over size limit, re-encoding"
        );
        let mut smallest = size;
        let mut quality = settings.quality;
        loop {
            let output = job.output.with_file_name(format!("compressed_q{quality}.mp4"));
            match self.muxer.compress(muxed, &output, settings, quality).await {
                Ok(()) => {
                    let compressed = file_size(&output).await?;
                    debug!(quality, size_bytes = compressed, "re-encode finished");
                    if compressed <= limit {
                        return Ok((output, true));
                    }
                    smallest = smallest.min(compressed);
                    remove_partial(&output).await;
                }
                Err(err) => {
                    warn!(quality, error = %err, "re-encode failed");
                    remove_partial(&output).await;
                    break;
                }
            }
            if quality >= MAX_COMPRESSION_QUALITY {
                break;
            }
            quality = quality
                .saturating_add(COMPRESSION_QUALITY_STEP)
                .min(MAX_COMPRESSION_QUALITY);
        }
        Err(PipelineError::FileTooLarge {
            size_bytes: smallest,
            limit_bytes: limit,
        })
    }

    async fn download_stream(&self, source: &StreamSource, headers: &HeaderMap) -> PipelineResult<u64> {
        let label = source.kind.to_string();
        self.retry_operation(&label, || self.download_candidates(source, headers))
            .await
    }

    /// One attempt: every candidate URL in order.
    async fn download_candidates(
        &self,
        source: &StreamSource,
        headers: &HeaderMap,
    ) -> PipelineResult<u64> {
        let mut transient = false;
        let mut last_reason = "no candidate urls".to_string();
        for (index, url) in source.urls.iter().enumerate() {
            match self.fetch_to_file(url, &source.path, headers).await {
                Ok(bytes) => {
                    debug!(stream = %source.kind, candidate = index, bytes, "stream downloaded");
                    return Ok(bytes);
                }
                Err(FetchFailure::Auth(status)) => {
                    remove_partial(&source.path).await;
                    return Err(PipelineError::AuthenticationRejected {
                        endpoint: format!("{} stream ({status})", source.kind),
                    });
                }
                Err(FetchFailure::Local(err)) => {
                    remove_partial(&source.path).await;
                    return Err(err);
                }
                Err(FetchFailure::Transient(reason)) => {
                    warn!(stream = %source.kind, candidate = index, %reason, "candidate failed");
                    transient = true;
                    last_reason = reason;
                }
                Err(FetchFailure::Gone(reason)) => {
                    warn!(stream = %source.kind, candidate = index, %reason, "candidate unavailable");
                    last_reason = reason;
                }
            }
            remove_partial(&source.path).await;
        }
        Err(PipelineError::StreamFetch {
            stream: source.kind,
            transient,
            attempts: 1,
            reason: last_reason,
        })
    }

    async fn retry_operation<F, Fut, T>(&self, label: &str, mut operation: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = PipelineResult<T>>,
    {
        let attempts = self.retry_policy.attempts.max(1);
        for attempt in 0..attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() || attempt + 1 == attempts => {
                    return Err(with_attempts(err, attempt + 1));
                }
                Err(err) => {
                    let delay = self.retry_policy.compute_delay(attempt);
                    let capped = delay.min(self.retry_sleep_cap);
                    warn!(attempt = attempt + 1, wait = ?capped, stage = label, error = %err, "retrying operation");
                    if !capped.is_zero() {
                        sleep(capped).await;
                    }
                }
            }
        }
        Err(PipelineError::Config(format!(
            "operation {label} ran with no attempts"
        )))
    }

    async fn fetch_to_file(
        &self,
        url: &str,
        path: &Path,
        headers: &HeaderMap,
    ) -> Result<u64, FetchFailure> {
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "file" {
                let source_path = parsed
                    .to_file_path()
                    .map_err(|_| FetchFailure::Gone(format!("invalid file url {url}")))?;
                return fs::copy(&source_path, path).await.map_err(|source| {
                    if source.kind() == std::io::ErrorKind::NotFound {
                        FetchFailure::Gone(format!("{} does not exist", source_path.display()))
                    } else {
                        FetchFailure::Local(PipelineError::Io {
                            path: source_path.clone(),
                            source,
                        })
                    }
                });
            }
        }

        let response = self
            .http_client
            .get(url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(|err| FetchFailure::Transient(err.to_string()))?;
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(FetchFailure::Auth(status));
        }
        if !status.is_success() {
            let reason = format!("HTTP {status}");
            let retryable = status.is_server_error()
                || matches!(
                    status,
                    StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
                );
            return Err(if retryable {
                FetchFailure::Transient(reason)
            } else {
                FetchFailure::Gone(reason)
            });
        }

        let expected = response.content_length();
        let io_failure = |source: std::io::Error| {
            FetchFailure::Local(PipelineError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        let mut file = fs::File::create(path).await.map_err(io_failure)?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let data = chunk.map_err(|err| FetchFailure::Transient(err.to_string()))?;
            file.write_all(&data).await.map_err(io_failure)?;
            written += data.len() as u64;
        }
        file.flush().await.map_err(io_failure)?;
        if let Some(expected) = expected {
            if written != expected {
                return Err(FetchFailure::Transient(format!(
                    "short body: {written} of {expected} bytes"
                )));
            }
        }
        Ok(written)
    }

    /// Moves the finished file out of the work dir before it is removed.
    /// The destination `<stem>_<random>.mp4` is created exclusively first, so
    /// concurrent runs for the same video never share a path.
    async fn finalize(&self, ready: &Path, stem: &str) -> PipelineResult<PathBuf> {
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| PipelineError::Io {
                path: self.output_dir.clone(),
                source,
            })?;
        let destination = tempfile::Builder::new()
            .prefix(&format!("{stem}_"))
            .suffix(".mp4")
            .rand_bytes(6)
            .tempfile_in(&self.output_dir)
            .map_err(|source| PipelineError::Io {
                path: self.output_dir.clone(),
                source,
            })?
            .into_temp_path();
        if fs::rename(ready, &destination).await.is_err() {
            // Cross-device moves need a copy.
            fs::copy(ready, &destination)
                .await
                .map_err(|source| PipelineError::Io {
                    path: destination.to_path_buf(),
                    source,
                })?;
            if let Err(err) = fs::remove_file(ready).await {
                warn!(path = %ready.display(), error = %err, "failed to remove muxed file after copy");
            }
        }
        destination.keep().map_err(|err| PipelineError::Io {
            path: self.output_dir.clone(),
            source: err.error,
        })
    }
}

fn with_attempts(error: PipelineError, attempts: u32) -> PipelineError {
    match error {
        PipelineError::StreamFetch {
            stream,
            transient,
            reason,
            ..
        } => PipelineError::StreamFetch {
            stream,
            transient,
            attempts,
            reason,
        },
        other => other,
    }
}

async fn file_size(path: &Path) -> PipelineResult<u64> {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove partial download"),
    }
}

fn cleanup_work_dir(work_dir: TempDir) {
    let path = work_dir.path().to_path_buf();
    if let Err(err) = work_dir.close() {
        warn!(path = %path.display(), error = %err, "failed to clean work directory");
    }
}
