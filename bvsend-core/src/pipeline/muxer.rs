use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{CompressionSection, MuxerSection};
use crate::pathmap::PathTranslator;

use super::error::{PipelineError, PipelineResult};

const STDERR_TAIL_CHARS: usize = 2000;

/// A fully built muxer command line, already in the muxer's path namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
pub trait MuxExecutor: Send + Sync {
    async fn run(&self, invocation: &MuxInvocation) -> PipelineResult<()>;
}

pub struct SystemMuxExecutor;

#[async_trait]
impl MuxExecutor for SystemMuxExecutor {
    async fn run(&self, invocation: &MuxInvocation) -> PipelineResult<()> {
        let mut command = Command::new(&invocation.program);
        command
            .kill_on_drop(true)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        match timeout(invocation.timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(PipelineError::MuxProcess {
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            }),
            Ok(Err(err)) => Err(PipelineError::MuxProcess {
                status: format!("could not start {}", invocation.program),
                stderr: err.to_string(),
            }),
            Err(_) => Err(PipelineError::MuxTimeout {
                timeout: invocation.timeout,
            }),
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    text.chars().skip(skip).collect()
}

/// Video encoder family for size-reducing re-encodes. Each family spells its
/// quality knob differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoder {
    Software,
    Nvenc(String),
    Qsv(String),
    Amf(String),
    VideoToolbox(String),
}

impl Encoder {
    /// Unknown names fall back to libx264.
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        let lower = name.to_ascii_lowercase();
        if lower.ends_with("_nvenc") {
            Encoder::Nvenc(name.to_string())
        } else if lower.ends_with("_qsv") {
            Encoder::Qsv(name.to_string())
        } else if lower.ends_with("_amf") {
            Encoder::Amf(name.to_string())
        } else if lower.ends_with("_videotoolbox") {
            Encoder::VideoToolbox(name.to_string())
        } else {
            if lower != "libx264" {
                warn!(encoder = name, "unknown encoder, using libx264");
            }
            Encoder::Software
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Encoder::Software => "libx264",
            Encoder::Nvenc(name)
            | Encoder::Qsv(name)
            | Encoder::Amf(name)
            | Encoder::VideoToolbox(name) => name,
        }
    }

    fn quality_args(&self, quality: u8) -> Vec<String> {
        let q = quality.to_string();
        let args: Vec<&str> = match self {
            Encoder::Software => vec!["-crf", q.as_str(), "-preset", "medium"],
            Encoder::Nvenc(_) => vec!["-cq", q.as_str(), "-preset", "p4", "-profile:v", "high"],
            Encoder::Qsv(_) => vec!["-global_quality", q.as_str(), "-preset", "medium"],
            Encoder::Amf(_) => vec!["-qp_i", q.as_str(), "-qp_p", q.as_str(), "-quality", "balanced"],
            Encoder::VideoToolbox(_) => vec!["-q:v", q.as_str()],
        };
        let mut full = vec!["-c:v".to_string(), self.name().to_string()];
        full.extend(args.into_iter().map(str::to_string));
        full
    }
}

#[derive(Debug, Clone)]
pub struct CompressionSettings {
    pub encoder: Encoder,
    pub quality: u8,
    pub timeout: Duration,
}

impl From<&CompressionSection> for CompressionSettings {
    fn from(section: &CompressionSection) -> Self {
        Self {
            encoder: Encoder::from_name(&section.encoder),
            quality: section.quality,
            timeout: Duration::from_secs(section.timeout_seconds.max(1)),
        }
    }
}

pub struct Muxer {
    command: Vec<String>,
    timeout: Duration,
    translator: PathTranslator,
    executor: Arc<dyn MuxExecutor>,
}

impl Muxer {
    pub fn new(section: &MuxerSection, translator: PathTranslator) -> PipelineResult<Self> {
        let command: Vec<String> = section
            .command
            .iter()
            .map(|part| part.trim().to_string())
            .collect();
        if command.first().map_or(true, |program| program.is_empty()) {
            return Err(PipelineError::Config(
                "muxer.command must name an executable".to_string(),
            ));
        }
        Ok(Self {
            command,
            timeout: Duration::from_secs(section.timeout_seconds.max(1)),
            translator,
            executor: Arc::new(SystemMuxExecutor),
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn MuxExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    /// `<command> -y -i <video> [-i <audio>] -c copy <output>`, with every path
    /// rewritten for the muxer's namespace.
    pub fn invocation(&self, video: &Path, audio: Option<&Path>, output: &Path) -> MuxInvocation {
        let mut args: Vec<String> = self.command[1..].to_vec();
        args.extend(
            ["-y", "-hide_banner", "-loglevel", "error", "-i"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.foreign(video));
        if let Some(audio) = audio {
            args.push("-i".to_string());
            args.push(self.foreign(audio));
            args.extend(
                ["-map", "0:v:0", "-map", "1:a:0"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        args.extend(["-c", "copy"].iter().map(|s| s.to_string()));
        args.push(self.foreign(output));
        MuxInvocation {
            program: self.command[0].clone(),
            args,
            timeout: self.timeout,
        }
    }

    /// Re-encode `input` into `output` at `quality`, audio as 128k AAC.
    pub fn compress_invocation(
        &self,
        input: &Path,
        output: &Path,
        settings: &CompressionSettings,
        quality: u8,
    ) -> MuxInvocation {
        let mut args: Vec<String> = self.command[1..].to_vec();
        args.extend(
            ["-y", "-hide_banner", "-loglevel", "error", "-i"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.foreign(input));
        args.extend(settings.encoder.quality_args(quality));
        args.extend(
            ["-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.foreign(output));
        MuxInvocation {
            program: self.command[0].clone(),
            args,
            timeout: settings.timeout,
        }
    }

    pub async fn mux(&self, video: &Path, audio: Option<&Path>, output: &Path) -> PipelineResult<()> {
        let invocation = self.invocation(video, audio, output);
        self.execute(&invocation, "mux").await
    }

    pub async fn compress(
        &self,
        input: &Path,
        output: &Path,
        settings: &CompressionSettings,
        quality: u8,
    ) -> PipelineResult<()> {
        let invocation = self.compress_invocation(input, output, settings, quality);
        self.execute(&invocation, "compress").await
    }

    async fn execute(&self, invocation: &MuxInvocation, stage: &str) -> PipelineResult<()> {
        debug!(
            program = %invocation.program,
            profile = self.translator.profile().name(),
            stage,
            "invoking muxer"
        );
        let result = self.executor.run(invocation).await;
        if let Err(err) = &result {
            warn!(error = %err, stage, "muxer run failed");
        }
        result
    }

    fn foreign(&self, path: &Path) -> String {
        self.translator
            .to_foreign(path)
            .to_string_lossy()
            .into_owned()
    }
}
