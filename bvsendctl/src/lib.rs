use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bvsend_core::quality::KNOWN_TIERS;
use bvsend_core::{
    load_sender_config, ChatTarget, ConfigReport, DeliveryAdapter, DeliveryError, HandleOutcome,
    InboundMessage, LinkExtractor, MuxResult, PathTranslator, PipelineError, QualityPolicy,
    RequestedQuality, SenderConfig, VideoLink, VideoLinkService,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] bvsend_core::ConfigError),
    #[error("configuration has {0} error(s)")]
    InvalidConfig(usize),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no bilibili video link found in input")]
    NoLink,
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Bilibili link resolver and downloader", long_about = None)]
pub struct Cli {
    /// Path to bvsend.toml
    #[arg(long, default_value = "configs/bvsend.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Debug logging (RUST_LOG wins when set)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Finds the video link in a message without touching the network
    Extract(ExtractArgs),
    /// Downloads and muxes the video linked in a message
    Fetch(FetchArgs),
    /// Lists the known quality tiers
    Tiers,
    /// Configuration checks
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Translates paths between the local and muxer namespaces
    #[command(subcommand)]
    Path(PathCommands),
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Message text
    pub text: String,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Message text containing the link
    pub text: String,
    /// Default quality code (overrides bilibili.qn)
    #[arg(long)]
    pub qn: Option<u32>,
    /// Fail instead of downgrading
    #[arg(long, default_value_t = false)]
    pub strict: bool,
    /// Directory for the finished file (overrides download.output_dir)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validates the configuration file
    Check,
}

#[derive(Subcommand, Debug)]
pub enum PathCommands {
    /// Local path to the muxer's view
    ToForeign { path: PathBuf },
    /// Muxer path back to the local view
    ToNative { path: PathBuf },
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Extract(args) => {
            let report = extract_report(&args.text)?;
            render(&report, cli.format)?;
        }
        Commands::Tiers => {
            let config = load_sender_config(&cli.config)?;
            render(&tier_list(config.quality_policy()), cli.format)?;
        }
        Commands::Config(ConfigCommands::Check) => {
            let config = load_sender_config(&cli.config)?;
            let report = ConfigCheck(config.validate());
            render(&report, cli.format)?;
            if !report.0.valid {
                return Err(AppError::InvalidConfig(report.0.errors.len()));
            }
        }
        Commands::Path(command) => {
            let config = load_sender_config(&cli.config)?;
            let report = translate_path(&config, command);
            render(&report, cli.format)?;
        }
        Commands::Fetch(args) => {
            let mut config = load_sender_config(&cli.config)?;
            apply_fetch_overrides(&mut config, args);
            let result = fetch(&config, &args.text).await?;
            render(&FetchReport::from(&result), cli.format)?;
        }
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct ExtractReport {
    pub kind: &'static str,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_override: Option<u32>,
}

fn extract_report(text: &str) -> Result<ExtractReport> {
    let link = LinkExtractor::new().extract(text).ok_or(AppError::NoLink)?;
    Ok(match link {
        VideoLink::Canonical(request) => ExtractReport {
            kind: "canonical",
            url: request.url.to_string(),
            video_id: Some(request.id.to_string()),
            page: Some(request.page),
            quality_override: request.quality_override,
        },
        VideoLink::Short(short) => ExtractReport {
            kind: "short",
            url: short.url.to_string(),
            video_id: None,
            page: None,
            quality_override: None,
        },
    })
}

impl DisplayFallback for ExtractReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("{} link: {}", self.kind, self.url)];
        if let Some(id) = &self.video_id {
            lines.push(format!("  video: {id} (P{})", self.page.unwrap_or(1)));
        }
        match self.quality_override {
            Some(code) => lines.push(format!("  quality override: qn={code}")),
            None if self.kind == "short" => {
                lines.push("  resolved at fetch time".to_string());
            }
            None => {}
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TierRow {
    pub code: u32,
    pub label: &'static str,
    pub resolution: u16,
    pub needs_login: bool,
    pub needs_fourk: bool,
}

#[derive(Debug, Serialize)]
pub struct TierList {
    pub auto_code: u32,
    pub strict: bool,
    pub has_credentials: bool,
    pub tiers: Vec<TierRow>,
}

fn tier_list(policy: QualityPolicy) -> TierList {
    let baseline = RequestedQuality::Auto.resolve(false);
    let tiers = KNOWN_TIERS
        .iter()
        .map(|level| TierRow {
            code: level.code(),
            label: level.label(),
            resolution: level.resolution(),
            needs_login: level.resolution() > baseline.resolution(),
            needs_fourk: level.needs_fourk(),
        })
        .collect();
    TierList {
        auto_code: policy.default.resolve(policy.has_credentials).code(),
        strict: policy.strict,
        has_credentials: policy.has_credentials,
        tiers,
    }
}

impl DisplayFallback for TierList {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "default qn={} (strict: {}, logged in: {})",
            self.auto_code, self.strict, self.has_credentials
        )];
        for tier in &self.tiers {
            let mut notes = Vec::new();
            if tier.needs_login {
                notes.push("login");
            }
            if tier.needs_fourk {
                notes.push("fourk");
            }
            let notes = if notes.is_empty() {
                String::new()
            } else {
                format!(" [{}]", notes.join(", "))
            };
            lines.push(format!(
                "  {:>3}  {:<14} {}p{notes}",
                tier.code, tier.label, tier.resolution
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ConfigCheck(ConfigReport);

impl DisplayFallback for ConfigCheck {
    fn display(&self) -> String {
        let report = &self.0;
        let mut lines = vec![if report.valid {
            "configuration OK".to_string()
        } else {
            "configuration INVALID".to_string()
        }];
        for (title, entries) in [
            ("errors", &report.errors),
            ("warnings", &report.warnings),
            ("recommendations", &report.recommendations),
        ] {
            if entries.is_empty() {
                continue;
            }
            lines.push(format!("{title}:"));
            lines.extend(entries.iter().map(|entry| format!("  - {entry}")));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PathReport {
    pub profile: &'static str,
    pub input: PathBuf,
    pub output: PathBuf,
}

fn translate_path(config: &SenderConfig, command: &PathCommands) -> PathReport {
    let translator = PathTranslator::new(config.environment.clone());
    let (input, output) = match command {
        PathCommands::ToForeign { path } => (path, translator.to_foreign(path)),
        PathCommands::ToNative { path } => (path, translator.to_native(path)),
    };
    PathReport {
        profile: config.environment.name(),
        input: input.clone(),
        output,
    }
}

impl DisplayFallback for PathReport {
    fn display(&self) -> String {
        self.output.display().to_string()
    }
}

fn apply_fetch_overrides(config: &mut SenderConfig, args: &FetchArgs) {
    if let Some(qn) = args.qn {
        config.bilibili.qn = qn;
    }
    if args.strict {
        config.bilibili.qn_strict = true;
    }
    if let Some(dir) = &args.output_dir {
        config.download.output_dir = dir.clone();
    }
}

/// Leaves the file in the output directory and prints failure notices.
struct ConsoleDelivery;

#[async_trait]
impl DeliveryAdapter for ConsoleDelivery {
    async fn deliver(&self, target: &ChatTarget, result: &MuxResult) -> std::result::Result<(), DeliveryError> {
        info!(chat = %target, path = %result.path.display(), "file ready");
        Ok(())
    }

    async fn report(&self, _target: &ChatTarget, message: &str) -> std::result::Result<(), DeliveryError> {
        eprintln!("{message}");
        Ok(())
    }
}

async fn fetch(config: &SenderConfig, text: &str) -> Result<MuxResult> {
    let service = Arc::new(VideoLinkService::from_config(config, Arc::new(ConsoleDelivery))?);
    let handle = service
        .spawn(InboundMessage::new(text, ChatTarget::new("cli")))
        .ok_or(AppError::NoLink)?;

    let watcher = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling");
                service.shutdown();
            }
        })
    };
    let outcome = handle.await;
    watcher.abort();

    match outcome {
        Ok(HandleOutcome::Delivered(result)) => Ok(result),
        Ok(HandleOutcome::Failed(err)) => Err(err.into()),
        Ok(HandleOutcome::DeliveryFailed { error, .. }) => Err(error.into()),
        Ok(HandleOutcome::Ignored) => Err(AppError::NoLink),
        Err(_) => Err(PipelineError::Cancelled.into()),
    }
}

#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_seconds: u64,
    pub title: String,
    pub video_id: String,
    pub quality_code: u32,
    pub quality_label: &'static str,
    pub requested_code: u32,
    pub downgraded: bool,
    pub compressed: bool,
}

impl From<&MuxResult> for FetchReport {
    fn from(result: &MuxResult) -> Self {
        Self {
            path: result.path.clone(),
            size_bytes: result.size_bytes,
            duration_seconds: result.duration_seconds,
            title: result.title.clone(),
            video_id: result.video_id.clone(),
            quality_code: result.quality.code(),
            quality_label: result.quality.label(),
            requested_code: result.requested_quality.code(),
            downgraded: result.downgraded(),
            compressed: result.compressed,
        }
    }
}

impl DisplayFallback for FetchReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("{} ({})", self.title, self.video_id),
            format!("  quality: {} (qn={})", self.quality_label, self.quality_code),
        ];
        if self.downgraded {
            lines.push(format!("  requested qn={}, downgraded", self.requested_code));
        }
        lines.push(format!(
            "  duration: {}:{:02}",
            self.duration_seconds / 60,
            self.duration_seconds % 60
        ));
        lines.push(format!(
            "  file: {} ({:.1} MiB{})",
            self.path.display(),
            self.size_bytes as f64 / (1024.0 * 1024.0),
            if self.compressed { ", re-encoded" } else { "" }
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("bvsendctl").chain(args.iter().copied())).unwrap()
    }

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("bvsend.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn fetch_arguments_parse() {
        let parsed = cli(&[
            "--format",
            "json",
            "fetch",
            "https://b23.tv/abc",
            "--qn",
            "80",
            "--strict",
        ]);
        assert_eq!(parsed.format, OutputFormat::Json);
        assert_eq!(parsed.config, PathBuf::from("configs/bvsend.toml"));
        match parsed.command {
            Commands::Fetch(args) => {
                assert_eq!(args.text, "https://b23.tv/abc");
                assert_eq!(args.qn, Some(80));
                assert!(args.strict);
                assert!(args.output_dir.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn path_subcommands_parse() {
        let parsed = cli(&["path", "to-foreign", "/tmp/a.mp4"]);
        assert!(matches!(
            parsed.command,
            Commands::Path(PathCommands::ToForeign { .. })
        ));
    }

    #[test]
    fn extract_reports_canonical_links() {
        let report =
            extract_report("看 https://www.bilibili.com/video/BV1xx411c7mD?p=2 qn=80").unwrap();
        assert_eq!(report.kind, "canonical");
        assert_eq!(report.video_id.as_deref(), Some("BV1xx411c7mD"));
        assert_eq!(report.page, Some(2));
        assert_eq!(report.quality_override, Some(80));
        assert!(report.display().contains("qn=80"));
    }

    #[test]
    fn extract_reports_short_links_unresolved() {
        let report = extract_report("https://b23.tv/AbCdEf1").unwrap();
        assert_eq!(report.kind, "short");
        assert!(report.video_id.is_none());
    }

    #[test]
    fn extract_without_link_fails() {
        assert!(matches!(extract_report("hello"), Err(AppError::NoLink)));
    }

    #[test]
    fn tier_list_marks_login_tiers() {
        let list = tier_list(QualityPolicy::from_code(0, false, false));
        assert_eq!(list.auto_code, 32);
        assert_eq!(list.tiers.len(), KNOWN_TIERS.len());
        let hd = list.tiers.iter().find(|tier| tier.code == 64).unwrap();
        assert!(hd.needs_login);
        let sd = list.tiers.iter().find(|tier| tier.code == 32).unwrap();
        assert!(!sd.needs_login);
        let uhd = list.tiers.iter().find(|tier| tier.code == 120).unwrap();
        assert!(uhd.needs_fourk);
    }

    #[test]
    fn path_translation_uses_configured_profile() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "[environment]\nprofile = \"container\"\nlocal_prefix = \"/data/tmp\"\nforeign_prefix = \"/srv/tmp\"\n",
        );
        let config = load_sender_config(path).unwrap();
        let report = translate_path(
            &config,
            &PathCommands::ToForeign {
                path: PathBuf::from("/data/tmp/job/out.mp4"),
            },
        );
        assert_eq!(report.profile, "container");
        assert_eq!(report.output, PathBuf::from("/srv/tmp/job/out.mp4"));
    }

    #[tokio::test]
    async fn config_check_fails_for_invalid_files() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[download]\nmax_retries = 0\n");
        let parsed = Cli {
            config: path,
            format: OutputFormat::Json,
            verbose: false,
            command: Commands::Config(ConfigCommands::Check),
        };
        assert!(matches!(run(parsed).await, Err(AppError::InvalidConfig(1))));
    }

    #[tokio::test]
    async fn reference_config_passes_check() {
        let parsed = Cli {
            config: PathBuf::from("../configs/bvsend.toml"),
            format: OutputFormat::Text,
            verbose: false,
            command: Commands::Config(ConfigCommands::Check),
        };
        run(parsed).await.unwrap();
    }

    #[test]
    fn fetch_overrides_replace_config_values() {
        let mut config = SenderConfig::from_toml_str("").unwrap();
        let args = FetchArgs {
            text: String::new(),
            qn: Some(116),
            strict: true,
            output_dir: Some(PathBuf::from("/tmp/out")),
        };
        apply_fetch_overrides(&mut config, &args);
        assert_eq!(config.bilibili.qn, 116);
        assert!(config.bilibili.qn_strict);
        assert_eq!(config.download.output_dir, PathBuf::from("/tmp/out"));
    }
}
