pub mod config;
pub mod delivery;
pub mod error;
pub mod link;
pub mod pathmap;
pub mod pipeline;
pub mod platform;
pub mod quality;
pub mod service;

pub use config::{load_sender_config, ConfigReport, SenderConfig};
pub use delivery::{ChatTarget, DeliveryAdapter, DeliveryError};
pub use error::{ConfigError, Result};
pub use link::{LinkError, LinkExtractor, ShortLink, VideoId, VideoLink, VideoRequest};
pub use pathmap::{EnvironmentProfile, PathTranslator};
pub use pipeline::{
    MuxExecutor, MuxInvocation, MuxResult, Pipeline, PipelineError, PipelineResult, StreamKind,
};
pub use platform::{BilibiliClient, Credentials, MediaPlatform, PlatformError, PlayInfo, VideoInfo};
pub use quality::{
    QualityError, QualityLevel, QualityNegotiator, QualityPolicy, QualityTarget, RequestedQuality,
};
pub use service::{HandleOutcome, InboundMessage, VideoLinkService};
