//! Message-level glue: one chat message in, at most one delivered file out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SenderConfig;
use crate::delivery::{ChatTarget, DeliveryAdapter, DeliveryError};
use crate::link::{LinkExtractor, VideoLink};
use crate::pipeline::{MuxResult, Pipeline, PipelineError, PipelineResult};
use crate::platform::{BilibiliClient, MediaPlatform};
use crate::quality::QualityNegotiator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    pub target: ChatTarget,
}

impl InboundMessage {
    pub fn new(text: impl Into<String>, target: ChatTarget) -> Self {
        Self {
            text: text.into(),
            target,
        }
    }
}

#[derive(Debug)]
pub enum HandleOutcome {
    /// No video link in the message.
    Ignored,
    Delivered(MuxResult),
    Failed(PipelineError),
    /// The file was produced but the adapter refused it.
    DeliveryFailed {
        result: MuxResult,
        error: DeliveryError,
    },
}

pub struct VideoLinkService {
    extractor: LinkExtractor,
    platform: Arc<dyn MediaPlatform>,
    pipeline: Pipeline,
    negotiator: QualityNegotiator,
    delivery: Arc<dyn DeliveryAdapter>,
    shutdown: CancellationToken,
}

impl VideoLinkService {
    pub fn new(
        pipeline: Pipeline,
        platform: Arc<dyn MediaPlatform>,
        negotiator: QualityNegotiator,
        delivery: Arc<dyn DeliveryAdapter>,
    ) -> Self {
        Self {
            extractor: LinkExtractor::new(),
            platform,
            pipeline,
            negotiator,
            delivery,
            shutdown: CancellationToken::new(),
        }
    }

    /// Wires the Bilibili client, the pipeline and the configured quality
    /// policy together.
    pub fn from_config(
        config: &SenderConfig,
        delivery: Arc<dyn DeliveryAdapter>,
    ) -> PipelineResult<Self> {
        let platform = Arc::new(BilibiliClient::new(&config.bilibili)?);
        let pipeline = Pipeline::new(config)?;
        let negotiator = QualityNegotiator::new(config.quality_policy());
        Ok(Self::new(pipeline, platform, negotiator, delivery))
    }

    pub fn with_negotiator(mut self, negotiator: QualityNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn handle(&self, message: &InboundMessage) -> HandleOutcome {
        let Some(link) = self.extractor.extract(&message.text) else {
            return HandleOutcome::Ignored;
        };
        // Dropping the run on shutdown kills the muxer and removes the work dir.
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(PipelineError::Cancelled),
            result = self.process(link) => result,
        };
        match outcome {
            Ok(result) => match self.delivery.deliver(&message.target, &result).await {
                Ok(()) => {
                    info!(chat = %message.target, path = %result.path.display(), "video delivered");
                    HandleOutcome::Delivered(result)
                }
                Err(error) => {
                    warn!(chat = %message.target, error = %error, "delivery failed");
                    HandleOutcome::DeliveryFailed { result, error }
                }
            },
            Err(error) => {
                warn!(chat = %message.target, error = %error, "video request failed");
                if !matches!(error, PipelineError::Cancelled) {
                    if let Err(report_error) = self
                        .delivery
                        .report(&message.target, &error.user_message())
                        .await
                    {
                        warn!(error = %report_error, "failed to report request failure");
                    }
                }
                HandleOutcome::Failed(error)
            }
        }
    }

    async fn process(&self, link: VideoLink) -> PipelineResult<MuxResult> {
        let platform = self.platform.as_ref();
        let request = self.pipeline.resolve_link(platform, link).await?;
        self.pipeline.run(platform, &request, &self.negotiator).await
    }

    /// Runs the message on its own task; `None` when it carries no link.
    pub fn spawn(self: &Arc<Self>, message: InboundMessage) -> Option<JoinHandle<HandleOutcome>> {
        self.extractor.extract(&message.text)?;
        let service = Arc::clone(self);
        Some(tokio::spawn(async move { service.handle(&message).await }))
    }

    /// Cancels every in-flight run.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
