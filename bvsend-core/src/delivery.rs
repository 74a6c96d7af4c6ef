use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::MuxResult;

/// Opaque chat identifier, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatTarget(pub String);

impl ChatTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery to {target} failed: {reason}")]
    Rejected { target: ChatTarget, reason: String },
    #[error("io error during delivery: {0}")]
    Io(#[from] std::io::Error),
}

/// Posts finished files (and failure reasons) back to the chat.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Called exactly once per successful run, never on failure.
    async fn deliver(&self, target: &ChatTarget, result: &MuxResult) -> Result<(), DeliveryError>;

    /// Human-readable failure notice. Hosts without a text channel keep the
    /// default and drop it.
    async fn report(&self, _target: &ChatTarget, _message: &str) -> Result<(), DeliveryError> {
        Ok(())
    }
}
