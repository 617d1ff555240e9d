//! Handing finished videos to a remote platform.
//!
//! Network upload and credential lifetime belong to the [`Publisher`]
//! implementation; an expired token is refreshed inside `publish` and never
//! surfaces here unless the refresh itself fails (a terminal error).

pub mod dryrun;
pub mod retry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use dryrun::DryRunPublisher;
pub use retry::{publish_with_retry, RetryPolicy};

/// Upload failures, split by whether trying again can help.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Network trouble or rate limiting.
    #[error("publish failed (retryable): {0}")]
    Retryable(String),
    /// Bad credentials or rejected metadata.
    #[error("publish failed: {0}")]
    Terminal(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Retryable(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishMetadata {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl PublishMetadata {
    /// Metadata titled after the audio file stem, or "Untitled Beat".
    pub fn for_audio(audio_path: &Path) -> Self {
        let title = audio_path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("Untitled Beat")
            .to_string();
        Self {
            title,
            description: String::new(),
            tags: Vec::new(),
            category: default_category(),
            visibility: default_visibility(),
            scheduled_at: None,
        }
    }
}

/// Present on a job only when it should be published after rendering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub account_id: String,
    pub metadata: PublishMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub remote_id: String,
    pub url: String,
}

pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        video_path: &Path,
        metadata: &PublishMetadata,
        account_id: &str,
    ) -> Result<PublishReceipt, PublishError>;
}

fn default_category() -> String { "Music".into() }
fn default_visibility() -> String { "public".into() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_falls_back_to_file_stem() {
        let meta = PublishMetadata::for_audio(Path::new("/beats/night drive.wav"));
        assert_eq!(meta.title, "night drive");
        assert_eq!(meta.category, "Music");
        assert_eq!(meta.visibility, "public");
        assert_eq!(PublishMetadata::for_audio(Path::new("/")).title, "Untitled Beat");
    }

    #[test]
    fn retryable_is_distinguished() {
        assert!(PublishError::Retryable("429".into()).is_retryable());
        assert!(!PublishError::Terminal("bad token".into()).is_retryable());
    }
}
