use std::path::Path;

use super::{PublishError, PublishMetadata, PublishReceipt, Publisher};

/// Logs what would be uploaded and returns a fabricated video id.
#[derive(Clone, Copy, Debug, Default)]
pub struct DryRunPublisher;

impl Publisher for DryRunPublisher {
    fn publish(
        &self,
        video_path: &Path,
        metadata: &PublishMetadata,
        account_id: &str,
    ) -> Result<PublishReceipt, PublishError> {
        if !video_path.exists() {
            return Err(PublishError::Terminal(format!(
                "video not found: {}",
                video_path.display()
            )));
        }
        if metadata.title.trim().is_empty() {
            return Err(PublishError::Terminal("title must not be empty".into()));
        }

        let remote_id = format!("dryrun_{}", chrono::Utc::now().timestamp_millis());
        log::info!(
            "[dry run] publish {} as '{}' ({}, {}) to account {}",
            video_path.display(),
            metadata.title,
            metadata.category,
            metadata.visibility,
            account_id
        );
        Ok(PublishReceipt {
            url: format!("https://www.youtube.com/watch?v={remote_id}"),
            remote_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_watch_url_for_existing_video() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("v.mp4");
        std::fs::write(&video, b"mp4").unwrap();
        let receipt = DryRunPublisher
            .publish(&video, &PublishMetadata::for_audio(&video), "acct")
            .unwrap();
        assert!(receipt.remote_id.starts_with("dryrun_"));
        assert!(receipt.url.ends_with(&receipt.remote_id));
    }

    #[test]
    fn missing_video_is_terminal() {
        let err = DryRunPublisher
            .publish(Path::new("/nope.mp4"), &PublishMetadata::for_audio(Path::new("a.wav")), "acct")
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
