use crate::encode::EncodeError;
use crate::jobs::model::{JobId, JobStatus};
use crate::publish::PublishError;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the render pipeline and the job scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad caller input. Never retried.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Analysis, synthesis or frame write failed while exporting a frame.
    #[error("render failed at frame {frame}: {source:#}")]
    RenderFailure {
        frame: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The source audio could not be decoded.
    #[error("audio decode failed: {0:#}")]
    Audio(#[source] anyhow::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Illegal state change; the job record is left untouched.
    #[error("job {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Outputs can only be attached to a `rendering` or `uploading` job.
    #[error("job {id} is {status}, not in progress")]
    NotActive { id: JobId, status: JobStatus },

    #[error("job {0} not found")]
    NotFound(JobId),

    /// The in-flight job was cancelled cooperatively.
    #[error("job cancelled")]
    Cancelled,

    #[error("job store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn render_failure(frame: usize, source: impl Into<anyhow::Error>) -> Self {
        Self::RenderFailure {
            frame,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_failure_names_the_frame() {
        let err = Error::render_failure(42, anyhow::anyhow!("disk full"));
        let text = err.to_string();
        assert!(text.contains("frame 42"));
        assert!(text.contains("disk full"));
    }

    #[test]
    fn transition_error_lists_both_states() {
        let err = Error::InvalidTransition {
            id: 7,
            from: JobStatus::Completed,
            to: JobStatus::Cancelled,
        };
        assert_eq!(err.to_string(), "job 7: illegal transition completed -> cancelled");
    }
}
