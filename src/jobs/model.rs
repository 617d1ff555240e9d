use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::publish::PublishRequest;
use crate::render::{LayerConfigs, SessionGeometry};
use crate::{Error, Result};

pub type JobId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Rendering,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Rendering,
        JobStatus::Uploading,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Owned by the worker; at most one job is ever in an active state.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Rendering | JobStatus::Uploading)
    }

    /// States that stamp `completed_at`.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Rendering)
                | (Pending, Cancelled)
                | (Rendering, Uploading)
                | (Rendering, Completed)
                | (Rendering, Failed)
                | (Rendering, Cancelled)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Cancelled)
                | (Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Rendering => "rendering",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendering parameters, copied into the job when it is submitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisualConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub layers: LayerConfigs,
}

impl VisualConfig {
    pub fn geometry(&self) -> SessionGeometry {
        SessionGeometry {
            width: self.width,
            height: self.height,
            frame_rate: self.fps,
        }
    }
}

/// What a caller submits.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRequest {
    pub audio_path: PathBuf,
    pub visual: VisualConfig,
    pub publish: Option<PublishRequest>,
}

impl JobRequest {
    /// Reject requests that could never render or publish.
    pub fn validate(&self) -> Result<()> {
        let visual = &self.visual;
        if visual.width == 0 || visual.height == 0 {
            return Err(Error::invalid(format!(
                "resolution must be non-zero, got {}x{}",
                visual.width, visual.height
            )));
        }
        if visual.fps == 0 {
            return Err(Error::invalid("fps must be positive"));
        }
        if let Some(ref publish) = self.publish {
            if publish.metadata.title.trim().is_empty() {
                return Err(Error::invalid("publish title must not be empty"));
            }
        }
        Ok(())
    }
}

/// Persisted unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub audio_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub visual: VisualConfig,
    pub publish: Option<PublishRequest>,
    pub progress: u8,
    pub error_message: Option<String>,
    pub remote_id: Option<String>,
    pub remote_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh `pending` record; the store assigns the real id on insert.
    pub fn new(request: JobRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            status: JobStatus::Pending,
            audio_path: request.audio_path,
            output_path: None,
            visual: request.visual,
            publish: request.publish,
            progress: 0,
            error_message: None,
            remote_id: None,
            remote_url: None,
            created_at,
            completed_at: None,
        }
    }

    pub fn wants_publish(&self) -> bool {
        self.publish.is_some()
    }
}

/// Consistent view of the queue, taken under one lock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub counts: BTreeMap<JobStatus, usize>,
    pub current_job: Option<JobId>,
    pub is_processing: bool,
    pub is_paused: bool,
}

impl QueueStatus {
    pub fn count(&self, status: JobStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listed_transitions_are_legal() {
        use JobStatus::*;
        let legal = [
            (Pending, Rendering),
            (Pending, Cancelled),
            (Rendering, Uploading),
            (Rendering, Completed),
            (Rendering, Failed),
            (Rendering, Cancelled),
            (Uploading, Completed),
            (Uploading, Failed),
            (Uploading, Cancelled),
            (Failed, Pending),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Uploading).unwrap(), "\"uploading\"");
        let parsed: JobStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, JobStatus::Cancelled);
    }
}
