//! Single-flight job execution.
//!
//! One background worker pulls the oldest `pending` job, renders it, hands
//! the frames to the [`Encoder`], optionally publishes the result and then
//! looks for the next job. All status changes go through the [`JobStore`],
//! which rejects illegal transitions atomically; that is what turns a cancel
//! racing with completion into a no-op.

use chrono::Utc;
use crossbeam::channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::events::{EventBus, FailureKind, JobEvent};
use super::model::{Job, JobId, JobRequest, JobStatus, QueueStatus};
use super::store::JobStore;
use crate::audio::{AudioDecoder, SymphoniaDecoder};
use crate::config::{FontConfig, OutputConfig, SchedulerConfig};
use crate::encode::{Encoder, FfmpegEncoder};
use crate::publish::{publish_with_retry, DryRunPublisher, Publisher, RetryPolicy};
use crate::render::{CancelToken, FrameSynthesizer, RenderSession, TextOverlay};
use crate::{Error, Result};

const INTERRUPTED: &str = "interrupted before completion";

/// External services a scheduler drives.
#[derive(Clone)]
pub struct Collaborators {
    pub decoder: Arc<dyn AudioDecoder>,
    pub encoder: Arc<dyn Encoder>,
    pub publisher: Arc<dyn Publisher>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            decoder: Arc::new(SymphoniaDecoder),
            encoder: Arc::new(FfmpegEncoder::default()),
            publisher: Arc::new(DryRunPublisher),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchedulerSettings {
    pub output: OutputConfig,
    pub scheduler: SchedulerConfig,
    pub font: FontConfig,
    /// Parent of per-session work directories; the system temp dir when unset.
    pub temp_root: Option<PathBuf>,
    /// Start with the queue paused; nothing runs until [`JobScheduler::resume`].
    pub start_paused: bool,
}

/// Overall progress for a render at `percent`, given the render phase's share.
pub fn weighted_progress(percent: f64, render_weight: u8) -> u8 {
    let scaled = (percent.clamp(0.0, 100.0) * render_weight as f64 / 100.0).round();
    scaled.min(100.0) as u8
}

struct ActiveJob {
    id: JobId,
    cancel: CancelToken,
}

#[derive(Default)]
struct WorkerState {
    paused: bool,
    shutdown: bool,
    active: Option<ActiveJob>,
}

struct Shared {
    store: Arc<dyn JobStore>,
    services: Collaborators,
    events: EventBus,
    settings: SchedulerSettings,
    retry: RetryPolicy,
    state: Mutex<WorkerState>,
    wake: Condvar,
}

/// Drives jobs from `pending` to a finished state, one at a time.
pub struct JobScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Recover interrupted jobs and start the worker thread.
    pub fn start(
        store: Arc<dyn JobStore>,
        services: Collaborators,
        mut settings: SchedulerSettings,
    ) -> Result<Self> {
        if settings.scheduler.max_concurrency != 1 {
            log::warn!(
                "max_concurrency = {} is not supported; running one job at a time",
                settings.scheduler.max_concurrency
            );
            settings.scheduler.max_concurrency = 1;
        }
        if settings.scheduler.render_weight > 100 {
            log::warn!(
                "render_weight = {} is above 100; clamping",
                settings.scheduler.render_weight
            );
            settings.scheduler.render_weight = 100;
        }

        recover_interrupted(store.as_ref())?;

        let shared = Arc::new(Shared {
            store,
            services,
            events: EventBus::new(),
            retry: settings.scheduler.retry_policy(),
            state: Mutex::new(WorkerState {
                paused: settings.start_paused,
                ..Default::default()
            }),
            settings,
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("beatcast-worker".into())
            .spawn(move || worker_shared.run())?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Persist a new `pending` job and wake the worker.
    pub fn add_job(&self, request: JobRequest) -> Result<JobId> {
        request.validate()?;
        let audio = request.audio_path.display().to_string();
        let state = self.shared.lock_state();
        let id = self.shared.store.insert(Job::new(request, Utc::now()))?;
        log::info!("Job {} added: {}", id, audio);
        self.shared.events.publish(JobEvent::Added { id });
        drop(state);
        self.shared.wake.notify_all();
        Ok(id)
    }

    /// Cancel a pending or in-flight job. `false` if the job is unknown or already finished.
    pub fn cancel_job(&self, id: JobId) -> bool {
        let state = self.shared.lock_state();
        let job = match self.shared.store.get(id) {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(err) => {
                log::error!("Cancel of job {} failed: {}", id, err);
                return false;
            }
        };

        if job.status.is_active() {
            if let Some(active) = state.active.as_ref().filter(|a| a.id == id) {
                active.cancel.cancel();
            }
        }
        match self.shared.store.update_status(id, JobStatus::Cancelled, None) {
            Ok(_) => {
                log::info!("Job {} cancelled ({})", id, job.status);
                self.shared.events.publish(JobEvent::Cancelled { id });
                true
            }
            Err(err) => {
                log::warn!("Cancel of job {} rejected: {}", id, err);
                false
            }
        }
    }

    /// Put a `failed` job back in the queue at its original position.
    pub fn retry_job(&self, id: JobId) -> bool {
        let _state = self.shared.lock_state();
        match self.shared.store.update_status(id, JobStatus::Pending, None) {
            Ok(_) => {
                log::info!("Job {} queued for retry", id);
                self.shared.events.publish(JobEvent::Retried { id });
                self.shared.wake.notify_all();
                true
            }
            Err(err) => {
                log::warn!("Retry of job {} rejected: {}", id, err);
                false
            }
        }
    }

    /// Stop starting new jobs. A running job is not interrupted.
    pub fn pause(&self) {
        self.shared.lock_state().paused = true;
        log::info!("Queue paused");
    }

    pub fn resume(&self) {
        self.shared.lock_state().paused = false;
        log::info!("Queue resumed");
        self.shared.wake.notify_all();
    }

    pub fn queue_status(&self) -> Result<QueueStatus> {
        let state = self.shared.lock_state();
        let counts = self.shared.store.list_by_status_counts()?;
        Ok(QueueStatus {
            counts,
            current_job: state.active.as_ref().map(|a| a.id),
            is_processing: state.active.is_some(),
            is_paused: state.paused,
        })
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.shared.store.get(id)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<Job>> {
        self.shared.store.list_history(limit)
    }

    /// Delete `completed`/`cancelled` jobs that finished more than `older_than` ago.
    pub fn clear_finished(&self, older_than: chrono::Duration) -> Result<usize> {
        let removed = self.shared.store.delete_finished_before(Utc::now() - older_than)?;
        if removed > 0 {
            log::info!("Cleared {} finished jobs", removed);
        }
        Ok(removed)
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    /// Block until nothing is running and nothing runnable is queued.
    pub fn wait_idle(&self) {
        let mut state = self.shared.lock_state();
        while !self.shared.is_idle(&state) {
            state = match self.shared.wake.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// [`wait_idle`](Self::wait_idle) with a deadline. Returns whether the queue went idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();
        while !self.shared.is_idle(&state) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = match self.shared.wake.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Stop the worker after its current job and join it.
    pub fn shutdown(&self) {
        self.shared.lock_state().shutdown = true;
        self.shared.wake.notify_all();
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Scheduler worker panicked");
            }
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Jobs left `rendering`/`uploading` by a previous process can never finish.
fn recover_interrupted(store: &dyn JobStore) -> Result<()> {
    for status in [JobStatus::Rendering, JobStatus::Uploading] {
        for job in store.list_by_status(status)? {
            log::warn!("Job {} was {} when the last run stopped; marking failed", job.id, status);
            store.update_status(job.id, JobStatus::Failed, Some(INTERRUPTED.into()))?;
        }
    }
    Ok(())
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_idle(&self, state: &WorkerState) -> bool {
        if state.active.is_some() {
            return false;
        }
        if state.paused || state.shutdown {
            return true;
        }
        !matches!(self.store.scan_oldest_pending(), Ok(Some(_)))
    }

    fn run(&self) {
        log::debug!("Scheduler worker started");
        let mut state = self.lock_state();
        loop {
            if state.shutdown {
                break;
            }
            match self.claim_next(&mut state) {
                Some((job, cancel)) => {
                    drop(state);
                    self.process(job, &cancel);
                    state = self.lock_state();
                    state.active = None;
                    self.wake.notify_all();
                }
                None => {
                    self.wake.notify_all();
                    state = match self.wake.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
        log::debug!("Scheduler worker stopped");
    }

    /// Move the oldest pending job to `rendering` while holding the state lock.
    fn claim_next(&self, state: &mut WorkerState) -> Option<(Job, CancelToken)> {
        if state.paused || state.active.is_some() {
            return None;
        }
        let job = match self.store.scan_oldest_pending() {
            Ok(job) => job?,
            Err(err) => {
                log::error!("Failed to scan job queue: {}", err);
                return None;
            }
        };
        let job = match self.store.update_status(job.id, JobStatus::Rendering, None) {
            Ok(job) => job,
            Err(err) => {
                log::warn!("Could not start job {}: {}", job.id, err);
                return None;
            }
        };
        let cancel = CancelToken::new();
        state.active = Some(ActiveJob {
            id: job.id,
            cancel: cancel.clone(),
        });
        log::info!("Job {} started", job.id);
        self.events.publish(JobEvent::Started { id: job.id });
        Some((job, cancel))
    }

    /// The record may be cancelled by another handle on the same store file.
    /// Mirror that onto the token so every later check sees it.
    fn cancelled_elsewhere(&self, id: JobId, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        match self.store.get(id) {
            Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                log::info!("Job {} was cancelled by another process", id);
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn process(&self, job: Job, cancel: &CancelToken) {
        let id = job.id;
        let (kind, err) = match self.execute(&job, cancel) {
            Ok(output_path) => {
                log::info!("Job {} completed: {}", id, output_path.display());
                self.events.publish(JobEvent::Completed { id, output_path });
                return;
            }
            Err(failure) => failure,
        };

        if cancel.is_cancelled() || matches!(err, Error::Cancelled) {
            log::info!("Job {} stopped after cancellation", id);
            return;
        }

        let message = err.to_string();
        log::error!("Job {} failed ({}): {}", id, kind, message);
        match self.store.update_status(id, JobStatus::Failed, Some(message.clone())) {
            Ok(_) => self.events.publish(JobEvent::Failed {
                id,
                error: message,
                kind,
            }),
            Err(store_err) => log::warn!("Could not mark job {} failed: {}", id, store_err),
        }
    }

    fn execute(
        &self,
        job: &Job,
        cancel: &CancelToken,
    ) -> std::result::Result<PathBuf, (FailureKind, Error)> {
        let video = self
            .render(job, cancel)
            .map_err(|e| (FailureKind::Render, e))?;

        match job.publish {
            None => {
                self.store
                    .update_status(job.id, JobStatus::Completed, None)
                    .map_err(|e| (FailureKind::Render, e))?;
            }
            Some(_) => self
                .upload(job, &video, cancel)
                .map_err(|e| (FailureKind::Publish, e))?,
        }
        Ok(video)
    }

    /// Decode, export frames, encode. Leaves the job in `rendering` with its output path set.
    fn render(&self, job: &Job, cancel: &CancelToken) -> Result<PathBuf> {
        let id = job.id;
        let audio = self.services.decoder.decode(&job.audio_path)?;
        log::info!(
            "Job {}: decoded {:.1}s of audio at {} Hz",
            id,
            audio.duration_seconds(),
            audio.sample_rate
        );

        let text = if job.visual.layers.has_text() {
            TextOverlay::resolve(&self.settings.font)
                .map_err(|e| Error::invalid(format!("font unavailable: {e:#}")))?
        } else {
            None
        };
        let mut session = RenderSession::new(
            audio,
            job.visual.geometry(),
            FrameSynthesizer::new(text),
            self.settings.temp_root.as_deref(),
        )?;
        if let Some(batch) = self.settings.scheduler.batch_size {
            session = session.with_batch_size(batch);
        }

        let weight = if job.wants_publish() {
            self.settings.scheduler.render_weight
        } else {
            100
        };
        let mut reported = 0u8;
        let frames = session.export_frames(&job.visual.layers, cancel, |p| {
            let progress = weighted_progress(p.percent, weight);
            if progress <= reported || cancel.is_cancelled() {
                return;
            }
            reported = progress;
            if let Err(err) = self.store.update_progress(id, progress) {
                log::warn!("Job {}: failed to record progress: {}", id, err);
            }
            if self.cancelled_elsewhere(id, cancel) {
                return;
            }
            self.events.publish(JobEvent::Progress { id, percent: progress });
        })?;

        if self.cancelled_elsewhere(id, cancel) {
            session.cleanup()?;
            return Err(Error::Cancelled);
        }

        let options = self.services.encoder.negotiate(&self.settings.output);
        let output_path = output_file(&self.settings.output.dir, id);
        let encoded = self
            .services
            .encoder
            .encode(&frames, &job.audio_path, &output_path, &options);
        if let Err(err) = session.cleanup() {
            log::warn!("Job {}: failed to remove work dir: {}", id, err);
        }
        let video = encoded?;

        if let Err(err) = self.store.set_output_path(id, &video) {
            discard_video(id, &video);
            return Err(if self.cancelled_elsewhere(id, cancel) {
                Error::Cancelled
            } else {
                err
            });
        }
        Ok(video)
    }

    fn upload(&self, job: &Job, video: &Path, cancel: &CancelToken) -> Result<()> {
        let Some(ref request) = job.publish else {
            return Ok(());
        };
        self.store.update_status(job.id, JobStatus::Uploading, None)?;

        log::info!("Job {}: publishing {} to {}", job.id, video.display(), request.account_id);
        let receipt = publish_with_retry(
            self.services.publisher.as_ref(),
            &self.retry,
            video,
            &request.metadata,
            &request.account_id,
            &|| self.cancelled_elsewhere(job.id, cancel),
        )?;
        if let Err(err) = self.store.set_remote(job.id, &receipt) {
            if self.cancelled_elsewhere(job.id, cancel) {
                log::warn!(
                    "Job {} was cancelled while {} went live; remote copy left in place",
                    job.id,
                    receipt.url
                );
                return Err(Error::Cancelled);
            }
            return Err(err);
        }
        self.store.update_status(job.id, JobStatus::Completed, None)?;
        log::info!("Job {}: published as {}", job.id, receipt.url);
        Ok(())
    }
}

fn discard_video(id: JobId, video: &Path) {
    match std::fs::remove_file(video) {
        Ok(()) => log::info!("Job {}: removed unclaimed video {}", id, video.display()),
        Err(err) => log::warn!("Job {}: failed to remove {}: {}", id, video.display(), err),
    }
}

fn output_file(dir: &Path, id: JobId) -> PathBuf {
    dir.join(format!("video_{}_{}.mp4", id, Utc::now().timestamp_millis()))
}
