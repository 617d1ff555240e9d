use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use super::model::{Job, JobId, JobStatus};
use crate::publish::PublishReceipt;
use crate::{Error, Result};

/// Durable keyed job records.
///
/// Implementations validate status changes with
/// [`JobStatus::can_transition_to`] atomically, so concurrent callers racing
/// on one job see exactly one winner.
pub trait JobStore: Send + Sync {
    /// Persist a new record and return its assigned id.
    fn insert(&self, job: Job) -> Result<JobId>;

    fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Apply a legal transition and return the updated record.
    ///
    /// Entering `failed` stores `error_message`; any other state clears it.
    /// Entering a finished state stamps `completed_at`. Going back to
    /// `pending` resets progress and the previous attempt's outputs.
    fn update_status(&self, id: JobId, status: JobStatus, error_message: Option<String>) -> Result<Job>;

    /// Raise progress while the job is active. Lower values and inactive jobs are ignored.
    fn update_progress(&self, id: JobId, percent: u8) -> Result<()>;

    fn set_output_path(&self, id: JobId, path: &Path) -> Result<()>;

    fn set_remote(&self, id: JobId, receipt: &PublishReceipt) -> Result<()>;

    fn list_by_status_counts(&self) -> Result<BTreeMap<JobStatus, usize>>;

    /// Oldest `pending` job by `created_at`, ties broken by insertion order.
    fn scan_oldest_pending(&self) -> Result<Option<Job>>;

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Newest first.
    fn list_history(&self, limit: usize) -> Result<Vec<Job>>;

    /// Drop `completed`/`cancelled` records finished before `cutoff`.
    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
}

impl StoreState {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(Error::NotFound(id))
    }
}

const LOCK_POLL: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// A lock file older than this was left by a process that died mid-write.
const LOCK_STALE: Duration = Duration::from_secs(30);

/// Cross-process write lock: a sibling `.lock` file created exclusively and
/// removed on drop.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        log::warn!("Removing stale job store lock {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::store(format!(
                            "timed out waiting for lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to release lock {}: {}", self.path.display(), err);
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age > LOCK_STALE)
}

/// JSON-file job store.
///
/// Several processes may share one file: every call reloads it first, and
/// every mutation holds a sibling lock file while it rewrites the JSON via a
/// temp file and rename.
#[derive(Debug)]
pub struct FileJobStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl FileJobStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match load(&path)? {
            Some(state) => state,
            None => {
                if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)?;
                }
                StoreState::default()
            }
        };
        log::debug!("Opened job store {} ({} jobs)", path.display(), state.jobs.len());
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| Error::store("job store lock has been poisoned"))
    }

    fn refresh(&self, state: &mut StoreState) -> Result<()> {
        if let Some(fresh) = self.path.as_deref().map(load).transpose()?.flatten() {
            *state = fresh;
        }
        Ok(())
    }

    /// Lock the in-process state, refreshed from disk.
    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        let mut state = self.guard()?;
        self.refresh(&mut state)?;
        Ok(state)
    }

    /// Run `f` against the latest state under the file lock and persist the result.
    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.guard()?;
        let _file_lock = match self.path {
            Some(ref path) => Some(FileLock::acquire(path.with_extension("json.lock"))?),
            None => None,
        };
        self.refresh(&mut state)?;
        let out = f(&mut state)?;
        self.persist(&state)?;
        Ok(out)
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::store(format!("failed to serialize jobs: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn load(path: &Path) -> Result<Option<StoreState>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| Error::store(format!("corrupt job store {}: {e}", path.display())))
}

/// Outputs may only be attached while the worker still owns the job.
fn ensure_active(job: &Job) -> Result<()> {
    if job.status.is_active() {
        Ok(())
    } else {
        Err(Error::NotActive {
            id: job.id,
            status: job.status,
        })
    }
}

impl JobStore for FileJobStore {
    fn insert(&self, mut job: Job) -> Result<JobId> {
        self.write(|state| {
            state.next_id += 1;
            job.id = state.next_id;
            let id = job.id;
            state.jobs.insert(id, job);
            Ok(id)
        })
    }

    fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    fn update_status(&self, id: JobId, status: JobStatus, error_message: Option<String>) -> Result<Job> {
        self.write(|state| {
            let job = state.job_mut(id)?;
            let from = job.status;
            if !from.can_transition_to(status) {
                return Err(Error::InvalidTransition { id, from, to: status });
            }
            job.status = status;
            job.error_message = match status {
                JobStatus::Failed => Some(error_message.unwrap_or_else(|| "unknown error".into())),
                _ => None,
            };
            match status {
                JobStatus::Pending => {
                    job.progress = 0;
                    job.completed_at = None;
                    job.output_path = None;
                    job.remote_id = None;
                    job.remote_url = None;
                }
                JobStatus::Completed => {
                    job.progress = 100;
                    job.completed_at = Some(Utc::now());
                }
                s if s.is_finished() => job.completed_at = Some(Utc::now()),
                _ => {}
            }
            Ok(job.clone())
        })
    }

    fn update_progress(&self, id: JobId, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        {
            let state = self.lock()?;
            let job = state.jobs.get(&id).ok_or(Error::NotFound(id))?;
            if !job.status.is_active() || percent <= job.progress {
                return Ok(());
            }
        }
        self.write(|state| {
            let job = state.job_mut(id)?;
            if job.status.is_active() && percent > job.progress {
                job.progress = percent;
            }
            Ok(())
        })
    }

    fn set_output_path(&self, id: JobId, path: &Path) -> Result<()> {
        self.write(|state| {
            let job = state.job_mut(id)?;
            ensure_active(job)?;
            job.output_path = Some(path.to_path_buf());
            Ok(())
        })
    }

    fn set_remote(&self, id: JobId, receipt: &PublishReceipt) -> Result<()> {
        self.write(|state| {
            let job = state.job_mut(id)?;
            ensure_active(job)?;
            job.remote_id = Some(receipt.remote_id.clone());
            job.remote_url = Some(receipt.url.clone());
            Ok(())
        })
    }

    fn list_by_status_counts(&self) -> Result<BTreeMap<JobStatus, usize>> {
        let state = self.lock()?;
        let mut counts: BTreeMap<JobStatus, usize> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for job in state.jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts)
    }

    fn scan_oldest_pending(&self) -> Result<Option<Job>> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    fn list_history(&self, limit: usize) -> Result<Vec<Job>> {
        let state = self.lock()?;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.write(|state| {
            let before = state.jobs.len();
            state.jobs.retain(|_, job| {
                let clearable = matches!(job.status, JobStatus::Completed | JobStatus::Cancelled);
                !(clearable && job.completed_at.is_some_and(|t| t < cutoff))
            });
            Ok(before - state.jobs.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobRequest, VisualConfig};

    fn job_at(created_at: DateTime<Utc>) -> Job {
        Job::new(
            JobRequest {
                audio_path: PathBuf::from("beat.wav"),
                visual: VisualConfig {
                    width: 64,
                    height: 36,
                    fps: 30,
                    layers: Default::default(),
                },
                publish: None,
            },
            created_at,
        )
    }

    #[test]
    fn oldest_pending_breaks_ties_by_insertion() {
        let store = FileJobStore::in_memory();
        let t0 = Utc::now();
        let late = store.insert(job_at(t0 + chrono::Duration::seconds(5))).unwrap();
        let first = store.insert(job_at(t0)).unwrap();
        let second = store.insert(job_at(t0)).unwrap();

        assert_eq!(store.scan_oldest_pending().unwrap().unwrap().id, first);
        store.update_status(first, JobStatus::Cancelled, None).unwrap();
        assert_eq!(store.scan_oldest_pending().unwrap().unwrap().id, second);
        store.update_status(second, JobStatus::Rendering, None).unwrap();
        assert_eq!(store.scan_oldest_pending().unwrap().unwrap().id, late);
    }

    #[test]
    fn illegal_transition_leaves_record_untouched() {
        let store = FileJobStore::in_memory();
        let id = store.insert(job_at(Utc::now())).unwrap();
        let err = store.update_status(id, JobStatus::Completed, None).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn retry_resets_progress_and_error_but_keeps_created_at() {
        let store = FileJobStore::in_memory();
        let created = Utc::now() - chrono::Duration::minutes(3);
        let id = store.insert(job_at(created)).unwrap();
        store.update_status(id, JobStatus::Rendering, None).unwrap();
        store.update_progress(id, 37).unwrap();
        let failed = store
            .update_status(id, JobStatus::Failed, Some("ffmpeg exploded".into()))
            .unwrap();
        assert_eq!(failed.progress, 37);
        assert!(failed.completed_at.is_some());

        let retried = store.update_status(id, JobStatus::Pending, None).unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.progress, 0);
        assert_eq!(retried.error_message, None);
        assert_eq!(retried.created_at, created);
        assert_eq!(retried.completed_at, None);
    }

    #[test]
    fn progress_is_monotonic_and_only_while_active() {
        let store = FileJobStore::in_memory();
        let id = store.insert(job_at(Utc::now())).unwrap();
        store.update_progress(id, 10).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().progress, 0);

        store.update_status(id, JobStatus::Rendering, None).unwrap();
        store.update_progress(id, 40).unwrap();
        store.update_progress(id, 20).unwrap();
        store.update_progress(id, 250).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().progress, 100);
    }

    #[test]
    fn counts_include_every_status() {
        let store = FileJobStore::in_memory();
        let a = store.insert(job_at(Utc::now())).unwrap();
        store.insert(job_at(Utc::now())).unwrap();
        store.update_status(a, JobStatus::Cancelled, None).unwrap();
        let counts = store.list_by_status_counts().unwrap();
        assert_eq!(counts.len(), 6);
        assert_eq!(counts[&JobStatus::Pending], 1);
        assert_eq!(counts[&JobStatus::Cancelled], 1);
        assert_eq!(counts[&JobStatus::Failed], 0);
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let store = FileJobStore::in_memory();
        let t0 = Utc::now();
        let ids: Vec<JobId> = (0..4)
            .map(|i| store.insert(job_at(t0 + chrono::Duration::seconds(i))).unwrap())
            .collect();
        let history = store.list_history(3).unwrap();
        let got: Vec<JobId> = history.iter().map(|j| j.id).collect();
        assert_eq!(got, vec![ids[3], ids[2], ids[1]]);
    }

    #[test]
    fn clears_only_old_finished_jobs() {
        let store = FileJobStore::in_memory();
        let done = store.insert(job_at(Utc::now())).unwrap();
        let failed = store.insert(job_at(Utc::now())).unwrap();
        store.insert(job_at(Utc::now())).unwrap();
        store.update_status(done, JobStatus::Cancelled, None).unwrap();
        store.update_status(failed, JobStatus::Rendering, None).unwrap();
        store.update_status(failed, JobStatus::Failed, Some("x".into())).unwrap();

        assert_eq!(store.delete_finished_before(Utc::now() - chrono::Duration::days(7)).unwrap(), 0);
        assert_eq!(store.delete_finished_before(Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);
        assert!(store.get(done).unwrap().is_none());
        assert!(store.get(failed).unwrap().is_some());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.json");
        let id = {
            let store = FileJobStore::open(&path).unwrap();
            let id = store.insert(job_at(Utc::now())).unwrap();
            store.update_status(id, JobStatus::Rendering, None).unwrap();
            store.update_progress(id, 55).unwrap();
            id
        };

        let reopened = FileJobStore::open(&path).unwrap();
        let job = reopened.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Rendering);
        assert_eq!(job.progress, 55);
        let next = reopened.insert(job_at(Utc::now())).unwrap();
        assert!(next > id);
    }

    #[test]
    fn outputs_attach_only_while_active() {
        let store = FileJobStore::in_memory();
        let id = store.insert(job_at(Utc::now())).unwrap();
        store.update_status(id, JobStatus::Rendering, None).unwrap();
        store.set_output_path(id, Path::new("/videos/a.mp4")).unwrap();

        store.update_status(id, JobStatus::Cancelled, None).unwrap();
        let receipt = PublishReceipt {
            remote_id: "r1".into(),
            url: "https://example.com/r1".into(),
        };
        assert!(matches!(
            store.set_remote(id, &receipt),
            Err(Error::NotActive { status: JobStatus::Cancelled, .. })
        ));
        assert!(matches!(
            store.set_output_path(id, Path::new("/videos/b.mp4")),
            Err(Error::NotActive { .. })
        ));
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.output_path.as_deref(), Some(Path::new("/videos/a.mp4")));
        assert_eq!(job.remote_url, None);
    }

    #[test]
    fn two_handles_on_one_file_see_each_others_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let runner = FileJobStore::open(&path).unwrap();
        let cli = FileJobStore::open(&path).unwrap();

        let first = runner.insert(job_at(Utc::now())).unwrap();
        let second = cli.insert(job_at(Utc::now())).unwrap();
        assert_ne!(first, second);

        runner.update_status(first, JobStatus::Rendering, None).unwrap();
        runner.update_progress(first, 30).unwrap();
        assert!(runner.get(second).unwrap().is_some());

        cli.update_status(first, JobStatus::Cancelled, None).unwrap();
        assert_eq!(runner.get(first).unwrap().unwrap().status, JobStatus::Cancelled);
        assert!(runner.update_status(first, JobStatus::Completed, None).is_err());

        let reopened = FileJobStore::open(&path).unwrap();
        assert_eq!(reopened.list_history(10).unwrap().len(), 2);
        assert!(!path.with_extension("json.lock").exists());
    }

    #[test]
    fn stale_lock_file_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = FileJobStore::open(&path).unwrap();
        let lock = path.with_extension("json.lock");
        std::fs::write(&lock, b"").unwrap();
        let old = SystemTime::now() - Duration::from_secs(120);
        std::fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(old)
            .unwrap();

        store.insert(job_at(Utc::now())).unwrap();
        assert!(!lock.exists());
    }

    #[test]
    fn corrupt_file_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(FileJobStore::open(&path), Err(Error::Store(_))));
    }
}
