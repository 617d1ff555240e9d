//! Job lifecycle notifications.
//!
//! Every subscriber gets its own unbounded channel, so a slow consumer never
//! stalls the worker. Subscribers that drop their receiver are pruned on the
//! next publish.

use crossbeam::channel::{self, Receiver, Sender};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use super::model::JobId;

/// Which phase a failed job died in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Decode, analysis, synthesis, frame write or encode.
    Render,
    Publish,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Render => f.write_str("render failure"),
            FailureKind::Publish => f.write_str("publish failure"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Added { id: JobId },
    Started { id: JobId },
    Progress { id: JobId, percent: u8 },
    Completed { id: JobId, output_path: PathBuf },
    Failed { id: JobId, error: String, kind: FailureKind },
    Cancelled { id: JobId },
    Retried { id: JobId },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match *self {
            JobEvent::Added { id }
            | JobEvent::Started { id }
            | JobEvent::Progress { id, .. }
            | JobEvent::Completed { id, .. }
            | JobEvent::Failed { id, .. }
            | JobEvent::Cancelled { id }
            | JobEvent::Retried { id } => id,
        }
    }
}

/// Fan-out of [`JobEvent`]s to any number of independent subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<JobEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = channel::unbounded();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn publish(&self, event: JobEvent) {
        log::debug!("Job event: {:?}", event);
        let mut subs = match self.subscribers.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(JobEvent::Added { id: 1 });
        bus.publish(JobEvent::Started { id: 1 });

        for rx in [&a, &b] {
            let got: Vec<JobEvent> = rx.try_iter().collect();
            assert_eq!(got, vec![JobEvent::Added { id: 1 }, JobEvent::Started { id: 1 }]);
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(JobEvent::Cancelled { id: 4 });
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
        assert_eq!(keep.try_recv().unwrap().job_id(), 4);
    }

    #[test]
    fn failure_kinds_read_naturally() {
        assert_eq!(FailureKind::Render.to_string(), "render failure");
        assert_eq!(FailureKind::Publish.to_string(), "publish failure");
    }
}
