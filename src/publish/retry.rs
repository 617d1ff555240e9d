use std::path::Path;
use std::time::{Duration, Instant};

use super::{PublishMetadata, PublishReceipt, Publisher};
use crate::{Error, Result};

const BACKOFF_POLL: Duration = Duration::from_millis(25);

/// Exponential backoff for retryable publish failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Publish, retrying `Retryable` failures until the policy's attempts run out.
/// `Terminal` failures return at once.
///
/// `cancelled` is polled before every attempt and while backing off; once it
/// reports true no further attempt is made and `Error::Cancelled` is returned.
pub fn publish_with_retry(
    publisher: &dyn Publisher,
    policy: &RetryPolicy,
    video_path: &Path,
    metadata: &PublishMetadata,
    account_id: &str,
    cancelled: &dyn Fn() -> bool,
) -> Result<PublishReceipt> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancelled() {
            log::info!("Publish to {} abandoned before attempt {}", account_id, attempt);
            return Err(Error::Cancelled);
        }
        match publisher.publish(video_path, metadata, account_id) {
            Ok(receipt) => return Ok(receipt),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay = policy.delay_after(attempt);
                log::warn!(
                    "Publish attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    attempts,
                    err,
                    delay
                );
                backoff(delay, cancelled);
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Sleep for `delay`, waking early once `cancelled` reports true.
fn backoff(delay: Duration, cancelled: &dyn Fn() -> bool) {
    let deadline = Instant::now() + delay;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || cancelled() {
            return;
        }
        std::thread::sleep(remaining.min(BACKOFF_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::PublishError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    type Outcome = std::result::Result<PublishReceipt, PublishError>;

    struct Scripted {
        results: Mutex<Vec<Outcome>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(mut results: Vec<Outcome>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl Publisher for Scripted {
        fn publish(&self, _: &Path, _: &PublishMetadata, _: &str) -> Outcome {
            *self.calls.lock().unwrap() += 1;
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(PublishError::Retryable("exhausted".into())))
        }
    }

    fn receipt() -> PublishReceipt {
        PublishReceipt {
            remote_id: "abc".into(),
            url: "https://example.com/abc".into(),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_attempts: 3,
        }
    }

    fn publish(p: &Scripted) -> Result<PublishReceipt> {
        publish_until(p, &fast(), &|| false)
    }

    fn publish_until(
        p: &Scripted,
        policy: &RetryPolicy,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<PublishReceipt> {
        let meta = PublishMetadata::for_audio(Path::new("beat.wav"));
        publish_with_retry(p, policy, Path::new("v.mp4"), &meta, "acct", cancelled)
    }

    #[test]
    fn delay_doubles_each_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn retryable_errors_are_retried_until_success() {
        let p = Scripted::new(vec![
            Err(PublishError::Retryable("timeout".into())),
            Err(PublishError::Retryable("429".into())),
            Ok(receipt()),
        ]);
        assert_eq!(publish(&p).unwrap(), receipt());
        assert_eq!(p.calls(), 3);
    }

    #[test]
    fn gives_up_after_three_attempts() {
        let p = Scripted::new(vec![]);
        match publish(&p).unwrap_err() {
            Error::Publish(err) => assert!(err.is_retryable()),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(p.calls(), 3);
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        let p = Scripted::new(vec![Err(PublishError::Terminal("bad credentials".into()))]);
        assert!(matches!(
            publish(&p).unwrap_err(),
            Error::Publish(PublishError::Terminal(ref msg)) if msg == "bad credentials"
        ));
        assert_eq!(p.calls(), 1);
    }

    #[test]
    fn cancel_during_backoff_stops_further_attempts() {
        let p = Scripted::new(vec![]);
        let stop = AtomicBool::new(false);
        let slow = RetryPolicy {
            base_delay: Duration::from_millis(200),
            max_attempts: 3,
        };
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                stop.store(true, Ordering::SeqCst);
            });
            let err = publish_until(&p, &slow, &|| stop.load(Ordering::SeqCst)).unwrap_err();
            assert!(matches!(err, Error::Cancelled));
        });
        assert_eq!(p.calls(), 1);
    }

    #[test]
    fn nothing_is_published_when_already_cancelled() {
        let p = Scripted::new(vec![Ok(receipt())]);
        assert!(matches!(
            publish_until(&p, &fast(), &|| true),
            Err(Error::Cancelled)
        ));
        assert_eq!(p.calls(), 0);
    }
}
