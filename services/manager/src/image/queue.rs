//! Bounded-concurrency FIFO build queue with per-digest deduplication.
//!
//! The queue is the data structure only; the image manager owns the worker
//! tasks that drain it. Exactly one job per digest can exist across the
//! pending list and the active set; re-submissions attach to the existing
//! job and report its position. Positions are 1-based for pending jobs and
//! 0 for jobs a worker has picked up, and can only decrease over a job's
//! lifetime.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::oci::{Digest, Reference};

/// Where a build request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOrigin {
    /// Resolved from an upstream registry.
    Pull,
    /// Pushed into the embedded registry; all blobs are already local.
    Push,
}

/// One queued conversion.
#[derive(Debug, Clone)]
pub struct BuildJob {
    /// Image identity.
    pub digest: Digest,
    /// Reference used for upstream fetches and metadata naming.
    pub reference: Reference,
    /// Provenance of the job.
    pub origin: BuildOrigin,
    /// Final image directory.
    pub image_dir: PathBuf,
}

/// Outcome of a submit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A new job was enqueued at this 1-based position.
    Enqueued { position: u64 },
    /// A job for the digest was already pending at this position.
    Attached { position: u64 },
    /// A worker is already building this digest.
    Building,
}

impl Submission {
    /// Queue position for clients: 0 means "running now".
    pub fn position(&self) -> u64 {
        match self {
            Self::Enqueued { position } | Self::Attached { position } => *position,
            Self::Building => 0,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<BuildJob>,
    active: HashSet<Digest>,
}

/// Shared FIFO of pending conversions.
#[derive(Debug, Default)]
pub struct BuildQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl BuildQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits a job, deduplicating on digest.
    pub fn submit(&self, job: BuildJob) -> Submission {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.active.contains(&job.digest) {
            return Submission::Building;
        }
        if let Some(index) = inner.pending.iter().position(|j| j.digest == job.digest) {
            return Submission::Attached {
                position: index as u64 + 1,
            };
        }

        inner.pending.push_back(job);
        let position = inner.pending.len() as u64;
        drop(inner);
        self.notify.notify_waiters();
        Submission::Enqueued { position }
    }

    /// Current position of a digest: 0 while building, 1-based while
    /// pending, `None` when unknown to the queue.
    pub fn position(&self, digest: &Digest) -> Option<u64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.active.contains(digest) {
            return Some(0);
        }
        inner
            .pending
            .iter()
            .position(|j| &j.digest == digest)
            .map(|i| i as u64 + 1)
    }

    /// Number of pending plus active jobs.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.len() + inner.active.len()
    }

    /// True when nothing is pending or building.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next job and marks its digest active.
    ///
    /// Worker tasks call this in a loop; cancellation is handled by the
    /// caller racing this future against a shutdown signal.
    pub async fn next(&self) -> BuildJob {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(job) = inner.pending.pop_front() {
                    inner.active.insert(job.digest.clone());
                    return job;
                }
            }
            notified.await;
        }
    }

    /// Marks a digest no longer building. Remaining pending jobs shift
    /// forward, which is what makes positions monotonically non-increasing.
    pub fn complete(&self, digest: &Digest) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.active.remove(digest);
    }

    /// Drains all pending jobs (shutdown). Active digests are untouched.
    pub fn drain_pending(&self) -> Vec<BuildJob> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(n: u8) -> BuildJob {
        let hex = format!("{:064x}", n);
        BuildJob {
            digest: Digest::parse(&format!("sha256:{hex}")).unwrap(),
            reference: Reference::parse("testing/app:v1").unwrap(),
            origin: BuildOrigin::Pull,
            image_dir: PathBuf::from("/tmp/img"),
        }
    }

    #[test]
    fn positions_are_one_based_fifo() {
        let queue = BuildQueue::new();
        assert_eq!(queue.submit(job(1)), Submission::Enqueued { position: 1 });
        assert_eq!(queue.submit(job(2)), Submission::Enqueued { position: 2 });
        assert_eq!(queue.position(&job(1).digest), Some(1));
        assert_eq!(queue.position(&job(2).digest), Some(2));
    }

    #[test]
    fn duplicate_submissions_attach() {
        let queue = BuildQueue::new();
        queue.submit(job(1));
        queue.submit(job(2));
        assert_eq!(queue.submit(job(2)), Submission::Attached { position: 2 });
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn next_pops_fifo_and_marks_active() {
        let queue = BuildQueue::new();
        queue.submit(job(1));
        queue.submit(job(2));

        let first = queue.next().await;
        assert_eq!(first.digest, job(1).digest);
        // Picked-up job reports position 0; the one behind it moved up.
        assert_eq!(queue.position(&job(1).digest), Some(0));
        assert_eq!(queue.position(&job(2).digest), Some(1));

        assert_eq!(queue.submit(job(1)), Submission::Building);

        queue.complete(&first.digest);
        assert_eq!(queue.position(&job(1).digest), None);
    }

    #[tokio::test]
    async fn positions_never_increase() {
        let queue = BuildQueue::new();
        for n in 1..=4 {
            queue.submit(job(n));
        }

        let mut last = queue.position(&job(4).digest).unwrap();
        for _ in 0..3 {
            let picked = queue.next().await;
            queue.complete(&picked.digest);
            let now = queue.position(&job(4).digest).unwrap();
            assert!(now <= last, "position went up: {last} -> {now}");
            last = now;
        }
        assert_eq!(last, 1);
    }

    #[tokio::test]
    async fn next_wakes_on_submit() {
        use std::sync::Arc;

        let queue = Arc::new(BuildQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };

        // Give the waiter a chance to park before submitting.
        tokio::task::yield_now().await;
        queue.submit(job(7));

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.digest, job(7).digest);
    }

    #[test]
    fn drain_pending_empties_the_fifo() {
        let queue = BuildQueue::new();
        queue.submit(job(1));
        queue.submit(job(2));
        let drained = queue.drain_pending();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
