//! Debounced writes to [`Storage`].
//!
//! Each `schedule` call aborts the previously scheduled write and starts a
//! new delay. Only the last snapshot of a burst reaches the backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::storage::Storage;

/// State that knows how to lay itself out as storage entries.
pub trait Snapshot: Send + Sync + 'static {
    fn entries(&self) -> anyhow::Result<Vec<(String, String)>>;
}

struct Pending<T> {
    snapshot: Arc<T>,
    handle: JoinHandle<()>,
}

pub struct Debouncer<T: Snapshot> {
    storage: Arc<Storage>,
    delay: Duration,
    pending: Option<Pending<T>>,
}

impl<T: Snapshot> std::fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("namespace", &self.storage.namespace())
            .field("delay", &self.delay)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl<T: Snapshot> Debouncer<T> {
    pub fn new(storage: Arc<Storage>, delay: Duration) -> Self {
        Self {
            storage,
            delay,
            pending: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| !pending.handle.is_finished())
    }

    /// Replaces any scheduled write with one for `snapshot`.
    ///
    /// Outside a tokio runtime there is no timer to wait on, so the write
    /// happens immediately.
    pub fn schedule(&mut self, snapshot: T) {
        self.cancel();
        let snapshot = Arc::new(snapshot);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(namespace = %self.storage.namespace(), "no async runtime; persisting without debounce");
            write_snapshot(&self.storage, snapshot.as_ref());
            return;
        };

        let storage = Arc::clone(&self.storage);
        let task_snapshot = Arc::clone(&snapshot);
        let delay = self.delay;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let written = tokio::task::spawn_blocking(move || {
                write_snapshot(&storage, task_snapshot.as_ref());
            })
            .await;
            if let Err(err) = written {
                error!(error = %err, "snapshot write task failed");
            }
        });

        trace!(namespace = %self.storage.namespace(), ?delay, "scheduled write");
        self.pending = Some(Pending { snapshot, handle });
    }

    /// Drops the scheduled write, if any.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
        }
    }

    /// Writes the scheduled snapshot now instead of after the delay.
    pub fn flush(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if pending.handle.is_finished() {
            return;
        }
        pending.handle.abort();
        debug!(namespace = %self.storage.namespace(), "flushing scheduled write");
        write_snapshot(&self.storage, pending.snapshot.as_ref());
    }
}

fn write_snapshot<T: Snapshot>(storage: &Storage, snapshot: &T) {
    let entries = match snapshot.entries() {
        Ok(entries) => entries,
        Err(err) => {
            error!(namespace = %storage.namespace(), error = %format!("{err:#}"), "failed to serialize snapshot");
            return;
        }
    };

    for (key, value) in entries {
        if let Err(err) = storage.set(&key, value) {
            error!(namespace = %storage.namespace(), key = %key, error = %format!("{err:#}"), "failed to persist");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Debouncer, Snapshot};
    use crate::storage::{MemoryBackend, Storage};

    struct Counter(u32);

    impl Snapshot for Counter {
        fn entries(&self) -> anyhow::Result<Vec<(String, String)>> {
            Ok(vec![("count".to_string(), self.0.to_string())])
        }
    }

    /// Lets the timer fire, then waits for the blocking write to finish.
    async fn settle(debouncer: &Debouncer<Counter>) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        while debouncer.is_pending() {
            tokio::task::yield_now().await;
        }
    }

    fn setup() -> (Arc<MemoryBackend>, Debouncer<Counter>) {
        let backend = Arc::new(MemoryBackend::new());
        let storage = Arc::new(Storage::open("test", backend.clone()));
        (backend, Debouncer::new(storage, Duration::from_millis(120)))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_last_snapshot() {
        let (backend, mut debouncer) = setup();
        for n in 1..=5 {
            debouncer.schedule(Counter(n));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.writes(), 0);

        settle(&debouncer).await;
        assert_eq!(backend.writes(), 1);
        assert_eq!(backend.value("test", "count").as_deref(), Some("5"));
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_immediately_and_only_once() {
        let (backend, mut debouncer) = setup();
        debouncer.schedule(Counter(9));
        debouncer.flush();
        assert_eq!(backend.writes(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_the_write() {
        let (backend, mut debouncer) = setup();
        debouncer.schedule(Counter(1));
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.writes(), 0);
    }

    #[test]
    fn writes_inline_without_a_runtime() {
        let (backend, mut debouncer) = setup();
        debouncer.schedule(Counter(3));
        assert_eq!(backend.writes(), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn write_failures_are_swallowed() {
        let (backend, mut debouncer) = setup();
        backend.set_fail_writes(true);
        debouncer.schedule(Counter(4));
        settle(&debouncer).await;
        assert!(!debouncer.is_pending());
        assert_eq!(backend.writes(), 0);
        assert_eq!(backend.value("test", "count"), None);
    }
}
