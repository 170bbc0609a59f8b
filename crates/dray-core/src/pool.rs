//! Fixed-capacity execution pool.
//!
//! `post` never queues: it either occupies an idle slot or fails with
//! [`PoolSaturated`]. Backpressure is the poller's business, which only
//! claims as many jobs as there are idle slots.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::FutureExt as _;
use tokio::sync::Notify;
use tokio_util::task::TaskTracker;

use crate::error::{Error, PoolClosed, PoolSaturated};

/// Callback run every time a slot becomes idle.
pub type OnIdle = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Clone)]
pub struct ExecutionPool {
    inner: Arc<Inner>,
}

struct Inner {
    size: usize,
    busy: AtomicUsize,
    // Serializes the closed check, the slot reservation and the spawn.
    closed: Mutex<bool>,
    tracker: TaskTracker,
    released: Notify,
    on_idle: Option<OnIdle>,
}

impl std::fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("size", &self.inner.size)
            .field("busy", &self.inner.busy.load(Ordering::SeqCst))
            .finish()
    }
}

impl ExecutionPool {
    pub fn new(size: usize) -> Self {
        Self::build(size, None)
    }

    /// Pool that calls `on_idle` whenever a unit finishes.
    pub fn with_on_idle(size: usize, on_idle: OnIdle) -> Self {
        Self::build(size, Some(on_idle))
    }

    fn build(size: usize, on_idle: Option<OnIdle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                size,
                busy: AtomicUsize::new(0),
                closed: Mutex::new(false),
                tracker: TaskTracker::new(),
                released: Notify::new(),
                on_idle,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of slots free right now.
    pub fn idle(&self) -> usize {
        self.inner
            .size
            .saturating_sub(self.inner.busy.load(Ordering::SeqCst))
    }

    /// Run `unit` on an idle slot.
    pub fn post<Fut>(&self, unit: Fut) -> Result<(), Error>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let closed = self
            .inner
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *closed {
            return Err(PoolClosed.into());
        }
        self.reserve()?;

        let slot = Slot {
            inner: self.inner.clone(),
        };
        self.inner.tracker.spawn(async move {
            let _slot = slot;
            if let Err(panic) = AssertUnwindSafe(unit).catch_unwind().await {
                tracing::error!(panic = %panic_message(panic.as_ref()), "job panic happened");
            }
        });
        drop(closed);
        Ok(())
    }

    fn reserve(&self) -> Result<(), PoolSaturated> {
        let size = self.inner.size;
        let mut busy = self.inner.busy.load(Ordering::SeqCst);
        loop {
            if busy >= size {
                return Err(PoolSaturated { size });
            }
            match self.inner.busy.compare_exchange(
                busy,
                busy + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => busy = actual,
            }
        }
    }

    /// Stop accepting units and wait for the running ones to finish.
    pub async fn shutdown(&self) {
        {
            let mut closed = self
                .inner
                .closed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *closed = true;
            self.inner.tracker.close();
        }
        self.wait().await;
    }

    /// Wait until the pool has been shut down and drained.
    pub async fn wait(&self) {
        self.inner.tracker.wait().await;
    }

    /// Wait until no slot is busy, without closing the pool.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.inner.busy.load(Ordering::SeqCst) == 0 {
                return;
            }
            released.await;
        }
    }
}

struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.inner.busy.fetch_sub(1, Ordering::SeqCst);
        self.inner.released.notify_waiters();
        if let Some(on_idle) = &self.inner.on_idle {
            on_idle();
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn rejects_posts_beyond_capacity() {
        let pool = ExecutionPool::new(1);
        let (release, wait) = oneshot::channel::<()>();

        pool.post(async move {
            let _ = wait.await;
        })
        .unwrap();
        assert_eq!(pool.idle(), 0);

        let error = pool.post(async {}).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Saturated);

        release.send(()).unwrap();
        pool.wait_idle().await;
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn panicking_unit_releases_its_slot() {
        let pool = ExecutionPool::new(1);

        pool.post(async { panic!("boom") }).unwrap();
        pool.wait_idle().await;

        assert_eq!(pool.idle(), 1);
        pool.post(async {}).unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_and_closes() {
        let pool = ExecutionPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let done = done.clone();
            pool.post(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown().await;

        assert_eq!(done.load(Ordering::SeqCst), 2);
        let error = pool.post(async {}).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn on_idle_runs_after_each_unit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pool = ExecutionPool::with_on_idle(
            2,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        pool.post(async {}).unwrap();
        pool.post(async {}).unwrap();
        pool.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
