//! Admission control for group processing
//!
//! "Main" tasks run one at a time in arrival order; out-of-band tasks start
//! right away. A main task may schedule further main tasks: they queue behind
//! it and start when it finishes.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    tracker: TaskTracker,
    main: Mutex<MainQueue>,
    /// Scheduled tasks that have not finished yet, queued ones included
    outstanding: watch::Sender<usize>,
}

#[derive(Default)]
struct MainQueue {
    running: bool,
    waiting: VecDeque<BoxFuture<'static, ()>>,
}

/// Held by the running main task; hands the slot to the next queued task when dropped
struct MainSlot {
    inner: Arc<Inner>,
}

impl Drop for MainSlot {
    fn drop(&mut self) {
        let next = {
            let mut queue = self.inner.main.lock().unwrap_or_else(|p| p.into_inner());
            let next = queue.waiting.pop_front();
            queue.running = next.is_some();
            next
        };

        if let Some(next) = next {
            match Handle::try_current() {
                Ok(handle) => Inner::start_main(&self.inner, next, &handle),
                Err(_) => {
                    let mut queue = self.inner.main.lock().unwrap_or_else(|p| p.into_inner());
                    let dropped = queue.waiting.len() + 1;
                    queue.waiting.clear();
                    queue.running = false;
                    drop(queue);

                    tracing::debug!("Runtime gone, dropping {} queued main tasks", dropped);
                    drop(next);
                    for _ in 0..dropped {
                        self.inner.finished();
                    }
                }
            }
        }
    }
}

/// Marks a task as finished once its future is done or dropped
struct Outstanding {
    inner: Arc<Inner>,
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.inner.finished();
    }
}

impl Inner {
    fn finished(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn start_main(inner: &Arc<Inner>, task: BoxFuture<'static, ()>, handle: &Handle) {
        let slot = MainSlot {
            inner: inner.clone(),
        };
        let outstanding = Outstanding {
            inner: inner.clone(),
        };
        inner.tracker.spawn_on(
            async move {
                let _outstanding = outstanding;
                let _slot = slot;
                task.await;
            },
            handle,
        );
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                tracker: TaskTracker::new(),
                main: Mutex::new(MainQueue::default()),
                outstanding,
            }),
        }
    }

    /// Run `task` now if `out_of_band`, otherwise after every main task scheduled before it
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F>(&self, task: F, out_of_band: bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.outstanding.send_modify(|n| *n += 1);

        if out_of_band {
            let outstanding = Outstanding {
                inner: self.inner.clone(),
            };
            self.inner.tracker.spawn(async move {
                let _outstanding = outstanding;
                task.await;
            });
            return;
        }

        let task: BoxFuture<'static, ()> = Box::pin(task);
        let start_now = {
            let mut queue = self.inner.main.lock().unwrap_or_else(|p| p.into_inner());
            if queue.running {
                queue.waiting.push_back(task);
                tracing::debug!("Main task queued ({} waiting)", queue.waiting.len());
                None
            } else {
                queue.running = true;
                Some(task)
            }
        };

        if let Some(task) = start_now {
            Inner::start_main(&self.inner, task, &Handle::current());
        }
    }

    /// Number of scheduled tasks that have not finished
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    /// Wait until every scheduled task, queued ones included, has finished
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        // the sender lives in `inner`, so this only fails if it is dropped under us
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop tracking new work and wait for every task to settle
    pub async fn shutdown(&self) {
        self.wait_idle().await;
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}
