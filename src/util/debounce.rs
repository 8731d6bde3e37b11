//! Debounced execution of a single async operation.
//!
//! Update requests arrive in bursts: one watcher event per saved file, often
//! several within milliseconds. [`Debounced`] coalesces calls made inside
//! the debounce window into one run, and while a run is in flight it queues
//! exactly one follow-up that starts after the current run settles. At most
//! one run executes at a time.
//!
//! Awaiters get the settled result of the latest scheduled run through
//! [`Debounced::result`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::util::BoxFuture;

type Operation<T> = Arc<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>;

struct Published<T> {
    /// Number of runs that have settled.
    completed: u64,
    value: Option<T>,
}

struct State {
    scheduled: bool,
    running: bool,
    follow_up: bool,
    /// Number of runs that will have settled once all scheduled work drains.
    planned: u64,
}

/// Debounce-async combinator: coalescing, serialized, with one queued
/// follow-up.
pub struct Debounced<T: Clone + Send + Sync + 'static> {
    op: Operation<T>,
    window: Duration,
    state: Arc<Mutex<State>>,
    published: Arc<watch::Sender<Published<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Debounced<T> {
    pub fn new(window: Duration, op: Operation<T>) -> Self {
        let (tx, _rx) = watch::channel(Published {
            completed: 0,
            value: None,
        });
        Self {
            op,
            window,
            state: Arc::new(Mutex::new(State {
                scheduled: false,
                running: false,
                follow_up: false,
                planned: 0,
            })),
            published: Arc::new(tx),
        }
    }

    /// Request a run. Calls within the window coalesce; calls during a run
    /// queue exactly one follow-up.
    ///
    /// Must be called within a tokio runtime.
    pub fn schedule(&self) {
        let mut state = self.state.lock();
        if state.running {
            if !state.follow_up {
                state.follow_up = true;
                state.planned += 1;
            }
            return;
        }
        if state.scheduled {
            return;
        }
        state.scheduled = true;
        state.planned += 1;
        drop(state);

        let op = self.op.clone();
        let window = self.window;
        let state = self.state.clone();
        let published = self.published.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                {
                    let mut state = state.lock();
                    state.scheduled = false;
                    state.running = true;
                }
                let value = (&*op)().await;
                let again = {
                    let mut state = state.lock();
                    state.running = false;
                    let again = state.follow_up;
                    state.follow_up = false;
                    if again {
                        state.scheduled = true;
                    }
                    again
                };
                published.send_modify(|p| {
                    p.completed += 1;
                    p.value = Some(value);
                });
                if !again {
                    break;
                }
            }
        });
    }

    /// Await the settled result of the latest scheduled run.
    ///
    /// Returns `None` if no run has ever been scheduled.
    pub async fn result(&self) -> Option<T> {
        let target = self.state.lock().planned;
        let mut rx = self.published.subscribe();
        let published = rx.wait_for(|p| p.completed >= target).await.ok()?;
        published.value.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
