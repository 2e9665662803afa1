//! Leading + trailing edge throttle on the tokio clock.
//!
//! `call` records its argument as pending. When the interval since the last
//! invocation has elapsed the callback runs right away with the newest
//! pending argument; otherwise a single trailing timer is armed that delivers
//! whatever argument is pending when it fires. Calls in between overwrite the
//! pending argument (last wins).

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Callback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct State<T> {
    last: Option<Instant>,
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    interval: Duration,
    callback: Callback<T>,
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // The state holds no invariants a panicking holder could break.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rate limiter for a callback taking `T`.
///
/// Must be used from within a tokio runtime. Dropping the throttle cancels a
/// pending trailing call; invocations already started run to completion.
pub struct Throttle<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Throttle<T> {
    pub fn new<F, Fut>(interval: Duration, callback: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback<T> = Arc::new(move |args| Box::pin(callback(args)));
        Self {
            inner: Arc::new(Inner {
                interval,
                callback,
                state: Mutex::new(State {
                    last: None,
                    pending: None,
                    timer: None,
                }),
            }),
        }
    }

    pub fn call(&self, args: T) {
        let now = Instant::now();
        let mut state = self.inner.lock();
        state.pending = Some(args);

        let remaining = match state.last {
            Some(last) => self.inner.interval.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        };

        if remaining.is_zero() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.last = Some(now);
            let pending = state.pending.take();
            drop(state);

            if let Some(args) = pending {
                tokio::spawn((self.inner.callback)(args));
            }
            return;
        }

        if state.timer.is_none() {
            let inner = Arc::clone(&self.inner);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(remaining).await;

                let pending = {
                    let mut state = inner.lock();
                    state.timer = None;
                    state.last = Some(Instant::now());
                    state.pending.take()
                };

                // Detached so cancelling the timer never interrupts a running callback.
                if let Some(args) = pending {
                    tokio::spawn((inner.callback)(args));
                }
            }));
        }
    }

    /// Drop the pending argument and abort the trailing timer.
    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        state.pending = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Whether a trailing invocation is scheduled.
    pub fn has_pending(&self) -> bool {
        self.inner.lock().timer.is_some()
    }
}

impl<T: Send + 'static> Drop for Throttle<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
