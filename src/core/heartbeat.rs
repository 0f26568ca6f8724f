//! Restartable keep-alive countdown.
//!
//! A [`HeartbeatTimer`] runs as its own task and moves through
//! `Created -> Started -> {Stopped | TimedOut}`. Nothing counts down until
//! [`HeartbeatTimer::start`] is called. Once started, every
//! [`HeartbeatTimer::heartbeat`] resets the countdown; if it ever reaches
//! zero the timeout callback runs exactly once.
//!
//! The three terminal paths (explicit stop, timeout, external cancellation)
//! are decided by a single compare-and-swap on the timer state, so at most
//! one of them wins and each callback runs at most once.
//!
//! The timer is not tied to item delivery; anything that needs a lease with
//! keep-alives can use it.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::core::error::HeartbeatError;

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;
const TIMED_OUT: u8 = 3;

/// Callback run when the timer reaches a terminal state.
pub type TimerCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Boxes an async closure into a [`TimerCallback`].
pub fn callback<F, Fut>(f: F) -> TimerCallback
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || -> BoxFuture<'static, ()> { Box::pin(f()) })
}

/// Observable state of a [`HeartbeatTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Created,
    Started,
    Stopped,
    TimedOut,
}

impl TimerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            CREATED => TimerState::Created,
            STARTED => TimerState::Started,
            STOPPED => TimerState::Stopped,
            _ => TimerState::TimedOut,
        }
    }
}

struct Shared {
    state: AtomicU8,
    last_beat: Mutex<Option<Instant>>,
    start: Notify,
    stop: Notify,
    beat: Notify,
}

impl Shared {
    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// Builder for a [`HeartbeatTimer`]. A timeout callback is mandatory.
pub struct HeartbeatBuilder {
    timeout: Duration,
    cancel: CancellationToken,
    on_shutdown: Option<TimerCallback>,
    on_timeout: Option<TimerCallback>,
}

impl HeartbeatBuilder {
    /// Token whose cancellation stops the timer and runs the shutdown callback.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_shutdown = Some(callback(f));
        self
    }

    pub fn on_timeout<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_timeout = Some(callback(f));
        self
    }

    /// Sets an already boxed timeout callback, if any.
    pub fn on_timeout_boxed(mut self, callback: Option<TimerCallback>) -> Self {
        self.on_timeout = callback;
        self
    }

    /// Spawns the timer task in the `Created` state.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(self) -> Result<HeartbeatTimer, HeartbeatError> {
        let on_timeout = self
            .on_timeout
            .ok_or(HeartbeatError::MissingTimeoutCallback)?;

        let shared = Arc::new(Shared {
            state: AtomicU8::new(CREATED),
            last_beat: Mutex::new(None),
            start: Notify::new(),
            stop: Notify::new(),
            beat: Notify::new(),
        });

        let task = tokio::spawn(run(
            Arc::clone(&shared),
            self.timeout,
            self.cancel,
            self.on_shutdown,
            on_timeout,
        ));

        Ok(HeartbeatTimer {
            timeout: self.timeout,
            shared,
            task: Some(task),
        })
    }
}

/// Handle to a running keep-alive countdown.
///
/// Dropping the handle aborts the countdown task without running any callback.
/// Use [`HeartbeatTimer::detach`] to let go of the handle and keep the task.
pub struct HeartbeatTimer {
    timeout: Duration,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HeartbeatTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatTimer")
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl HeartbeatTimer {
    pub fn builder(timeout: Duration) -> HeartbeatBuilder {
        HeartbeatBuilder {
            timeout,
            cancel: CancellationToken::new(),
            on_shutdown: None,
            on_timeout: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> TimerState {
        TimerState::from_raw(self.shared.state())
    }

    /// Starts the countdown. Only the first call succeeds.
    pub fn start(&self) -> bool {
        if !self.shared.transition(CREATED, STARTED) {
            return false;
        }
        *self.shared.last_beat.lock() = Some(Instant::now());
        self.shared.start.notify_one();
        true
    }

    /// Stops the timer. Returns true only if this call moved it out of a
    /// live state; false if it was already stopped or had timed out.
    pub fn stop(&self) -> bool {
        let stopped = self.shared.transition(STARTED, STOPPED)
            || self.shared.transition(CREATED, STOPPED);
        if stopped {
            self.shared.stop.notify_one();
        }
        stopped
    }

    /// Resets the countdown. Returns false once the timer is no longer running.
    pub fn heartbeat(&self) -> bool {
        if self.shared.state() != STARTED {
            return false;
        }
        *self.shared.last_beat.lock() = Some(Instant::now());
        self.shared.beat.notify_one();
        true
    }

    /// Time of the last reset, or now if the timer never started.
    pub fn last_heartbeat(&self) -> Instant {
        self.shared.last_beat.lock().unwrap_or_else(Instant::now)
    }

    /// Releases the handle without stopping the countdown task.
    pub fn detach(mut self) {
        drop(self.task.take());
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    timeout: Duration,
    cancel: CancellationToken,
    on_shutdown: Option<TimerCallback>,
    on_timeout: TimerCallback,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            // `start` may have won before this task was first polled.
            if shared.transition(CREATED, STOPPED) || shared.transition(STARTED, STOPPED) {
                fire(on_shutdown);
            }
            return;
        }
        _ = shared.stop.notified() => return,
        _ = shared.start.notified() => {}
    }

    let mut deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if shared.transition(STARTED, STOPPED) {
                    fire(on_shutdown);
                }
                return;
            }
            _ = shared.stop.notified() => return,
            _ = shared.beat.notified() => {
                deadline = Instant::now() + timeout;
                trace!(?timeout, "heartbeat received, countdown reset");
            }
            _ = sleep_until(deadline) => {
                if shared.transition(STARTED, TIMED_OUT) {
                    fire(Some(on_timeout));
                }
                return;
            }
        }
    }
}

// Callbacks run detached: they commonly drop the timer handle that owns
// this task, which would abort them mid-flight.
fn fire(callback: Option<TimerCallback>) {
    if let Some(callback) = callback {
        tokio::spawn(callback());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (c.clone(), c)
    }

    fn timer_with(timeout_ms: u64, fired: Arc<AtomicUsize>) -> HeartbeatTimer {
        HeartbeatTimer::builder(Duration::from_millis(timeout_ms))
            .on_timeout(move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn missing_timeout_callback_is_rejected() {
        let res = HeartbeatTimer::builder(Duration::from_secs(1)).spawn();
        assert_eq!(res.unwrap_err(), HeartbeatError::MissingTimeoutCallback);
    }

    #[tokio::test(start_paused = true)]
    async fn start_succeeds_only_once() {
        let (fired, _) = counter();
        let timer = timer_with(50, fired);
        assert_eq!(timer.state(), TimerState::Created);
        assert!(timer.start());
        assert!(!timer.start());
        assert_eq!(timer.state(), TimerState::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_does_not_begin_before_start() {
        let (fired, seen) = counter();
        let timer = timer_with(50, fired);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(!timer.heartbeat());
        assert_eq!(timer.state(), TimerState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_runs_timeout_exactly_once() {
        let (fired, seen) = counter();
        let timer = timer_with(50, fired);
        assert!(timer.start());

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(timer.state(), TimerState::TimedOut);
        assert!(!timer.heartbeat());
        assert!(!timer.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_timer_alive() {
        let (fired, seen) = counter();
        let timer = timer_with(50, fired);
        assert!(timer.start());

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(timer.heartbeat());
        }

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(timer.stop());
        assert_eq!(timer.state(), TimerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_timeout() {
        let (fired, seen) = counter();
        let timer = timer_with(50, fired);
        assert!(timer.start());
        assert!(timer.stop());
        assert!(!timer.stop());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(!timer.start());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_is_terminal() {
        let (fired, seen) = counter();
        let timer = timer_with(50, fired);
        assert!(timer.stop());
        assert!(!timer.start());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_runs_shutdown_callback() {
        let (timeouts, timeouts_seen) = counter();
        let (shutdowns, shutdowns_seen) = counter();
        let token = CancellationToken::new();

        let timer = HeartbeatTimer::builder(Duration::from_millis(50))
            .cancel_on(token.clone())
            .on_shutdown(move || async move {
                shutdowns.fetch_add(1, Ordering::SeqCst);
            })
            .on_timeout(move || async move {
                timeouts.fetch_add(1, Ordering::SeqCst);
            })
            .spawn()
            .unwrap();

        assert!(timer.start());
        token.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(shutdowns_seen.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts_seen.load(Ordering::SeqCst), 0);
        assert_eq!(timer.state(), TimerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start_still_runs_shutdown() {
        let (timeouts, timeouts_seen) = counter();
        let (shutdowns, shutdowns_seen) = counter();
        let token = CancellationToken::new();

        let timer = HeartbeatTimer::builder(Duration::from_millis(50))
            .cancel_on(token.clone())
            .on_shutdown(move || async move {
                shutdowns.fetch_add(1, Ordering::SeqCst);
            })
            .on_timeout(move || async move {
                timeouts.fetch_add(1, Ordering::SeqCst);
            })
            .spawn()
            .unwrap();

        token.cancel();
        timer.start();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(shutdowns_seen.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts_seen.load(Ordering::SeqCst), 0);
        assert_eq!(timer.state(), TimerState::Stopped);
        assert!(!timer.heartbeat());
    }

    #[tokio::test(start_paused = true)]
    async fn detached_timer_keeps_counting_down() {
        let (fired, seen) = counter();
        let timer = timer_with(50, fired);
        assert!(timer.start());
        timer.detach();

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_heartbeat_tracks_resets() {
        let (fired, _) = counter();
        let timer = timer_with(1_000, fired);

        let before = Instant::now();
        assert!(timer.last_heartbeat() >= before);

        assert!(timer.start());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(timer.heartbeat());
        assert!(timer.last_heartbeat() >= before + Duration::from_millis(100));
    }
}
