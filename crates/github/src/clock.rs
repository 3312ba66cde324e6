use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::watch;

/// Source of wall-clock time and delays. Polling goes through this so that
/// elapsed time can be simulated.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime { OffsetDateTime::now_utc() }

    async fn sleep(&self, duration: Duration) { tokio::time::sleep(duration).await }
}

/// Caller-owned cancellation for long waits. Cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Trips every [`CancelSignal`] created from it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) { self.tx.send_replace(true); }
}

impl CancelSignal {
    pub fn channel() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires.
    pub fn never() -> CancelSignal { Self::channel().1 }

    pub fn is_cancelled(&self) -> bool { *self.rx.borrow() }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let result = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if result.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleeps on `clock` unless `cancel` fires first.
pub(crate) async fn sleep_or_cancel(
    clock: &dyn Clock,
    cancel: &CancelSignal,
    duration: Duration,
) -> crate::Result<()> {
    if cancel.is_cancelled() {
        return Err(crate::Error::Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(crate::Error::Cancelled),
        _ = clock.sleep(duration) => Ok(()),
    }
}

/// Drives `fut` unless `cancel` fires first, in which case `fut` is dropped
/// mid-flight.
pub(crate) async fn run_or_cancel<T>(
    cancel: &CancelSignal,
    fut: impl Future<Output = crate::Result<T>>,
) -> crate::Result<T> {
    if cancel.is_cancelled() {
        return Err(crate::Error::Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(crate::Error::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use time::macros::datetime;

    use super::*;

    /// Virtual clock: `sleep` advances `now` instantly.
    pub struct ManualClock {
        now: Mutex<OffsetDateTime>,
    }

    impl ManualClock {
        pub fn new(now: OffsetDateTime) -> Self { Self { now: Mutex::new(now) } }

        pub fn start() -> Self { Self::new(datetime!(2025-03-01 12:00:00.250 UTC)) }

        pub fn advance(&self, duration: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += duration;
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> OffsetDateTime { *self.now.lock().unwrap() }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
            tokio::task::yield_now().await;
        }
    }
}
