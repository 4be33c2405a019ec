use std::sync::Mutex;
use std::time::Duration;

/// Monotonic millisecond time source used by the read engine.
///
/// All task deadlines and wake times are expressed against this trait so
/// that tests can substitute [`VirtualClock`] and assert exact completion
/// times.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary epoch fixed at construction.
    fn now_ms(&self) -> u64;

    /// Suspend the caller for `ms` milliseconds.
    async fn sleep_ms(&self, ms: u64);
}

/// Clock backed by the tokio runtime.
pub struct MonotonicClock {
    epoch: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

#[async_trait::async_trait]
impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Deterministic clock for tests.
///
/// `sleep_ms` advances virtual time and returns after yielding once to the
/// runtime, so futures co-scheduled with the sleeper observe the new time
/// before the sleeper resumes.
pub struct VirtualClock {
    now: Mutex<u64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self { now: Mutex::new(0) }
    }

    /// Advance time without suspending.
    pub fn advance_ms(&self, ms: u64) {
        *self.now.lock().unwrap() += ms;
    }
}

#[async_trait::async_trait]
impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        *self.now.lock().unwrap()
    }

    async fn sleep_ms(&self, ms: u64) {
        self.advance_ms(ms);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn virtual_clock_advances_on_sleep() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now_ms(), 0);

        clock.sleep_ms(1303).await;
        assert_eq!(clock.now_ms(), 1303);

        clock.advance_ms(7);
        assert_eq!(clock.now_ms(), 1310);
    }
}
