use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Granularity at which blocking waits re-check cancellation.
pub const CANCEL_POLL: Duration = Duration::from_millis(500);

/// Cooperative cancellation flag shared between tasks.
///
/// Also accepted by `signal_hook::flag::register` through [`CancelFlag::as_arc`].
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_arc(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn as_arc(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Sleeps for `duration`, returning early (with `false`) once any flag is set.
pub async fn sleep_unless_cancelled(duration: Duration, flags: &[&CancelFlag]) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if flags.iter().any(|flag| flag.is_cancelled()) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep_until(deadline.min(now + CANCEL_POLL)).await;
    }
}
