//! Environment abstraction for deterministic testing.
//!
//! Decouples the client from wall-clock time and sleeping so the sync loop,
//! file-cache pruning and the device-key backoff can run under a manual
//! clock in tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

/// Abstract environment providing time and sleeping.
///
/// # Invariants
///
/// - `now_ms()` never goes backwards within one execution context.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Current wall-clock time as millisecond epoch.
    fn now_ms(&self) -> u64;

    /// Sleep for the given duration. The only suspension point the
    /// environment owns; everything else awaits the network or the store.
    async fn sleep(&self, duration: Duration);
}

/// Production environment backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

#[async_trait]
impl Environment for SystemEnvironment {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test utilities: a manually advanced clock.
pub mod test_utils {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Deterministic environment with a manual clock. Sleeping advances the
    /// clock instead of suspending.
    #[derive(Debug, Default)]
    pub struct MockEnv {
        now_ms: AtomicU64,
    }

    impl MockEnv {
        /// Create a mock environment starting at the given epoch time.
        pub fn starting_at(now_ms: u64) -> Arc<Self> {
            Arc::new(Self { now_ms: AtomicU64::new(now_ms) })
        }

        /// Advance the clock.
        pub fn advance(&self, duration: Duration) {
            self.now_ms.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Environment for MockEnv {
        fn now_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }
    }
}
