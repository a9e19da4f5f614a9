//! Clock abstraction.
//!
//! Backoff timing, actor-cache TTL expiry, and signature staleness all need
//! to be driven by a clock the tests can pin; this is threaded the way
//! `AppState` threads `Arc<Database>`/`Arc<reqwest::Client>` as an explicit
//! collaborator rather than reading `Utc::now()` inline.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A fixed clock that can be advanced manually, for deterministic tests of
/// backoff scheduling and TTL expiry.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { inner: Arc::new(Mutex::new(start)) }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.inner.lock().expect("test clock mutex poisoned");
        *guard += delta;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().expect("test clock mutex poisoned")
    }
}
