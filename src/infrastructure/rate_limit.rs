//! Request pacing for the upstream API
//!
//! Two limits apply to every call:
//! - a minimum spacing between requests, enforced with a `governor` limiter
//!   that allows no burst
//! - a call budget per rolling window; once exhausted the caller pauses
//!   briefly and the window restarts instead of failing

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::infrastructure::config::ApiConfig;

#[derive(Debug)]
struct BudgetWindow {
    started: Instant,
    calls: u32,
}

/// Shared pacer, one per process
pub struct RequestPacer {
    spacing: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    window: Mutex<BudgetWindow>,
    budget: u32,
    window_length: Duration,
    pause: Duration,
}

impl RequestPacer {
    pub fn new(min_interval: Duration, budget: u32, window_length: Duration, pause: Duration) -> Self {
        // A zero interval disables spacing
        let spacing = Quota::with_period(min_interval)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));

        Self {
            spacing,
            window: Mutex::new(BudgetWindow {
                started: Instant::now(),
                calls: 0,
            }),
            budget: budget.max(1),
            window_length,
            pause,
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(
            config.min_request_interval(),
            config.window_budget,
            config.window(),
            config.budget_pause(),
        )
    }

    /// Wait until the next request may be sent and count it against the window.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.spacing {
            limiter.until_ready().await;
        }

        let mut window = self.window.lock().await;
        if window.started.elapsed() >= self.window_length {
            debug!("Request budget window rolled over after {} calls", window.calls);
            window.started = Instant::now();
            window.calls = 0;
        }

        if window.calls >= self.budget {
            warn!(
                "Request budget of {} calls per {:?} exhausted, pausing {:?}",
                self.budget, self.window_length, self.pause
            );
            tokio::time::sleep(self.pause).await;
            window.started = Instant::now();
            window.calls = 0;
        }

        window.calls += 1;
    }

    /// Calls counted in the current window
    pub async fn calls_in_window(&self) -> u32 {
        self.window.lock().await.calls
    }
}
