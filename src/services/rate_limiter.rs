use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum RateLimiterError {
    #[error("{parameter} must be a positive {kind}")]
    InvalidParameter { parameter: &'static str, kind: &'static str },

    #[error("RateLimiter not initialized; call initialize() before acquire()")]
    NotInitialized,

    #[error("Rate limiter semaphore closed")]
    Closed,
}

#[derive(Debug, Default)]
struct WindowState {
    // Completion times of successful acquires inside the sliding window.
    timestamps: VecDeque<Instant>,
    total_requests: u64,
    total_wait_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_wait_time: f64,
    pub avg_wait_time: f64,
    pub current_calls_in_window: usize,
    pub requests_per_window: u32,
}

/// A slot in the limiter. Dropping it releases the concurrency slot, which
/// keeps cancelled tasks from leaking capacity.
pub struct RateLimiterPermit {
    _permit: OwnedSemaphorePermit,
    wait_time: Duration,
}

impl RateLimiterPermit {
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }
}

/// Two constraints per API: a sliding request window and a cap on in-flight
/// calls. `acquire` suspends until both are satisfied.
pub struct RateLimiter {
    requests_per_window: u32,
    window: Duration,
    max_concurrent: u32,
    semaphore: OnceLock<Arc<Semaphore>>,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(requests_per_window: u32, window_seconds: f64, max_concurrent: u32) -> Result<Self, RateLimiterError> {
        if requests_per_window == 0 {
            return Err(RateLimiterError::InvalidParameter {
                parameter: "requests_per_window",
                kind: "integer",
            });
        }
        if !(window_seconds > 0.0) {
            return Err(RateLimiterError::InvalidParameter {
                parameter: "window_seconds",
                kind: "number",
            });
        }
        if max_concurrent == 0 {
            return Err(RateLimiterError::InvalidParameter {
                parameter: "max_concurrent",
                kind: "integer",
            });
        }

        Ok(Self {
            requests_per_window,
            window: Duration::from_secs_f64(window_seconds),
            max_concurrent,
            semaphore: OnceLock::new(),
            state: Mutex::new(WindowState::default()),
        })
    }

    /// Creates the concurrency semaphore. Idempotent.
    pub fn initialize(&self) {
        self.semaphore.get_or_init(|| Arc::new(Semaphore::new(self.max_concurrent as usize)));
    }

    pub fn is_initialized(&self) -> bool {
        self.semaphore.get().is_some()
    }

    /// Waits until both the concurrency cap and the sliding window allow
    /// another request, then records the request in the window.
    pub async fn acquire(&self) -> Result<RateLimiterPermit, RateLimiterError> {
        let semaphore = self.semaphore.get().ok_or(RateLimiterError::NotInitialized)?;
        let started = Instant::now();

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RateLimiterError::Closed)?;

        let waited = loop {
            let sleep_for = {
                let mut state = self.state.lock().expect("rate limiter lock poisoned");
                let now = Instant::now();
                Self::drop_expired(&mut state.timestamps, now, self.window);

                if state.timestamps.len() < self.requests_per_window as usize {
                    state.timestamps.push_back(now);
                    let waited = started.elapsed();
                    state.total_requests += 1;
                    state.total_wait_time += waited.as_secs_f64();
                    break waited;
                }

                // Window is full; wake up when the oldest entry ages out.
                let oldest = *state.timestamps.front().expect("window is non-empty here");
                (oldest + self.window).saturating_duration_since(now)
            };

            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        };

        Ok(RateLimiterPermit { _permit: permit, wait_time: waited })
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        Self::drop_expired(&mut state.timestamps, Instant::now(), self.window);

        let avg = if state.total_requests > 0 {
            state.total_wait_time / state.total_requests as f64
        } else {
            0.0
        };

        RateLimiterStats {
            total_requests: state.total_requests,
            total_wait_time: state.total_wait_time,
            avg_wait_time: avg,
            current_calls_in_window: state.timestamps.len(),
            requests_per_window: self.requests_per_window,
        }
    }

    fn drop_expired(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while timestamps.front().is_some_and(|ts| now.duration_since(*ts) >= window) {
            timestamps.pop_front();
        }
    }
}
