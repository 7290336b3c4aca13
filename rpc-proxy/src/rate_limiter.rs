use crate::config::RateLimitConfig;
use crate::metrics_defs::RATE_LIMITER_ENTRIES;
use shared::gauge;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy)]
struct RateWindowEntry {
    count: u32,
    window_start: Instant,
}

impl RateWindowEntry {
    fn new(now: Instant) -> Self {
        RateWindowEntry {
            count: 1,
            window_start: now,
        }
    }
}

/// Per-process, burst tolerant fixed window limiter.
///
/// Within the first `burst_window` of a window a caller may send up to
/// `burst_limit` requests; across the whole window the cap is
/// `sustained_limit`. The window resets on the first request arriving after
/// it elapsed, so a caller may send up to `burst_limit + sustained_limit`
/// requests across a window boundary.
///
/// Checks never fail: a poisoned table lets the request through.
pub struct RateLimiter {
    settings: RateLimitConfig,
    entries: Mutex<HashMap<String, RateWindowEntry>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitConfig) -> Self {
        RateLimiter {
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, identity: &str) -> Admission {
        self.check_at(identity, Instant::now())
    }

    pub fn check_at(&self, identity: &str, now: Instant) -> Admission {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => {
                tracing::warn!("Rate limiter table poisoned, allowing request");
                self.entries.clear_poison();
                return Admission::Allowed;
            }
        };

        let Some(entry) = entries.get_mut(identity) else {
            entries.insert(identity.to_string(), RateWindowEntry::new(now));
            return Admission::Allowed;
        };

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed > self.settings.window() {
            *entry = RateWindowEntry::new(now);
            return Admission::Allowed;
        }

        entry.count = entry.count.saturating_add(1);

        if elapsed < self.settings.burst_window() && entry.count <= self.settings.burst_limit {
            return Admission::Allowed;
        }
        if entry.count <= self.settings.sustained_limit {
            return Admission::Allowed;
        }

        Admission::Rejected {
            retry_after_secs: self.retry_after(entry.count),
        }
    }

    /// Suggested wait grows with how far over the limit the caller is.
    fn retry_after(&self, count: u32) -> u64 {
        let scale = self.settings.retry_after_scale.max(1);
        u64::from(count / scale).clamp(1, self.settings.max_retry_after_secs.max(1))
    }

    /// Removes entries whose window started more than `stale_after` before
    /// `now`. Returns how many were removed.
    ///
    /// An entry whose window is still open is never removed, whatever
    /// `stale_after` says.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let stale_after = self.settings.stale_after().max(self.settings.window());
        let Ok(mut entries) = self.entries.lock() else {
            self.entries.clear_poison();
            return 0;
        };

        let before = entries.len();
        entries.retain(|_, entry| {
            now.saturating_duration_since(entry.window_start) <= stale_after
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the periodic sweep of stale entries. The task runs until the
    /// returned handle is shut down.
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let limiter = Arc::clone(self);
        let period = self.settings.sweep_interval();
        let (tx, mut rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = limiter.sweep_at(Instant::now());
                        let remaining = limiter.len();
                        gauge!(RATE_LIMITER_ENTRIES).set(remaining as f64);
                        tracing::debug!(removed, remaining, "Swept rate limiter table");
                    }
                    _ = &mut rx => break,
                }
            }
        });

        SweeperHandle {
            shutdown: Some(tx),
            handle,
        }
    }
}

/// Handle to the background sweep task
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweep task and waits for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            tracing::error!("Rate limiter sweeper panicked: {e}");
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.handle.abort();
        }
    }
}
