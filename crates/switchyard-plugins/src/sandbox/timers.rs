//! Bounded per-context timer facility.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::error::{PluginError, PluginResult};

/// Work run when a timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Timer quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerLimits {
    /// Maximum pending timers.
    pub max_timers: usize,
    /// Shortest repeating period.
    pub min_interval: Duration,
    /// Longest repeating period.
    pub max_interval: Duration,
}

impl Default for TimerLimits {
    fn default() -> Self {
        Self {
            max_timers: 100,
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Default)]
struct TimerState {
    next_id: u64,
    pending: HashMap<u64, JoinHandle<()>>,
}

/// Pending timers for one plugin.
///
/// One-shot timers remove themselves before their callback runs. Dropping
/// the registry aborts everything still pending.
pub struct TimerRegistry {
    plugin_id: String,
    limits: TimerLimits,
    runtime: Option<Handle>,
    state: Arc<Mutex<TimerState>>,
}

impl TimerRegistry {
    /// Create a registry bound to the current tokio runtime, if any.
    #[must_use]
    pub fn new(plugin_id: &str, limits: TimerLimits) -> Self {
        Self {
            plugin_id: plugin_id.to_owned(),
            limits,
            runtime: Handle::try_current().ok(),
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    /// The quotas in force.
    #[must_use]
    pub fn limits(&self) -> TimerLimits {
        self.limits
    }

    /// Clamp a repeating period into `[min_interval, max_interval]`.
    #[must_use]
    pub fn clamp_interval(&self, period: Duration) -> Duration {
        period.clamp(self.limits.min_interval, self.limits.max_interval)
    }

    /// Run `callback` once after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::TimerLimit`] when the cap is reached, or a
    /// sandbox error when no runtime is available.
    pub fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> PluginResult<u64> {
        let shared = Arc::clone(&self.state);
        self.schedule(move |id| async move {
            tokio::time::sleep(delay).await;
            let still_pending = shared
                .lock()
                .map(|mut state| state.pending.remove(&id).is_some())
                .unwrap_or(false);
            if still_pending {
                callback();
            }
        })
    }

    /// Run `callback` every `period`, clamped. The first run is one period
    /// from now.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::TimerLimit`] when the cap is reached, or a
    /// sandbox error when no runtime is available.
    pub fn set_interval(&self, period: Duration, callback: TimerCallback) -> PluginResult<u64> {
        let period = self.clamp_interval(period);
        self.schedule(move |_| async move {
            let start = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                callback();
            }
        })
    }

    fn schedule<F, Fut>(&self, task: F) -> PluginResult<u64>
    where
        F: FnOnce(u64) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            PluginError::sandbox(&self.plugin_id, "timers require a tokio runtime")
        })?;

        // Held across spawn and insert so a zero-delay timer cannot fire
        // before it is registered.
        let mut state = self.lock()?;
        if state.pending.len() >= self.limits.max_timers {
            return Err(PluginError::TimerLimit {
                plugin_id: self.plugin_id.clone(),
                limit: self.limits.max_timers,
            });
        }
        state.next_id = state.next_id.wrapping_add(1);
        let id = state.next_id;
        let handle = runtime.spawn(task(id));
        state.pending.insert(id, handle);
        debug!(plugin_id = %self.plugin_id, timer_id = id, "Timer scheduled");
        Ok(id)
    }

    /// Cancel a timer. Returns whether it was pending.
    pub fn clear(&self, id: u64) -> bool {
        match self.lock().ok().and_then(|mut s| s.pending.remove(&id)) {
            Some(handle) => {
                handle.abort();
                true
            },
            None => false,
        }
    }

    /// Cancel every timer. Returns how many were pending.
    pub fn clear_all(&self) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let count = state.pending.len();
        for (_, handle) in state.pending.drain() {
            handle.abort();
        }
        count
    }

    /// Number of pending timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().map(|s| s.pending.len()).unwrap_or_default()
    }

    fn lock(&self) -> PluginResult<MutexGuard<'_, TimerState>> {
        self.state
            .lock()
            .map_err(|e| PluginError::sandbox(&self.plugin_id, format!("timer lock poisoned: {e}")))
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear_all();
    }
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("plugin_id", &self.plugin_id)
            .field("limits", &self.limits)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        let callback: TimerCallback = Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_and_deregisters() {
        let timers = TimerRegistry::new("demo", TimerLimits::default());
        let (count, callback) = counter();

        timers.set_timeout(Duration::from_millis(50), callback).unwrap();
        assert_eq!(timers.pending(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_is_enforced() {
        let limits = TimerLimits {
            max_timers: 3,
            ..TimerLimits::default()
        };
        let timers = TimerRegistry::new("demo", limits);
        let (_, callback) = counter();
        for _ in 0..3 {
            timers
                .set_timeout(Duration::from_secs(10), Arc::clone(&callback))
                .unwrap();
        }
        let err = timers
            .set_timeout(Duration::from_secs(10), callback)
            .unwrap_err();
        assert!(matches!(err, PluginError::TimerLimit { limit: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_cap_is_one_hundred() {
        let timers = TimerRegistry::new("demo", TimerLimits::default());
        let (_, callback) = counter();
        for _ in 0..100 {
            timers
                .set_timeout(Duration::from_secs(10), Arc::clone(&callback))
                .unwrap();
        }
        assert!(timers.set_timeout(Duration::from_secs(10), callback).is_err());
        assert_eq!(timers.clear_all(), 100);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_prevents_firing() {
        let timers = TimerRegistry::new("demo", TimerLimits::default());
        let (count, callback) = counter();
        let id = timers.set_timeout(Duration::from_millis(20), callback).unwrap();
        assert!(timers.clear(id));
        assert!(!timers.clear(id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_repeats_with_clamped_period() {
        let timers = TimerRegistry::new("demo", TimerLimits::default());
        let (count, callback) = counter();
        let id = timers.set_interval(Duration::from_millis(1), callback).unwrap();

        // Clamped to 10ms: 3 ticks by 35ms.
        tokio::time::sleep(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(timers.pending(), 1);

        assert!(timers.clear(id));
    }

    #[test]
    fn test_clamp_interval() {
        let timers = TimerRegistry::new("demo", TimerLimits::default());
        assert_eq!(
            timers.clamp_interval(Duration::ZERO),
            Duration::from_millis(10)
        );
        assert_eq!(
            timers.clamp_interval(Duration::from_secs(7200)),
            Duration::from_secs(3600)
        );
        assert_eq!(
            timers.clamp_interval(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_no_runtime_is_an_error() {
        let timers = TimerRegistry::new("demo", TimerLimits::default());
        let (_, callback) = counter();
        assert!(matches!(
            timers.set_timeout(Duration::ZERO, callback),
            Err(PluginError::SandboxError { .. })
        ));
    }
}
