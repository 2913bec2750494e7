use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::state::{TransferProgress, TransferState};

/// Default minimum gap between notifications for one transfer.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with transfer progress.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Fans transfer progress out to registered callbacks, throttled per
/// transfer.
pub struct ProgressTracker {
    inner: RwLock<TrackerInner>,
}

struct TrackerInner {
    callbacks: Vec<ProgressCallback>,
    transfers: HashMap<String, Tracked>,
    interval: Duration,
}

struct Tracked {
    state: Arc<TransferState>,
    last_notified: Option<Instant>,
    speed: SpeedCalculator,
    last_bytes: u64,
}

impl ProgressTracker {
    /// Creates a tracker; `interval` defaults to 500 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            inner: RwLock::new(TrackerInner {
                callbacks: Vec::new(),
                transfers: HashMap::new(),
                interval: interval.unwrap_or(DEFAULT_INTERVAL),
            }),
        }
    }

    pub fn on_progress(&self, callback: ProgressCallback) {
        self.inner.write().unwrap().callbacks.push(callback);
    }

    pub fn track(&self, state: Arc<TransferState>) {
        let name = state.name();
        self.inner.write().unwrap().transfers.insert(
            name,
            Tracked {
                state,
                last_notified: None,
                speed: SpeedCalculator::new(None),
                last_bytes: 0,
            },
        );
    }

    pub fn untrack(&self, name: &str) {
        self.inner.write().unwrap().transfers.remove(name);
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.inner.read().unwrap().transfers.contains_key(name)
    }

    /// Notifies callbacks about `name` unless it was reported within the
    /// interval. Finished transfers are always reported.
    pub fn report(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        let interval = inner.interval;
        let Some(tracked) = inner.transfers.get_mut(name) else {
            return;
        };
        let progress = tracked.state.progress();
        let delta = progress
            .transferred_bytes
            .saturating_sub(tracked.last_bytes);
        tracked.last_bytes = progress.transferred_bytes;
        tracked.speed.record(delta);

        let now = Instant::now();
        let due = tracked
            .last_notified
            .is_none_or(|t| now.duration_since(t) >= interval);
        if !due && tracked.state.is_active() {
            return;
        }
        tracked.last_notified = Some(now);
        for cb in &inner.callbacks {
            cb(progress.clone());
        }
    }

    /// Recent throughput of `name` in bytes per second.
    pub fn rate(&self, name: &str) -> f64 {
        let inner = self.inner.read().unwrap();
        inner
            .transfers
            .get(name)
            .map(|t| t.speed.rate())
            .unwrap_or(0.0)
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

/// Throughput over a sliding time window.
pub struct SpeedCalculator {
    samples: Mutex<VecDeque<(Instant, u64)>>,
    window: Duration,
}

impl SpeedCalculator {
    /// `window` defaults to 5 s.
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            window: window.unwrap_or(Duration::from_secs(5)),
        }
    }

    pub fn record(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        samples.push_back((now, bytes));
        while let Some(&(t, _)) = samples.front() {
            if now.duration_since(t) <= self.window {
                break;
            }
            samples.pop_front();
        }
    }

    /// Bytes per second across the window; 0 with fewer than two samples.
    pub fn rate(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        let (Some(first), Some(last)) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let span = last.0.duration_since(first.0);
        if samples.len() < 2 || span.is_zero() {
            return 0.0;
        }
        let bytes: u64 = samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / span.as_secs_f64()
    }

    /// Estimated time for `remaining` bytes at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.rate();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_reaches_callbacks() {
        let tracker = ProgressTracker::new(Some(Duration::from_secs(60)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        tracker.on_progress(Box::new(move |p| s.lock().unwrap().push(p.transferred_bytes)));

        let state = Arc::new(TransferState::new("t", 100));
        tracker.track(Arc::clone(&state));
        state.begin_attempt();
        state.set_transferred(10);
        tracker.report("t");
        // Throttled: within the interval and still active.
        state.set_transferred(20);
        tracker.report("t");
        // Completion always reports.
        state.complete();
        tracker.report("t");

        assert_eq!(*seen.lock().unwrap(), vec![10, 100]);
    }

    #[test]
    fn unknown_transfer_is_ignored() {
        let tracker = ProgressTracker::default();
        tracker.report("missing");
        assert_eq!(tracker.rate("missing"), 0.0);
    }

    #[test]
    fn untrack_removes() {
        let tracker = ProgressTracker::default();
        tracker.track(Arc::new(TransferState::new("t", 1)));
        assert!(tracker.is_tracked("t"));
        tracker.untrack("t");
        assert!(!tracker.is_tracked("t"));
    }

    #[test]
    fn speed_needs_two_samples() {
        let calc = SpeedCalculator::new(None);
        assert_eq!(calc.rate(), 0.0);
        calc.record(100);
        assert_eq!(calc.rate(), 0.0);
        assert!(calc.eta(10).is_none());
    }

    #[test]
    fn speed_and_eta() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)));
        calc.record(0);
        std::thread::sleep(Duration::from_millis(50));
        calc.record(1000);
        assert!(calc.rate() > 0.0);
        assert!(calc.eta(10_000).unwrap() > Duration::ZERO);
    }
}
