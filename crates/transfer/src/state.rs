use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    Active,
    /// Waiting out a transient failure before the next attempt.
    Paused,
    Completed,
    Aborted,
}

/// Point-in-time view of a transfer, handed to progress callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub name: String,
    pub phase: TransferPhase,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Tracks a single upload or download (thread-safe).
pub struct TransferState {
    inner: RwLock<StateInner>,
}

struct StateInner {
    name: String,
    phase: TransferPhase,
    total_bytes: u64,
    transferred_bytes: u64,
    attempts: u32,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: Option<String>,
}

impl TransferState {
    pub fn new(name: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(StateInner {
                name: name.into(),
                phase: TransferPhase::Idle,
                total_bytes,
                transferred_bytes: 0,
                attempts: 0,
                started_at: None,
                finished_at: None,
                error: None,
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.read().unwrap().name.clone()
    }

    /// Enters `Active` for a new attempt, from `Idle` or `Paused`.
    pub fn begin_attempt(&self) {
        let mut s = self.inner.write().unwrap();
        if matches!(s.phase, TransferPhase::Completed | TransferPhase::Aborted) {
            return;
        }
        s.phase = TransferPhase::Active;
        s.attempts += 1;
        s.started_at.get_or_insert_with(Instant::now);
    }

    /// Records bytes the destination now durably holds.
    pub fn set_transferred(&self, bytes: u64) {
        let mut s = self.inner.write().unwrap();
        s.transferred_bytes = bytes;
    }

    pub fn pause(&self, err: &str) {
        let mut s = self.inner.write().unwrap();
        if s.phase == TransferPhase::Active {
            s.phase = TransferPhase::Paused;
            s.error = Some(err.to_string());
        }
    }

    pub fn complete(&self) {
        let mut s = self.inner.write().unwrap();
        s.phase = TransferPhase::Completed;
        s.transferred_bytes = s.total_bytes;
        s.error = None;
        s.finished_at = Some(Instant::now());
    }

    pub fn abort(&self, err: &str) {
        let mut s = self.inner.write().unwrap();
        s.phase = TransferPhase::Aborted;
        s.error = Some(err.to_string());
        s.finished_at = Some(Instant::now());
    }

    pub fn phase(&self) -> TransferPhase {
        self.inner.read().unwrap().phase
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.phase(),
            TransferPhase::Idle | TransferPhase::Active | TransferPhase::Paused
        )
    }

    /// Time from the first attempt to completion (or now).
    pub fn elapsed(&self) -> Duration {
        let s = self.inner.read().unwrap();
        match (s.started_at, s.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn progress(&self) -> TransferProgress {
        let s = self.inner.read().unwrap();
        TransferProgress {
            name: s.name.clone(),
            phase: s.phase,
            total_bytes: s.total_bytes,
            transferred_bytes: s.transferred_bytes,
            attempts: s.attempts,
            error: s.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let st = TransferState::new("obj", 100);
        assert_eq!(st.phase(), TransferPhase::Idle);
        st.begin_attempt();
        st.set_transferred(40);
        st.pause("reset");
        assert_eq!(st.phase(), TransferPhase::Paused);
        assert_eq!(st.progress().error.as_deref(), Some("reset"));
        st.begin_attempt();
        assert_eq!(st.progress().attempts, 2);
        st.complete();
        let p = st.progress();
        assert_eq!(p.phase, TransferPhase::Completed);
        assert_eq!(p.transferred_bytes, 100);
        assert!(p.error.is_none());
        assert!(!st.is_active());
    }

    #[test]
    fn finished_transfers_stay_finished() {
        let st = TransferState::new("obj", 10);
        st.begin_attempt();
        st.abort("denied");
        st.begin_attempt();
        st.pause("late");
        assert_eq!(st.phase(), TransferPhase::Aborted);
        assert_eq!(st.progress().error.as_deref(), Some("denied"));
    }
}
