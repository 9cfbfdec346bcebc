use std::collections::HashMap;

// Timer periods in milliseconds.
pub const CONNECT_TIMEOUT: u64 = 15_000;
pub const SHOULD_RING_TIMEOUT: u64 = 30_000;
pub const RINGER_TIMEOUT: u64 = 30_000;
pub const CONFSTART_TIMEOUT_S: u64 = 120; // age bound, seconds
pub const SEND_CHECK_TIMEOUT: u64 = 60_000;
pub const ONGOING_CALL_TIMEOUT: u64 = 90_000;
pub const ROTATE_KEY_TIMEOUT: u64 = 30_000;
pub const ROTATE_KEY_FIRST_TIMEOUT: u64 = 5_000;
pub const ROTATE_KEY_FAST_TIMEOUT: u64 = 5_000;
pub const ROTATE_MLS_TIMEOUT: u64 = 10_000;
pub const MLS_KEY_AGE: u64 = 10_000;
pub const REQ_NEW_EPOCH_TIMEOUT: u64 = 10_000;
pub const DECRYPT_CHECK_TIMEOUT: u64 = 5_000;
pub const KEEPALIVE_TIMEOUT: u64 = 5_000;
pub const NOONE_JOINED_TIMEOUT: u64 = 60_000;
pub const EVERYONE_LEFT_TIMEOUT: u64 = 60_000;

pub const MAX_MISSING_PINGS: u32 = 4;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const QUALITY_POOR_MISSING: u32 = 3;
pub const QUALITY_MEDIUM_MISSING: u32 = 1;

/// The controller's timers. One deadline per kind; re-arming replaces the
/// previous deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Connect,
    Ongoing,
    Ring,
    SendCheck,
    RotateKey,
    RotateMls,
    DecryptCheck,
    Keepalive,
    Alone,
}

/// Deadline table driven by the engine's `tick`.
#[derive(Debug, Default)]
pub struct TimerTable {
    deadlines: HashMap<TimerKind, u64>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, kind: TimerKind, now_ms: u64, period_ms: u64) {
        self.deadlines.insert(kind, now_ms.saturating_add(period_ms));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines.remove(&kind);
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_running(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    /// Remove and return every timer whose deadline has passed, ordered by
    /// deadline so cascaded timers fire deterministically.
    pub fn due(&mut self, now_ms: u64) -> Vec<TimerKind> {
        let mut fired: Vec<(u64, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now_ms)
            .map(|(kind, deadline)| (*deadline, *kind))
            .collect();
        fired.sort_by_key(|(deadline, _)| *deadline);
        for (_, kind) in &fired {
            self.deadlines.remove(kind);
        }
        fired.into_iter().map(|(_, kind)| kind).collect()
    }

    /// Earliest pending deadline, for the async driver's sleep.
    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.values().min().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_fires_once_in_deadline_order() {
        let mut timers = TimerTable::new();
        timers.start(TimerKind::Keepalive, 0, 5_000);
        timers.start(TimerKind::Connect, 0, 1_000);
        timers.start(TimerKind::Alone, 0, 60_000);

        assert_eq!(
            timers.due(6_000),
            vec![TimerKind::Connect, TimerKind::Keepalive]
        );
        assert!(timers.due(6_000).is_empty());
        assert!(timers.is_running(TimerKind::Alone));
    }

    #[test]
    fn restart_replaces_deadline() {
        let mut timers = TimerTable::new();
        timers.start(TimerKind::Ongoing, 0, 1_000);
        timers.start(TimerKind::Ongoing, 0, 90_000);
        assert!(timers.due(5_000).is_empty());
    }

    #[test]
    fn next_deadline_is_minimum() {
        let mut timers = TimerTable::new();
        assert_eq!(timers.next_deadline(), None);
        timers.start(TimerKind::Keepalive, 100, 5_000);
        timers.start(TimerKind::Connect, 100, 15_000);
        assert_eq!(timers.next_deadline(), Some(5_100));
    }
}
