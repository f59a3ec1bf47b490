/// More concurrent downloads than this silence per-file notifications.
pub const NOTIFY_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTransition {
    /// First transfer of a batch; the watcher must be stopped.
    Activated,
    Joined,
}

/// Returned when the last in-flight transfer leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
    /// `Some(all_ok)` when notifications were suppressed and one summary is owed.
    pub summary: Option<bool>,
}

/// In-flight download counter with batch notification state.
#[derive(Debug, Default)]
pub struct TransferQueue {
    in_flight: usize,
    suppressed: bool,
    batch_failed: bool,
}

impl TransferQueue {
    pub fn enter(&mut self) -> QueueTransition {
        self.in_flight += 1;
        if self.in_flight > NOTIFY_THRESHOLD {
            self.suppressed = true;
        }
        if self.in_flight == 1 {
            QueueTransition::Activated
        } else {
            QueueTransition::Joined
        }
    }

    /// Marks one transfer finished. Never goes below zero.
    pub fn leave(&mut self, ok: bool) -> Option<Drained> {
        if self.in_flight == 0 {
            return None;
        }
        if !ok {
            self.batch_failed = true;
        }
        self.in_flight -= 1;
        if self.in_flight > 0 {
            return None;
        }
        let summary = self.suppressed.then_some(!self.batch_failed);
        self.suppressed = false;
        self.batch_failed = false;
        Some(Drained { summary })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn notifications_enabled(&self) -> bool {
        !self.suppressed
    }
}
