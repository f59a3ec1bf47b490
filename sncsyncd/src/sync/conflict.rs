/// Outcome of comparing the last synced, local and remote fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Local content is what was last synced.
    Unchanged,
    /// Remote already holds the local content.
    Converged,
    /// Only the local side changed since the last sync.
    Push,
    /// Remote changed since the last sync and differs from local.
    Conflict,
}

impl SyncDecision {
    pub fn in_sync(self) -> bool {
        !matches!(self, SyncDecision::Conflict)
    }

    pub fn no_push_needed(self) -> bool {
        matches!(self, SyncDecision::Unchanged | SyncDecision::Converged)
    }
}

/// Local-only short circuit. An empty `stored` fingerprint never matches.
pub fn check_local(stored: &str, local: &str) -> Option<SyncDecision> {
    (!stored.is_empty() && stored == local).then_some(SyncDecision::Unchanged)
}

pub fn check_remote(stored: &str, local: &str, remote: &str) -> SyncDecision {
    if remote == local {
        SyncDecision::Converged
    } else if !stored.is_empty() && remote == stored {
        SyncDecision::Push
    } else {
        SyncDecision::Conflict
    }
}
