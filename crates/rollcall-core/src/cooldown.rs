//! Duplicate suppression for repeat confirmations of the same identity.

/// The single retained confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownEntry {
    pub identity_id: String,
    pub confirmed_at_ms: i64,
}

/// Remembers only the most recent confirmation; it is not a history.
///
/// Not synchronized. The scan loop holds it behind its shared-state lock and
/// uses [`check_and_record`](Self::check_and_record) so the check and the
/// update happen as one step.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    last: Option<CooldownEntry>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the last confirmation was `identity_id` and fewer than
    /// `cooldown_ms` milliseconds separate it from `now_ms`.
    pub fn check(&self, identity_id: &str, now_ms: i64, cooldown_ms: i64) -> bool {
        match &self.last {
            Some(entry) => {
                entry.identity_id == identity_id && now_ms - entry.confirmed_at_ms < cooldown_ms
            }
            None => false,
        }
    }

    /// Overwrite the retained entry (last write wins).
    pub fn record(&mut self, identity_id: &str, now_ms: i64) {
        self.last = Some(CooldownEntry {
            identity_id: identity_id.to_string(),
            confirmed_at_ms: now_ms,
        });
    }

    /// Returns true for a duplicate; otherwise records the confirmation and returns false.
    pub fn check_and_record(&mut self, identity_id: &str, now_ms: i64, cooldown_ms: i64) -> bool {
        if self.check(identity_id, now_ms, cooldown_ms) {
            return true;
        }
        self.record(identity_id, now_ms);
        false
    }

    pub fn last(&self) -> Option<&CooldownEntry> {
        self.last.as_ref()
    }
}
