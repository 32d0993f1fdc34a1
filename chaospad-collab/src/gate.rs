//! Snapshot write admission: size guard, per-document rate gate and the
//! per-document lock table that serializes check → persist → prune.
//!
//! ```text
//!   declared size ──► SizeGuard ──► DocumentLocks[doc] ──► WriteGate ──► store
//!                     (fails open)   (lazy, never freed)   (min interval)
//! ```
//!
//! Neither the lock table nor the rate state ever forgets a document. Both
//! grow with the number of distinct documents written in the process
//! lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use crate::clock::Clock;

/// Default minimum spacing between admitted writes per document.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(3);
/// Default character cap for declared snapshot sizes.
pub const DEFAULT_MAX_CHARS: u64 = 6000;
/// Average characters per word used to approximate a declared word count.
pub const CHARS_PER_WORD: u64 = 6;

/// Gate decision for one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed. `rate_limited` is true when a final write bypassed the interval.
    Admitted { rate_limited: bool },
    /// Non-final write inside the interval.
    Rejected,
}

/// Per-document minimum-interval gate.
pub struct WriteGate {
    min_interval: Duration,
    clock: Arc<dyn Clock>,
    last_write: Mutex<HashMap<String, Duration>>,
}

impl WriteGate {
    pub fn new(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval,
            clock,
            last_write: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Decide whether a write may proceed, recording it if so.
    ///
    /// Callers must hold the document's lock from [`DocumentLocks`] across
    /// this call and the subsequent persist, otherwise two writers can both
    /// observe "not over limit".
    pub fn admit_write(&self, document_id: &str, is_final: bool) -> GateDecision {
        let now = self.clock.now();
        let mut last_write = match self.last_write.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let over_limit = last_write
            .get(document_id)
            .is_some_and(|last| now.saturating_sub(*last) < self.min_interval);

        if over_limit && !is_final {
            return GateDecision::Rejected;
        }

        last_write.insert(document_id.to_string(), now);
        GateDecision::Admitted {
            rate_limited: over_limit,
        }
    }

    /// Timestamp of the last admitted write, if any.
    pub fn last_write(&self, document_id: &str) -> Option<Duration> {
        match self.last_write.lock() {
            Ok(guard) => guard.get(document_id).copied(),
            Err(poisoned) => poisoned.into_inner().get(document_id).copied(),
        }
    }

    pub fn tracked_documents(&self) -> usize {
        self.last_write.lock().map(|g| g.len()).unwrap_or(0)
    }
}

/// Lazily created async mutex per document.
#[derive(Default)]
pub struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `document_id`, created on first use.
    pub fn lock_for(&self, document_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller-declared size of a submission, as raw header values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeHint {
    pub char_count: Option<String>,
    pub word_count: Option<String>,
}

impl SizeHint {
    pub fn chars(count: impl ToString) -> Self {
        Self {
            char_count: Some(count.to_string()),
            word_count: None,
        }
    }

    pub fn words(count: impl ToString) -> Self {
        Self {
            char_count: None,
            word_count: Some(count.to_string()),
        }
    }
}

/// Result of the pre-flight size check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    Ok,
    /// Estimated size in characters exceeds the cap.
    TooLarge { estimated: i64 },
}

/// Best-effort rejection of oversized submissions before any storage work.
#[derive(Debug, Clone, Copy)]
pub struct SizeGuard {
    max_chars: u64,
    chars_per_word: u64,
}

impl Default for SizeGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS, CHARS_PER_WORD)
    }
}

impl SizeGuard {
    pub fn new(max_chars: u64, chars_per_word: u64) -> Self {
        Self {
            max_chars,
            chars_per_word,
        }
    }

    pub fn max_chars(&self) -> u64 {
        self.max_chars
    }

    /// A char count takes precedence over a word count. If the char count is
    /// present but not a number the guard is skipped entirely.
    pub fn check(&self, hint: &SizeHint) -> SizeCheck {
        let cap = self.max_chars as i64;
        let estimated = if let Some(raw) = &hint.char_count {
            match raw.trim().parse::<i64>() {
                Ok(chars) => chars,
                Err(_) => return SizeCheck::Ok,
            }
        } else if let Some(raw) = &hint.word_count {
            match raw.trim().parse::<i64>() {
                Ok(words) => words.saturating_mul(self.chars_per_word as i64),
                Err(_) => return SizeCheck::Ok,
            }
        } else {
            return SizeCheck::Ok;
        };

        if estimated > cap {
            SizeCheck::TooLarge { estimated }
        } else {
            SizeCheck::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn gate() -> (Arc<ManualClock>, WriteGate) {
        let clock = Arc::new(ManualClock::new());
        let gate = WriteGate::new(DEFAULT_MIN_INTERVAL, clock.clone());
        (clock, gate)
    }

    #[test]
    fn test_first_write_admitted() {
        let (_clock, gate) = gate();
        assert_eq!(
            gate.admit_write("pad", false),
            GateDecision::Admitted { rate_limited: false }
        );
        assert_eq!(gate.last_write("pad"), Some(Duration::ZERO));
    }

    #[test]
    fn test_second_write_inside_interval_rejected() {
        let (clock, gate) = gate();
        gate.admit_write("pad", false);
        clock.set(Duration::from_secs(1));

        assert_eq!(gate.admit_write("pad", false), GateDecision::Rejected);
        // State untouched by the rejection
        assert_eq!(gate.last_write("pad"), Some(Duration::ZERO));
    }

    #[test]
    fn test_final_write_bypasses_interval() {
        let (clock, gate) = gate();
        gate.admit_write("pad", false);
        clock.set(Duration::from_secs(1));

        assert_eq!(
            gate.admit_write("pad", true),
            GateDecision::Admitted { rate_limited: true }
        );
        assert_eq!(gate.last_write("pad"), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_write_at_interval_boundary_admitted() {
        let (clock, gate) = gate();
        gate.admit_write("pad", false);
        clock.set(DEFAULT_MIN_INTERVAL);
        assert_eq!(
            gate.admit_write("pad", false),
            GateDecision::Admitted { rate_limited: false }
        );
    }

    #[test]
    fn test_final_outside_interval_not_flagged() {
        let (clock, gate) = gate();
        gate.admit_write("pad", false);
        clock.set(Duration::from_secs(10));
        assert_eq!(
            gate.admit_write("pad", true),
            GateDecision::Admitted { rate_limited: false }
        );
    }

    #[test]
    fn test_documents_gated_independently() {
        let (_clock, gate) = gate();
        gate.admit_write("a", false);
        assert_eq!(
            gate.admit_write("b", false),
            GateDecision::Admitted { rate_limited: false }
        );
        assert_eq!(gate.tracked_documents(), 2);
    }

    #[test]
    fn test_locks_cached_per_document() {
        let locks = DocumentLocks::new();
        let a1 = locks.lock_for("a");
        let a2 = locks.lock_for("a");
        let b = locks.lock_for("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_size_guard_char_count() {
        let guard = SizeGuard::default();
        assert_eq!(guard.check(&SizeHint::chars(6000)), SizeCheck::Ok);
        assert_eq!(
            guard.check(&SizeHint::chars(7000)),
            SizeCheck::TooLarge { estimated: 7000 }
        );
    }

    #[test]
    fn test_size_guard_word_count() {
        let guard = SizeGuard::default();
        assert_eq!(guard.check(&SizeHint::words(1000)), SizeCheck::Ok);
        assert_eq!(
            guard.check(&SizeHint::words(1001)),
            SizeCheck::TooLarge { estimated: 6006 }
        );
    }

    #[test]
    fn test_size_guard_char_count_takes_precedence() {
        let guard = SizeGuard::default();
        let hint = SizeHint {
            char_count: Some("100".into()),
            word_count: Some("5000".into()),
        };
        assert_eq!(guard.check(&hint), SizeCheck::Ok);
    }

    #[test]
    fn test_size_guard_fails_open() {
        let guard = SizeGuard::default();
        assert_eq!(guard.check(&SizeHint::default()), SizeCheck::Ok);
        assert_eq!(guard.check(&SizeHint::chars("lots")), SizeCheck::Ok);
        assert_eq!(guard.check(&SizeHint::words("many")), SizeCheck::Ok);
        // Unparseable char count skips the guard even with a huge word count
        let hint = SizeHint {
            char_count: Some("??".into()),
            word_count: Some("99999".into()),
        };
        assert_eq!(guard.check(&hint), SizeCheck::Ok);
    }
}
