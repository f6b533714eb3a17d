//! Per-sequence NACK/PLI bookkeeping.
//!
//! An entry is created the first time a missing sequence becomes eligible
//! for a NACK, and removed once the sequence is sorted or a PLI purges
//! the buffer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// NACK attempts per missing sequence before falling back to a PLI.
pub const MAX_NACKS: u32 = 5;

/// Recovery state of one missing sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackPliState {
    // ---
    pub seq_cycle: u32,
    pub ts_cycle: u32,

    /// NACKs sent so far
    pub nacked: u32,

    /// A PLI was issued because NACKs were exhausted
    pub pli: bool,

    pub last_nack_at: Option<Instant>,
}

/// What the jitter buffer should do about a missing sequence now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Send a NACK for it
    Nack,

    /// NACKs are exhausted: purge and request a key frame
    Pli,

    /// Too early since the previous NACK
    Wait,
}

/// Missing sequences keyed by extended sequence number.
#[derive(Debug, Default)]
pub struct NackTable {
    entries: BTreeMap<u64, NackPliState>,
}

impl NackTable {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, seq: u64) -> Option<&NackPliState> {
        self.entries.get(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decides the next step for `seq` and records it.
    ///
    /// Up to [`MAX_NACKS`] NACKs are granted, each at least `spacing`
    /// after the previous one. Once the last NACK has had its `spacing`
    /// to be answered, the entry escalates to [`Escalation::Pli`].
    pub fn escalate(
        &mut self,
        seq: u64,
        seq_cycle: u32,
        now: Instant,
        spacing: Duration,
    ) -> Escalation {
        // ---
        let state = self.entries.entry(seq).or_insert_with(|| NackPliState {
            seq_cycle,
            ..NackPliState::default()
        });

        let due = state
            .last_nack_at
            .map_or(true, |last| now >= last + spacing);
        if !due {
            return Escalation::Wait;
        }

        if state.nacked < MAX_NACKS {
            state.nacked += 1;
            state.last_nack_at = Some(now);
            return Escalation::Nack;
        }

        state.pli = true;
        Escalation::Pli
    }

    /// Drops every entry below `seq` (sorted since).
    pub fn resolve_below(&mut self, seq: u64) {
        // ---
        self.entries = self.entries.split_off(&seq);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_five_nacks_then_pli() {
        // ---
        let mut table = NackTable::new();
        let spacing = Duration::from_millis(40);
        let t0 = Instant::now();

        let mut steps = Vec::new();
        for ms in (0..=300).step_by(10) {
            let step = table.escalate(7, 0, t0 + Duration::from_millis(ms), spacing);
            if step != Escalation::Wait {
                steps.push((ms, step));
            }
            if step == Escalation::Pli {
                break;
            }
        }

        let nacks: Vec<u64> = steps
            .iter()
            .filter(|(_, s)| *s == Escalation::Nack)
            .map(|(ms, _)| *ms)
            .collect();
        assert_eq!(nacks, vec![0, 40, 80, 120, 160]);
        assert_eq!(steps.last(), Some(&(200, Escalation::Pli)));
        assert!(table.get(7).is_some_and(|s| s.pli && s.nacked == MAX_NACKS));
    }

    #[test]
    fn test_resolve_below_keeps_newer_entries() {
        // ---
        let mut table = NackTable::new();
        let now = Instant::now();
        for seq in [3, 5, 9] {
            table.escalate(seq, 0, now, Duration::ZERO);
        }

        table.resolve_below(5);
        assert!(table.get(3).is_none());
        assert!(table.get(5).is_some());
        assert_eq!(table.len(), 2);

        table.clear();
        assert!(table.is_empty());
    }
}
