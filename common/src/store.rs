//! Sorted packet store with an unsorted side buffer.
//!
//! The sorted store holds a contiguous run of packets keyed by extended
//! sequence number (`first..=last`). Packets that arrive ahead of the
//! expected sequence wait in the unsorted buffer and are drained into the
//! store as soon as the gap in front of them closes.

use crate::rtp::RtpPacket;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Why [`SortedStore::push`] refused a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Not `last + 1` and disorder is not accepted
    OutOfOrder { expected: u64, got: u64 },

    /// Older than `first` without `force`
    TooOld { first: u64, got: u64 },

    /// Store is empty but the packet is not newer than the last one seen
    Late { last: u64, got: u64 },

    Duplicate(u64),
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::OutOfOrder { expected, got } => {
                write!(f, "packet {got} is out of order, expected {expected}")
            }
            PushError::TooOld { first, got } => {
                write!(f, "packet {got} is older than the store start {first}")
            }
            PushError::Late { last, got } => {
                write!(f, "packet {got} arrived after {last} was already stored")
            }
            PushError::Duplicate(seq) => write!(f, "duplicate packet {seq}"),
        }
    }
}

impl std::error::Error for PushError {}

/// Packets that arrived ahead of the expected sequence number.
#[derive(Debug, Default)]
pub struct UnsortedBuffer {
    packets: BTreeMap<u64, RtpPacket>,
}

impl UnsortedBuffer {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts by extended sequence; a duplicate replaces the older copy.
    pub fn put(&mut self, p: RtpPacket) {
        self.packets.insert(p.ext_seq(), p);
    }

    /// Removes and returns the packet with extended sequence `seq`.
    pub fn take(&mut self, seq: u64) -> Option<RtpPacket> {
        self.packets.remove(&seq)
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.packets.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Empties the buffer, returning packets in ascending order.
    pub fn drain_sorted(&mut self) -> Vec<RtpPacket> {
        std::mem::take(&mut self.packets).into_values().collect()
    }

    pub fn purge(&mut self) {
        self.packets.clear();
    }
}

/// Sorted store plus its unsorted side buffer.
///
/// ```
/// use sfu_common::store::SortedStore;
/// use sfu_common::RtpPacket;
///
/// let mut store = SortedStore::new(90_000, 0);
/// store.unsorted_mut().put(RtpPacket::new(96, 11, 3000, 1, false, &[0]));
/// store.push(RtpPacket::new(96, 10, 0, 1, false, &[0]), false, false).unwrap();
///
/// // 11 was drained behind 10
/// assert_eq!(store.last_seq(), Some(11));
/// assert_eq!(store.pop().map(|p| p.sequence()), Some(10));
/// ```
#[derive(Debug)]
pub struct SortedStore {
    // ---
    packets: BTreeMap<u64, RtpPacket>,
    unsorted: UnsortedBuffer,

    /// `(first, last)` extended sequences, `None` while empty
    window: Option<(u64, u64)>,

    /// Last packet inserted (survives pops)
    last_packet: Option<RtpPacket>,

    clock_rate: u32,

    /// 0 disables eviction
    max_entries: usize,

    /// Number of consecutive pairs folded into `avg_interval`
    interval_count: u64,

    /// Running mean of consecutive timestamp deltas
    avg_interval: Duration,

    /// Timestamp span between the first and the newest packet
    time_size: Duration,
}

impl SortedStore {
    // ---
    pub fn new(clock_rate: u32, max_entries: usize) -> Self {
        // ---
        Self {
            packets: BTreeMap::new(),
            unsorted: UnsortedBuffer::new(),
            window: None,
            last_packet: None,
            clock_rate: clock_rate.max(1),
            max_entries,
            interval_count: 0,
            avg_interval: Duration::ZERO,
            time_size: Duration::ZERO,
        }
    }

    pub fn unsorted(&self) -> &UnsortedBuffer {
        &self.unsorted
    }

    pub fn unsorted_mut(&mut self) -> &mut UnsortedBuffer {
        &mut self.unsorted
    }

    /// Inserts `p` and drains any contiguous run waiting in the unsorted
    /// buffer behind it.
    ///
    /// # Arguments
    ///
    /// * `force` - accept a packet older than `first`, rewinding the window
    /// * `accept_disorder` - accept a packet that is not `last + 1`
    ///
    /// # Errors
    ///
    /// Returns the reason the packet was refused; the store is unchanged.
    pub fn push(
        &mut self,
        p: RtpPacket,
        force: bool,
        accept_disorder: bool,
    ) -> Result<(), PushError> {
        // ---
        let seq = p.ext_seq();

        let (first, last) = match self.window {
            None => {
                if let Some(last) = &self.last_packet {
                    if last.ext_seq() >= seq {
                        return Err(PushError::Late {
                            last: last.ext_seq(),
                            got: seq,
                        });
                    }
                }
                (seq, seq)
            }
            Some((first, last)) => {
                if seq != last + 1 && !accept_disorder {
                    return Err(PushError::OutOfOrder {
                        expected: last + 1,
                        got: seq,
                    });
                }
                if seq < first && !force {
                    return Err(PushError::TooOld { first, got: seq });
                }
                if self.packets.contains_key(&seq) {
                    return Err(PushError::Duplicate(seq));
                }
                (first.min(seq), last.max(seq))
            }
        };

        self.insert(p);
        let mut last = last;
        while let Some(waiting) = self.unsorted.take(last.max(seq) + 1) {
            last = waiting.ext_seq();
            self.insert(waiting);
        }

        let mut first = first;
        if self.max_entries != 0 {
            while (last - first) as usize > self.max_entries {
                self.packets.remove(&first);
                first += 1;
            }
        }
        self.window = Some((first, last));

        self.adjust_time_size();
        Ok(())
    }

    /// Moves every unsorted packet into the store in ascending order.
    ///
    /// With `with_holes == false`, a packet that does not follow the
    /// current last one goes back to the unsorted buffer.
    pub fn push_all_unsorted(&mut self, with_holes: bool) {
        // ---
        for p in self.unsorted.drain_sorted() {
            let seq = p.ext_seq();
            let window = match self.window {
                None => (seq, seq),
                Some((_, last)) if !with_holes && seq != last + 1 => {
                    self.unsorted.put(p);
                    continue;
                }
                Some((first, last)) => (first.min(seq), last.max(seq)),
            };
            self.window = Some(window);
            self.insert(p);
        }

        self.adjust_time_size();
    }

    /// Removes and returns the oldest packet. Holes left by a flush with
    /// holes are skipped.
    pub fn pop(&mut self) -> Option<RtpPacket> {
        // ---
        let (first, last) = self.window?;
        let (&seq, _) = self.packets.range(first..).next()?;
        let p = self.packets.remove(&seq);

        self.window = if seq >= last {
            None
        } else {
            Some((seq + 1, last))
        };
        self.adjust_time_size();
        p
    }

    /// Drops everything, unsorted buffer included. `last_packet` is
    /// cleared too so a restart after a key frame is not refused as late.
    pub fn purge(&mut self) {
        // ---
        self.packets.clear();
        self.unsorted.purge();
        self.window = None;
        self.last_packet = None;
        self.time_size = Duration::ZERO;
    }

    pub fn get(&self, seq: u64) -> Option<&RtpPacket> {
        self.packets.get(&seq)
    }

    /// Oldest stored packet, the one [`SortedStore::pop`] would return.
    pub fn peek(&self) -> Option<&RtpPacket> {
        // ---
        let (first, _) = self.window?;
        self.packets.range(first..).next().map(|(_, p)| p)
    }

    pub fn last_packet(&self) -> Option<&RtpPacket> {
        self.last_packet.as_ref()
    }

    /// Lowest extended sequence of the window, `None` while empty.
    pub fn first_seq(&self) -> Option<u64> {
        self.window.map(|(first, _)| first)
    }

    /// Highest extended sequence of the window, `None` while empty.
    pub fn last_seq(&self) -> Option<u64> {
        self.window.map(|(_, last)| last)
    }

    /// `last - first`, the span (not the count) of stored sequences.
    pub fn size(&self) -> u64 {
        self.window.map_or(0, |(first, last)| last - first)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn avg_interval(&self) -> Duration {
        self.avg_interval
    }

    pub fn time_size(&self) -> Duration {
        self.time_size
    }

    /// Media time between two stored packets, negative if `end` is older.
    pub fn time_size_between(&self, start: u64, end: u64) -> Option<i64> {
        // ---
        let (s, e) = (self.packets.get(&start)?, self.packets.get(&end)?);
        Some(self.ts_delta_ns(s.ext_timestamp(), e.ext_timestamp()))
    }

    fn insert(&mut self, p: RtpPacket) {
        // ---
        if let Some(prev) = &self.last_packet {
            if p.ext_seq() == prev.ext_seq() + 1 {
                let interval = self.ts_delta_ns(prev.ext_timestamp(), p.ext_timestamp());
                self.adjust_avg_interval(interval);
            }
        }
        self.last_packet = Some(p.clone());
        self.packets.insert(p.ext_seq(), p);
    }

    fn ts_delta_ns(&self, from: u64, to: u64) -> i64 {
        // ---
        ((to as i128 - from as i128) * 1_000_000_000 / self.clock_rate as i128) as i64
    }

    /// Folds one consecutive-pair interval into the running mean. Pairs
    /// sharing a timestamp (fragments of one frame) are skipped.
    fn adjust_avg_interval(&mut self, interval: i64) {
        // ---
        if interval <= 0 {
            return;
        }
        let n = self.interval_count;
        let avg = (self.avg_interval.as_nanos() as u64 * n + interval as u64) / (n + 1);
        self.avg_interval = Duration::from_nanos(avg);
        self.interval_count += 1;
    }

    fn adjust_time_size(&mut self) {
        // ---
        let Some((first, _)) = self.window else {
            return;
        };
        let (Some((_, first)), Some(newest)) =
            (self.packets.range(first..).next(), &self.last_packet)
        else {
            return;
        };
        let ns = self.ts_delta_ns(first.ext_timestamp(), newest.ext_timestamp());
        self.time_size = Duration::from_nanos(ns.max(0) as u64);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    // 20 ms audio frames at 48 kHz
    fn packet(seq: u16) -> RtpPacket {
        RtpPacket::new(111, seq, seq as u32 * 960, 1, false, &[seq as u8])
    }

    #[test]
    fn test_push_contiguous() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        for seq in 10..15 {
            store.push(packet(seq), false, false).unwrap();
        }

        assert_eq!(store.first_seq(), Some(10));
        assert_eq!(store.last_seq(), Some(14));
        assert_eq!(store.size(), 4);
        assert_eq!(store.time_size(), Duration::from_millis(80));
        assert_eq!(store.avg_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_push_refuses_out_of_order() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        store.push(packet(10), false, false).unwrap();

        assert_eq!(
            store.push(packet(12), false, false),
            Err(PushError::OutOfOrder {
                expected: 11,
                got: 12
            })
        );
        assert!(store.push(packet(12), false, true).is_ok());
        assert_eq!(store.last_seq(), Some(12));
    }

    #[test]
    fn test_push_drains_unsorted_run() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        store.push(packet(10), false, false).unwrap();
        store.unsorted_mut().put(packet(12));
        store.unsorted_mut().put(packet(13));
        store.unsorted_mut().put(packet(15));

        store.push(packet(11), false, false).unwrap();
        assert_eq!(store.last_seq(), Some(13));
        assert_eq!(store.unsorted().len(), 1);
        assert!(store.unsorted().contains(15));
    }

    #[test]
    fn test_late_packet_after_pop_is_refused() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        store.push(packet(10), false, false).unwrap();
        assert!(store.pop().is_some());
        assert!(store.is_empty());

        assert_eq!(
            store.push(packet(9), false, false),
            Err(PushError::Late { last: 10, got: 9 })
        );
        assert!(store.push(packet(11), false, false).is_ok());
    }

    #[test]
    fn test_force_rewinds_window() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        store.push(packet(10), false, false).unwrap();
        assert!(matches!(
            store.push(packet(5), false, true),
            Err(PushError::TooOld { .. })
        ));
        store.push(packet(5), true, true).unwrap();
        assert_eq!(store.first_seq(), Some(5));
    }

    #[test]
    fn test_max_entries_evicts_oldest() {
        // ---
        let mut store = SortedStore::new(48_000, 3);
        for seq in 1..=6 {
            store.push(packet(seq), false, false).unwrap();
        }
        assert_eq!(store.size(), 3);
        assert_eq!(store.first_seq(), Some(3));
        assert!(store.get(2).is_none());
    }

    #[test]
    fn test_push_all_unsorted_with_and_without_holes() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        store.unsorted_mut().put(packet(20));
        store.unsorted_mut().put(packet(22));
        store.unsorted_mut().put(packet(21));
        store.unsorted_mut().put(packet(25));

        store.push_all_unsorted(false);
        assert_eq!((store.first_seq(), store.last_seq()), (Some(20), Some(22)));
        assert!(store.unsorted().contains(25));

        store.push_all_unsorted(true);
        assert_eq!(store.last_seq(), Some(25));
        assert!(store.unsorted().is_empty());

        let popped: Vec<u16> = std::iter::from_fn(|| store.pop()).map(|p| p.sequence()).collect();
        assert_eq!(popped, vec![20, 21, 22, 25]);
    }

    #[test]
    fn test_sequence_zero_is_a_real_packet() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        store.push(packet(0), false, false).unwrap();
        store.push(packet(1), false, false).unwrap();
        assert_eq!(store.pop().map(|p| p.sequence()), Some(0));
        assert_eq!(store.pop().map(|p| p.sequence()), Some(1));
        assert!(store.pop().is_none());
    }

    #[test]
    fn test_purge_resets_everything() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        store.push(packet(10), false, false).unwrap();
        store.unsorted_mut().put(packet(12));
        store.purge();

        assert!(store.is_empty());
        assert!(store.unsorted().is_empty());
        assert!(store.last_packet().is_none());
        // an older sequence is accepted again after a purge
        assert!(store.push(packet(3), false, false).is_ok());
    }

    #[test]
    fn test_time_size_between() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        for seq in 1..=3 {
            store.push(packet(seq), false, false).unwrap();
        }
        assert_eq!(store.time_size_between(1, 3), Some(40_000_000));
        assert_eq!(store.time_size_between(3, 1), Some(-40_000_000));
        assert_eq!(store.time_size_between(1, 9), None);
    }

    #[test]
    fn test_avg_interval_survives_pops() {
        // ---
        let mut store = SortedStore::new(48_000, 0);
        for seq in 1..=4 {
            store.push(packet(seq), false, false).unwrap();
            assert!(store.pop().is_some());
        }
        assert_eq!(store.avg_interval(), Duration::from_millis(20));
        assert!(store.peek().is_none());
    }
}
