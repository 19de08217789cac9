//! Inbound IPv6 fragment reassembly: keyed multi-fragment state with
//! poisoning on inconsistent overlaps, bounded memory, and a timeout sweep.

use crate::logger::{self, BreadcrumbFlags};
use crate::tracker::Tracker;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use crate::proto::ip6_frag::IP6_FRAG_MAX_DATAGRAM;

/// One logical datagram across its fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragKey {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub id: u32,
    pub next: u8,
}

struct FragEntry {
    created_at: Instant,
    last_touched: Instant,
    /// Offset → payload bytes, kept ordered for the final splice.
    frags: BTreeMap<usize, Vec<u8>>,
    last_seen: bool,
    total_len: usize,
    buffered: usize,
    poisoned: bool,
    /// Tracker of the first fragment seen, parent of the reassembled frame.
    tracker: Tracker,
}

impl FragEntry {
    fn new(now: Instant, tracker: Tracker) -> Self {
        Self {
            created_at: now,
            last_touched: now,
            frags: BTreeMap::new(),
            last_seen: false,
            total_len: 0,
            buffered: 0,
            poisoned: false,
            tracker,
        }
    }

    fn is_complete(&self) -> bool {
        if !self.last_seen || self.poisoned {
            return false;
        }
        let mut cursor = 0;
        for (&offset, data) in &self.frags {
            if offset != cursor {
                return false;
            }
            cursor += data.len();
        }
        cursor == self.total_len
    }
}

/// Result of pushing one fragment into the table.
#[derive(Debug, PartialEq, Eq)]
pub enum FragPush {
    /// Recorded; datagram still incomplete.
    Stored,
    /// Exact duplicate of a recorded fragment; ignored.
    Duplicate,
    /// Entry now covers the whole datagram.
    Complete {
        next: u8,
        payload: Vec<u8>,
        tracker: Tracker,
    },
    /// Inconsistent overlap; the entry is poisoned until the sweep.
    Poisoned,
    /// Fragment claims bytes past the 65535-byte datagram cap.
    TooBig,
    /// Table limits reached; fragment discarded.
    ResourceLimit,
}

/// Sweep output for one expired entry. `quote` holds the head of the
/// datagram when the offset-0 fragment had arrived; only then is a Time
/// Exceeded owed to the source (RFC 2460 §4.5).
#[derive(Debug)]
pub struct ReassemblyTimeout {
    pub key: FragKey,
    pub quote: Option<Vec<u8>>,
    pub tracker: Tracker,
}

pub struct ReassemblyTable {
    entries: FxHashMap<FragKey, FragEntry>,
    timeout: Duration,
    max_entries: usize,
    max_bytes: usize,
    total_bytes: usize,
}

impl ReassemblyTable {
    pub fn new(timeout: Duration, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            timeout,
            max_entries: max_entries.max(1),
            max_bytes,
            total_bytes: 0,
        }
    }

    /// Record one fragment. `offset` is in bytes (already expanded from
    /// wire units); `more` is the M flag; `tracker` is the carrying
    /// frame's tracker.
    pub fn push(
        &mut self,
        key: FragKey,
        offset: usize,
        more: bool,
        payload: &[u8],
        tracker: &Tracker,
        now: Instant,
    ) -> FragPush {
        if offset + payload.len() > IP6_FRAG_MAX_DATAGRAM {
            return FragPush::TooBig;
        }
        if !self.entries.contains_key(&key) {
            if self.total_bytes + payload.len() > self.max_bytes {
                return FragPush::ResourceLimit;
            }
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
            self.entries
                .insert(key, FragEntry::new(now, tracker.clone()));
            logger::breadcrumb(
                BreadcrumbFlags::FRAG,
                format!(
                    "{tracker} - new reassembly entry {} -> {} id {:#010x} next {}",
                    key.src, key.dst, key.id, key.next
                ),
            );
        }
        let entry = self.entries.get_mut(&key).expect("entry just ensured");
        entry.last_touched = now;
        if entry.poisoned {
            return FragPush::Poisoned;
        }
        if self.total_bytes + payload.len() > self.max_bytes {
            return FragPush::ResourceLimit;
        }

        // Overlap scan against recorded coverage.
        for (&have_offset, have) in &entry.frags {
            let overlaps = offset < have_offset + have.len() && have_offset < offset + payload.len();
            if !overlaps {
                continue;
            }
            if have_offset == offset && have.len() == payload.len() && have == payload {
                return FragPush::Duplicate;
            }
            entry.poisoned = true;
            logger::warn(format!(
                "reassembly entry {} id {:#010x} poisoned by overlapping fragment at {offset}",
                key.src, key.id
            ));
            return FragPush::Poisoned;
        }

        if !more {
            entry.last_seen = true;
            entry.total_len = offset + payload.len();
        }
        entry.frags.insert(offset, payload.to_vec());
        entry.buffered += payload.len();
        self.total_bytes += payload.len();

        if entry.is_complete() {
            let entry = self.entries.remove(&key).expect("complete entry present");
            self.total_bytes -= entry.buffered;
            let mut payload = Vec::with_capacity(entry.total_len);
            for data in entry.frags.values() {
                payload.extend_from_slice(data);
            }
            logger::breadcrumb(
                BreadcrumbFlags::FRAG,
                format!(
                    "{} - reassembled {} bytes, id {:#010x}",
                    entry.tracker,
                    payload.len(),
                    key.id
                ),
            );
            return FragPush::Complete {
                next: key.next,
                payload,
                tracker: entry.tracker,
            };
        }
        FragPush::Stored
    }

    /// Remove entries older than the timeout. Returns one event per
    /// expired entry; the quote is present only when the offset-0
    /// fragment had arrived and the entry was not poisoned.
    pub fn sweep(&mut self, now: Instant) -> Vec<ReassemblyTimeout> {
        let expired: SmallVec<[FragKey; 8]> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                now.saturating_duration_since(entry.created_at) >= self.timeout
            })
            .map(|(key, _)| *key)
            .collect();
        let mut events = Vec::new();
        for key in expired {
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            self.total_bytes -= entry.buffered;
            logger::breadcrumb(
                BreadcrumbFlags::FRAG,
                format!(
                    "{} - reassembly timeout for {} id {:#010x}",
                    entry.tracker, key.src, key.id
                ),
            );
            let quote = if entry.poisoned {
                None
            } else {
                entry.frags.get(&0).cloned()
            };
            events.push(ReassemblyTimeout {
                key,
                quote,
                tracker: entry.tracker,
            });
        }
        events
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_touched)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            if let Some(entry) = self.entries.remove(&key) {
                self.total_bytes -= entry.buffered;
                logger::breadcrumb(
                    BreadcrumbFlags::FRAG,
                    format!("evicted reassembly entry for {} id {:#010x}", key.src, key.id),
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::PROTO_UDP;
    use crate::tracker::TrackerPrefix;

    fn key(id: u32) -> FragKey {
        FragKey {
            src: "2001:db8::1".parse().unwrap(),
            dst: "2001:db8::2".parse().unwrap(),
            id,
            next: PROTO_UDP,
        }
    }

    fn table() -> ReassemblyTable {
        ReassemblyTable::new(Duration::from_secs(30), 4, 1024)
    }

    fn tracker() -> Tracker {
        Tracker::new(TrackerPrefix::Rx)
    }

    #[test]
    fn in_order_completion() {
        let mut table = table();
        let now = Instant::now();
        let tk = tracker();
        assert_eq!(
            table.push(key(1), 0, true, &[1; 16], &tk, now),
            FragPush::Stored
        );
        match table.push(key(1), 16, false, &[2; 5], &tk, now) {
            FragPush::Complete { next, payload, .. } => {
                assert_eq!(next, PROTO_UDP);
                assert_eq!(payload.len(), 21);
                assert_eq!(&payload[..16], &[1; 16]);
                assert_eq!(&payload[16..], &[2; 5]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(table.is_empty());
        assert_eq!(table.buffered_bytes(), 0);
    }

    #[test]
    fn reverse_order_completion() {
        let mut table = table();
        let now = Instant::now();
        let tk = tracker();
        assert_eq!(
            table.push(key(2), 16, false, &[9; 4], &tk, now),
            FragPush::Stored
        );
        assert_eq!(
            table.push(key(2), 8, true, &[8; 8], &tk, now),
            FragPush::Stored
        );
        match table.push(key(2), 0, true, &[7; 8], &tk, now) {
            FragPush::Complete { payload, .. } => {
                assert_eq!(payload.len(), 20);
                assert_eq!(&payload[..8], &[7; 8]);
                assert_eq!(&payload[8..16], &[8; 8]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn gap_prevents_completion() {
        let mut table = table();
        let now = Instant::now();
        let tk = tracker();
        table.push(key(3), 0, true, &[0; 8], &tk, now);
        // Offset 8 missing.
        assert_eq!(
            table.push(key(3), 16, false, &[0; 4], &tk, now),
            FragPush::Stored
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn exact_duplicate_ignored() {
        let mut table = table();
        let now = Instant::now();
        let tk = tracker();
        table.push(key(4), 0, true, &[5; 8], &tk, now);
        assert_eq!(
            table.push(key(4), 0, true, &[5; 8], &tk, now),
            FragPush::Duplicate
        );
        assert_eq!(table.buffered_bytes(), 8);
    }

    #[test]
    fn inconsistent_overlap_poisons_entry() {
        let mut table = table();
        let now = Instant::now();
        let tk = tracker();
        table.push(key(5), 0, true, &[5; 16], &tk, now);
        assert_eq!(
            table.push(key(5), 8, true, &[6; 8], &tk, now),
            FragPush::Poisoned
        );
        // Even a well-formed follow-up is discarded.
        assert_eq!(
            table.push(key(5), 16, false, &[5; 4], &tk, now),
            FragPush::Poisoned
        );
        // Poisoned entries expire without a quotable notification.
        let events = table.sweep(now + Duration::from_secs(31));
        assert_eq!(events.len(), 1);
        assert!(events[0].quote.is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn oversized_fragment_rejected() {
        let mut table = table();
        let now = Instant::now();
        let tk = tracker();
        assert_eq!(
            table.push(key(6), 65528, true, &[0; 16], &tk, now),
            FragPush::TooBig
        );
        assert!(table.is_empty());
    }

    #[test]
    fn byte_cap_rejects_fragment() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30), 4, 16);
        let now = Instant::now();
        let tk = tracker();
        assert_eq!(table.push(key(7), 0, true, &[0; 16], &tk, now), FragPush::Stored);
        assert_eq!(
            table.push(key(8), 0, true, &[0; 8], &tk, now),
            FragPush::ResourceLimit
        );
    }

    #[test]
    fn entry_cap_evicts_least_recently_touched() {
        let mut table = ReassemblyTable::new(Duration::from_secs(30), 2, 1024);
        let start = Instant::now();
        let tk = tracker();
        table.push(key(10), 0, true, &[0; 8], &tk, start);
        table.push(key(11), 0, true, &[0; 8], &tk, start + Duration::from_millis(10));
        table.push(key(12), 0, true, &[0; 8], &tk, start + Duration::from_millis(20));
        assert_eq!(table.len(), 2);
        // key(10) was oldest; its slot is gone, the others remain.
        table.push(key(11), 8, true, &[0; 8], &tk, start + Duration::from_millis(30));
        assert_eq!(table.len(), 2);
        assert_eq!(table.buffered_bytes(), 24);
    }

    #[test]
    fn timeout_quote_requires_first_fragment() {
        let mut table = table();
        let start = Instant::now();
        let tk = tracker();
        table.push(key(20), 0, true, &[1; 8], &tk, start);
        table.push(key(21), 8, true, &[2; 8], &tk, start);
        let mut events = table.sweep(start + Duration::from_secs(31));
        events.sort_by_key(|event| event.key.id);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].quote.as_deref(), Some(&[1u8; 8][..]));
        assert_eq!(events[1].quote, None);
        assert!(table.is_empty());
    }
}
