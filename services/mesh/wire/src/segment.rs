//! Segmentation and reassembly (SAR) of payloads larger than the link MTU.
//!
//! Every payload sent over the link travels as one or more fragments, each
//! prefixed with a 16-byte fragment header:
//!
//! ```text
//! +----------+---------+--------+--------+------------+----------+---------+
//! | originId | groupId | index  | count  | payloadLen | crc32    | payload |
//! | u32 BE   | u16 BE  | u16 BE | u16 BE | u16 BE     | u32 BE   | ...     |
//! +----------+---------+--------+--------+------------+----------+---------+
//! ```
//!
//! Fragments of one group may arrive in any order and more than once; the
//! [`Reassembler`] keys groups by `(originId, groupId)` and emits a payload
//! exactly once when every index is present.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::WireError;

/// Fragment header size in bytes
pub const FRAGMENT_HEADER_SIZE: usize = 16;

/// Smallest MTU accepted by the segmenter
pub const MIN_MTU: usize = 64;

/// Maximum number of fragments in one group
pub const MAX_FRAGMENT_COUNT: usize = 255;

/// Identifies one reassembly group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// Sending node
    pub origin_id: u32,
    /// Per-sender group counter
    pub group_id: u16,
}

/// One link-sized piece of a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Sending node
    pub origin_id: u32,
    /// Group this fragment belongs to
    pub group_id: u16,
    /// 0-based position in the group
    pub index: u16,
    /// Total fragments in the group
    pub count: u16,
    /// Fragment payload
    pub bytes: Bytes,
}

impl Fragment {
    /// Reassembly key for this fragment
    pub fn key(&self) -> GroupKey {
        GroupKey {
            origin_id: self.origin_id,
            group_id: self.group_id,
        }
    }

    /// Encoded size (header plus payload)
    pub fn encoded_size(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.bytes.len()
    }

    /// Encode the fragment to bytes (big-endian)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u32(self.origin_id);
        buf.put_u16(self.group_id);
        buf.put_u16(self.index);
        buf.put_u16(self.count);
        buf.put_u16(self.bytes.len() as u16);
        buf.put_u32(crc32fast::hash(&self.bytes));
        buf.put_slice(&self.bytes);
        buf.freeze()
    }

    /// Decode a fragment from one complete link frame
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return Err(WireError::MalformedFragment("short header"));
        }

        let origin_id = buf.get_u32();
        let group_id = buf.get_u16();
        let index = buf.get_u16();
        let count = buf.get_u16();
        let payload_len = buf.get_u16() as usize;
        let crc = buf.get_u32();

        if count == 0 {
            return Err(WireError::MalformedFragment("zero count"));
        }
        if index >= count {
            return Err(WireError::MalformedFragment("index out of range"));
        }
        if payload_len != buf.len() {
            return Err(WireError::MalformedFragment("length mismatch"));
        }
        if crc32fast::hash(&buf) != crc {
            return Err(WireError::FragmentChecksum);
        }

        Ok(Self {
            origin_id,
            group_id,
            index,
            count,
            bytes: buf,
        })
    }
}

/// Splits payloads into fragments for one sending node
#[derive(Debug)]
pub struct Segmenter {
    origin_id: u32,
    next_group_id: u16,
}

impl Segmenter {
    /// Create a segmenter whose group counter starts at a random value
    pub fn new(origin_id: u32) -> Self {
        Self::with_first_group(origin_id, rand::random())
    }

    /// Create a segmenter with a fixed first group id
    pub fn with_first_group(origin_id: u32, first_group_id: u16) -> Self {
        Self {
            origin_id,
            next_group_id: first_group_id,
        }
    }

    /// Sending node
    pub fn origin_id(&self) -> u32 {
        self.origin_id
    }

    /// Split a payload into fragments no larger than `mtu` once encoded.
    ///
    /// Fails before consuming a group id, so a rejected payload never
    /// produces partial output.
    pub fn segment(&mut self, payload: Bytes, mtu: usize) -> Result<Segments, WireError> {
        if mtu < MIN_MTU {
            return Err(WireError::MtuTooSmall(mtu));
        }

        // Encoded payload length must fit the u16 length field
        let chunk_size = (mtu - FRAGMENT_HEADER_SIZE).min(u16::MAX as usize);
        let count = if payload.is_empty() {
            1
        } else {
            (payload.len() + chunk_size - 1) / chunk_size
        };

        if count > MAX_FRAGMENT_COUNT {
            return Err(WireError::PayloadTooLarge {
                len: payload.len(),
                count,
                max: MAX_FRAGMENT_COUNT,
            });
        }

        let group_id = self.next_group_id;
        self.next_group_id = self.next_group_id.wrapping_add(1);

        debug!(
            "Segmenting {}b into {} fragment(s) (group {}, mtu {})",
            payload.len(),
            count,
            group_id,
            mtu
        );

        Ok(Segments {
            origin_id: self.origin_id,
            group_id,
            count: count as u16,
            chunk_size,
            payload,
            next: 0,
        })
    }
}

/// Lazily produced fragments of one group, in ascending index order.
///
/// Cloning yields an independent iterator from the same position, and
/// [`Segments::restart`] rewinds to the first fragment.
#[derive(Debug, Clone)]
pub struct Segments {
    origin_id: u32,
    group_id: u16,
    count: u16,
    chunk_size: usize,
    payload: Bytes,
    next: u16,
}

impl Segments {
    /// Group id assigned to this payload
    pub fn group_id(&self) -> u16 {
        self.group_id
    }

    /// Total fragments in the group
    pub fn fragment_count(&self) -> u16 {
        self.count
    }

    /// Rewind to the first fragment
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for Segments {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        if self.next >= self.count {
            return None;
        }

        let index = self.next;
        self.next += 1;

        let start = (index as usize * self.chunk_size).min(self.payload.len());
        let end = (start + self.chunk_size).min(self.payload.len());

        Some(Fragment {
            origin_id: self.origin_id,
            group_id: self.group_id,
            index,
            count: self.count,
            bytes: self.payload.slice(start..end),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.count - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Segments {}

/// Partially received payload
#[derive(Debug)]
struct ReassemblyGroup {
    fragments: BTreeMap<u16, Bytes>,
    count: u16,
    created: Instant,
}

impl ReassemblyGroup {
    fn is_complete(&self) -> bool {
        self.fragments.len() == self.count as usize
    }

    fn concat(self) -> Bytes {
        let len = self.fragments.values().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(len);
        for bytes in self.fragments.into_values() {
            buf.put_slice(&bytes);
        }
        buf.freeze()
    }
}

/// Result of a periodic sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Groups discarded because they outlived the timeout
    pub expired: Vec<GroupKey>,
}

/// Collects fragments into complete payloads
#[derive(Debug)]
pub struct Reassembler {
    groups: HashMap<GroupKey, ReassemblyGroup>,
    // Delivered or evicted groups; late fragments for these are ignored
    retired: HashMap<GroupKey, Instant>,
    max_groups: usize,
    evicted: u64,
}

impl Reassembler {
    /// Create a reassembler buffering at most `max_groups` groups
    pub fn new(max_groups: usize) -> Self {
        Self {
            groups: HashMap::new(),
            retired: HashMap::new(),
            max_groups: max_groups.max(1),
            evicted: 0,
        }
    }

    /// Number of groups currently buffered
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Take the number of groups evicted for capacity since the last call
    pub fn take_evicted(&mut self) -> u64 {
        std::mem::take(&mut self.evicted)
    }

    /// Store a fragment; returns the payload when its group completes
    pub fn on_fragment(&mut self, fragment: Fragment, now: Instant) -> Option<Bytes> {
        let key = fragment.key();

        if self.retired.contains_key(&key) {
            debug!(
                "Ignoring late fragment {}/{} of retired group {:?}",
                fragment.index, fragment.count, key
            );
            return None;
        }

        if !self.groups.contains_key(&key) && self.groups.len() >= self.max_groups {
            self.evict_oldest(now);
        }

        let group = self.groups.entry(key).or_insert_with(|| ReassemblyGroup {
            fragments: BTreeMap::new(),
            count: fragment.count,
            created: now,
        });

        if group.count != fragment.count {
            warn!(
                "Discarding fragment for group {:?}: count {} disagrees with {}",
                key, fragment.count, group.count
            );
            return None;
        }

        // Duplicates overwrite; completion depends only on the index set
        group.fragments.insert(fragment.index, fragment.bytes);

        if !group.is_complete() {
            return None;
        }

        let group = self.groups.remove(&key)?;
        self.retired.insert(key, now);
        let payload = group.concat();
        debug!("Reassembled {}b from group {:?}", payload.len(), key);
        Some(payload)
    }

    /// Discard groups older than `timeout`; each one is reported once
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> SweepReport {
        let mut expired = Vec::new();
        self.groups.retain(|key, group| {
            let alive = now.saturating_duration_since(group.created) < timeout;
            if !alive {
                warn!(
                    "Reassembly timed out for group {:?} ({}/{} fragments)",
                    key,
                    group.fragments.len(),
                    group.count
                );
                expired.push(*key);
            }
            alive
        });

        self.retired
            .retain(|_, since| now.saturating_duration_since(*since) < timeout);

        expired.sort();
        SweepReport { expired }
    }

    fn evict_oldest(&mut self, now: Instant) {
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.created)
            .map(|(key, _)| *key);

        if let Some(key) = oldest {
            warn!("Reassembly buffer full, evicting group {:?}", key);
            self.groups.remove(&key);
            self.retired.insert(key, now);
            self.evicted += 1;
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn over_the_wire(fragments: impl IntoIterator<Item = Fragment>) -> Vec<Fragment> {
        fragments
            .into_iter()
            .map(|f| Fragment::decode(f.encode()).unwrap())
            .collect()
    }

    #[test]
    fn test_five_thousand_bytes_five_fragments() {
        let data = payload(5000);
        let mut segmenter = Segmenter::with_first_group(1, 0);
        let segments = segmenter
            .segment(data.clone(), 1000 + FRAGMENT_HEADER_SIZE)
            .unwrap();
        assert_eq!(segments.len(), 5);

        let fragments = over_the_wire(segments);
        assert!(fragments
            .iter()
            .all(|f| f.encoded_size() <= 1000 + FRAGMENT_HEADER_SIZE));

        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let mut out = None;
        for fragment in fragments {
            assert!(out.is_none());
            out = reassembler.on_fragment(fragment, now);
        }
        assert_eq!(out.unwrap(), data);
        assert_eq!(reassembler.pending_groups(), 0);
    }

    #[test]
    fn test_mtu_counts_fragment_header() {
        let mut segmenter = Segmenter::with_first_group(1, 0);
        let segments = segmenter.segment(payload(5000), 1000).unwrap();
        // 984 payload bytes per fragment
        assert_eq!(segments.fragment_count(), 6);
        assert_eq!(segments.len(), 6);
    }

    #[test]
    fn test_reversed_order() {
        let data = payload(3000);
        let mut segmenter = Segmenter::with_first_group(2, 10);
        let mut fragments = over_the_wire(segmenter.segment(data.clone(), 256).unwrap());
        fragments.reverse();

        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let results: Vec<Bytes> = fragments
            .into_iter()
            .filter_map(|f| reassembler.on_fragment(f, now))
            .collect();
        assert_eq!(results, vec![data]);
    }

    #[test]
    fn test_interleaved_groups_and_origins() {
        let a = payload(700);
        let b = Bytes::from(vec![0xAB; 650]);
        let c = Bytes::from(vec![0xCD; 400]);

        let mut seg_one = Segmenter::with_first_group(1, 5);
        let mut seg_two = Segmenter::with_first_group(2, 5);
        let fa = over_the_wire(seg_one.segment(a.clone(), 128).unwrap());
        let fb = over_the_wire(seg_one.segment(b.clone(), 128).unwrap());
        let fc = over_the_wire(seg_two.segment(c.clone(), 128).unwrap());

        // Round-robin the three groups, odd indices first
        let mut mixed = Vec::new();
        let longest = fa.len().max(fb.len()).max(fc.len());
        for pass in [1usize, 0] {
            let mut i = pass;
            while i < longest {
                for group in [&fa, &fb, &fc] {
                    if let Some(f) = group.get(i) {
                        mixed.push(f.clone());
                    }
                }
                i += 2;
            }
        }

        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let mut results: Vec<Bytes> = mixed
            .into_iter()
            .filter_map(|f| reassembler.on_fragment(f, now))
            .collect();
        results.sort();

        let mut expected = vec![a, b, c];
        expected.sort();
        assert_eq!(results, expected);
    }

    #[test]
    fn test_duplicate_fragment_idempotent() {
        let data = payload(500);
        let mut segmenter = Segmenter::with_first_group(3, 0);
        let fragments = over_the_wire(segmenter.segment(data.clone(), 200).unwrap());
        assert_eq!(fragments.len(), 3);

        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        assert!(reassembler.on_fragment(fragments[0].clone(), now).is_none());
        assert!(reassembler.on_fragment(fragments[0].clone(), now).is_none());
        assert!(reassembler.on_fragment(fragments[1].clone(), now).is_none());
        assert_eq!(
            reassembler.on_fragment(fragments[2].clone(), now),
            Some(data)
        );

        // Late copies after completion neither complete again nor linger
        assert!(reassembler.on_fragment(fragments[2].clone(), now).is_none());
        assert!(reassembler.on_fragment(fragments[1].clone(), now).is_none());
        assert_eq!(reassembler.pending_groups(), 0);
    }

    #[test]
    fn test_two_of_three_then_third() {
        let parts = [
            Bytes::from_static(b"alpha-"),
            Bytes::from_static(b"bravo-"),
            Bytes::from_static(b"charlie"),
        ];
        let fragment = |index: u16| Fragment {
            origin_id: 1,
            group_id: 77,
            index,
            count: 3,
            bytes: parts[index as usize].clone(),
        };

        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        assert!(reassembler.on_fragment(fragment(0), now).is_none());
        assert!(reassembler.on_fragment(fragment(1), now).is_none());
        assert_eq!(
            reassembler.on_fragment(fragment(2), now).unwrap(),
            Bytes::from_static(b"alpha-bravo-charlie")
        );
    }

    #[test]
    fn test_sweep_reports_each_group_once() {
        let mut reassembler = Reassembler::default();
        let start = Instant::now();
        let lone = Fragment {
            origin_id: 9,
            group_id: 1,
            index: 0,
            count: 2,
            bytes: Bytes::from_static(b"half"),
        };
        assert!(reassembler.on_fragment(lone, start).is_none());

        let timeout = Duration::from_secs(5);
        let early = reassembler.sweep_expired(start + Duration::from_secs(1), timeout);
        assert!(early.expired.is_empty());

        let late = reassembler.sweep_expired(start + Duration::from_secs(6), timeout);
        assert_eq!(
            late.expired,
            vec![GroupKey {
                origin_id: 9,
                group_id: 1
            }]
        );

        let again = reassembler.sweep_expired(start + Duration::from_secs(12), timeout);
        assert!(again.expired.is_empty());
        assert_eq!(reassembler.pending_groups(), 0);
    }

    #[test]
    fn test_completed_keys_forgotten_after_timeout() {
        let mut reassembler = Reassembler::default();
        let start = Instant::now();
        let single = Fragment {
            origin_id: 4,
            group_id: 8,
            index: 0,
            count: 1,
            bytes: Bytes::from_static(b"one"),
        };
        assert!(reassembler.on_fragment(single.clone(), start).is_some());
        assert!(reassembler.on_fragment(single.clone(), start).is_none());

        reassembler.sweep_expired(start + Duration::from_secs(10), Duration::from_secs(5));
        // Group id reuse after the window is a new payload
        assert!(reassembler
            .on_fragment(single, start + Duration::from_secs(10))
            .is_some());
    }

    #[test]
    fn test_count_mismatch_discarded() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let first = Fragment {
            origin_id: 1,
            group_id: 2,
            index: 0,
            count: 2,
            bytes: Bytes::from_static(b"a"),
        };
        let liar = Fragment {
            index: 1,
            count: 3,
            ..first.clone()
        };
        assert!(reassembler.on_fragment(first, now).is_none());
        assert!(reassembler.on_fragment(liar, now).is_none());
        assert_eq!(reassembler.pending_groups(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut reassembler = Reassembler::new(2);
        let start = Instant::now();
        for (i, group_id) in [1u16, 2, 3].into_iter().enumerate() {
            let fragment = Fragment {
                origin_id: 1,
                group_id,
                index: 0,
                count: 2,
                bytes: Bytes::from_static(b"x"),
            };
            reassembler.on_fragment(fragment, start + Duration::from_millis(i as u64));
        }
        assert_eq!(reassembler.pending_groups(), 2);
        assert_eq!(reassembler.take_evicted(), 1);
        assert_eq!(reassembler.take_evicted(), 0);
    }

    #[test]
    fn test_evicted_group_dropped_once() {
        let mut reassembler = Reassembler::new(1);
        let start = Instant::now();
        let timeout = Duration::from_secs(5);
        let fragment = |group_id: u16, index: u16| Fragment {
            origin_id: 1,
            group_id,
            index,
            count: 2,
            bytes: Bytes::from_static(b"x"),
        };

        assert!(reassembler.on_fragment(fragment(1, 0), start).is_none());
        // Group 2 pushes group 1 out
        assert!(reassembler.on_fragment(fragment(2, 0), start).is_none());
        assert_eq!(reassembler.take_evicted(), 1);

        // A straggler of group 1 must not start a fresh group
        assert!(reassembler
            .on_fragment(fragment(1, 1), start + Duration::from_millis(10))
            .is_none());
        assert_eq!(reassembler.take_evicted(), 0);
        assert_eq!(reassembler.pending_groups(), 1);

        let report = reassembler.sweep_expired(start + Duration::from_secs(6), timeout);
        assert_eq!(
            report.expired,
            vec![GroupKey {
                origin_id: 1,
                group_id: 2
            }]
        );
        assert_eq!(reassembler.take_evicted(), 0);
    }

    #[test]
    fn test_payload_too_large_consumes_nothing() {
        let mut segmenter = Segmenter::with_first_group(1, 40);
        let mtu = MIN_MTU;
        let per_fragment = mtu - FRAGMENT_HEADER_SIZE;
        let too_big = payload(per_fragment * MAX_FRAGMENT_COUNT + 1);

        match segmenter.segment(too_big, mtu) {
            Err(WireError::PayloadTooLarge { count, max, .. }) => {
                assert_eq!(count, MAX_FRAGMENT_COUNT + 1);
                assert_eq!(max, MAX_FRAGMENT_COUNT);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let next = segmenter.segment(payload(10), mtu).unwrap();
        assert_eq!(next.group_id(), 40);
    }

    #[test]
    fn test_max_fragment_count_accepted() {
        let mut segmenter = Segmenter::with_first_group(1, 0);
        let per_fragment = MIN_MTU - FRAGMENT_HEADER_SIZE;
        let segments = segmenter
            .segment(payload(per_fragment * MAX_FRAGMENT_COUNT), MIN_MTU)
            .unwrap();
        assert_eq!(segments.len(), MAX_FRAGMENT_COUNT);
    }

    #[test]
    fn test_mtu_too_small() {
        let mut segmenter = Segmenter::new(1);
        assert_eq!(
            segmenter.segment(payload(10), MIN_MTU - 1).unwrap_err(),
            WireError::MtuTooSmall(MIN_MTU - 1)
        );
    }

    #[test]
    fn test_group_id_wraps() {
        let mut segmenter = Segmenter::with_first_group(1, u16::MAX);
        assert_eq!(segmenter.segment(payload(1), 128).unwrap().group_id(), u16::MAX);
        assert_eq!(segmenter.segment(payload(1), 128).unwrap().group_id(), 0);
    }

    #[test]
    fn test_empty_payload_single_fragment() {
        let mut segmenter = Segmenter::with_first_group(1, 0);
        let fragments: Vec<_> = segmenter.segment(Bytes::new(), 128).unwrap().collect();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].bytes.is_empty());

        let mut reassembler = Reassembler::default();
        assert_eq!(
            reassembler.on_fragment(fragments[0].clone(), Instant::now()),
            Some(Bytes::new())
        );
    }

    #[test]
    fn test_segments_restartable() {
        let mut segmenter = Segmenter::with_first_group(1, 0);
        let mut segments = segmenter.segment(payload(300), 128).unwrap();
        let copy = segments.clone();

        let first_pass: Vec<_> = segments.by_ref().collect();
        assert_eq!(segments.len(), 0);
        segments.restart();
        let second_pass: Vec<_> = segments.collect();
        let cloned_pass: Vec<_> = copy.collect();

        assert_eq!(first_pass, second_pass);
        assert_eq!(first_pass, cloned_pass);
        assert!(first_pass.windows(2).all(|w| w[0].index + 1 == w[1].index));
    }

    #[test]
    fn test_fragment_decode_rejects_corruption() {
        let fragment = Fragment {
            origin_id: 1,
            group_id: 2,
            index: 0,
            count: 1,
            bytes: Bytes::from_static(b"payload"),
        };
        let encoded = fragment.encode();

        let mut flipped = encoded.to_vec();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert_eq!(
            Fragment::decode(Bytes::from(flipped)),
            Err(WireError::FragmentChecksum)
        );

        assert_eq!(
            Fragment::decode(encoded.slice(..encoded.len() - 1)),
            Err(WireError::MalformedFragment("length mismatch"))
        );
        assert_eq!(
            Fragment::decode(encoded.slice(..8)),
            Err(WireError::MalformedFragment("short header"))
        );

        let mut bad_index = encoded.to_vec();
        bad_index[6..8].copy_from_slice(&1u16.to_be_bytes());
        assert_eq!(
            Fragment::decode(Bytes::from(bad_index)),
            Err(WireError::MalformedFragment("index out of range"))
        );

        let mut zero_count = encoded.to_vec();
        zero_count[8..10].copy_from_slice(&0u16.to_be_bytes());
        assert_eq!(
            Fragment::decode(Bytes::from(zero_count)),
            Err(WireError::MalformedFragment("zero count"))
        );
    }
}
