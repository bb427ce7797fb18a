//! Reassembly of fragmented transfers.
//!
//! A [`Reassembler`] belongs to exactly one connection, so fragments from
//! different peers never mix. Each transfer is keyed by its [`TransferId`]
//! and owns a zeroed buffer of the declared total length. Chunks are placed
//! by absolute offset and may arrive in any order.
//!
//! Completion is judged by coverage, not by a running byte count: the
//! covered ranges are kept as a merged interval set, so a duplicated or
//! overlapping chunk never pushes a transfer over the line early.
//!
//! Transfers whose sender vanishes mid-stream are reclaimed by
//! [`Reassembler::evict_stale`]. A [`ReassemblyBudget`] bounds how many
//! transfers one peer may keep open and how much memory they pin.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::fragment::{Fragment, TransferId};

/// Largest total length a single transfer may declare.
pub const MAX_TRANSFER_LENGTH: u64 = i32::MAX as u64;

/// Limits on what one connection may hold in reassembly at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyBudget {
    /// Concurrent transfers.
    pub max_transfers: usize,
    /// Sum of the declared lengths of all open transfers.
    pub max_buffered_bytes: u64,
}

impl Default for ReassemblyBudget {
    fn default() -> Self {
        Self {
            max_transfers: 64,
            max_buffered_bytes: MAX_TRANSFER_LENGTH,
        }
    }
}

/// Errors produced while adding fragments.
#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    /// Total length outside `(0, MAX_TRANSFER_LENGTH]`.
    #[error("invalid transfer total length {0}")]
    InvalidTotalLength(u64),

    /// The chunk does not fit inside the transfer buffer.
    #[error("chunk [{offset}, +{len}) out of bounds for transfer of {total} bytes")]
    ChunkOutOfBounds {
        /// Chunk offset.
        offset: u64,
        /// Chunk length.
        len: usize,
        /// Transfer total length.
        total: u64,
    },

    /// A later fragment disagreed with the first about the total length.
    #[error("transfer {id} declared total length {declared}, expected {expected}")]
    TotalLengthMismatch {
        /// Transfer in question.
        id: TransferId,
        /// Length carried by the offending fragment.
        declared: u64,
        /// Length recorded from the first fragment.
        expected: u64,
    },

    /// Starting this transfer would exceed the connection's budget.
    #[error("transfer of {total} bytes refused: {open} open, {buffered} bytes buffered")]
    BudgetExceeded {
        /// Declared length of the refused transfer.
        total: u64,
        /// Transfers already open.
        open: usize,
        /// Bytes already held.
        buffered: u64,
    },
}

struct PendingTransfer {
    buffer: Vec<u8>,
    /// Covered byte ranges, `start -> end` (exclusive), disjoint and non-adjacent.
    ranges: BTreeMap<u64, u64>,
    covered: u64,
    last_update: Instant,
}

impl PendingTransfer {
    fn new(total: u64, now: Instant) -> Self {
        Self {
            buffer: vec![0u8; total as usize],
            ranges: BTreeMap::new(),
            covered: 0,
            last_update: now,
        }
    }

    fn total(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Mark `[start, end)` as covered and return how many bytes were new.
    fn cover(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }

        let mut merged_start = start;
        let mut merged_end = end;
        let mut overlap = 0;

        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in touching {
            overlap += e.min(end).saturating_sub(s.max(start));
            merged_start = merged_start.min(s);
            merged_end = merged_end.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(merged_start, merged_end);

        let added = (end - start) - overlap;
        self.covered += added;
        added
    }
}

/// Per-connection table of in-flight fragmented transfers.
#[derive(Default)]
pub struct Reassembler {
    transfers: HashMap<TransferId, PendingTransfer>,
    budget: ReassemblyBudget,
}

impl Reassembler {
    /// Create an empty reassembler with the default budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty reassembler bounded by `budget`.
    pub fn with_budget(budget: ReassemblyBudget) -> Self {
        Self {
            transfers: HashMap::new(),
            budget,
        }
    }

    /// Apply one chunk to its transfer.
    ///
    /// Returns `Some(payload)` exactly once per transfer, when every byte of
    /// `[0, total_length)` has been covered; the transfer state is discarded
    /// at that point.
    pub fn add(
        &mut self,
        id: TransferId,
        total_length: u64,
        offset: u64,
        chunk: &[u8],
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        if total_length == 0 || total_length > MAX_TRANSFER_LENGTH {
            return Err(ReassemblyError::InvalidTotalLength(total_length));
        }

        let end = offset
            .checked_add(chunk.len() as u64)
            .filter(|&end| end <= total_length)
            .ok_or(ReassemblyError::ChunkOutOfBounds {
                offset,
                len: chunk.len(),
                total: total_length,
            })?;

        if !self.transfers.contains_key(&id) {
            self.reserve(total_length)?;
        }

        let now = Instant::now();
        let transfer = self
            .transfers
            .entry(id)
            .or_insert_with(|| PendingTransfer::new(total_length, now));

        if transfer.total() != total_length {
            return Err(ReassemblyError::TotalLengthMismatch {
                id,
                declared: total_length,
                expected: transfer.total(),
            });
        }

        transfer.buffer[offset as usize..end as usize].copy_from_slice(chunk);
        transfer.cover(offset, end);
        transfer.last_update = now;

        if transfer.covered < transfer.total() {
            return Ok(None);
        }

        Ok(self.transfers.remove(&id).map(|t| t.buffer))
    }

    fn reserve(&self, total_length: u64) -> Result<(), ReassemblyError> {
        let open = self.transfers.len();
        let buffered = self.buffered_bytes();
        if open >= self.budget.max_transfers
            || buffered.saturating_add(total_length) > self.budget.max_buffered_bytes
        {
            return Err(ReassemblyError::BudgetExceeded {
                total: total_length,
                open,
                buffered,
            });
        }
        Ok(())
    }

    /// Convenience wrapper over [`Reassembler::add`] for a parsed envelope.
    pub fn add_fragment(
        &mut self,
        fragment: &Fragment<'_>,
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        self.add(
            fragment.transfer_id,
            fragment.total_length,
            fragment.offset,
            fragment.chunk,
        )
    }

    /// Drop a transfer without completing it. Returns whether it existed.
    pub fn abort(&mut self, id: &TransferId) -> bool {
        self.transfers.remove(id).is_some()
    }

    /// Drop every in-flight transfer.
    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    /// Abort transfers that have not received a chunk within `max_idle`.
    pub fn evict_stale(&mut self, max_idle: Duration) -> Vec<TransferId> {
        self.evict_stale_at(Instant::now(), max_idle)
    }

    /// [`Reassembler::evict_stale`] against an explicit clock reading.
    pub fn evict_stale_at(&mut self, now: Instant, max_idle: Duration) -> Vec<TransferId> {
        let stale: Vec<TransferId> = self
            .transfers
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_update) > max_idle)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.transfers.remove(id);
        }
        stale
    }

    /// Number of in-flight transfers.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether no transfer is in flight.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Bytes currently held in reassembly buffers.
    pub fn buffered_bytes(&self) -> u64 {
        self.transfers.values().map(PendingTransfer::total).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::seq::SliceRandom;

    fn split(payload: &[u8], sizes: &[usize]) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        for &size in sizes {
            out.push((offset as u64, payload[offset..offset + size].to_vec()));
            offset += size;
        }
        assert_eq!(offset, payload.len());
        out
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let mut rng = rand::rng();
        let payload: Vec<u8> = (0..10_000).map(|_| rng.random()).collect();
        let chunks = split(&payload, &[1_000, 3_000, 7, 2_993, 1_500, 1_000, 500]);

        let id = TransferId::new_random();
        let mut reassembler = Reassembler::new();
        let mut completions = 0;
        let mut result = None;

        for (i, (offset, chunk)) in chunks.iter().rev().enumerate() {
            let out = reassembler.add(id, 10_000, *offset, chunk).unwrap();
            if let Some(full) = out {
                completions += 1;
                assert_eq!(i, chunks.len() - 1, "completion must follow the last chunk");
                result = Some(full);
            }
        }

        assert_eq!(completions, 1);
        assert_eq!(result.unwrap(), payload);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_shuffled_order_reassembly() {
        let mut rng = rand::rng();
        let payload: Vec<u8> = (0..4_096).map(|_| rng.random()).collect();
        let mut chunks = split(&payload, &[512, 1, 1_023, 2_000, 60, 500]);
        chunks.shuffle(&mut rng);

        let id = TransferId::new_random();
        let mut reassembler = Reassembler::new();
        let outputs: Vec<_> = chunks
            .iter()
            .map(|(offset, chunk)| reassembler.add(id, 4_096, *offset, chunk).unwrap())
            .collect();

        assert!(outputs[..outputs.len() - 1].iter().all(Option::is_none));
        assert_eq!(outputs.last().unwrap().as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn test_duplicate_chunk_does_not_complete_early() {
        let id = TransferId::new_random();
        let mut reassembler = Reassembler::new();

        assert!(reassembler.add(id, 8, 0, b"abcd").unwrap().is_none());
        // Same chunk again: four more bytes received, but nothing new covered.
        assert!(reassembler.add(id, 8, 0, b"abcd").unwrap().is_none());
        assert_eq!(reassembler.len(), 1);

        let full = reassembler.add(id, 8, 4, b"efgh").unwrap();
        assert_eq!(full.as_deref(), Some(&b"abcdefgh"[..]));
    }

    #[test]
    fn test_overlapping_chunks_counted_once() {
        let id = TransferId::new_random();
        let mut reassembler = Reassembler::new();

        assert!(reassembler.add(id, 10, 2, b"cdef").unwrap().is_none());
        assert!(reassembler.add(id, 10, 0, b"abcd").unwrap().is_none());
        assert!(reassembler.add(id, 10, 5, b"fgh").unwrap().is_none());
        let full = reassembler.add(id, 10, 7, b"hij").unwrap();
        assert_eq!(full.as_deref(), Some(&b"abcdefghij"[..]));
    }

    #[test]
    fn test_transfers_are_independent() {
        let a = TransferId::new_random();
        let b = TransferId::new_random();
        let mut reassembler = Reassembler::new();

        assert!(reassembler.add(a, 4, 0, b"aa").unwrap().is_none());
        assert!(reassembler.add(b, 4, 0, b"bb").unwrap().is_none());
        assert_eq!(reassembler.len(), 2);
        assert_eq!(reassembler.buffered_bytes(), 8);

        assert_eq!(
            reassembler.add(b, 4, 2, b"BB").unwrap().as_deref(),
            Some(&b"bbBB"[..])
        );
        assert_eq!(reassembler.len(), 1);
    }

    #[test]
    fn test_invalid_total_length_rejected() {
        let mut reassembler = Reassembler::new();
        let id = TransferId::new_random();

        assert!(matches!(
            reassembler.add(id, 0, 0, &[]),
            Err(ReassemblyError::InvalidTotalLength(0))
        ));
        assert!(matches!(
            reassembler.add(id, MAX_TRANSFER_LENGTH + 1, 0, b"x"),
            Err(ReassemblyError::InvalidTotalLength(_))
        ));
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_out_of_bounds_chunk_rejected() {
        let mut reassembler = Reassembler::new();
        let id = TransferId::new_random();

        assert!(matches!(
            reassembler.add(id, 4, 3, b"xy"),
            Err(ReassemblyError::ChunkOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_total_length_mismatch_rejected() {
        let mut reassembler = Reassembler::new();
        let id = TransferId::new_random();

        reassembler.add(id, 8, 0, b"ab").unwrap();
        assert!(matches!(
            reassembler.add(id, 16, 2, b"cd"),
            Err(ReassemblyError::TotalLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_budget_limits_open_transfers() {
        let mut reassembler = Reassembler::with_budget(ReassemblyBudget {
            max_transfers: 2,
            max_buffered_bytes: 1_000,
        });
        let a = TransferId::new_random();
        let b = TransferId::new_random();
        let c = TransferId::new_random();

        reassembler.add(a, 10, 0, b"a").unwrap();
        reassembler.add(b, 10, 0, b"b").unwrap();
        assert!(matches!(
            reassembler.add(c, 10, 0, b"c"),
            Err(ReassemblyError::BudgetExceeded { open: 2, .. })
        ));
        // Chunks for transfers already open are still accepted.
        assert!(reassembler.add(a, 10, 1, b"a").unwrap().is_none());

        // Completing one frees its slot.
        assert!(reassembler.add(b, 10, 1, &[0; 9]).unwrap().is_some());
        assert!(reassembler.add(c, 10, 0, b"c").unwrap().is_none());
    }

    #[test]
    fn test_budget_limits_buffered_bytes() {
        let mut reassembler = Reassembler::with_budget(ReassemblyBudget {
            max_transfers: 16,
            max_buffered_bytes: 100,
        });

        reassembler.add(TransferId::new_random(), 60, 0, b"x").unwrap();
        assert!(matches!(
            reassembler.add(TransferId::new_random(), 41, 0, b"y"),
            Err(ReassemblyError::BudgetExceeded {
                total: 41,
                buffered: 60,
                ..
            })
        ));
        assert_eq!(reassembler.len(), 1);
        assert!(reassembler.add(TransferId::new_random(), 40, 0, b"z").is_ok());
        assert_eq!(reassembler.buffered_bytes(), 100);
    }

    #[test]
    fn test_abort_and_clear() {
        let mut reassembler = Reassembler::new();
        let a = TransferId::new_random();
        let b = TransferId::new_random();
        reassembler.add(a, 4, 0, b"a").unwrap();
        reassembler.add(b, 4, 0, b"b").unwrap();

        assert!(reassembler.abort(&a));
        assert!(!reassembler.abort(&a));
        assert_eq!(reassembler.len(), 1);

        reassembler.clear();
        assert!(reassembler.is_empty());

        // An aborted transfer starts over from scratch.
        assert!(reassembler.add(a, 2, 0, b"x").unwrap().is_none());
    }

    #[test]
    fn test_stale_transfers_evicted() {
        let mut reassembler = Reassembler::new();
        let id = TransferId::new_random();
        reassembler.add(id, 100, 0, b"partial").unwrap();

        let later = Instant::now() + Duration::from_secs(120);
        assert!(reassembler.evict_stale(Duration::from_secs(60)).is_empty());

        let evicted = reassembler.evict_stale_at(later, Duration::from_secs(60));
        assert_eq!(evicted, vec![id]);
        assert!(reassembler.is_empty());
    }
}
