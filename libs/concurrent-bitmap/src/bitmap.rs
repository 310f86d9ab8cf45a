// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::OutOfBounds;
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::loom::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::segment::{self, BITS_PER_SEGMENT, DATA_MASK, Token};
use core::fmt;
use crossbeam_utils::CachePadded;

/// Fan-out of the summary levels; one `u64` word summarizes 64 children.
const SUMMARY_FANOUT: usize = 64;

/// A growable, thread-safe bitmap.
///
/// See the [crate docs](crate) for the segment/token layout and the intended
/// declare-empty protocol.
pub struct ConcurrentBitmap {
    inner: RwLock<Storage>,
}

struct Storage {
    /// Logical number of bits. Bits at positions `>= len` inside the last
    /// segment are invalid and kept zero.
    len: usize,
    segments: Box<[CachePadded<AtomicU64>]>,
    /// `summary[0]` summarizes the segments in groups of [`SUMMARY_FANOUT`],
    /// `summary[k]` summarizes `summary[k - 1]`. The last level, when present,
    /// holds exactly one node.
    summary: Vec<Box<[SummaryNode]>>,
}

struct SummaryNode {
    /// Bit `j` set ⇔ child `j` has at least one set bit.
    any_set: AtomicU64,
    /// Bit `j` set ⇔ all of child `j`'s valid bits are set.
    all_full: AtomicU64,
}

// === impl ConcurrentBitmap ===

impl ConcurrentBitmap {
    /// Creates a bitmap of `len` zero bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            inner: RwLock::new(Storage::with_len(len)),
        }
    }

    /// The current logical number of bits.
    pub fn len(&self) -> usize {
        self.read().len
    }

    /// Returns the value of bit `index`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfBounds`] if `index >= len`.
    pub fn is_bit_set(&self, index: usize) -> Result<bool, OutOfBounds> {
        let storage = self.read();
        storage.check(index)?;
        let word = storage.segments[index / BITS_PER_SEGMENT].load(Ordering::Acquire);
        Ok(segment::data(word) & bit_mask(index) != 0)
    }

    /// Unconditionally sets or clears bit `index`.
    ///
    /// Every committed call advances the containing segment's [`Token`], even
    /// when the bit already had the requested value. This deliberate "no-op
    /// writes still count" rule is what lets a producer invalidate a
    /// concurrent [`try_update_bit`](Self::try_update_bit) that is about to
    /// declare the producer's freshly filled slot empty.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfBounds`] if `index >= len`.
    pub fn update_bit(&self, index: usize, value: bool) -> Result<(), OutOfBounds> {
        let storage = self.read();
        storage.check(index)?;

        let seg = index / BITS_PER_SEGMENT;
        let mask = bit_mask(index);
        let word = &storage.segments[seg];

        let mut current = word.load(Ordering::Acquire);
        loop {
            let data = if value {
                segment::data(current) | mask
            } else {
                segment::data(current) & !mask
            };
            match word.compare_exchange_weak(
                current,
                segment::bump(current, data),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        storage.refresh_summary(seg);
        Ok(())
    }

    /// Returns the current version token of the segment containing `index`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfBounds`] if `index >= len`.
    pub fn get_token(&self, index: usize) -> Result<Token, OutOfBounds> {
        let storage = self.read();
        storage.check(index)?;
        let word = storage.segments[index / BITS_PER_SEGMENT].load(Ordering::Acquire);
        Ok(segment::token(word))
    }

    /// Conditionally sets or clears bit `index`, succeeding only if the
    /// containing segment's version still equals `token`.
    ///
    /// Returns `Ok(true)` when the update committed and `Ok(false)` when some
    /// other mutation of the segment committed after `token` was observed.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfBounds`] if `index >= len`.
    pub fn try_update_bit(
        &self,
        index: usize,
        token: Token,
        value: bool,
    ) -> Result<bool, OutOfBounds> {
        let storage = self.read();
        storage.check(index)?;

        let seg = index / BITS_PER_SEGMENT;
        let mask = bit_mask(index);
        let word = &storage.segments[seg];

        let current = word.load(Ordering::Acquire);
        if segment::token(current) != token {
            return Ok(false);
        }

        let data = if value {
            segment::data(current) | mask
        } else {
            segment::data(current) & !mask
        };

        // A single strong CAS: failure means a mutation committed since the
        // token was read, which is exactly the condition we must report.
        let committed = word
            .compare_exchange(
                current,
                segment::bump(current, data),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if committed {
            storage.refresh_summary(seg);
        }
        Ok(committed)
    }

    /// Inserts a bit with the given `value` at `index`, shifting all bits at
    /// `index` and above one position up.
    ///
    /// With `grow = true` the logical length is extended by one; otherwise the
    /// previous top bit is shifted out and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfBounds`] if `index > len` (or `index >= len` when not
    /// growing).
    pub fn insert_bit_at(&self, index: usize, value: bool, grow: bool) -> Result<(), OutOfBounds> {
        let mut storage = self.write();

        if grow {
            if index > storage.len {
                return Err(OutOfBounds {
                    index,
                    len: storage.len,
                });
            }
            let new_len = storage.len + 1;
            storage.resize(new_len);
        } else {
            storage.check(index)?;
        }

        let mut words = storage.snapshot_data();
        shift_up(&mut words, index);
        set_word_bit(&mut words, index, value);
        clear_invalid(&mut words, storage.len);
        storage.commit_data(&words);
        Ok(())
    }

    /// Removes the bit at `index`, shifting all bits above it one position
    /// down.
    ///
    /// With `shrink = true` the logical length is reduced by one; otherwise
    /// the vacated top position becomes zero.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfBounds`] if `index >= len`.
    pub fn remove_bit_at(&self, index: usize, shrink: bool) -> Result<(), OutOfBounds> {
        let mut storage = self.write();
        storage.check(index)?;

        let mut words = storage.snapshot_data();
        shift_down(&mut words, index);
        if shrink {
            let new_len = storage.len - 1;
            storage.resize(new_len);
            words.truncate(storage.segments.len());
        }
        clear_invalid(&mut words, storage.len);
        storage.commit_data(&words);
        Ok(())
    }

    /// Extends the logical length by `additional` zero bits.
    pub fn grow(&self, additional: usize) {
        if additional == 0 {
            return;
        }
        let mut storage = self.write();
        let len = storage.len;
        storage.resize(len + additional);
    }

    /// Truncates the logical length by `by` bits, discarding the topmost bits.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfBounds`] if `by > len`.
    pub fn shrink(&self, by: usize) -> Result<(), OutOfBounds> {
        let mut storage = self.write();
        if by > storage.len {
            return Err(OutOfBounds {
                index: by,
                len: storage.len,
            });
        }
        let len = storage.len;
        storage.resize(len - by);
        Ok(())
    }

    /// Returns `true` if no bit is currently set.
    ///
    /// The summary levels are consulted first; a claim of emptiness is then
    /// verified by a scan of the segment words, so `true` is only returned if
    /// every word was observed zero.
    pub fn is_empty(&self) -> bool {
        let storage = self.read();
        if let Some(top) = storage.summary.last()
            && top[0].any_set.load(Ordering::Acquire) != 0
        {
            return false;
        }
        storage
            .segments
            .iter()
            .all(|word| segment::data(word.load(Ordering::Acquire)) == 0)
    }

    /// Returns `true` if every bit is currently set.
    ///
    /// An empty (`len == 0`) bitmap is vacuously full. Like
    /// [`is_empty`](Self::is_empty), the summary fast path is backed by a
    /// verifying scan.
    pub fn is_full(&self) -> bool {
        let storage = self.read();
        if let Some(top) = storage.summary.last() {
            let expected = low_mask(storage.level_width(storage.summary.len() - 1));
            if top[0].all_full.load(Ordering::Acquire) != expected {
                return false;
            }
        }
        storage.segments.iter().enumerate().all(|(seg, word)| {
            let valid = storage.valid_mask(seg);
            segment::data(word.load(Ordering::Acquire)) & valid == valid
        })
    }

    /// Counts the currently set bits.
    ///
    /// The count is assembled from per-segment reads without any
    /// synchronization against concurrent mutators, hence the name: the
    /// result may correspond to no single instant in time.
    pub fn unsafe_pop_count(&self) -> usize {
        let storage = self.read();
        storage
            .segments
            .iter()
            .map(|word| segment::data(word.load(Ordering::Relaxed)).count_ones() as usize)
            .sum()
    }

    /// Returns the index of the lowest set bit, if any.
    ///
    /// Like [`unsafe_pop_count`](Self::unsafe_pop_count) this is a racy
    /// observation; callers that act on the returned index must reconfirm it,
    /// e.g. through [`try_update_bit`](Self::try_update_bit).
    pub fn find_first_set(&self) -> Option<usize> {
        let storage = self.read();
        for (seg, word) in storage.segments.iter().enumerate() {
            let data = segment::data(word.load(Ordering::Acquire));
            if data != 0 {
                return Some(seg * BITS_PER_SEGMENT + data.trailing_zeros() as usize);
            }
        }
        None
    }

    fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.inner.read().expect("bitmap lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.inner.write().expect("bitmap lock poisoned")
    }
}

impl fmt::Debug for ConcurrentBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentBitmap")
            .field("len", &self.len())
            .field("pop_count", &self.unsafe_pop_count())
            .finish_non_exhaustive()
    }
}

// === impl Storage ===

impl Storage {
    fn with_len(len: usize) -> Self {
        let num_segments = len.div_ceil(BITS_PER_SEGMENT);
        let segments = (0..num_segments)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        let mut this = Self {
            len,
            segments,
            summary: Vec::new(),
        };
        this.summary = this.build_summary_levels();
        this
    }

    fn check(&self, index: usize) -> Result<(), OutOfBounds> {
        if index < self.len {
            Ok(())
        } else {
            Err(OutOfBounds {
                index,
                len: self.len,
            })
        }
    }

    /// Data bits valid in segment `seg` under the current length.
    fn valid_mask(&self, seg: usize) -> u64 {
        let base = seg * BITS_PER_SEGMENT;
        let bits = self.len.saturating_sub(base).min(BITS_PER_SEGMENT);
        low_mask(bits)
    }

    /// Number of children summarized at `level` in total (segments for level
    /// 0, level `k - 1` nodes otherwise).
    fn level_width(&self, level: usize) -> usize {
        let mut width = self.segments.len();
        for _ in 0..level {
            width = width.div_ceil(SUMMARY_FANOUT);
        }
        width
    }

    fn build_summary_levels(&self) -> Vec<Box<[SummaryNode]>> {
        let mut levels = Vec::new();
        let mut width = self.segments.len();
        while width > 1 {
            width = width.div_ceil(SUMMARY_FANOUT);
            levels.push((0..width).map(|_| SummaryNode::new()).collect());
        }
        levels
    }

    /// Recomputes the summary path covering segment `seg`.
    ///
    /// Each level is recomputed from the authoritative level below and
    /// re-checked afterwards; if the child's status moved in between, the
    /// level is redone. A racing mutator of the same child runs this loop
    /// itself, so the mutator that commits last also recomputes last and the
    /// summary converges once mutators quiesce. Readers treat summary claims
    /// of emptiness/fullness as hints to verify, never as proof.
    fn refresh_summary(&self, seg: usize) {
        let mut child = seg;
        for level in 0..self.summary.len() {
            let node = &self.summary[level][child / SUMMARY_FANOUT];
            let bit = 1_u64 << (child % SUMMARY_FANOUT);
            loop {
                let (any, full) = self.child_status(level, child);
                if any {
                    node.any_set.fetch_or(bit, Ordering::AcqRel);
                } else {
                    node.any_set.fetch_and(!bit, Ordering::AcqRel);
                }
                if full {
                    node.all_full.fetch_or(bit, Ordering::AcqRel);
                } else {
                    node.all_full.fetch_and(!bit, Ordering::AcqRel);
                }
                if self.child_status(level, child) == (any, full) {
                    break;
                }
            }
            child /= SUMMARY_FANOUT;
        }
    }

    /// `(any_set, all_full)` of child `child` at `level`, read from the level
    /// below.
    fn child_status(&self, level: usize, child: usize) -> (bool, bool) {
        if level == 0 {
            let data = segment::data(self.segments[child].load(Ordering::Acquire));
            let valid = self.valid_mask(child);
            (data != 0, data & valid == valid)
        } else {
            let node = &self.summary[level - 1][child];
            let children = low_mask(
                (self.level_width(level - 1) - child * SUMMARY_FANOUT).min(SUMMARY_FANOUT),
            );
            (
                node.any_set.load(Ordering::Acquire) != 0,
                node.all_full.load(Ordering::Acquire) == children,
            )
        }
    }

    /// Recomputes every summary node. Only called with the write lock held.
    fn rebuild_summary(&self) {
        for seg in 0..self.segments.len() {
            self.refresh_summary(seg);
        }
    }

    /// Changes the logical length, reallocating the segment array as needed.
    /// Only called with the write lock held; tokens of surviving segments are
    /// preserved and bits that become invalid are cleared.
    fn resize(&mut self, new_len: usize) {
        let needed = new_len.div_ceil(BITS_PER_SEGMENT);
        if needed != self.segments.len() {
            let segments: Box<[CachePadded<AtomicU64>]> = (0..needed)
                .map(|seg| {
                    let word = self
                        .segments
                        .get(seg)
                        .map_or(0, |word| word.load(Ordering::Acquire));
                    CachePadded::new(AtomicU64::new(word))
                })
                .collect();
            self.segments = segments;
        }
        self.len = new_len;
        self.summary = self.build_summary_levels();

        // clear bits that fell outside the new length
        if let Some(last) = self.segments.last() {
            let word = last.load(Ordering::Acquire);
            let valid = self.valid_mask(self.segments.len() - 1);
            let data = segment::data(word);
            if data & !valid != 0 {
                last.store(segment::bump(word, data & valid), Ordering::Release);
            }
        }
        self.rebuild_summary();
    }

    /// Copies all data words out. Only called with the write lock held.
    fn snapshot_data(&self) -> Vec<u64> {
        self.segments
            .iter()
            .map(|word| segment::data(word.load(Ordering::Acquire)))
            .collect()
    }

    /// Writes back data words, bumping the token of every changed segment.
    /// Only called with the write lock held.
    fn commit_data(&self, words: &[u64]) {
        debug_assert_eq!(words.len(), self.segments.len());
        for (seg, &data) in words.iter().enumerate() {
            let word = self.segments[seg].load(Ordering::Acquire);
            if segment::data(word) != data {
                self.segments[seg].store(segment::bump(word, data), Ordering::Release);
            }
        }
        self.rebuild_summary();
    }
}

// === impl SummaryNode ===

impl SummaryNode {
    fn new() -> Self {
        Self {
            any_set: AtomicU64::new(0),
            all_full: AtomicU64::new(0),
        }
    }
}

/// Mask with the low `bits` bits set (`bits <= 64`).
fn low_mask(bits: usize) -> u64 {
    debug_assert!(bits <= 64);
    if bits >= 64 { u64::MAX } else { (1 << bits) - 1 }
}

fn bit_mask(index: usize) -> u64 {
    1 << (index % BITS_PER_SEGMENT)
}

fn set_word_bit(words: &mut [u64], index: usize, value: bool) {
    let seg = index / BITS_PER_SEGMENT;
    if value {
        words[seg] |= bit_mask(index);
    } else {
        words[seg] &= !bit_mask(index);
    }
}

/// Shifts every bit at `from` and above one position up, dropping the top
/// bit of the last word. The bit at `from` is left cleared.
fn shift_up(words: &mut [u64], from: usize) {
    let first = from / BITS_PER_SEGMENT;
    let orig: Vec<u64> = words.to_vec();
    for seg in first..words.len() {
        let carry = if seg == first {
            0
        } else {
            (orig[seg - 1] >> (BITS_PER_SEGMENT - 1)) & 1
        };
        let keep = if seg == first {
            low_mask(from % BITS_PER_SEGMENT)
        } else {
            0
        };
        words[seg] = (orig[seg] & keep) | (((orig[seg] & !keep) << 1) & DATA_MASK) | carry;
    }
}

/// Shifts every bit above `from` one position down, overwriting the bit at
/// `from`. The top of the last word becomes zero.
fn shift_down(words: &mut [u64], from: usize) {
    let first = from / BITS_PER_SEGMENT;
    let orig: Vec<u64> = words.to_vec();
    for seg in first..words.len() {
        let carry = orig
            .get(seg + 1)
            .map_or(0, |&next| (next & 1) << (BITS_PER_SEGMENT - 1));
        let keep = if seg == first {
            low_mask(from % BITS_PER_SEGMENT)
        } else {
            0
        };
        words[seg] = (orig[seg] & keep) | ((orig[seg] >> 1) & !keep & DATA_MASK) | carry;
    }
}

/// Clears bits at positions `>= len`.
fn clear_invalid(words: &mut [u64], len: usize) {
    for (seg, word) in words.iter_mut().enumerate() {
        let base = seg * BITS_PER_SEGMENT;
        let bits = len.saturating_sub(base).min(BITS_PER_SEGMENT);
        *word &= low_mask(bits);
    }
}
