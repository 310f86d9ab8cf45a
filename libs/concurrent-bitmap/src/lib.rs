// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # A growable concurrent bitmap with per-segment version tokens.
//!
//! The logical bit sequence is partitioned into 56-bit *segments*, each stored
//! in a single `AtomicU64` alongside an 8-bit version *token*. Because a
//! segment fits in one CAS-able word, single-bit reads and updates are
//! lock-free; the token advances on every committed mutation of the segment,
//! which lets callers perform ABA-safe conditional updates through
//! [`ConcurrentBitmap::try_update_bit`].
//!
//! The primary consumer is a hierarchical scheduler that keeps one bit per
//! child queue ("child `i` has pending work") and needs to resolve the race
//! between a worker declaring a child empty and a concurrent producer that
//! just made it non-empty:
//!
//! ```text
//! worker                                producer
//! ------                                --------
//! t = bitmap.get_token(i)
//! child.is_empty() == true              child.push(item)
//!                                       bitmap.update_bit(i, true)   // bumps token
//! bitmap.try_update_bit(i, t, false)    // fails: token moved, bit stays set
//! ```
//!
//! Segments are grouped into *summary levels* of fan-out 64 that track, per
//! child, "any bit set" and "all valid bits set". Emptiness and fullness
//! queries consult the summary first and only fall back to a verifying scan
//! when the summary claims the interesting (empty/full) answer, so the common
//! non-empty case is O(depth).
//!
//! Structural operations — [`grow`](ConcurrentBitmap::grow),
//! [`shrink`](ConcurrentBitmap::shrink), the shifting
//! [`insert_bit_at`](ConcurrentBitmap::insert_bit_at) and
//! [`remove_bit_at`](ConcurrentBitmap::remove_bit_at) — take a short writer
//! lock; everything else runs under the read side.

mod bitmap;
mod loom;
mod segment;

pub use bitmap::ConcurrentBitmap;
pub use segment::Token;

use core::fmt;

/// Error returned when a bit index lies outside the bitmap's current logical
/// length.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfBounds {
    /// The offending index.
    pub index: usize,
    /// The logical length at the time of the call.
    pub len: usize,
}

impl fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bit index {} out of bounds for bitmap of length {}",
            self.index, self.len
        )
    }
}

impl core::error::Error for OutOfBounds {}
