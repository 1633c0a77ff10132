//! Buffer slot management for the chunk pipeline.
//!
//! Two pieces live here:
//! - `DoubleBuffer`, the two-deep ring holding device-resident chunk
//!   slots. Slot lookup is by chunk index; the named accessors make the
//!   fill/compute/drain slot discipline visible at every call site, and
//!   `ring_claims_disjoint` states the invariant the discipline relies
//!   on (checkable in debug builds and exhaustively in tests).
//! - `ArenaPlan`, the construction-time allocation layout: every engine
//!   buffer is reserved as a typed span (name, element width, shape) with
//!   bump placement, and the plan verifies pairwise non-overlap before
//!   anything is materialized. Buffers are allocated exactly once per
//!   engine; the plan's footprint feeds the profiling report.

use std::sync::Mutex;

use crate::error::LamError;

// =============================================================================
// Double-buffered device ring
// =============================================================================

/// A two-slot ring of device-side chunk buffers.
///
/// During step `k` of a chunk iteration the pipeline fills chunk `k`,
/// computes chunk `k-1` and drains chunk `k-2`. Assigning each chunk the
/// slot `chunk % 2` gives fill and compute different slots of the source
/// ring, and compute and drain different slots of the destination ring,
/// so no two streams touch one slot concurrently with conflicting access.
pub struct DoubleBuffer<B> {
    slots: [Mutex<B>; 2],
}

impl<B> DoubleBuffer<B> {
    pub fn new(slot0: B, slot1: B) -> Self {
        Self {
            slots: [Mutex::new(slot0), Mutex::new(slot1)],
        }
    }

    #[inline]
    fn slot(&self, chunk: usize) -> &Mutex<B> {
        &self.slots[chunk % 2]
    }

    /// Slot the fill stream writes for chunk `chunk`.
    #[inline]
    pub fn filling(&self, chunk: usize) -> &Mutex<B> {
        self.slot(chunk)
    }

    /// Slot the compute stream reads or writes for chunk `chunk`.
    #[inline]
    pub fn computing(&self, chunk: usize) -> &Mutex<B> {
        self.slot(chunk)
    }

    /// Slot the drain stream reads for chunk `chunk`.
    #[inline]
    pub fn draining(&self, chunk: usize) -> &Mutex<B> {
        self.slot(chunk)
    }
}

/// True when the slot claims of pipeline step `k` are conflict-free:
/// on the source ring the fill of chunk `k` and the compute of chunk
/// `k-1` claim different slots, and on the destination ring the compute
/// of chunk `k-1` and the drain of chunk `k-2` claim different slots.
pub(crate) fn ring_claims_disjoint(step: usize, nchunk: usize) -> bool {
    let fill = (step < nchunk).then_some(step % 2);
    let compute = (step >= 1 && step <= nchunk).then(|| (step - 1) % 2);
    let drain = (step >= 2).then(|| (step - 2) % 2);
    let src_ok = match (fill, compute) {
        (Some(f), Some(c)) => f != c,
        _ => true,
    };
    let dst_ok = match (compute, drain) {
        (Some(c), Some(d)) => c != d,
        _ => true,
    };
    src_ok && dst_ok
}

// =============================================================================
// Allocation layout plan
// =============================================================================

/// Span alignment, matching the page-friendly alignment staging
/// allocators want.
const SPAN_ALIGN: usize = 64;

/// One reserved span of the engine's allocation layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub name: &'static str,
    pub offset: usize,
    pub bytes: usize,
}

impl Reservation {
    fn end(&self) -> usize {
        self.offset + self.bytes
    }

    fn overlaps(&self, other: &Reservation) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Construction-time layout of every buffer the engine owns.
///
/// Reservations are placed by a bump cursor; `verify` re-checks the
/// pairwise non-overlap before any element is allocated, covering
/// spans placed by hand through `reserve_at` as well.
#[derive(Debug, Default)]
pub struct ArenaPlan {
    reservations: Vec<Reservation>,
    cursor: usize,
}

impl ArenaPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a typed span for `shape` elements of `elem_bytes` each.
    pub fn reserve(
        &mut self,
        name: &'static str,
        elem_bytes: usize,
        shape: &[usize],
    ) -> Result<Reservation, LamError> {
        let count = shape.iter().try_fold(1usize, |acc, &d| {
            acc.checked_mul(d)
                .ok_or_else(|| LamError::Config(format!("arena span `{name}` overflows usize")))
        })?;
        let bytes = count
            .checked_mul(elem_bytes)
            .ok_or_else(|| LamError::Config(format!("arena span `{name}` overflows usize")))?;
        let reservation = Reservation {
            name,
            offset: self.cursor,
            bytes,
        };
        let padded = bytes.div_ceil(SPAN_ALIGN) * SPAN_ALIGN;
        self.cursor = self.cursor.checked_add(padded).ok_or_else(|| {
            LamError::Config(format!("arena cursor overflows after span `{name}`"))
        })?;
        self.reservations.push(reservation.clone());
        Ok(reservation)
    }

    /// Place a span at an explicit offset, bypassing the bump cursor.
    /// `verify` decides whether the placement is legal.
    pub fn reserve_at(&mut self, name: &'static str, offset: usize, bytes: usize) {
        self.reservations.push(Reservation {
            name,
            offset,
            bytes,
        });
    }

    /// Check pairwise disjointness of all reservations and return the
    /// total footprint in bytes.
    pub fn verify(&self) -> Result<usize, LamError> {
        for (i, a) in self.reservations.iter().enumerate() {
            for b in &self.reservations[i + 1..] {
                if a.overlaps(b) {
                    return Err(LamError::Config(format!(
                        "arena spans `{}` and `{}` overlap ([{}, {}) vs [{}, {}))",
                        a.name,
                        b.name,
                        a.offset,
                        a.end(),
                        b.offset,
                        b.end()
                    )));
                }
            }
        }
        Ok(self
            .reservations
            .iter()
            .map(|r| r.end())
            .max()
            .unwrap_or(0))
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }
}
