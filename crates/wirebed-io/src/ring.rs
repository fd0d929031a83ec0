//! Single-producer single-consumer descriptor rings.
//!
//! A [`RingChannel`] is the wirebed view of one AF_XDP ring: a power-of-two
//! array of fixed-size entries plus a pair of free-running `u32` cursors
//! shared with the kernel. The producer cursor is advanced only by the
//! producing side, the consumer cursor only by the consuming side, and both
//! wrap naturally; an index into the entry array is always
//! `cursor & (capacity - 1)`.
//!
//! Cursor publication is `Release`, cursor observation is `Acquire`, matching
//! the barriers the kernel uses on its side of the shared mapping.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Cache line bound used for cursor placement in heap-backed rings.
const CURSOR_STRIDE: usize = 64;

/// Errors from ring construction and cursor movement.
#[derive(Debug, Error)]
pub enum RingError {
    /// Ring capacities must be nonzero powers of two so that cursor masking
    /// is a single AND.
    #[error("ring capacity {0} is not a nonzero power of two")]
    InvalidCapacity(u32),

    /// The backing allocation for a heap ring failed.
    #[error("ring allocation of {0} bytes failed")]
    Alloc(usize),

    /// `release(n)` asked to consume more entries than the most recent
    /// `peek` made visible.
    #[error("release of {requested} entries exceeds peeked extent {peeked}")]
    ReleaseOverrun {
        /// Entries the caller tried to release.
        requested: u32,
        /// Entries made visible by the latest peek.
        peeked: u32,
    },
}

/// A transmit or receive descriptor, laid out exactly as `struct xdp_desc`
/// in `linux/if_xdp.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    /// Byte address of the payload inside the frame region.
    pub addr: u64,
    /// Payload length in bytes.
    pub len: u32,
    /// Kernel option bits; zero for every descriptor wirebed produces.
    pub options: u32,
}

enum Backing {
    /// Ring allocated by us; header holds both cursors, entries follow.
    Heap { base: *mut u8, layout: Layout },
    /// Ring mapped from the kernel; the whole mapping is unmapped on drop.
    Kernel { base: *mut u8, len: usize },
    /// Borrowed view of another ring's memory. Never frees.
    Alias,
}

/// One side of a SPSC ring.
///
/// Each `RingChannel` value is a single-role handle: the producing side
/// calls [`reserve`](Self::reserve) and [`commit_writes`](Self::commit_writes),
/// the consuming side calls [`peek`](Self::peek), [`entry`](Self::entry) and
/// [`release`](Self::release). Kernel-backed rings get their peer role from
/// the kernel; heap-backed rings get it from [`alias`](Self::alias).
pub struct RingChannel<T: Copy> {
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    entries: *mut T,
    capacity: u32,
    mask: u32,
    /// Shadow of the shared producer cursor, owned by the producing side.
    cached_prod: u32,
    /// Shadow of the shared consumer cursor, owned by the consuming side.
    cached_cons: u32,
    /// Extent of the latest peek, not yet released.
    peeked: u32,
    backing: Backing,
    _entries: PhantomData<T>,
}

// SAFETY: the raw pointers reference either an owned allocation or a kernel
// mapping that lives as long as the channel. A channel is a single-role,
// single-owner handle; moving it to another thread moves the whole role.
// Cross-side cursor traffic goes through the atomics with Acquire/Release.
unsafe impl<T: Copy + Send> Send for RingChannel<T> {}

impl<T: Copy> RingChannel<T> {
    /// Allocates a process-local ring. Both cursor words live in the same
    /// allocation, each on its own cache line, entries after them.
    pub fn heap(capacity: u32) -> Result<Self, RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(capacity));
        }
        let entries_offset = 2 * CURSOR_STRIDE;
        let size = entries_offset + capacity as usize * size_of::<T>();
        let layout = Layout::from_size_align(size, CURSOR_STRIDE)
            .map_err(|_| RingError::Alloc(size))?;
        // SAFETY: layout has nonzero size (two cursor lines at minimum).
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(RingError::Alloc(size));
        }
        // SAFETY: offsets stay inside the allocation; alignment of the
        // cursor words (4) and of T are both satisfied by the 64-byte lines.
        let (producer, consumer, entries) = unsafe {
            (
                base as *const AtomicU32,
                base.add(CURSOR_STRIDE) as *const AtomicU32,
                base.add(entries_offset) as *mut T,
            )
        };
        Ok(Self {
            producer,
            consumer,
            entries,
            capacity,
            mask: capacity - 1,
            cached_prod: 0,
            cached_cons: 0,
            peeked: 0,
            backing: Backing::Heap { base, layout },
            _entries: PhantomData,
        })
    }

    /// Wraps one ring of a kernel mapping.
    ///
    /// # Safety
    ///
    /// `base..base+len` must be a live `mmap` region laid out per
    /// `xdp_mmap_offsets` for this ring: `producer_off` and `consumer_off`
    /// name the two `u32` cursor words and `desc_off` the start of
    /// `capacity` entries of `T`. The channel takes ownership of the mapping
    /// and unmaps it on drop.
    pub unsafe fn from_kernel(
        base: *mut u8,
        len: usize,
        producer_off: u64,
        consumer_off: u64,
        desc_off: u64,
        capacity: u32,
    ) -> Result<Self, RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(capacity));
        }
        // SAFETY: caller guarantees the offsets are in bounds and aligned.
        let (producer, consumer, entries) = unsafe {
            (
                base.add(producer_off as usize) as *const AtomicU32,
                base.add(consumer_off as usize) as *const AtomicU32,
                base.add(desc_off as usize) as *mut T,
            )
        };
        // The kernel may hand over rings with nonzero cursors after a
        // rebind; start the shadows from whatever is published.
        // SAFETY: producer/consumer point at the mapped cursor words.
        let (prod, cons) = unsafe {
            (
                (*producer).load(Ordering::Acquire),
                (*consumer).load(Ordering::Acquire),
            )
        };
        Ok(Self {
            producer,
            consumer,
            entries,
            capacity,
            mask: capacity - 1,
            cached_prod: prod,
            cached_cons: cons,
            peeked: 0,
            backing: Backing::Kernel { base, len },
            _entries: PhantomData,
        })
    }

    /// Borrowed peer handle over the same memory, for in-process rings where
    /// both roles live in userspace. The alias must only be used in the role
    /// opposite to `self` and must not outlive the owning channel.
    pub(crate) fn alias(&self) -> Self {
        // SAFETY: reading the shared cursor words to seed the shadows.
        let (prod, cons) = unsafe {
            (
                (*self.producer).load(Ordering::Acquire),
                (*self.consumer).load(Ordering::Acquire),
            )
        };
        Self {
            producer: self.producer,
            consumer: self.consumer,
            entries: self.entries,
            capacity: self.capacity,
            mask: self.mask,
            cached_prod: prod,
            cached_cons: cons,
            peeked: 0,
            backing: Backing::Alias,
            _entries: PhantomData,
        }
    }

    /// Number of entry slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots the producing side may still fill before the ring is full.
    pub fn free_slots(&self) -> u32 {
        // SAFETY: consumer points at a live cursor word.
        let cons = unsafe { (*self.consumer).load(Ordering::Acquire) };
        self.capacity - self.cached_prod.wrapping_sub(cons)
    }

    /// Entries published by the producer and not yet released here.
    pub fn pending(&self) -> u32 {
        // SAFETY: producer points at a live cursor word.
        let prod = unsafe { (*self.producer).load(Ordering::Acquire) };
        prod.wrapping_sub(self.cached_cons)
    }

    /// Claims up to `want` slots for writing.
    ///
    /// Returns the starting cursor and the granted count, which may be less
    /// than `want` (including zero) when the ring is nearly full. Nothing is
    /// visible to the consumer until [`commit_writes`](Self::commit_writes);
    /// a repeated reserve without an intervening commit returns the same
    /// starting cursor.
    pub fn reserve(&mut self, want: u32) -> (u32, u32) {
        let granted = want.min(self.free_slots());
        (self.cached_prod, granted)
    }

    /// Writes `count` entries starting at `start` and publishes them.
    ///
    /// `start` and `count` must come from the immediately preceding
    /// [`reserve`](Self::reserve); `fill` is called once per slot with the
    /// slot's index within the batch.
    pub fn commit_writes<F>(&mut self, start: u32, count: u32, mut fill: F)
    where
        F: FnMut(u32) -> T,
    {
        debug_assert_eq!(start, self.cached_prod, "commit does not match reserve");
        debug_assert!(count <= self.capacity);
        for i in 0..count {
            let slot = (start.wrapping_add(i) & self.mask) as usize;
            // SAFETY: slot < capacity, and the slots in [start, start+count)
            // were granted by reserve, so the consumer cannot read them yet.
            unsafe { self.entries.add(slot).write(fill(i)) };
        }
        self.cached_prod = self.cached_prod.wrapping_add(count);
        // SAFETY: producer points at a live cursor word. Release orders the
        // entry writes above before the cursor becomes visible.
        unsafe { (*self.producer).store(self.cached_prod, Ordering::Release) };
    }

    /// Observes up to `max` published entries without consuming them.
    ///
    /// Returns the starting cursor and the visible count. The extent stays
    /// claimable until [`release`](Self::release); a later peek re-reads the
    /// producer cursor and may see more.
    pub fn peek(&mut self, max: u32) -> (u32, u32) {
        // SAFETY: producer points at a live cursor word. Acquire orders the
        // producer's entry writes before our reads of them.
        let prod = unsafe { (*self.producer).load(Ordering::Acquire) };
        let available = prod.wrapping_sub(self.cached_cons).min(max);
        self.peeked = available;
        (self.cached_cons, available)
    }

    /// Copies out the entry at an absolute cursor position.
    ///
    /// The cursor must lie within the extent of the latest peek (producing
    /// side: within a granted reserve, before commit overwrites it).
    pub fn entry(&self, cursor: u32) -> T {
        let slot = (cursor & self.mask) as usize;
        // SAFETY: slot < capacity; within a peeked extent the producer has
        // published the entry and will not rewrite it until it is released.
        unsafe { self.entries.add(slot).read() }
    }

    /// Returns `count` entries to the producer.
    ///
    /// Rejects counts beyond the latest peek, so a slot can never be handed
    /// back twice or before it was observed.
    pub fn release(&mut self, count: u32) -> Result<(), RingError> {
        if count > self.peeked {
            return Err(RingError::ReleaseOverrun {
                requested: count,
                peeked: self.peeked,
            });
        }
        self.peeked -= count;
        self.cached_cons = self.cached_cons.wrapping_add(count);
        // SAFETY: consumer points at a live cursor word. Release orders our
        // entry reads before the slots become reusable.
        unsafe { (*self.consumer).store(self.cached_cons, Ordering::Release) };
        Ok(())
    }

    /// Raw cursor pair `(producer, consumer)` as currently published.
    pub fn cursors(&self) -> (u32, u32) {
        // SAFETY: both point at live cursor words.
        unsafe {
            (
                (*self.producer).load(Ordering::Acquire),
                (*self.consumer).load(Ordering::Acquire),
            )
        }
    }
}

impl<T: Copy> Drop for RingChannel<T> {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap { base, layout } => {
                // SAFETY: allocated in heap() with this exact layout.
                unsafe { alloc::dealloc(base, layout) };
            }
            Backing::Kernel { base, len } => {
                // SAFETY: mapping handed over by from_kernel.
                unsafe { libc::munmap(base as *mut libc::c_void, len) };
            }
            Backing::Alias => {}
        }
    }
}

/// The four rings every packet backend hands to the engine.
pub struct RingSet {
    /// Engine produces frame offsets for the kernel to receive into.
    pub fill: RingChannel<u64>,
    /// Kernel produces offsets of frames whose transmit finished.
    pub completion: RingChannel<u64>,
    /// Kernel produces descriptors of received packets.
    pub rx: RingChannel<FrameDesc>,
    /// Engine produces descriptors of packets to transmit.
    pub tx: RingChannel<FrameDesc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert!(matches!(
            RingChannel::<u64>::heap(0),
            Err(RingError::InvalidCapacity(0))
        ));
        assert!(matches!(
            RingChannel::<u64>::heap(3),
            Err(RingError::InvalidCapacity(3))
        ));
        assert!(RingChannel::<u64>::heap(8).is_ok());
    }

    #[test]
    fn produced_entries_arrive_in_order() {
        let mut prod = RingChannel::<u64>::heap(8).unwrap();
        let mut cons = prod.alias();

        let (start, granted) = prod.reserve(5);
        assert_eq!(granted, 5);
        prod.commit_writes(start, granted, |i| 100 + u64::from(i));

        let (cur, avail) = cons.peek(16);
        assert_eq!(avail, 5);
        for i in 0..avail {
            assert_eq!(cons.entry(cur.wrapping_add(i)), 100 + u64::from(i));
        }
        cons.release(avail).unwrap();
        assert_eq!(cons.peek(16).1, 0);
    }

    #[test]
    fn reserve_grants_partial_when_nearly_full() {
        let mut prod = RingChannel::<u64>::heap(4).unwrap();
        let mut cons = prod.alias();

        let (s, g) = prod.reserve(3);
        assert_eq!(g, 3);
        prod.commit_writes(s, g, u64::from);

        // one slot left, ask for four
        let (_, g) = prod.reserve(4);
        assert_eq!(g, 1);

        // consumer frees two, retry drains the backlog
        cons.peek(2);
        cons.release(2).unwrap();
        let (s, g) = prod.reserve(4);
        assert_eq!(g, 3);
        prod.commit_writes(s, g, |i| u64::from(i) + 10);
        assert_eq!(cons.peek(16).1, 4);
    }

    #[test]
    fn repeated_reserve_without_commit_returns_same_start() {
        let mut prod = RingChannel::<u64>::heap(8).unwrap();
        let (a, _) = prod.reserve(2);
        let (b, _) = prod.reserve(5);
        assert_eq!(a, b);
    }

    #[test]
    fn release_beyond_peek_is_rejected() {
        let mut prod = RingChannel::<u64>::heap(8).unwrap();
        let mut cons = prod.alias();
        let (s, g) = prod.reserve(3);
        prod.commit_writes(s, g, u64::from);

        let (_, avail) = cons.peek(2);
        assert_eq!(avail, 2);
        let err = cons.release(3).unwrap_err();
        assert!(matches!(
            err,
            RingError::ReleaseOverrun {
                requested: 3,
                peeked: 2
            }
        ));
        // the rejected call must not have moved the cursor
        cons.release(2).unwrap();
        assert_eq!(cons.peek(16).1, 1);
    }

    #[test]
    fn cursors_wrap_across_u32_boundary() {
        let mut prod = RingChannel::<u64>::heap(4).unwrap();
        let mut cons = prod.alias();

        // walk the cursors far enough to wrap slot indices many times
        for round in 0..1025u64 {
            let (s, g) = prod.reserve(3);
            assert_eq!(g, 3);
            prod.commit_writes(s, g, |i| round * 10 + u64::from(i));
            let (cur, avail) = cons.peek(4);
            assert_eq!(avail, 3);
            assert_eq!(cons.entry(cur), round * 10);
            assert_eq!(cons.entry(cur.wrapping_add(2)), round * 10 + 2);
            cons.release(avail).unwrap();
        }
        let (p, c) = prod.cursors();
        assert_eq!(p, c);
        assert_eq!(p, 1025 * 3);
    }

    #[test]
    fn frame_desc_matches_kernel_layout() {
        assert_eq!(size_of::<FrameDesc>(), 16);
        assert_eq!(align_of::<FrameDesc>(), 8);
    }

    proptest! {
        /// Any interleaving of produce/consume steps keeps the in-flight
        /// count within capacity and never loses or duplicates an entry.
        #[test]
        fn occupancy_never_exceeds_capacity(ops in prop::collection::vec((0u32..=8, 0u32..=8), 1..200)) {
            let capacity = 8u32;
            let mut prod = RingChannel::<u64>::heap(capacity).unwrap();
            let mut cons = prod.alias();
            let mut next_write = 0u64;
            let mut next_read = 0u64;

            for (nprod, ncons) in ops {
                let (s, g) = prod.reserve(nprod);
                prop_assert!(g <= nprod);
                let base = next_write;
                prod.commit_writes(s, g, |i| base + u64::from(i));
                next_write += u64::from(g);

                let (cur, avail) = cons.peek(ncons);
                for i in 0..avail {
                    prop_assert_eq!(cons.entry(cur.wrapping_add(i)), next_read + u64::from(i));
                }
                cons.release(avail).unwrap();
                next_read += u64::from(avail);

                let (p, c) = prod.cursors();
                prop_assert!(p.wrapping_sub(c) <= capacity);
            }
        }
    }
}
