//! Frame region and ownership ledger.
//!
//! A [`FramePool`] owns one contiguous, page-aligned region of equal-size
//! frames shared with the kernel as UMEM. Every frame is in exactly one
//! custody state at any time; the pool is the only authority that moves a
//! frame between states, and it refuses any move the ownership machine does
//! not allow. Frames are identified by their byte offset from the region
//! base, which is exactly the address the kernel rings carry.

use std::io;

use thiserror::Error;
use tracing::warn;

/// Byte offset of a frame's first byte inside the pool region.
///
/// Wraps the raw `u64` the fill and completion rings carry so that pool
/// offsets and payload addresses (which may point past frame headroom)
/// cannot be mixed up.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameOffset(pub u64);

/// Custody state of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Owned by the pool, available for acquisition.
    Free,
    /// Committed to the fill ring; the kernel may write a packet into it.
    InFill,
    /// Present on the receive ring with a packet the engine has not yet
    /// consumed.
    InRx,
    /// Owned by the transport layer, readable or writable by it.
    InUse,
    /// Committed to the transmit ring; the kernel may read it.
    InTx,
    /// Present on the completion ring; transmit finished, not yet reclaimed.
    InComp,
}

/// Per-state frame census, for conservation checks and stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// Frames in [`FrameState::Free`].
    pub free: u32,
    /// Frames in [`FrameState::InFill`].
    pub in_fill: u32,
    /// Frames in [`FrameState::InRx`].
    pub in_rx: u32,
    /// Frames in [`FrameState::InUse`].
    pub in_use: u32,
    /// Frames in [`FrameState::InTx`].
    pub in_tx: u32,
    /// Frames in [`FrameState::InComp`].
    pub in_comp: u32,
}

impl StateCounts {
    /// Sum over all states; always equals the pool's frame count.
    pub fn total(&self) -> u32 {
        self.free + self.in_fill + self.in_rx + self.in_use + self.in_tx + self.in_comp
    }
}

/// Errors from pool construction and frame custody.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Region geometry is unusable (size, count, or alignment).
    #[error("invalid frame geometry: {0}")]
    Geometry(String),

    /// The region mapping failed.
    #[error("frame region allocation failed: {0}")]
    Allocation(#[source] io::Error),

    /// An address does not land inside the pool, or does not respect frame
    /// boundaries for the requested length.
    #[error("address {addr:#x} (len {len}) is outside the frame region")]
    OutOfBounds {
        /// Offending byte address.
        addr: u64,
        /// Requested length at that address.
        len: u32,
    },

    /// A custody move the ownership machine forbids.
    #[error("frame {offset:#x} is {actual:?}, cannot move to {requested:?}")]
    IllegalTransition {
        /// Frame base offset.
        offset: u64,
        /// State the frame is actually in.
        actual: FrameState,
        /// State the caller asked for.
        requested: FrameState,
    },
}

/// Page-aligned arena of equal-size frames with a custody ledger.
pub struct FramePool {
    base: *mut u8,
    region_len: usize,
    frame_size: u32,
    frame_count: u32,
    states: Vec<FrameState>,
    /// LIFO of frames in `Free` state. Entries leave only through
    /// [`take_free`](Self::take_free) or a priming
    /// [`submit_to_fill`](Self::submit_to_fill).
    free_list: Vec<u64>,
    counts: StateCounts,
}

// SAFETY: the pool exclusively owns its mapping; all access to frame memory
// and the ledger goes through &self/&mut self.
unsafe impl Send for FramePool {}

impl FramePool {
    /// Maps a region of `frame_count` frames of `frame_size` bytes each.
    ///
    /// The mapping is anonymous, page-aligned, and pre-faulted. Locking the
    /// pages is attempted so the kernel never has to fault during packet
    /// DMA, but an `RLIMIT_MEMLOCK` refusal only logs a warning.
    pub fn create(frame_count: u32, frame_size: u32) -> Result<Self, PoolError> {
        if frame_size < 2048 || !frame_size.is_power_of_two() || frame_size > 4096 {
            return Err(PoolError::Geometry(format!(
                "frame size {frame_size} must be a power of two in 2048..=4096"
            )));
        }
        if frame_count == 0 || !frame_count.is_power_of_two() {
            return Err(PoolError::Geometry(format!(
                "frame count {frame_count} must be a nonzero power of two"
            )));
        }
        let region_len = frame_count as usize * frame_size as usize;

        // SAFETY: anonymous mapping, no fd, length checked nonzero above.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                region_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(PoolError::Allocation(io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        // SAFETY: locking the mapping we just created.
        if unsafe { libc::mlock(base as *const libc::c_void, region_len) } != 0 {
            warn!(
                region_len,
                error = %io::Error::last_os_error(),
                "could not lock frame region, continuing unlocked"
            );
        }

        let mut free_list: Vec<u64> = (0..frame_count)
            .map(|i| u64::from(i) * u64::from(frame_size))
            .collect();
        // Pop order matches offset order, which keeps early traffic in the
        // first pages of the region.
        free_list.reverse();

        Ok(Self {
            base,
            region_len,
            frame_size,
            frame_count,
            states: vec![FrameState::Free; frame_count as usize],
            free_list,
            counts: StateCounts {
                free: frame_count,
                ..StateCounts::default()
            },
        })
    }

    /// Region base pointer, as registered with the kernel.
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Total region length in bytes.
    pub fn region_len(&self) -> usize {
        self.region_len
    }

    /// Frame size in bytes.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Number of frames in the region.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Base offsets of all frames, in address order.
    pub fn all_offsets(&self) -> impl Iterator<Item = FrameOffset> + '_ {
        (0..self.frame_count).map(|i| FrameOffset(u64::from(i) * u64::from(self.frame_size)))
    }

    /// Current per-state census.
    pub fn state_counts(&self) -> StateCounts {
        self.counts
    }

    /// Custody state of the frame at `offset`.
    pub fn state_of(&self, offset: FrameOffset) -> Result<FrameState, PoolError> {
        Ok(self.states[self.index_of(offset)?])
    }

    /// Maps any in-region byte address to its frame's base offset.
    pub fn frame_base(&self, addr: u64) -> Result<FrameOffset, PoolError> {
        if addr >= self.region_len as u64 {
            return Err(PoolError::OutOfBounds { addr, len: 0 });
        }
        Ok(FrameOffset(addr - addr % u64::from(self.frame_size)))
    }

    /// Read view of `len` payload bytes at `addr`. The payload must not
    /// cross its frame's end.
    pub fn payload(&self, addr: u64, len: u32) -> Result<&[u8], PoolError> {
        let base = self.frame_base(addr)?.0;
        if addr + u64::from(len) > base + u64::from(self.frame_size) {
            return Err(PoolError::OutOfBounds { addr, len });
        }
        // SAFETY: addr..addr+len checked inside the owned mapping.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(addr as usize), len as usize) })
    }

    /// Write view of the whole frame at `offset`.
    pub fn frame_mut(&mut self, offset: FrameOffset) -> Result<&mut [u8], PoolError> {
        self.index_of(offset)?;
        // SAFETY: offset is a validated frame base inside the owned mapping.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(offset.0 as usize),
                self.frame_size as usize,
            )
        })
    }

    /// Acquires a free frame for transmit, moving it `Free -> InUse`.
    /// Returns `None` when every frame is committed elsewhere.
    pub fn take_free(&mut self) -> Option<FrameOffset> {
        let off = self.free_list.pop()?;
        let idx = (off / u64::from(self.frame_size)) as usize;
        self.states[idx] = FrameState::InUse;
        self.counts.free -= 1;
        self.counts.in_use += 1;
        Some(FrameOffset(off))
    }

    /// Commits a frame to the fill ring: `Free -> InFill` at priming, or
    /// `InUse -> InFill` when recycling a delivered or unwanted frame.
    pub fn submit_to_fill(&mut self, offset: FrameOffset) -> Result<(), PoolError> {
        let idx = self.index_of(offset)?;
        match self.states[idx] {
            FrameState::Free => {
                // priming pops the free list front-to-back, so the match is
                // normally at the tail
                if let Some(pos) = self.free_list.iter().rposition(|&o| o == offset.0) {
                    self.free_list.swap_remove(pos);
                }
                self.counts.free -= 1;
            }
            FrameState::InUse => self.counts.in_use -= 1,
            actual => {
                return Err(PoolError::IllegalTransition {
                    offset: offset.0,
                    actual,
                    requested: FrameState::InFill,
                });
            }
        }
        self.states[idx] = FrameState::InFill;
        self.counts.in_fill += 1;
        Ok(())
    }

    /// Marks a frame the kernel moved from the fill ring to the receive
    /// ring: `InFill -> InRx`.
    pub fn receive(&mut self, offset: FrameOffset) -> Result<(), PoolError> {
        self.step(offset, FrameState::InFill, FrameState::InRx)
    }

    /// Hands a received frame to the transport layer: `InRx -> InUse`.
    pub fn deliver(&mut self, offset: FrameOffset) -> Result<(), PoolError> {
        self.step(offset, FrameState::InRx, FrameState::InUse)
    }

    /// Commits a written frame to the transmit ring: `InUse -> InTx`.
    pub fn submit_to_tx(&mut self, offset: FrameOffset) -> Result<(), PoolError> {
        self.step(offset, FrameState::InUse, FrameState::InTx)
    }

    /// Marks a frame the kernel reported on the completion ring:
    /// `InTx -> InComp`.
    pub fn complete_tx(&mut self, offset: FrameOffset) -> Result<(), PoolError> {
        self.step(offset, FrameState::InTx, FrameState::InComp)
    }

    /// Reclaims a completed frame: `InComp -> Free`.
    pub fn release_frame(&mut self, offset: FrameOffset) -> Result<(), PoolError> {
        self.step(offset, FrameState::InComp, FrameState::Free)?;
        self.free_list.push(offset.0);
        Ok(())
    }

    fn step(
        &mut self,
        offset: FrameOffset,
        from: FrameState,
        to: FrameState,
    ) -> Result<(), PoolError> {
        let idx = self.index_of(offset)?;
        let actual = self.states[idx];
        if actual != from {
            return Err(PoolError::IllegalTransition {
                offset: offset.0,
                actual,
                requested: to,
            });
        }
        self.states[idx] = to;
        *self.count_slot(from) -= 1;
        *self.count_slot(to) += 1;
        Ok(())
    }

    fn count_slot(&mut self, state: FrameState) -> &mut u32 {
        match state {
            FrameState::Free => &mut self.counts.free,
            FrameState::InFill => &mut self.counts.in_fill,
            FrameState::InRx => &mut self.counts.in_rx,
            FrameState::InUse => &mut self.counts.in_use,
            FrameState::InTx => &mut self.counts.in_tx,
            FrameState::InComp => &mut self.counts.in_comp,
        }
    }

    fn index_of(&self, offset: FrameOffset) -> Result<usize, PoolError> {
        let fs = u64::from(self.frame_size);
        if offset.0 % fs != 0 || offset.0 >= self.region_len as u64 {
            return Err(PoolError::OutOfBounds {
                addr: offset.0,
                len: 0,
            });
        }
        Ok((offset.0 / fs) as usize)
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        // SAFETY: unmapping the region create() mapped.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.region_len) };
    }
}
