//! In-process packet backend.
//!
//! [`LoopbackBackend`] wires the engine's four rings to a
//! [`LoopbackDriver`] instead of a kernel socket. The driver plays the
//! kernel's role: it consumes fill entries to deliver injected packets and
//! turns transmit descriptors into completions on demand. Everything runs
//! on one thread, so tests can interleave engine iterations with driver
//! steps deterministically.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::backend::PacketIo;
use crate::error::EngineError;
use crate::ring::{FrameDesc, RingChannel, RingSet};
use crate::umem::FramePool;

struct Shared {
    frame_base: *mut u8,
    region_len: usize,
    frame_size: u32,
    /// Driver-side ring handles; populated by `link`.
    fill: Option<RingChannel<u64>>,
    rx: Option<RingChannel<FrameDesc>>,
    tx: Option<RingChannel<FrameDesc>>,
    completion: Option<RingChannel<u64>>,
    /// Payloads of every completed transmit, in completion order.
    tx_log: Vec<Vec<u8>>,
    kicks: u64,
}

/// The engine-facing half. Build with [`LoopbackBackend::new`], hand the
/// backend to the engine and keep the driver.
pub struct LoopbackBackend {
    ring_size: u32,
    shared: Rc<RefCell<Shared>>,
}

/// The "kernel"-facing half of a loopback pair.
pub struct LoopbackDriver {
    shared: Rc<RefCell<Shared>>,
}

impl LoopbackBackend {
    /// Creates a backend/driver pair with rings of `ring_size` entries.
    pub fn new(ring_size: u32) -> (Self, LoopbackDriver) {
        let shared = Rc::new(RefCell::new(Shared {
            frame_base: std::ptr::null_mut(),
            region_len: 0,
            frame_size: 0,
            fill: None,
            rx: None,
            tx: None,
            completion: None,
            tx_log: Vec::new(),
            kicks: 0,
        }));
        (
            Self {
                ring_size,
                shared: Rc::clone(&shared),
            },
            LoopbackDriver { shared },
        )
    }
}

impl PacketIo for LoopbackBackend {
    fn link(&mut self, pool: &FramePool) -> Result<RingSet, EngineError> {
        let fill = RingChannel::heap(self.ring_size)?;
        let completion = RingChannel::heap(self.ring_size)?;
        let rx = RingChannel::heap(self.ring_size)?;
        let tx = RingChannel::heap(self.ring_size)?;

        let mut shared = self.shared.borrow_mut();
        shared.frame_base = pool.base_ptr();
        shared.region_len = pool.region_len();
        shared.frame_size = pool.frame_size();
        shared.fill = Some(fill.alias());
        shared.rx = Some(rx.alias());
        shared.tx = Some(tx.alias());
        shared.completion = Some(completion.alias());

        Ok(RingSet {
            fill,
            completion,
            rx,
            tx,
        })
    }

    fn poll_ready(&mut self, timeout: Duration) -> Result<bool, EngineError> {
        let ready = self
            .shared
            .borrow()
            .rx
            .as_ref()
            .is_some_and(|rx| rx.cursors().0 != rx.cursors().1);
        if !ready && !timeout.is_zero() {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(ready)
    }

    fn kick_tx(&mut self) -> Result<(), EngineError> {
        self.shared.borrow_mut().kicks += 1;
        Ok(())
    }
}

impl LoopbackDriver {
    /// Delivers one packet to the engine: takes a frame off the fill ring,
    /// copies `payload` into it and publishes a receive descriptor.
    /// Returns `false` when the fill ring is empty or the receive ring is
    /// full, i.e. the packet would have been dropped on real hardware.
    pub fn inject(&self, payload: &[u8]) -> bool {
        let mut shared = self.shared.borrow_mut();
        if payload.len() > shared.frame_size as usize {
            return false;
        }
        let shared = &mut *shared;
        let (Some(fill), Some(rx)) = (shared.fill.as_mut(), shared.rx.as_mut()) else {
            return false;
        };

        let (cur, avail) = fill.peek(1);
        if avail == 0 {
            return false;
        }
        let (start, granted) = rx.reserve(1);
        if granted == 0 {
            return false;
        }

        let addr = fill.entry(cur);
        debug_assert!(addr as usize + payload.len() <= shared.region_len);
        // SAFETY: addr came off the fill ring, so it is a frame base inside
        // the pool region and payload fits the frame (checked above).
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                shared.frame_base.add(addr as usize),
                payload.len(),
            );
        }
        let len = payload.len() as u32;
        rx.commit_writes(start, granted, |_| FrameDesc {
            addr,
            len,
            options: 0,
        });
        // the fill entry is consumed only once the packet is published
        fill.release(1).is_ok()
    }

    /// Completes up to `max` pending transmits: consumes transmit
    /// descriptors, records their payloads and publishes the frame offsets
    /// on the completion ring. Returns how many were completed.
    pub fn complete_transmits(&self, max: u32) -> u32 {
        let mut shared = self.shared.borrow_mut();
        let shared = &mut *shared;
        let (Some(tx), Some(comp)) = (shared.tx.as_mut(), shared.completion.as_mut()) else {
            return 0;
        };

        let (cur, avail) = tx.peek(max);
        let (start, granted) = comp.reserve(avail);
        if granted == 0 {
            return 0;
        }

        let mut offsets = [0u64; 64];
        let take = granted.min(offsets.len() as u32);
        for i in 0..take {
            let desc = tx.entry(cur.wrapping_add(i));
            // SAFETY: descriptors we are handed were validated by the
            // engine against the pool region before being published.
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    shared.frame_base.add(desc.addr as usize),
                    desc.len as usize,
                )
            };
            shared.tx_log.push(bytes.to_vec());
            offsets[i as usize] =
                desc.addr - desc.addr % u64::from(shared.frame_size);
        }
        comp.commit_writes(start, take, |i| offsets[i as usize]);
        if tx.release(take).is_err() {
            return 0;
        }
        take
    }

    /// Frames currently sitting in the fill ring, i.e. receive headroom.
    pub fn fill_level(&self) -> u32 {
        self.shared.borrow().fill.as_ref().map_or(0, |f| f.pending())
    }

    /// Transmit descriptors published and not yet completed.
    pub fn tx_level(&self) -> u32 {
        self.shared.borrow().tx.as_ref().map_or(0, |t| t.pending())
    }

    /// Number of transmit kicks the engine issued.
    pub fn kicks(&self) -> u64 {
        self.shared.borrow().kicks
    }

    /// Copies of every completed transmit payload, oldest first.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.shared.borrow().tx_log.clone()
    }
}
