//! Packet backend seam.
//!
//! The engine drives frames and rings; a [`PacketIo`] implementation owns
//! whatever sits on the other side of those rings. [`crate::XskBackend`]
//! puts an AF_XDP socket there; [`crate::LoopbackBackend`] puts an
//! in-process driver there so the whole datapath runs without privileges
//! or hardware.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::EngineError;
use crate::ring::RingSet;
use crate::umem::FramePool;

/// One packet I/O flavor, selected when the engine is built.
pub trait PacketIo {
    /// Registers the frame region with the backend and returns the four
    /// rings the engine will drive. Called exactly once per engine.
    fn link(&mut self, pool: &FramePool) -> Result<RingSet, EngineError>;

    /// Makes the backend the redirect target for `queue_id`, so packets on
    /// that queue flow into the receive ring. No-op for backends without a
    /// redirect stage.
    fn register_redirect(&mut self, _queue_id: u32) -> Result<(), EngineError> {
        Ok(())
    }

    /// Removes the redirect registration installed by
    /// [`register_redirect`](Self::register_redirect). Best effort; called
    /// during shutdown.
    fn unregister_redirect(&mut self, _queue_id: u32) {}

    /// Blocks up to `timeout` waiting for receive traffic. Returns whether
    /// the receive ring is (probably) non-empty. Spurious readiness is fine.
    fn poll_ready(&mut self, timeout: Duration) -> Result<bool, EngineError>;

    /// Tells the backend that new transmit descriptors were published.
    fn kick_tx(&mut self) -> Result<(), EngineError>;

    /// Underlying socket descriptor, when there is one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}
