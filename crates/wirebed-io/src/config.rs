//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::EngineError;

bitflags! {
    /// Socket bind flags, mirroring `XDP_*` bind flags in `linux/if_xdp.h`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BindFlags: u16 {
        /// Force copy mode; works on any driver.
        const COPY = 1 << 1;
        /// Force zero-copy mode; bind fails if the driver cannot.
        const ZEROCOPY = 1 << 2;
        /// Kernel sets a ring flag when it needs a wakeup syscall instead
        /// of being kicked unconditionally.
        const NEED_WAKEUP = 1 << 3;
    }
}

/// Static configuration of one engine instance.
///
/// One engine serves exactly one `(interface, queue)` pair; run several
/// engines on several queues to scale out.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Network interface name, e.g. `eth0`.
    pub interface: String,
    /// Hardware queue index on that interface.
    pub queue_id: u32,
    /// CPU core to pin the engine thread to, with IRQ steering and NUMA
    /// memory binding. `None` leaves placement to the scheduler.
    pub core_id: Option<u32>,
    /// Frame size in bytes; power of two in `2048..=4096`.
    pub frame_size: u32,
    /// Number of frames in the pool; nonzero power of two.
    pub frame_count: u32,
    /// Capacity of each of the four rings; nonzero power of two.
    pub ring_size: u32,
    /// Upper bound on descriptors handled per ring per loop iteration.
    pub batch_size: u32,
    /// How long one idle poll may block waiting for receive readiness.
    pub poll_timeout: Duration,
    /// Socket bind mode.
    pub bind_flags: BindFlags,
    /// Pinned BPF XSKMAP to register the socket in, if the redirect
    /// program's map is published via bpffs.
    pub xskmap_pin: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interface: String::from("eth0"),
            queue_id: 0,
            core_id: None,
            frame_size: 2048,
            frame_count: 4096,
            ring_size: 4096,
            batch_size: 64,
            poll_timeout: Duration::from_millis(100),
            bind_flags: BindFlags::NEED_WAKEUP,
            xskmap_pin: None,
        }
    }
}

impl EngineConfig {
    /// Checks field consistency before any kernel resource is touched.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.interface.is_empty() {
            return Err(EngineError::Config("interface name is empty".into()));
        }
        if self.frame_size < 2048 || self.frame_size > 4096 || !self.frame_size.is_power_of_two()
        {
            return Err(EngineError::Config(format!(
                "frame size {} must be a power of two in 2048..=4096",
                self.frame_size
            )));
        }
        if self.frame_count == 0 || !self.frame_count.is_power_of_two() {
            return Err(EngineError::Config(format!(
                "frame count {} must be a nonzero power of two",
                self.frame_count
            )));
        }
        if self.ring_size == 0 || !self.ring_size.is_power_of_two() {
            return Err(EngineError::Config(format!(
                "ring size {} must be a nonzero power of two",
                self.ring_size
            )));
        }
        if self.batch_size == 0 || self.batch_size > self.ring_size {
            return Err(EngineError::Config(format!(
                "batch size {} must be in 1..={}",
                self.batch_size, self.ring_size
            )));
        }
        if self.bind_flags.contains(BindFlags::COPY | BindFlags::ZEROCOPY) {
            return Err(EngineError::Config(
                "COPY and ZEROCOPY bind flags are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inconsistent_fields() {
        let mut cfg = EngineConfig::default();
        cfg.frame_size = 1500;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.frame_count = 1000;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.batch_size = cfg.ring_size * 2;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.interface.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.bind_flags = BindFlags::COPY | BindFlags::ZEROCOPY;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bind_flag_bits_match_kernel_abi() {
        assert_eq!(BindFlags::COPY.bits(), 0x2);
        assert_eq!(BindFlags::ZEROCOPY.bits(), 0x4);
        assert_eq!(BindFlags::NEED_WAKEUP.bits(), 0x8);
    }
}
