//! AF_XDP socket backend.
//!
//! Owns the `AF_XDP` socket for one `(interface, queue)` pair: registers
//! the frame region as UMEM, sizes and maps the four kernel rings, binds to
//! the queue, and registers the socket in the redirect program's XSKMAP.
//! Constants and struct layouts mirror `linux/if_xdp.h`.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::PacketIo;
use crate::config::{BindFlags, EngineConfig};
use crate::error::EngineError;
use crate::redirect::PinnedXskMap;
use crate::ring::{FrameDesc, RingChannel, RingSet};
use crate::umem::FramePool;

// Socket options at SOL_XDP level.
const XDP_MMAP_OFFSETS: libc::c_int = 1;
const XDP_RX_RING: libc::c_int = 2;
const XDP_TX_RING: libc::c_int = 3;
const XDP_UMEM_REG: libc::c_int = 4;
const XDP_UMEM_FILL_RING: libc::c_int = 5;
const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;

// mmap page offsets selecting which ring a mapping refers to.
const XDP_PGOFF_RX_RING: libc::off_t = 0;
const XDP_PGOFF_TX_RING: libc::off_t = 0x80000000;
const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x100000000;
const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x180000000;

/// `struct xdp_umem_reg`.
#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
    tx_metadata_len: u32,
}

/// `struct xdp_ring_offset`, v2 layout (kernel 5.4+, with `flags`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

/// `struct xdp_mmap_offsets`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fill: XdpRingOffset,
    completion: XdpRingOffset,
}

/// AF_XDP implementation of [`PacketIo`].
pub struct XskBackend {
    interface: String,
    queue_id: u32,
    ring_size: u32,
    bind_flags: BindFlags,
    xskmap_pin: Option<PathBuf>,
    sock: Option<OwnedFd>,
    map: Option<PinnedXskMap>,
}

impl XskBackend {
    /// Prepares a backend from the engine configuration. No kernel resource
    /// is touched until [`PacketIo::link`].
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            queue_id: config.queue_id,
            ring_size: config.ring_size,
            bind_flags: config.bind_flags,
            xskmap_pin: config.xskmap_pin.clone(),
            sock: None,
            map: None,
        }
    }

    fn sock_fd(&self) -> Result<RawFd, EngineError> {
        self.sock
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| EngineError::Protocol("socket used before link".into()))
    }

    fn set_opt<T>(fd: RawFd, opt: libc::c_int, value: &T) -> io::Result<()> {
        // SAFETY: value points at a live T of the advertised size.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_XDP,
                opt,
                value as *const T as *const libc::c_void,
                size_of::<T>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn mmap_offsets(fd: RawFd) -> Result<XdpMmapOffsets, EngineError> {
        let mut offsets = XdpMmapOffsets::default();
        let mut len = size_of::<XdpMmapOffsets>() as libc::socklen_t;
        // SAFETY: offsets is a live out-buffer of `len` bytes.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut offsets as *mut XdpMmapOffsets as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(EngineError::from_os(
                "XDP_MMAP_OFFSETS",
                io::Error::last_os_error(),
            ));
        }
        if (len as usize) < size_of::<XdpMmapOffsets>() {
            // pre-5.4 kernels report the v1 layout without ring flags
            return Err(EngineError::Protocol(format!(
                "kernel reported {len}-byte ring offsets, expected {}",
                size_of::<XdpMmapOffsets>()
            )));
        }
        Ok(offsets)
    }

    /// Maps one kernel ring and wraps it as a channel.
    fn map_ring<T: Copy>(
        fd: RawFd,
        pgoff: libc::off_t,
        offset: &XdpRingOffset,
        capacity: u32,
        name: &str,
    ) -> Result<RingChannel<T>, EngineError> {
        let len = offset.desc as usize + capacity as usize * size_of::<T>();
        // SAFETY: mapping the socket's ring region as the kernel defines it.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(EngineError::from_os(name, io::Error::last_os_error()));
        }
        // SAFETY: base..base+len is the live ring mapping and the offsets
        // come straight from XDP_MMAP_OFFSETS.
        let ring = unsafe {
            RingChannel::from_kernel(
                base as *mut u8,
                len,
                offset.producer,
                offset.consumer,
                offset.desc,
                capacity,
            )
        }?;
        Ok(ring)
    }
}

impl Drop for XskBackend {
    fn drop(&mut self) {
        // engines normally unregister in run(); this covers early teardown
        let queue_id = self.queue_id;
        self.unregister_redirect(queue_id);
    }
}

impl PacketIo for XskBackend {
    fn link(&mut self, pool: &FramePool) -> Result<RingSet, EngineError> {
        // SAFETY: plain socket(2) call.
        let raw = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(EngineError::from_os("socket(AF_XDP)", io::Error::last_os_error()));
        }
        // SAFETY: raw is a freshly created, owned descriptor.
        let sock = unsafe { OwnedFd::from_raw_fd(raw) };
        let fd = sock.as_raw_fd();

        let ifname = CString::new(self.interface.as_bytes())
            .map_err(|_| EngineError::Config("interface name contains NUL".into()))?;
        // SAFETY: ifname is a valid C string.
        let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if ifindex == 0 {
            return Err(EngineError::Config(format!(
                "no such interface: {}",
                self.interface
            )));
        }

        let reg = XdpUmemReg {
            addr: pool.base_ptr() as u64,
            len: pool.region_len() as u64,
            chunk_size: pool.frame_size(),
            headroom: 0,
            flags: 0,
            tx_metadata_len: 0,
        };
        Self::set_opt(fd, XDP_UMEM_REG, &reg)
            .map_err(|e| EngineError::from_os("XDP_UMEM_REG", e))?;

        for (opt, name) in [
            (XDP_UMEM_FILL_RING, "XDP_UMEM_FILL_RING"),
            (XDP_UMEM_COMPLETION_RING, "XDP_UMEM_COMPLETION_RING"),
            (XDP_RX_RING, "XDP_RX_RING"),
            (XDP_TX_RING, "XDP_TX_RING"),
        ] {
            Self::set_opt(fd, opt, &self.ring_size)
                .map_err(|e| EngineError::from_os(name, e))?;
        }

        let offsets = Self::mmap_offsets(fd)?;
        let fill = Self::map_ring::<u64>(
            fd,
            XDP_UMEM_PGOFF_FILL_RING,
            &offsets.fill,
            self.ring_size,
            "fill ring mmap",
        )?;
        let completion = Self::map_ring::<u64>(
            fd,
            XDP_UMEM_PGOFF_COMPLETION_RING,
            &offsets.completion,
            self.ring_size,
            "completion ring mmap",
        )?;
        let rx = Self::map_ring::<FrameDesc>(
            fd,
            XDP_PGOFF_RX_RING,
            &offsets.rx,
            self.ring_size,
            "rx ring mmap",
        )?;
        let tx = Self::map_ring::<FrameDesc>(
            fd,
            XDP_PGOFF_TX_RING,
            &offsets.tx,
            self.ring_size,
            "tx ring mmap",
        )?;

        let addr = libc::sockaddr_xdp {
            sxdp_family: libc::AF_XDP as u16,
            sxdp_flags: self.bind_flags.bits(),
            sxdp_ifindex: ifindex,
            sxdp_queue_id: self.queue_id,
            sxdp_shared_umem_fd: 0,
        };
        // SAFETY: addr is a live sockaddr_xdp of the advertised size.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_xdp as *const libc::sockaddr,
                size_of::<libc::sockaddr_xdp>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(EngineError::from_os("bind(AF_XDP)", io::Error::last_os_error()));
        }

        info!(
            interface = %self.interface,
            queue = self.queue_id,
            ring_size = self.ring_size,
            flags = ?self.bind_flags,
            "AF_XDP socket bound"
        );
        self.sock = Some(sock);
        Ok(RingSet {
            fill,
            completion,
            rx,
            tx,
        })
    }

    fn register_redirect(&mut self, queue_id: u32) -> Result<(), EngineError> {
        let fd = self.sock_fd()?;
        match &self.xskmap_pin {
            Some(path) => {
                let map = PinnedXskMap::open(path)?;
                map.insert(queue_id, fd)?;
                info!(map = %path.display(), queue = queue_id, "registered in XSKMAP");
                self.map = Some(map);
                Ok(())
            }
            None => {
                debug!(queue = queue_id, "no pinned XSKMAP, assuming external registration");
                Ok(())
            }
        }
    }

    fn unregister_redirect(&mut self, queue_id: u32) {
        if let Some(map) = self.map.take() {
            if let Err(e) = map.remove(queue_id) {
                debug!(queue = queue_id, error = %e, "XSKMAP entry removal failed");
            }
        }
    }

    fn poll_ready(&mut self, timeout: Duration) -> Result<bool, EngineError> {
        let mut pfd = libc::pollfd {
            fd: self.sock_fd()?,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: pfd is a live pollfd array of length 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(EngineError::Io(err));
        }
        Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
    }

    fn kick_tx(&mut self) -> Result<(), EngineError> {
        // SAFETY: zero-byte send on our own socket; no buffers involved.
        let rc = unsafe {
            libc::sendto(
                self.sock_fd()?,
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                std::ptr::null(),
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // transient kernel-side congestion, the next kick retries
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ENOBUFS)
                | Some(libc::EINTR) => return Ok(()),
                _ => return Err(EngineError::from_os("sendto(AF_XDP)", err)),
            }
        }
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(AsRawFd::as_raw_fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_struct_layouts() {
        assert_eq!(size_of::<XdpUmemReg>(), 32);
        assert_eq!(size_of::<XdpRingOffset>(), 32);
        assert_eq!(size_of::<XdpMmapOffsets>(), 128);
    }

    #[test]
    fn link_on_missing_interface_reports_config_error() {
        let cfg = EngineConfig {
            interface: "wirebed-does-not-exist0".into(),
            ..EngineConfig::default()
        };
        let mut backend = XskBackend::new(&cfg);
        let pool = FramePool::create(64, 2048).unwrap();
        match backend.link(&pool) {
            // unprivileged runners may be refused at socket creation
            Err(EngineError::Permission(_)) => {}
            Err(EngineError::Config(msg)) => assert!(msg.contains("wirebed-does-not-exist0")),
            Err(other) => panic!("expected Config or Permission error, got {other}"),
            Ok(_) => panic!("link on a missing interface should fail"),
        }
    }
}
