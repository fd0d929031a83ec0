//! XSKMAP registration.
//!
//! The redirect program (an XDP program attached to the interface by the
//! operator's loader) keeps an XSKMAP of queue index to AF_XDP socket. The
//! contract here is only the userspace half: look up the map pinned in
//! bpffs, install our socket under our queue index before the first packet
//! is expected, and remove it at shutdown. Program loading and attachment
//! are out of scope.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

// bpf(2) commands.
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_MAP_DELETE_ELEM: libc::c_long = 3;
const BPF_OBJ_GET: libc::c_long = 7;

/// `bpf_attr` for BPF_OBJ_GET.
#[repr(C)]
struct ObjGetAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

/// `bpf_attr` for map element commands. The kernel's `__aligned_u64`
/// fields give the same 4-byte pad after `map_fd` that repr(C) inserts.
#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    key: u64,
    value: u64,
    flags: u64,
}

fn bpf<T>(cmd: libc::c_long, attr: &T) -> io::Result<libc::c_long> {
    // SAFETY: attr is a live, fully initialized command struct of the
    // advertised size; the kernel only reads it.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *const T as *const libc::c_void,
            size_of::<T>(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc)
}

/// Handle to an XSKMAP pinned in bpffs.
#[derive(Debug)]
pub(crate) struct PinnedXskMap {
    fd: OwnedFd,
    path: PathBuf,
}

impl PinnedXskMap {
    /// Opens the map pinned at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self, EngineError> {
        let pathname = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| EngineError::Config("XSKMAP pin path contains NUL".into()))?;
        let attr = ObjGetAttr {
            pathname: pathname.as_ptr() as u64,
            bpf_fd: 0,
            file_flags: 0,
        };
        let fd = bpf(BPF_OBJ_GET, &attr).map_err(|e| match e.raw_os_error() {
            Some(libc::ENOENT) => EngineError::Config(format!(
                "no pinned XSKMAP at {}",
                path.display()
            )),
            _ => EngineError::from_os("BPF_OBJ_GET", e),
        })?;
        // SAFETY: a successful BPF_OBJ_GET returns a fresh owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Installs `sock_fd` under `queue_id`, routing that queue's redirected
    /// packets to the socket.
    pub(crate) fn insert(&self, queue_id: u32, sock_fd: RawFd) -> Result<(), EngineError> {
        let value = sock_fd as u32;
        let attr = MapElemAttr {
            map_fd: self.fd.as_raw_fd() as u32,
            key: &queue_id as *const u32 as u64,
            value: &value as *const u32 as u64,
            flags: 0,
        };
        bpf(BPF_MAP_UPDATE_ELEM, &attr).map_err(|e| match e.raw_os_error() {
            Some(libc::E2BIG) => EngineError::Config(format!(
                "queue {queue_id} is outside the XSKMAP at {}",
                self.path.display()
            )),
            _ => EngineError::from_os("BPF_MAP_UPDATE_ELEM", e),
        })?;
        Ok(())
    }

    /// Removes the entry for `queue_id`.
    pub(crate) fn remove(&self, queue_id: u32) -> io::Result<()> {
        let attr = MapElemAttr {
            map_fd: self.fd.as_raw_fd() as u32,
            key: &queue_id as *const u32 as u64,
            value: 0,
            flags: 0,
        };
        bpf(BPF_MAP_DELETE_ELEM, &attr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_layouts_match_bpf_abi() {
        assert_eq!(size_of::<ObjGetAttr>(), 16);
        assert_eq!(size_of::<MapElemAttr>(), 32);
        assert_eq!(std::mem::offset_of!(MapElemAttr, key), 8);
    }

    #[test]
    fn missing_pin_path_is_a_config_error() {
        let err = PinnedXskMap::open(Path::new("/sys/fs/bpf/wirebed-missing-map")).unwrap_err();
        match err {
            EngineError::Config(msg) => assert!(msg.contains("wirebed-missing-map")),
            // bpffs may not even be mounted on the test runner
            EngineError::Io(_) | EngineError::Permission(_) => {}
            other => panic!("unexpected error: {other}"),
        }
    }
}
