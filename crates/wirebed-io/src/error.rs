//! Engine error taxonomy.

use thiserror::Error;

use crate::ring::RingError;
use crate::umem::PoolError;

/// Everything that can go wrong while setting up or running an engine.
///
/// The first four variants classify failures by what the operator has to
/// fix: the configuration, the process's privileges, the machine's
/// resources, or an unexpected kernel-side condition.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or inconsistent configuration; rejected before any kernel
    /// resource is touched.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The kernel refused an operation for lack of privilege
    /// (typically missing `CAP_NET_RAW`/`CAP_NET_ADMIN` or a locked-memory
    /// limit).
    #[error("insufficient privileges: {0}")]
    Permission(#[source] std::io::Error),

    /// A kernel resource could not be created (memory, file descriptors,
    /// ring mappings).
    #[error("kernel resource unavailable: {0}")]
    Resource(#[source] std::io::Error),

    /// The kernel accepted our calls but behaved outside the socket
    /// contract, e.g. the queue is already bound or a descriptor points
    /// outside the registered region.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Queue/core/NUMA placement failed.
    #[error(transparent)]
    Affinity(#[from] wirebed_affinity::AffinityError),

    /// A frame custody violation. Always a wirebed bug or kernel
    /// misbehavior, never expected traffic.
    #[error(transparent)]
    FrameCustody(#[from] PoolError),

    /// A ring misuse, see [`RingError`].
    #[error(transparent)]
    Ring(#[from] RingError),

    /// Uncategorized operating system error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Classifies an errno from a setup syscall into the taxonomy.
    pub(crate) fn from_os(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => EngineError::Permission(err),
            Some(libc::ENOMEM) | Some(libc::ENOBUFS) | Some(libc::EMFILE)
            | Some(libc::ENFILE) => EngineError::Resource(err),
            Some(libc::EBUSY) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => {
                EngineError::Protocol(format!("{context}: {err}"))
            }
            _ if err.kind() == ErrorKind::PermissionDenied => EngineError::Permission(err),
            _ => EngineError::Io(err),
        }
    }
}
