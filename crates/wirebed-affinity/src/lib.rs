//! # Wirebed Affinity
//!
//! Queue/core placement for zero-copy packet engines.
//!
//! A hardware queue performs best when three things line up on the same
//! core: the queue's interrupt, the polling thread, and the memory the
//! frames live in. This crate provides the one-shot configuration that
//! lines them up:
//!
//! - interrupt discovery from the interface's `msi_irqs` sysfs directory
//! - interrupt steering via `/proc/irq/<n>/smp_affinity_list`
//! - thread pinning via `sched_setaffinity`
//! - NUMA memory binding via `set_mempolicy(MPOL_BIND)` on the node
//!   co-located with the core's physical package
//!
//! All filesystem roots are explicit fields of [`AffinityManager`], so
//! tests point the manager at a fabricated tree instead of the live
//! `/sys` and `/proc`.
//!
//! Steering an interrupt requires elevated privilege; the failure is
//! reported as [`AffinityError::PermissionDenied`] rather than a crash so
//! a multi-queue caller can keep bringing up other queues.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

/// Memory policy modes from `linux/mempolicy.h`.
const MPOL_BIND: libc::c_int = 2;

/// Errors from queue/core placement operations.
#[derive(Debug, Error)]
pub enum AffinityError {
    /// Neither a per-queue interrupt enumeration nor a shared interrupt
    /// file exists for the interface, or the queue index is out of range.
    #[error("no interrupt enumerable for interface {interface} queue {queue_id}")]
    IrqNotFound {
        /// Interface the lookup ran against.
        interface: String,
        /// Queue index that could not be resolved.
        queue_id: u32,
    },

    /// The interrupt exists but has no affinity control file.
    #[error("interrupt {irq} has no affinity control")]
    IrqUnavailable {
        /// Interrupt number without a `smp_affinity_list`.
        irq: u32,
    },

    /// Writing the affinity control requires elevated privilege.
    #[error("permission denied writing {path} (run with CAP_SYS_NICE/root)")]
    PermissionDenied {
        /// Affinity control file the write was attempted on.
        path: PathBuf,
    },

    /// The core id is outside the online range.
    #[error("core {core} outside online range 0..{online}")]
    InvalidCore {
        /// Requested core id.
        core: i64,
        /// Number of online cores.
        online: usize,
    },

    /// CPU package/node topology could not be read.
    #[error("cpu topology unavailable: {0}")]
    TopologyUnavailable(String),

    /// `set_mempolicy` or `sched_setaffinity` failed.
    #[error("kernel rejected placement: {0}")]
    Kernel(io::Error),

    /// Other filesystem error while probing sysfs/procfs.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias for affinity operations.
pub type Result<T> = std::result::Result<T, AffinityError>;

/// Immutable record of a completed queue binding.
///
/// Computed once at startup; kept for diagnostics and for idempotent
/// re-binding (re-running [`AffinityManager::bind_queue_to_core`] with the
/// same tuple is harmless).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    /// Network interface name (e.g. `"eth0"`).
    pub interface: String,
    /// Hardware queue index on that interface.
    pub queue_id: u32,
    /// Linux interrupt number servicing the queue.
    pub irq: u32,
    /// Core the interrupt and polling thread are pinned to.
    pub core_id: u32,
    /// NUMA node subsequent allocations are bound to (0 on single-node
    /// machines).
    pub numa_node: u32,
}

/// Discovers and applies queue/core/memory placement.
///
/// The four filesystem roots default to the live kernel surfaces; tests
/// construct the manager over a temporary directory with
/// [`AffinityManager::with_roots`].
#[derive(Debug, Clone)]
pub struct AffinityManager {
    sysfs_net: PathBuf,
    procfs_irq: PathBuf,
    sysfs_cpu: PathBuf,
    sysfs_node: PathBuf,
}

impl Default for AffinityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityManager {
    /// Manager over the live `/sys` and `/proc` surfaces.
    pub fn new() -> Self {
        Self {
            sysfs_net: PathBuf::from("/sys/class/net"),
            procfs_irq: PathBuf::from("/proc/irq"),
            sysfs_cpu: PathBuf::from("/sys/devices/system/cpu"),
            sysfs_node: PathBuf::from("/sys/devices/system/node"),
        }
    }

    /// Manager over explicit roots (used by tests with a fabricated tree).
    pub fn with_roots(
        sysfs_net: impl Into<PathBuf>,
        procfs_irq: impl Into<PathBuf>,
        sysfs_cpu: impl Into<PathBuf>,
        sysfs_node: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sysfs_net: sysfs_net.into(),
            procfs_irq: procfs_irq.into(),
            sysfs_cpu: sysfs_cpu.into(),
            sysfs_node: sysfs_node.into(),
        }
    }

    /// Resolve the interrupt number servicing `queue_id` on `interface`.
    ///
    /// Enumerates the MSI-X entries under
    /// `<net>/<interface>/device/msi_irqs` (one file per vector, named by
    /// interrupt number), sorts them numerically ascending, and returns the
    /// `queue_id`-th. Drivers without per-queue vectors expose a single
    /// shared `device/irq` file, which is used as a fallback for any queue
    /// index.
    pub fn locate_irq(&self, interface: &str, queue_id: u32) -> Result<u32> {
        let not_found = || AffinityError::IrqNotFound {
            interface: interface.to_string(),
            queue_id,
        };

        let msi_dir = self
            .sysfs_net
            .join(interface)
            .join("device")
            .join("msi_irqs");

        match fs::read_dir(&msi_dir) {
            Ok(entries) => {
                let mut irqs: Vec<u32> = entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
                    .collect();
                irqs.sort_unstable();

                let irq = *irqs.get(queue_id as usize).ok_or_else(not_found)?;
                debug!(interface, queue_id, irq, vectors = irqs.len(), "resolved per-queue irq");
                Ok(irq)
            }
            Err(_) => {
                // Fallback for drivers without MSI-X enumeration: one
                // shared interrupt for every queue.
                let irq_file = self.sysfs_net.join(interface).join("device").join("irq");
                let text = fs::read_to_string(&irq_file).map_err(|_| not_found())?;
                let irq = text.trim().parse::<u32>().map_err(|_| not_found())?;
                debug!(interface, queue_id, irq, "resolved shared irq");
                Ok(irq)
            }
        }
    }

    /// Steer interrupt `irq` to `core`.
    ///
    /// Writes the decimal core id to `<proc_irq>/<irq>/smp_affinity_list`.
    /// Requires elevated privilege; without it the write fails with
    /// [`AffinityError::PermissionDenied`].
    pub fn steer_irq(&self, irq: u32, core: u32) -> Result<()> {
        let path = self
            .procfs_irq
            .join(irq.to_string())
            .join("smp_affinity_list");

        fs::write(&path, core.to_string()).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => AffinityError::PermissionDenied { path: path.clone() },
            io::ErrorKind::NotFound => AffinityError::IrqUnavailable { irq },
            _ => AffinityError::Io(e),
        })?;

        info!(irq, core, "steered interrupt");
        Ok(())
    }

    /// Restrict the calling thread's scheduling to a single core.
    ///
    /// Rejects `core < 0` and `core >= num_online_cores()` with
    /// [`AffinityError::InvalidCore`].
    pub fn pin_current_thread(&self, core: i64) -> Result<()> {
        let online = num_cpus::get();
        if core < 0 || core >= online as i64 {
            return Err(AffinityError::InvalidCore { core, online });
        }

        // SAFETY: cpu_set_t is plain data; CPU_ZERO/CPU_SET only touch the
        // set we own. sched_setaffinity with pid 0 applies to the calling
        // thread and validates the mask in the kernel.
        let ret = unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core as usize, &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if ret != 0 {
            return Err(AffinityError::Kernel(io::Error::last_os_error()));
        }

        debug!(core, "pinned current thread");
        Ok(())
    }

    /// Bind subsequent allocations of this thread to the NUMA node local
    /// to `core`'s physical package. No-op on single-node machines.
    ///
    /// Returns the node the policy was bound to (0 when no-op).
    pub fn bind_memory_to_node(&self, core: i64) -> Result<u32> {
        let online = num_cpus::get();
        if core < 0 || core >= online as i64 {
            return Err(AffinityError::InvalidCore { core, online });
        }

        if self.max_node()? == 0 {
            debug!(core, "single NUMA node, memory binding is a no-op");
            return Ok(0);
        }

        let node = self.physical_package_id(core as u32)?;

        // Nodemask with only the local node's bit. maxnode counts bits the
        // kernel should examine, plus one per set_mempolicy(2).
        let mask: libc::c_ulong = 1 << node;
        // SAFETY: the mask outlives the syscall and maxnode matches the
        // mask width handed to the kernel.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                MPOL_BIND,
                &mask as *const libc::c_ulong,
                (libc::c_ulong::BITS + 1) as libc::c_ulong,
            )
        };
        if ret != 0 {
            return Err(AffinityError::Kernel(io::Error::last_os_error()));
        }

        info!(core, node, "bound memory policy to local node");
        Ok(node)
    }

    /// Compose the full placement for one queue: locate the interrupt,
    /// steer it to `core`, pin the calling thread there, and bind memory
    /// to the local node.
    ///
    /// Aborts on the first failure. No steering is rolled back here;
    /// callers needing idempotency revert [`Self::steer_irq`] themselves,
    /// so a failed composite never silently misattributes interrupts.
    pub fn bind_queue_to_core(
        &self,
        interface: &str,
        queue_id: u32,
        core: u32,
    ) -> Result<QueueBinding> {
        let irq = self.locate_irq(interface, queue_id)?;
        self.steer_irq(irq, core)?;
        self.pin_current_thread(core as i64)?;
        let numa_node = self.bind_memory_to_node(core as i64)?;

        let binding = QueueBinding {
            interface: interface.to_string(),
            queue_id,
            irq,
            core_id: core,
            numa_node,
        };
        info!(?binding, "queue bound to core");
        Ok(binding)
    }

    /// Highest NUMA node index advertised under the node root.
    ///
    /// A missing node root is treated as a single-node machine, which is
    /// what non-NUMA kernels present.
    fn max_node(&self) -> Result<u32> {
        let entries = match fs::read_dir(&self.sysfs_node) {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };

        let max = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                name.strip_prefix("node")?.parse::<u32>().ok()
            })
            .max()
            .unwrap_or(0);
        Ok(max)
    }

    /// Physical package (socket) id owning `core`, read from cpu topology.
    fn physical_package_id(&self, core: u32) -> Result<u32> {
        let path = self
            .sysfs_cpu
            .join(format!("cpu{core}"))
            .join("topology")
            .join("physical_package_id");

        let text = fs::read_to_string(&path)
            .map_err(|e| AffinityError::TopologyUnavailable(format!("{}: {e}", path.display())))?;
        text.trim()
            .parse::<u32>()
            .map_err(|e| AffinityError::TopologyUnavailable(format!("{}: {e}", path.display())))
    }
}
