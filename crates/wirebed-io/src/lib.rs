//! Zero-copy packet I/O for wirebed.
//!
//! The datapath is a frame region shared with the kernel ([`FramePool`]),
//! four SPSC descriptor rings over it ([`RingChannel`]), and a
//! single-threaded poll loop ([`IoEngine`]) that moves frames between them
//! without ever copying a payload. Packets cross into the transport layer
//! through [`TransportHooks`].
//!
//! The kernel side is an AF_XDP socket ([`XskBackend`]); tests and
//! unprivileged demos swap in an in-process driver ([`LoopbackBackend`])
//! behind the same [`PacketIo`] seam.
//!
//! ```no_run
//! use wirebed_io::{EngineConfig, IoEngine, TransportHooks};
//!
//! struct Printer;
//! impl TransportHooks for Printer {
//!     fn on_packet_received(&mut self, payload: &[u8]) {
//!         println!("{} bytes", payload.len());
//!     }
//! }
//!
//! # fn main() -> Result<(), wirebed_io::EngineError> {
//! let config = EngineConfig {
//!     interface: "eth0".into(),
//!     queue_id: 0,
//!     core_id: Some(2),
//!     ..EngineConfig::default()
//! };
//! let shutdown = std::sync::atomic::AtomicBool::new(false);
//! IoEngine::bind(config)?.run(&mut Printer, &shutdown)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backend;
mod config;
mod engine;
mod error;
mod loopback;
mod ring;
mod stats;
mod umem;

#[cfg(target_os = "linux")]
mod redirect;
#[cfg(target_os = "linux")]
mod xsk;

pub use backend::PacketIo;
pub use config::{BindFlags, EngineConfig};
pub use engine::{IoEngine, IterationStats, TransportHooks, TxFrame};
pub use error::EngineError;
pub use loopback::{LoopbackBackend, LoopbackDriver};
pub use ring::{FrameDesc, RingChannel, RingError, RingSet};
pub use stats::{EngineStats, StatsSnapshot};
pub use umem::{FrameOffset, FramePool, FrameState, PoolError, StateCounts};

#[cfg(target_os = "linux")]
pub use xsk::XskBackend;
