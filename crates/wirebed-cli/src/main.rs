//! wirebed - run a zero-copy packet engine on one interface queue.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, ensure};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wirebed_io::{
    BindFlags, EngineConfig, IoEngine, LoopbackBackend, TransportHooks,
};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[derive(Parser, Debug)]
#[command(name = "wirebed", version, about = "Zero-copy packet engine runner")]
struct Cli {
    /// Network interface to serve
    #[arg(short, long, default_value = "eth0")]
    interface: String,

    /// Hardware queue index on the interface
    #[arg(short, long, default_value_t = 0)]
    queue: u32,

    /// CPU core to run on; steers the queue interrupt there, pins the
    /// engine thread, and binds memory to the local NUMA node
    #[arg(short, long)]
    core: Option<u32>,

    /// Frame size in bytes (power of two, 2048..=4096)
    #[arg(long, default_value_t = 2048)]
    frame_size: u32,

    /// Number of frames in the pool (power of two)
    #[arg(long, default_value_t = 4096)]
    frames: u32,

    /// Ring capacity for all four rings (power of two)
    #[arg(long, default_value_t = 4096)]
    ring_size: u32,

    /// Descriptors handled per ring per loop iteration
    #[arg(long, default_value_t = 64)]
    batch: u32,

    /// Force copy mode instead of letting the driver choose
    #[arg(long, conflicts_with = "zero_copy")]
    copy_mode: bool,

    /// Require zero-copy mode; fail if the driver cannot
    #[arg(long)]
    zero_copy: bool,

    /// Pinned XSKMAP of the redirect program, e.g. /sys/fs/bpf/xsks_map
    #[arg(long)]
    xskmap: Option<PathBuf>,

    /// Echo received packets back out instead of counting them
    #[arg(long)]
    echo: bool,

    /// Run an unprivileged in-process self test instead of binding
    #[arg(long)]
    selftest: bool,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let mut bind_flags = BindFlags::NEED_WAKEUP;
        if self.copy_mode {
            bind_flags |= BindFlags::COPY;
        }
        if self.zero_copy {
            bind_flags |= BindFlags::ZEROCOPY;
        }
        EngineConfig {
            interface: self.interface.clone(),
            queue_id: self.queue,
            core_id: self.core,
            frame_size: self.frame_size,
            frame_count: self.frames,
            ring_size: self.ring_size,
            batch_size: self.batch,
            poll_timeout: Duration::from_millis(100),
            bind_flags,
            xskmap_pin: self.xskmap.clone(),
        }
    }
}

/// Counts traffic, optionally echoing every packet back to the wire.
#[derive(Default)]
struct CliHooks {
    echo: bool,
    outbox: VecDeque<Vec<u8>>,
}

impl TransportHooks for CliHooks {
    fn on_packet_received(&mut self, payload: &[u8]) {
        if self.echo {
            self.outbox.push_back(payload.to_vec());
        }
    }

    fn has_pending_tx(&self) -> bool {
        !self.outbox.is_empty()
    }

    fn fill_transmit(&mut self, frame: &mut [u8]) -> usize {
        match self.outbox.pop_front() {
            Some(msg) if msg.len() <= frame.len() => {
                frame[..msg.len()].copy_from_slice(&msg);
                msg.len()
            }
            _ => 0,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.selftest {
        return selftest(&cli);
    }

    let handler: extern "C" fn(libc::c_int) = on_sigint;
    // SAFETY: the handler only touches an atomic flag.
    unsafe {
        libc::signal(libc::SIGINT, handler as usize);
        libc::signal(libc::SIGTERM, handler as usize);
    }

    let mut engine = IoEngine::bind(cli.engine_config())
        .with_context(|| format!("binding {} queue {}", cli.interface, cli.queue))?;
    if let Some(binding) = engine.binding() {
        info!(
            irq = binding.irq,
            core = binding.core_id,
            numa_node = binding.numa_node,
            "placement established"
        );
    }

    // status line, printed from a side thread while the engine holds its core
    let stats = engine.stats();
    let reporter = std::thread::spawn(move || {
        let mut last = stats.snapshot();
        while !SHUTDOWN.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(5));
            let now = stats.snapshot();
            info!(
                rx_pps = (now.rx_packets - last.rx_packets) / 5,
                tx_pps = (now.tx_packets - last.tx_packets) / 5,
                rx_packets = now.rx_packets,
                tx_packets = now.tx_packets,
                "throughput"
            );
            last = now;
        }
    });

    let mut hooks = CliHooks {
        echo: cli.echo,
        ..CliHooks::default()
    };
    let result = engine.run(&mut hooks, &SHUTDOWN);
    SHUTDOWN.store(true, Ordering::Relaxed);
    let _ = reporter.join();

    let snap = engine.stats().snapshot();
    info!(
        rx_packets = snap.rx_packets,
        rx_bytes = snap.rx_bytes,
        tx_packets = snap.tx_packets,
        tx_completions = snap.tx_completions,
        iterations = snap.iterations,
        "final counters"
    );
    result.map_err(Into::into)
}

/// Exercises the whole datapath against the in-process backend, so a
/// deployment can sanity-check a wirebed build without privileges.
fn selftest(cli: &Cli) -> anyhow::Result<()> {
    const PACKETS: u64 = 10_000;

    // rings at half the pool, so the echo path always has free frames
    let ring_size = (cli.frames / 2).max(1);
    let config = EngineConfig {
        interface: "selftest0".into(),
        core_id: None,
        xskmap_pin: None,
        ring_size,
        batch_size: cli.batch.min(ring_size),
        ..cli.engine_config()
    };
    let (backend, driver) = LoopbackBackend::new(config.ring_size);
    let mut engine = IoEngine::with_backend(config, Box::new(backend))?;
    let mut hooks = CliHooks {
        echo: true,
        ..CliHooks::default()
    };

    let mut injected = 0u64;
    while engine.stats().snapshot().tx_completions < PACKETS {
        while injected < PACKETS && driver.inject(format!("selftest-{injected}").as_bytes()) {
            injected += 1;
        }
        driver.complete_transmits(cli.batch);
        engine.poll_iteration(&mut hooks)?;

        let census = engine.frame_census();
        ensure!(
            census.total() == cli.frames,
            "frame conservation violated: {census:?}"
        );
    }

    let snap = engine.stats().snapshot();
    ensure!(snap.rx_packets == PACKETS, "received {} of {PACKETS}", snap.rx_packets);
    ensure!(
        driver.transmitted().len() as u64 == PACKETS,
        "echoed {} of {PACKETS}",
        driver.transmitted().len()
    );
    info!(
        packets = PACKETS,
        iterations = snap.iterations,
        "self test passed"
    );
    println!("self test passed: {PACKETS} packets echoed, frames conserved");
    Ok(())
}
