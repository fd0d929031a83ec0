//! End-to-end datapath tests over the in-process loopback backend:
//! priming, ordered delivery, frame conservation, transmit backlog
//! draining, and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use wirebed_io::{EngineConfig, IoEngine, LoopbackBackend, LoopbackDriver, TransportHooks};

fn engine_with(
    frame_count: u32,
    ring_size: u32,
    batch_size: u32,
) -> (IoEngine, LoopbackDriver) {
    let (backend, driver) = LoopbackBackend::new(ring_size);
    let config = EngineConfig {
        interface: "loop0".into(),
        frame_count,
        ring_size,
        batch_size,
        ..EngineConfig::default()
    };
    let engine = IoEngine::with_backend(config, Box::new(backend)).expect("engine construction");
    (engine, driver)
}

/// Records every delivered payload.
#[derive(Default)]
struct Recorder {
    packets: Vec<Vec<u8>>,
}

impl TransportHooks for Recorder {
    fn on_packet_received(&mut self, payload: &[u8]) {
        self.packets.push(payload.to_vec());
    }
}

/// Echoes every delivered payload back out.
#[derive(Default)]
struct Echo {
    outbox: std::collections::VecDeque<Vec<u8>>,
}

impl TransportHooks for Echo {
    fn on_packet_received(&mut self, payload: &[u8]) {
        self.outbox.push_back(payload.to_vec());
    }

    fn has_pending_tx(&self) -> bool {
        !self.outbox.is_empty()
    }

    fn fill_transmit(&mut self, frame: &mut [u8]) -> usize {
        match self.outbox.pop_front() {
            Some(msg) => {
                frame[..msg.len()].copy_from_slice(&msg);
                msg.len()
            }
            None => 0,
        }
    }
}

/// Sends a fixed batch of messages, independent of receive traffic.
struct Sender {
    queue: std::collections::VecDeque<Vec<u8>>,
}

impl Sender {
    fn new(count: usize) -> Self {
        Self {
            queue: (0..count)
                .map(|i| format!("msg-{i:04}").into_bytes())
                .collect(),
        }
    }
}

impl TransportHooks for Sender {
    fn on_packet_received(&mut self, _payload: &[u8]) {}

    fn has_pending_tx(&self) -> bool {
        !self.queue.is_empty()
    }

    fn fill_transmit(&mut self, frame: &mut [u8]) -> usize {
        match self.queue.pop_front() {
            Some(msg) => {
                frame[..msg.len()].copy_from_slice(&msg);
                msg.len()
            }
            None => 0,
        }
    }
}

#[test]
fn startup_commits_every_frame_to_the_fill_ring() {
    let (engine, driver) = engine_with(4096, 4096, 64);
    let census = engine.frame_census();
    assert_eq!(census.in_fill, 4096);
    assert_eq!(census.free, 0);
    assert_eq!(census.total(), 4096);
    assert_eq!(driver.fill_level(), 4096);
}

#[test]
fn packets_are_delivered_in_arrival_order() {
    let (mut engine, driver) = engine_with(16, 16, 8);
    let mut recorder = Recorder::default();

    for i in 0..10u32 {
        assert!(driver.inject(format!("pkt-{i}").as_bytes()));
    }

    // batch is 8, so delivery takes two iterations
    let first = engine.poll_iteration(&mut recorder).unwrap();
    assert_eq!(first.received, 8);
    let second = engine.poll_iteration(&mut recorder).unwrap();
    assert_eq!(second.received, 2);

    let got: Vec<String> = recorder
        .packets
        .iter()
        .map(|p| String::from_utf8(p.clone()).unwrap())
        .collect();
    let want: Vec<String> = (0..10).map(|i| format!("pkt-{i}")).collect();
    assert_eq!(got, want);

    // every delivered frame went back to the fill ring
    let census = engine.frame_census();
    assert_eq!(census.in_fill, 16);
    assert_eq!(census.in_rx, 0);
    assert_eq!(census.in_use, 0);
    assert_eq!(census.total(), 16);

    let snap = engine.stats().snapshot();
    assert_eq!(snap.rx_packets, 10);
    assert_eq!(snap.frames_recycled, 10);
}

#[test]
fn sustained_traffic_conserves_every_frame() {
    let (mut engine, driver) = engine_with(16, 16, 8);
    let mut recorder = Recorder::default();

    for round in 0..200u32 {
        for i in 0..4 {
            assert!(driver.inject(format!("r{round}p{i}").as_bytes()), "round {round}");
        }
        let it = engine.poll_iteration(&mut recorder).unwrap();
        assert_eq!(it.received, 4);
        assert_eq!(engine.frame_census().total(), 16, "round {round}");
    }
    assert_eq!(recorder.packets.len(), 800);
    assert_eq!(engine.frame_census().in_fill, 16);
}

#[test]
fn echo_round_trip_preserves_payloads() {
    let (mut engine, driver) = engine_with(32, 16, 16);
    let mut echo = Echo::default();

    let msgs: Vec<Vec<u8>> = (0..6).map(|i| format!("echo-{i}").into_bytes()).collect();
    for m in &msgs {
        assert!(driver.inject(m));
    }

    // deliver and re-transmit in one iteration
    let it = engine.poll_iteration(&mut echo).unwrap();
    assert_eq!(it.received, 6);
    assert_eq!(it.transmitted, 6);
    assert_eq!(driver.tx_level(), 6);
    assert!(driver.kicks() >= 1);

    // the driver completes, the next iteration reclaims
    assert_eq!(driver.complete_transmits(16), 6);
    let it = engine.poll_iteration(&mut echo).unwrap();
    assert_eq!(it.completed, 6);

    assert_eq!(driver.transmitted(), msgs);
    let census = engine.frame_census();
    assert_eq!(census.total(), 32);
    assert_eq!(census.in_tx, 0);
    assert_eq!(census.in_comp, 0);
}

#[test]
fn transmit_backlog_drains_without_losing_frames() {
    // 16 sends against an 8-slot transmit ring
    let (mut engine, driver) = engine_with(32, 8, 16);
    let mut sender = Sender::new(16);

    let it = engine.poll_iteration(&mut sender).unwrap();
    assert_eq!(it.transmitted, 8, "ring-limited first burst");
    assert!(engine.stats().snapshot().tx_backpressure > 0);

    let mut completed_total = 0u32;
    let mut transmitted_total = it.transmitted;
    while transmitted_total < 16 || completed_total < 16 {
        driver.complete_transmits(8);
        let it = engine.poll_iteration(&mut sender).unwrap();
        transmitted_total += it.transmitted;
        completed_total += it.completed;
        assert_eq!(engine.frame_census().total(), 32);
    }

    let sent: Vec<String> = driver
        .transmitted()
        .into_iter()
        .map(|p| String::from_utf8(p).unwrap())
        .collect();
    let want: Vec<String> = (0..16).map(|i| format!("msg-{i:04}")).collect();
    assert_eq!(sent, want);

    // all transmit frames came back to the pool
    let census = engine.frame_census();
    assert_eq!(census.in_tx, 0);
    assert_eq!(census.in_comp, 0);
    assert_eq!(census.free + census.in_fill, 32);
}

#[test]
fn zero_length_fill_recycles_the_frame() {
    struct Liar {
        claims: u32,
    }
    impl TransportHooks for Liar {
        fn on_packet_received(&mut self, _payload: &[u8]) {}
        fn has_pending_tx(&self) -> bool {
            self.claims > 0
        }
        fn fill_transmit(&mut self, _frame: &mut [u8]) -> usize {
            self.claims -= 1;
            0
        }
    }

    let (mut engine, _driver) = engine_with(16, 8, 8);
    let mut liar = Liar { claims: 3 };

    let it = engine.poll_iteration(&mut liar).unwrap();
    assert_eq!(it.transmitted, 0);
    // the claimed frame was handed back, nothing leaked
    let census = engine.frame_census();
    assert_eq!(census.total(), 16);
    assert_eq!(census.in_tx, 0);

    // drive until the claims are exhausted; still nothing leaks
    while liar.claims > 0 {
        engine.poll_iteration(&mut liar).unwrap();
    }
    let census = engine.frame_census();
    assert_eq!(census.total(), 16);
    assert_eq!(census.free + census.in_fill + census.in_use, 16);
}

#[test]
fn run_stops_on_shutdown_and_drains() {
    let (mut engine, driver) = engine_with(16, 16, 8);

    for i in 0..3u32 {
        assert!(driver.inject(format!("last-{i}").as_bytes()));
    }

    /// Raises the shared flag once everything injected has arrived.
    struct StopAfter {
        remaining: u32,
        flag: Arc<AtomicBool>,
    }
    impl TransportHooks for StopAfter {
        fn on_packet_received(&mut self, _payload: &[u8]) {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.flag.store(true, Ordering::Relaxed);
            }
        }
    }

    let flag = Arc::new(AtomicBool::new(false));
    let mut hooks = StopAfter {
        remaining: 3,
        flag: Arc::clone(&flag),
    };
    engine.run(&mut hooks, &flag).unwrap();

    assert_eq!(hooks.remaining, 0);
    let snap = engine.stats().snapshot();
    assert_eq!(snap.rx_packets, 3);
    assert_eq!(engine.frame_census().total(), 16);
}
