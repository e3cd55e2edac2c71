//! Common test doubles and helpers

// Shared across several test files; not every item is used in each one.
#![allow(dead_code)]

#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;
#[allow(unused_imports)]
pub use probelink_lib::capture::{CaptureEngine, Sample};
#[allow(unused_imports)]
pub use probelink_lib::descriptor::{ChannelRecord, DescriptorBlob, DescriptorSpec, DescriptorTable};
#[allow(unused_imports)]
pub use probelink_lib::dispatcher::{Dispatcher, DispatcherConfig, Opcode, State};
#[allow(unused_imports)]
pub use probelink_lib::error::ProbeError;
#[allow(unused_imports)]
pub use probelink_lib::transport::Transport;

use std::collections::VecDeque;

/// What the dispatcher asked of the capture engine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Reset,
    Begin,
    Word(u32),
    Finish,
}

#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub events: Vec<EngineEvent>,
    pub finished: bool,
}

impl RecordingEngine {
    pub fn words(&self) -> Vec<u32> {
        self.events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Word(w) => Some(*w),
                _ => None,
            })
            .collect()
    }

    pub fn finishes(&self) -> usize {
        self.events.iter().filter(|e| **e == EngineEvent::Finish).count()
    }
}

impl CaptureEngine for RecordingEngine {
    fn reset(&mut self) {
        self.finished = false;
        self.events.push(EngineEvent::Reset);
    }

    fn begin_reconfigure(&mut self) {
        self.events.push(EngineEvent::Begin);
    }

    fn commit_word(&mut self, word: u32) {
        self.events.push(EngineEvent::Word(word));
    }

    fn finish_reconfigure(&mut self) {
        self.events.push(EngineEvent::Finish);
    }

    fn capture_finished(&self) -> bool {
        self.finished
    }

    fn read_sample(&self, _address: usize) -> Option<Sample> {
        None
    }
}

/// Delivers at most one queued byte per step and records everything sent.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub incoming: VecDeque<u8>,
    pub sent: Vec<u8>,
    pub busy_steps: u32,
    busy_left: u32,
}

impl ScriptedTransport {
    pub fn with_busy_steps(busy_steps: u32) -> Self {
        Self {
            busy_steps,
            ..Default::default()
        }
    }
}

impl Transport for ScriptedTransport {
    fn is_busy(&self) -> bool {
        self.busy_left > 0
    }

    fn try_send(&mut self, byte: u8) -> Result<(), ProbeError> {
        assert!(self.busy_left == 0, "byte {:#04x} sent while transmitter busy", byte);
        self.sent.push(byte);
        self.busy_left = self.busy_steps;
        Ok(())
    }

    fn poll_received(&mut self) -> Result<Option<u8>, ProbeError> {
        Ok(self.incoming.pop_front())
    }

    fn clock(&mut self) {
        self.busy_left = self.busy_left.saturating_sub(1);
    }
}

/// Decode hex string to bytes for testing
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Route library logs to the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_test_writer().with_target(false))
        .try_init();
}

pub type TestDispatcher = Dispatcher<RecordingEngine, ScriptedTransport>;

/// Table whose bytes are all distinct modulo 251, so order mistakes show up.
pub fn pattern_table(len: usize) -> DescriptorTable {
    let raw: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    DescriptorTable::build(&DescriptorBlob::from_bytes(raw, len).expect("blob"))
}

pub fn dispatcher(width: u32, table: DescriptorTable, busy_steps: u32) -> TestDispatcher {
    let config = DispatcherConfig {
        capture_width: width,
        reconfigure_timeout: None,
    };
    Dispatcher::new(config, table, RecordingEngine::default(), ScriptedTransport::with_busy_steps(busy_steps))
        .expect("dispatcher")
}

pub fn step_n(d: &mut TestDispatcher, n: usize) {
    for _ in 0..n {
        d.step().expect("step");
    }
}

/// Step at least once, then until the dispatcher is back in `IDLE`.
pub fn run_to_idle(d: &mut TestDispatcher, max_steps: usize) -> usize {
    let mut steps = 0;
    loop {
        d.step().expect("step");
        steps += 1;
        if d.state() == State::Idle {
            return steps;
        }
        assert!(steps < max_steps, "still in {} after {} steps", d.state(), steps);
    }
}

/// `LOAD_TRIGGER` followed by `size` bytes counting up from `seed`
pub fn queue_load(d: &mut TestDispatcher, size: usize, seed: u8) -> Vec<u8> {
    let payload: Vec<u8> = (0..size).map(|i| seed.wrapping_add(i as u8)).collect();
    let transport = d.transport_mut();
    transport.incoming.push_back(Opcode::LoadTrigger.into());
    transport.incoming.extend(payload.iter().copied());
    payload
}

pub fn expected_words(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
