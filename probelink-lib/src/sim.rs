//! In-process probe: a [`Dispatcher`] driving a [`SimCaptureEngine`] on its
//! own thread, reachable through a [`ChannelLink`].

use crate::capture::{CaptureHandle, SimCaptureEngine};
use crate::descriptor::DescriptorTable;
use crate::dispatcher::{Dispatcher, DispatcherConfig, State};
use crate::error::ProbeError;
use crate::transport::{ChannelLink, ChannelTransport, channel_pair};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type SimDispatcher = Dispatcher<SimCaptureEngine, ChannelTransport>;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub dispatcher: DispatcherConfig,
    /// Steps a sent byte keeps the transmitter busy
    pub tx_busy_steps: u32,
    /// Pause between steps; zero just yields
    pub step_interval: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            tx_busy_steps: 1,
            step_interval: Duration::ZERO,
        }
    }
}

/// A running simulated device.
pub struct DeviceSim {
    stop: Arc<AtomicBool>,
    capture: CaptureHandle,
    thread: Option<JoinHandle<Result<SimDispatcher, ProbeError>>>,
}

impl DeviceSim {
    pub fn spawn(config: SimConfig, table: DescriptorTable) -> Result<(Self, ChannelLink), ProbeError> {
        let (transport, link) = channel_pair(config.tx_busy_steps);
        let engine = SimCaptureEngine::new();
        let capture = engine.handle();
        let dispatcher = Dispatcher::new(config.dispatcher, table, engine, transport)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let step_interval = config.step_interval;
        let thread = thread::Builder::new()
            .name("probe-sim".to_string())
            .spawn(move || run(dispatcher, &thread_stop, step_interval))?;

        info!("simulated probe started");
        Ok((
            Self {
                stop,
                capture,
                thread: Some(thread),
            },
            link,
        ))
    }

    /// Capture-domain handle for raising the finished level.
    pub fn capture(&self) -> CaptureHandle {
        self.capture.clone()
    }

    /// Stop the device once it is idle with no input pending, and hand back
    /// the dispatcher for inspection.
    pub fn shutdown(mut self) -> Result<SimDispatcher, ProbeError> {
        self.stop.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ProbeError::Io(std::io::Error::other("simulator thread panicked")))?,
            None => Err(ProbeError::Disconnected),
        }
    }
}

impl Drop for DeviceSim {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(mut dispatcher: SimDispatcher, stop: &AtomicBool, step_interval: Duration) -> Result<SimDispatcher, ProbeError> {
    // Enough steps to finish one full table dump or bitstream after a stop
    // request; a host that stalls mid-command does not keep us alive forever.
    let drain_budget = 2 * dispatcher.table().len() as u64 + 4 * dispatcher.layout().size() as u64 + 16;
    let mut stopping_since: Option<u64> = None;

    loop {
        if stop.load(Ordering::Acquire) {
            let since = *stopping_since.get_or_insert(dispatcher.steps());
            let quiet = dispatcher.state() == State::Idle && !dispatcher.transport_mut().has_pending();
            if quiet {
                break;
            }
            if dispatcher.steps() - since > drain_budget {
                warn!(state = %dispatcher.state(), "simulator stopped mid-command");
                break;
            }
        }

        match dispatcher.step() {
            Ok(()) => {}
            Err(ProbeError::Disconnected) => {
                debug!("host side of the link dropped");
                break;
            }
            Err(e) => return Err(e),
        }

        if step_interval.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(step_interval);
        }
    }

    info!(steps = dispatcher.steps(), "simulated probe stopped");
    Ok(dispatcher)
}
