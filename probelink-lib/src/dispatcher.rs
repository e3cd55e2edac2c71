//! # Command dispatcher
//!
//! The protocol state machine of the probe. It is advanced one step at a time
//! by [`Dispatcher::step`]; each step samples its inputs (received byte,
//! transport busy flag, synchronized capture-finished level, registered table
//! data), computes the next state and outputs from that snapshot, and only then
//! commits them.
//!
//! ```text
//!            READ_SYMTAB                      LOAD_TRIGGER
//!   ┌────────────────────── IDLE ─────────────────────────┐
//!   ▼                        ▲  ▲                          ▼
//! SYMTAB_READ_WAIT ──► SYMTAB_SEND   RECONFIGURE_FINISH ◄── RECONFIGURE
//!   ▲                    │  (last)         (last byte)      │ (word every
//!   └────── next index ──┘                                  │  4th byte)
//! ```

use crate::bitstream::{BitstreamAssembler, BitstreamLayout};
use crate::capture::CaptureEngine;
use crate::constants::DEFAULT_CAPTURE_WIDTH;
use crate::descriptor::{DescriptorTable, TableReadPort};
use crate::error::ProbeError;
use crate::sync::Synchronizer;
use crate::transport::Transport;
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;
use tracing::{debug, info, trace, warn};

/// Opcode bytes exchanged with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    ReadSymtab = 0x01,
    LoadTrigger = 0x02,
    /// Outbound only; received as a command it is ignored like any unknown byte
    Triggered = 0x03,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Protocol state. `TRIGGERED` exists only as an opcode value; no state uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum State {
    #[strum(to_string = "IDLE")]
    Idle,
    #[strum(to_string = "SYMTAB_READ_WAIT")]
    SymtabReadWait,
    #[strum(to_string = "SYMTAB_SEND")]
    SymtabSend,
    #[strum(to_string = "RECONFIGURE")]
    Reconfigure,
    #[strum(to_string = "RECONFIGURE_FINISH")]
    ReconfigureFinish,
}

impl State {
    /// States that read the receive side of the transport
    pub fn accepts_input(self) -> bool {
        matches!(self, State::Idle | State::Reconfigure)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Captured signal width in bits; sets the bitstream length
    pub capture_width: u32,
    /// Steps without a byte after which `RECONFIGURE` gives up and returns to
    /// `IDLE`. `None` waits forever, which is what the wire protocol expects.
    pub reconfigure_timeout: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capture_width: DEFAULT_CAPTURE_WIDTH,
            reconfigure_timeout: None,
        }
    }
}

pub struct Dispatcher<E, T> {
    state: State,
    table: DescriptorTable,
    read_port: TableReadPort,
    layout: BitstreamLayout,
    bitstream: BitstreamAssembler,
    notified: bool,
    finished: Synchronizer<bool>,
    reconfigure_timeout: Option<u64>,
    stalled_steps: u64,
    steps: u64,
    engine: E,
    transport: T,
}

impl<E: CaptureEngine, T: Transport> Dispatcher<E, T> {
    pub fn new(config: DispatcherConfig, table: DescriptorTable, engine: E, transport: T) -> Result<Self, ProbeError> {
        let layout = BitstreamLayout::for_width(config.capture_width)?;
        debug!(
            table_len = table.len(),
            bitstream_len = layout.size(),
            words = layout.word_count(),
            "dispatcher created"
        );
        Ok(Self {
            state: State::Idle,
            table,
            read_port: TableReadPort::default(),
            layout,
            bitstream: BitstreamAssembler::default(),
            notified: false,
            finished: Synchronizer::new(false),
            reconfigure_timeout: config.reconfigure_timeout,
            stalled_steps: 0,
            steps: 0,
            engine,
            transport,
        })
    }

    /// Advance the state machine by one step.
    pub fn step(&mut self) -> Result<(), ProbeError> {
        // Snapshot of everything this step may look at. Input is left queued in
        // the transport until a state that consumes it.
        let received = if self.state.accepts_input() {
            self.transport.poll_received()?
        } else {
            None
        };
        let busy = self.transport.is_busy();
        let finished = self.finished.clock(self.engine.capture_finished());
        let fetched = self.read_port.data();

        if let Some(byte) = received {
            trace!(state = %self.state, byte = format_args!("{:#04x}", byte), "rx");
        }

        let next = match self.state {
            State::Idle => self.on_idle(received, busy, finished)?,
            State::SymtabReadWait => {
                if busy {
                    State::SymtabReadWait
                } else {
                    self.transport.try_send(fetched)?;
                    State::SymtabSend
                }
            }
            State::SymtabSend => {
                if busy {
                    State::SymtabSend
                } else if self.read_port.index() < self.table.last_index() {
                    self.read_port.request(self.read_port.index() + 1);
                    State::SymtabReadWait
                } else {
                    info!(bytes = self.table.len(), "symbol table sent");
                    State::Idle
                }
            }
            State::Reconfigure => self.on_reconfigure(received),
            State::ReconfigureFinish => {
                self.engine.finish_reconfigure();
                self.notified = false;
                self.bitstream.reset();
                info!(words = self.layout.word_count(), "trigger configuration loaded");
                State::Idle
            }
        };

        // Commit.
        self.read_port.clock(&self.table);
        self.transport.clock();
        if next != self.state {
            debug!(from = %self.state, to = %next, step = self.steps, "state transition");
        }
        self.state = next;
        self.steps += 1;
        Ok(())
    }

    fn on_idle(&mut self, received: Option<u8>, busy: bool, finished: bool) -> Result<State, ProbeError> {
        if finished && !self.notified && !busy {
            info!("capture finished, notifying host");
            self.transport.try_send(Opcode::Triggered.into())?;
            self.notified = true;
        }

        let Some(byte) = received else {
            return Ok(State::Idle);
        };
        match Opcode::from_primitive(byte) {
            Opcode::ReadSymtab => {
                info!("READ_SYMTAB");
                self.read_port.request(0);
                Ok(State::SymtabReadWait)
            }
            Opcode::LoadTrigger => {
                info!(bytes = self.layout.size(), "LOAD_TRIGGER");
                self.engine.reset();
                self.engine.begin_reconfigure();
                self.bitstream.reset();
                self.stalled_steps = 0;
                Ok(State::Reconfigure)
            }
            other => {
                debug!(opcode = ?other, "ignoring byte while idle");
                Ok(State::Idle)
            }
        }
    }

    fn on_reconfigure(&mut self, received: Option<u8>) -> State {
        let Some(byte) = received else {
            self.stalled_steps += 1;
            return match self.reconfigure_timeout {
                Some(limit) if self.stalled_steps >= limit => {
                    warn!(
                        bitpos = self.bitstream.bitpos(),
                        expected = self.layout.size(),
                        "no configuration byte for {} steps, abandoning load",
                        limit
                    );
                    self.bitstream.reset();
                    State::Idle
                }
                _ => State::Reconfigure,
            };
        };

        self.stalled_steps = 0;
        let shifted = self.bitstream.shift(byte, &self.layout);
        if let Some(word) = shifted.word {
            trace!(word = format_args!("{:#010x}", word), bitpos = self.bitstream.bitpos(), "commit word");
            self.engine.commit_word(word);
        }
        if shifted.last {
            State::ReconfigureFinish
        } else {
            State::Reconfigure
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Whether a notification was already sent for the current capture
    pub fn notification_latched(&self) -> bool {
        self.notified
    }

    pub fn bitpos(&self) -> usize {
        self.bitstream.bitpos()
    }

    /// Steps executed since construction
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn layout(&self) -> &BitstreamLayout {
        &self.layout
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_parts(self) -> (E, T) {
        (self.engine, self.transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{OPCODE_LOAD_TRIGGER, OPCODE_READ_SYMTAB, OPCODE_TRIGGERED};

    #[test]
    fn test_opcodes_match_shared_table() {
        assert_eq!(u8::from(Opcode::ReadSymtab), OPCODE_READ_SYMTAB);
        assert_eq!(u8::from(Opcode::LoadTrigger), OPCODE_LOAD_TRIGGER);
        assert_eq!(u8::from(Opcode::Triggered), OPCODE_TRIGGERED);
    }

    #[test]
    fn test_opcode_decoding() {
        assert_eq!(Opcode::from_primitive(0x01), Opcode::ReadSymtab);
        assert_eq!(Opcode::from_primitive(0x02), Opcode::LoadTrigger);
        assert_eq!(Opcode::from_primitive(0x03), Opcode::Triggered);
        assert_eq!(Opcode::from_primitive(0xA5), Opcode::Unknown(0xA5));
        assert_eq!(u8::from(Opcode::Triggered), 0x03);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(State::SymtabReadWait.to_string(), "SYMTAB_READ_WAIT");
        assert_eq!(State::ReconfigureFinish.to_string(), "RECONFIGURE_FINISH");
    }
}
