//! Host side of the protocol: fetch the descriptor, load trigger
//! configurations and wait for the capture notification.

use crate::bitstream::TriggerBitstream;
use crate::constants::DESCRIPTOR_TABLE_SIZE;
use crate::dispatcher::Opcode;
use crate::error::ProbeError;
use crate::transport::{ChannelLink, SerialConfig};
use bytes::{BufMut, Bytes, BytesMut};
use serialport::{SerialPort, SerialPortInfo};
use std::io::{self, Read, Write};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A raw byte pipe to the device.
pub trait ByteLink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ProbeError>;

    /// Read one byte, or `None` if nothing arrived within `timeout`.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ProbeError>;
}

pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    pub fn open(config: &SerialConfig) -> Result<Self, ProbeError> {
        info!(path = %config.path, baud = config.baud_rate, "opening serial link");
        Ok(Self { port: config.open()? })
    }

    pub fn list_ports() -> Result<Vec<SerialPortInfo>, ProbeError> {
        Ok(serialport::available_ports()?)
    }
}

impl ByteLink for SerialLink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ProbeError> {
        debug!(bytes = hex::encode(bytes), "serial write");
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ProbeError> {
        self.port.set_timeout(timeout)?;
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl ByteLink for ChannelLink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ProbeError> {
        for byte in bytes {
            self.tx.send(*byte).map_err(|_| ProbeError::Disconnected)?;
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ProbeError> {
        match self.rx.recv_timeout(timeout) {
            Ok(byte) => Ok(Some(byte)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ProbeError::Disconnected),
        }
    }
}

/// Protocol client on top of a [`ByteLink`].
///
/// The notification byte can arrive at any time the device is idle. Bytes
/// seen outside a command are checked for it so a notification is not lost;
/// one emitted in the same instant the device accepts `READ_SYMTAB` cannot be
/// told apart from table data, so callers should not fetch the table while a
/// capture may be finishing.
pub struct HostLink<L> {
    link: L,
    table_size: usize,
    byte_timeout: Duration,
    triggered: bool,
}

impl<L: ByteLink> HostLink<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            table_size: DESCRIPTOR_TABLE_SIZE,
            byte_timeout: Duration::from_millis(500),
            triggered: false,
        }
    }

    pub fn with_table_size(mut self, table_size: usize) -> Self {
        self.table_size = table_size;
        self
    }

    /// Longest silence tolerated in the middle of a table dump
    pub fn with_byte_timeout(mut self, timeout: Duration) -> Self {
        self.byte_timeout = timeout;
        self
    }

    /// Consume whatever the device sent while no command was running.
    fn drain(&mut self) -> Result<(), ProbeError> {
        while let Some(byte) = self.link.read_byte(Duration::ZERO)? {
            self.note_unsolicited(byte);
        }
        Ok(())
    }

    fn note_unsolicited(&mut self, byte: u8) {
        if Opcode::from(byte) == Opcode::Triggered {
            info!("capture notification received");
            self.triggered = true;
        } else {
            warn!(byte = format_args!("{:#04x}", byte), "discarding unexpected byte");
        }
    }

    /// Fetch the descriptor table.
    pub fn read_symtab(&mut self) -> Result<Bytes, ProbeError> {
        self.drain()?;
        self.link.write_bytes(&[Opcode::ReadSymtab.into()])?;

        let mut table = BytesMut::with_capacity(self.table_size);
        while table.len() < self.table_size {
            match self.link.read_byte(self.byte_timeout)? {
                Some(byte) => table.put_u8(byte),
                None => {
                    warn!(received = table.len(), expected = self.table_size, "symbol table dump stalled");
                    return Err(ProbeError::Timeout(self.byte_timeout));
                }
            }
        }
        info!(bytes = table.len(), "symbol table received");
        Ok(table.freeze())
    }

    /// Stream a trigger configuration. The device does not acknowledge it.
    pub fn load_trigger(&mut self, bitstream: &TriggerBitstream) -> Result<(), ProbeError> {
        self.drain()?;
        let mut frame = Vec::with_capacity(1 + bitstream.len());
        frame.push(Opcode::LoadTrigger.into());
        frame.extend_from_slice(bitstream.as_bytes());
        self.link.write_bytes(&frame)?;
        // A finished load re-arms the device's notification.
        self.triggered = false;
        info!(bytes = bitstream.len(), "trigger configuration sent");
        Ok(())
    }

    /// Block until the device reports a finished capture or `timeout` elapses.
    pub fn wait_for_trigger(&mut self, timeout: Duration) -> Result<bool, ProbeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.triggered {
                self.triggered = false;
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if let Some(byte) = self.link.read_byte(remaining)? {
                self.note_unsolicited(byte);
            }
        }
    }

    pub fn into_inner(self) -> L {
        self.link
    }
}
