//! Byte transports on the device side of the link.

use crate::constants::DEFAULT_BAUD_RATE;
use crate::error::ProbeError;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Duration;
use tracing::trace;

/// The dispatcher's view of the byte transport.
///
/// At most one byte is in flight: callers check [`is_busy`](Self::is_busy)
/// before calling [`try_send`](Self::try_send).
///
/// The receive side is assumed to buffer: the dispatcher only polls it in
/// states that consume input, and anything arriving meanwhile must still be
/// there afterwards. A bare one-step receive pulse does not satisfy this.
pub trait Transport {
    fn is_busy(&self) -> bool;

    fn try_send(&mut self, byte: u8) -> Result<(), ProbeError>;

    /// The byte that arrived since the previous step, if any.
    fn poll_received(&mut self) -> Result<Option<u8>, ProbeError>;

    /// Called once at the end of every control-loop step.
    fn clock(&mut self) {}
}

/// Settings for opening a serial port with the protocol's 8N1 framing.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(10),
        }
    }

    pub fn open(&self) -> Result<Box<dyn SerialPort>, ProbeError> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        Ok(port)
    }
}

/// Device-side transport over a real serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(config: &SerialConfig) -> Result<Self, ProbeError> {
        Ok(Self { port: config.open()? })
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Transport for SerialTransport {
    fn is_busy(&self) -> bool {
        // write_all below only returns once the OS has taken the byte
        false
    }

    fn try_send(&mut self, byte: u8) -> Result<(), ProbeError> {
        trace!(byte = format_args!("{:#04x}", byte), "tx");
        self.port.write_all(&[byte])?;
        Ok(())
    }

    fn poll_received(&mut self) -> Result<Option<u8>, ProbeError> {
        if self.port.bytes_to_read()? == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; 1];
        self.port.read_exact(&mut buf)?;
        trace!(byte = format_args!("{:#04x}", buf[0]), "rx");
        Ok(Some(buf[0]))
    }
}

/// Device end of an in-process link.
///
/// Every sent byte keeps the transmitter busy for `busy_steps` steps, which
/// stands in for the time a UART spends shifting a frame out.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Sender<u8>,
    rx: Receiver<u8>,
    peeked: Option<u8>,
    busy_steps: u32,
    busy_left: u32,
}

/// Host end of an in-process link.
#[derive(Debug)]
pub struct ChannelLink {
    pub(crate) tx: Sender<u8>,
    pub(crate) rx: Receiver<u8>,
}

/// Create a connected device/host pair.
pub fn channel_pair(busy_steps: u32) -> (ChannelTransport, ChannelLink) {
    let (host_tx, device_rx) = mpsc::channel();
    let (device_tx, host_rx) = mpsc::channel();
    (
        ChannelTransport {
            tx: device_tx,
            rx: device_rx,
            peeked: None,
            busy_steps,
            busy_left: 0,
        },
        ChannelLink {
            tx: host_tx,
            rx: host_rx,
        },
    )
}

impl ChannelTransport {
    /// True if a byte is waiting to be received.
    pub fn has_pending(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.rx.try_recv().ok();
        }
        self.peeked.is_some()
    }
}

impl Transport for ChannelTransport {
    fn is_busy(&self) -> bool {
        self.busy_left > 0
    }

    fn try_send(&mut self, byte: u8) -> Result<(), ProbeError> {
        self.tx.send(byte).map_err(|_| ProbeError::Disconnected)?;
        self.busy_left = self.busy_steps;
        Ok(())
    }

    fn poll_received(&mut self) -> Result<Option<u8>, ProbeError> {
        if let Some(byte) = self.peeked.take() {
            return Ok(Some(byte));
        }
        match self.rx.try_recv() {
            Ok(byte) => Ok(Some(byte)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ProbeError::Disconnected),
        }
    }

    fn clock(&mut self) {
        self.busy_left = self.busy_left.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_busy_window() {
        let (mut device, link) = channel_pair(2);
        assert!(!device.is_busy());
        device.try_send(0x42).unwrap();
        assert!(device.is_busy());
        device.clock();
        assert!(device.is_busy());
        device.clock();
        assert!(!device.is_busy());
        assert_eq!(link.rx.try_recv().unwrap(), 0x42);
    }

    #[test]
    fn test_channel_peek_keeps_byte() {
        let (mut device, link) = channel_pair(0);
        assert!(!device.has_pending());
        link.tx.send(7).unwrap();
        assert!(device.has_pending());
        assert_eq!(device.poll_received().unwrap(), Some(7));
        assert_eq!(device.poll_received().unwrap(), None);

        drop(link);
        assert!(matches!(device.poll_received(), Err(ProbeError::Disconnected)));
    }
}
