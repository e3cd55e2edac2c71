//! # Channel descriptor table
//!
//! The probe describes what it captures through a fixed-size descriptor that
//! the host fetches with `READ_SYMTAB`. In transmission order it reads:
//!
//! | bytes          | field                                           |
//! |----------------|-------------------------------------------------|
//! | `0..pad`       | zero padding up to the fixed table size         |
//! | 8              | magic tag `DEBUGROM`                            |
//! | 4              | timebase in picoseconds, big-endian             |
//! | 4              | capture depth (samples), big-endian             |
//! | 4              | capture width (bits), big-endian                |
//! | per channel    | NUL-terminated name, width byte, format byte    |
//!
//! The device keeps the descriptor as a blob indexed least significant byte
//! first, so fields appear most significant byte first only once the blob is
//! reversed. [`DescriptorTable`] performs that reversal once at start-up and
//! is read-only afterwards.

use crate::constants::{DESCRIPTOR_HEADER_SIZE, DESCRIPTOR_MAGIC};
use crate::error::ProbeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One `(name, width, format)` record of the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub name: String,
    /// Width of the channel in bits
    pub width: u8,
    /// Display format, reserved (always 0 today)
    #[serde(default)]
    pub format: u8,
}

impl ChannelRecord {
    pub fn new(name: impl Into<String>, width: u8) -> Self {
        Self {
            name: name.into(),
            width,
            format: 0,
        }
    }

    fn encoded_len(&self) -> usize {
        self.name.len() + 3
    }
}

/// Metadata about the capture engine: timing, geometry and channel layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorSpec {
    pub timebase_ps: u32,
    pub depth: u32,
    pub width: u32,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
}

impl DescriptorSpec {
    pub fn from_json(json: &str) -> Result<Self, ProbeError> {
        let spec: Self = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Checks channel names, that every channel is at least one bit wide and
    /// that channel widths add up to the capture width.
    ///
    /// A descriptor without channel records is allowed; it only carries the header.
    pub fn validate(&self) -> Result<(), ProbeError> {
        for channel in &self.channels {
            let name = &channel.name;
            if name.is_empty() || !name.is_ascii() || name.bytes().any(|b| b == 0) {
                return Err(ProbeError::InvalidChannelName(name.clone()));
            }
            if channel.width == 0 {
                return Err(ProbeError::ZeroWidthChannel(name.clone()));
            }
        }

        if !self.channels.is_empty() {
            let total: u32 = self.channels.iter().map(|c| c.width as u32).sum();
            if total != self.width {
                return Err(ProbeError::ChannelWidthMismatch {
                    expected: self.width,
                    actual: total,
                });
            }
        }
        Ok(())
    }

    /// Number of bytes the header and channel records occupy, without padding
    pub fn encoded_len(&self) -> usize {
        DESCRIPTOR_HEADER_SIZE + self.channels.iter().map(ChannelRecord::encoded_len).sum::<usize>()
    }

    fn encode_records(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(DESCRIPTOR_MAGIC);
        buf.put_u32(self.timebase_ps);
        buf.put_u32(self.depth);
        buf.put_u32(self.width);
        for channel in &self.channels {
            buf.put_slice(channel.name.as_bytes());
            buf.put_u8(0);
            buf.put_u8(channel.width);
            buf.put_u8(channel.format);
        }
        buf
    }

    /// Serialize into the device's blob representation of `table_size` bytes.
    pub fn to_blob(&self, table_size: usize) -> Result<DescriptorBlob, ProbeError> {
        self.validate()?;
        let records = self.encode_records();
        if records.len() > table_size {
            return Err(ProbeError::DescriptorOverflow {
                needed: records.len(),
                capacity: table_size,
            });
        }

        let mut wire = vec![0u8; table_size - records.len()];
        wire.extend_from_slice(&records);
        // The blob is stored least significant byte first.
        wire.reverse();
        DescriptorBlob::from_bytes(wire, table_size)
    }

    /// Decode a descriptor table as received from the device.
    pub fn from_table(table: &[u8]) -> Result<Self, ProbeError> {
        let start = table
            .iter()
            .position(|&b| b != 0)
            .ok_or(ProbeError::MissingMagic)?;
        let mut buf = &table[start..];

        if buf.len() < DESCRIPTOR_HEADER_SIZE {
            if buf.starts_with(&DESCRIPTOR_MAGIC[..buf.len().min(DESCRIPTOR_MAGIC.len())]) {
                return Err(ProbeError::Truncated {
                    offset: start,
                    message: format!("header needs {} bytes, {} left", DESCRIPTOR_HEADER_SIZE, buf.len()),
                });
            }
            return Err(ProbeError::MissingMagic);
        }
        if &buf[..DESCRIPTOR_MAGIC.len()] != DESCRIPTOR_MAGIC {
            return Err(ProbeError::MissingMagic);
        }
        buf.advance(DESCRIPTOR_MAGIC.len());

        let timebase_ps = buf.get_u32();
        let depth = buf.get_u32();
        let width = buf.get_u32();

        let mut channels = Vec::new();
        while buf.has_remaining() {
            let offset = table.len() - buf.remaining();
            let name_end = buf.iter().position(|&b| b == 0).ok_or_else(|| ProbeError::Truncated {
                offset,
                message: "unterminated channel name".to_string(),
            })?;
            let name = String::from_utf8_lossy(&buf[..name_end]).to_string();
            buf.advance(name_end + 1);

            if buf.remaining() < 2 {
                return Err(ProbeError::Truncated {
                    offset: table.len() - buf.remaining(),
                    message: format!("channel {:?} is missing its width/format bytes", name),
                });
            }
            let channel_width = buf.get_u8();
            let format = buf.get_u8();
            channels.push(ChannelRecord {
                name,
                width: channel_width,
                format,
            });
        }

        Ok(Self {
            timebase_ps,
            depth,
            width,
            channels,
        })
    }

    /// Sample period in seconds
    pub fn sample_period_s(&self) -> f64 {
        self.timebase_ps as f64 / 1e12
    }
}

impl fmt::Display for DescriptorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Timebase: {} ps", self.timebase_ps)?;
        writeln!(f, "Depth:    {} samples", self.depth)?;
        writeln!(f, "Width:    {} bits", self.width)?;
        if self.channels.is_empty() {
            return writeln!(f, "Channels: <none>");
        }
        writeln!(f, "Channels:")?;
        let mut bit = 0u32;
        for channel in &self.channels {
            let width = channel.width as u32;
            // Decoded tables are not validated; a zero-width record has no bit range.
            if width == 0 {
                writeln!(f, "  [   -:-   ] {:<24} format {}", channel.name, channel.format)?;
                continue;
            }
            writeln!(
                f,
                "  [{:>4}:{:<4}] {:<24} format {}",
                bit + width - 1,
                bit,
                channel.name,
                channel.format
            )?;
            bit += width;
        }
        Ok(())
    }
}

/// The raw descriptor as held by the device, least significant byte first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorBlob {
    bytes: Bytes,
}

impl DescriptorBlob {
    pub fn from_bytes(bytes: impl Into<Bytes>, expected_size: usize) -> Result<Self, ProbeError> {
        let bytes = bytes.into();
        if expected_size == 0 {
            return Err(ProbeError::EmptyTable);
        }
        if bytes.len() != expected_size {
            return Err(ProbeError::BlobLength {
                expected: expected_size,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Fixed-size, read-only descriptor table in transmission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTable {
    bytes: Box<[u8]>,
}

impl DescriptorTable {
    /// Byte `i` of the table is byte `len - 1 - i` of the blob.
    pub fn build(blob: &DescriptorBlob) -> Self {
        Self {
            bytes: blob.as_bytes().iter().rev().copied().collect(),
        }
    }

    pub fn from_spec(spec: &DescriptorSpec, table_size: usize) -> Result<Self, ProbeError> {
        Ok(Self::build(&spec.to_blob(table_size)?))
    }

    pub fn read(&self, index: usize) -> Option<u8> {
        self.bytes.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.bytes.len().saturating_sub(1)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Registered read port on a [`DescriptorTable`].
///
/// An index asserted with [`request`](Self::request) during one step is
/// latched by [`clock`](Self::clock) at the end of that step, and its byte is
/// visible through [`data`](Self::data) on the next one.
#[derive(Debug, Clone, Default)]
pub struct TableReadPort {
    index: usize,
    pending: bool,
    data: u8,
}

impl TableReadPort {
    pub fn request(&mut self, index: usize) {
        self.index = index;
        self.pending = true;
    }

    pub fn clock(&mut self, table: &DescriptorTable) {
        if self.pending {
            // Reads past the end return zero, like an unpopulated ROM word.
            self.data = table.read(self.index).unwrap_or_default();
            self.pending = false;
        }
    }

    /// Index of the most recent request
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn data(&self) -> u8 {
        self.data
    }
}
