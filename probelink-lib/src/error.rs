use std::io;
use std::time::Duration;
use thiserror::Error;

/// The primary error type for the `probelink` library.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Capture width {width} gives a {size}-byte bitstream, which is not a whole number of 32-bit words")]
    UnalignedBitstream { width: u32, size: usize },

    #[error("Blob length mismatch: expected {expected} bytes, got {actual}")]
    BlobLength { expected: usize, actual: usize },

    #[error("Descriptor needs {needed} bytes but the table holds {capacity}")]
    DescriptorOverflow { needed: usize, capacity: usize },

    #[error("Invalid channel name {0:?}")]
    InvalidChannelName(String),

    #[error("Channel {0:?} has zero width")]
    ZeroWidthChannel(String),

    #[error("Descriptor table cannot be empty")]
    EmptyTable,

    #[error("Channel widths sum to {actual} bits, capture width is {expected}")]
    ChannelWidthMismatch { expected: u32, actual: u32 },

    #[error("Descriptor magic not found")]
    MissingMagic,

    #[error("Descriptor truncated at offset {offset}: {message}")]
    Truncated { offset: usize, message: String },

    #[error("Bitstream length mismatch: expected {expected} bytes, got {actual}")]
    BitstreamLength { expected: usize, actual: usize },

    #[error("Timed out after {0:?} waiting for the device")]
    Timeout(Duration),

    #[error("Link disconnected")]
    Disconnected,
}
