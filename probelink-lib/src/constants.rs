// Protocol constants shared by host and device builds

/// Size of the descriptor table (2048 bytes)
pub const DESCRIPTOR_TABLE_SIZE: usize = 2048;

/// Tag that opens the descriptor header
pub const DESCRIPTOR_MAGIC: &[u8; 8] = b"DEBUGROM";

/// Magic plus timebase, depth and width fields (20 bytes)
pub const DESCRIPTOR_HEADER_SIZE: usize = DESCRIPTOR_MAGIC.len() + 3 * 4;

/// Opcode: dump the descriptor table
pub const OPCODE_READ_SYMTAB: u8 = 0x01;

/// Opcode: stream a new trigger configuration
pub const OPCODE_LOAD_TRIGGER: u8 = 0x02;

/// Outbound-only notification that a capture has finished
pub const OPCODE_TRIGGERED: u8 = 0x03;

/// Size of one configuration word on the wire
pub const WORD_SIZE: usize = 4;

/// Configuration bytes per monitored channel
pub const BITSTREAM_BYTES_PER_CHANNEL: usize = 2;

/// Capture width of the reference build, in bits
pub const DEFAULT_CAPTURE_WIDTH: u32 = 128;

/// Default serial bit rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
