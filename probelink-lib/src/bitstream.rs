//! Trigger-configuration bitstream.
//!
//! After `LOAD_TRIGGER` the host streams `2 × width` bytes, grouped into
//! 32-bit big-endian words (32 words per 64 monitored channels). The device
//! side assembles them with [`BitstreamAssembler`]; the host side packs them
//! with [`TriggerBitstream`].

use crate::constants::{BITSTREAM_BYTES_PER_CHANNEL, WORD_SIZE};
use crate::error::ProbeError;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the bitstream for a given capture width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitstreamLayout {
    width: u32,
    size: usize,
}

impl BitstreamLayout {
    pub fn for_width(width: u32) -> Result<Self, ProbeError> {
        let size = width as usize * BITSTREAM_BYTES_PER_CHANNEL;
        if size == 0 || size % WORD_SIZE != 0 {
            return Err(ProbeError::UnalignedBitstream { width, size });
        }
        Ok(Self { width, size })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Total length in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn word_count(&self) -> usize {
        self.size / WORD_SIZE
    }

    /// Position of the final byte of the stream
    pub fn last_offset(&self) -> usize {
        self.size - 1
    }
}

/// What a single received byte did to the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shifted {
    /// Word completed by this byte, if it was the 4th of its group
    pub word: Option<u32>,
    /// This byte was the last one of the stream
    pub last: bool,
}

/// Device-side word assembler: a 32-bit shift register and a byte counter.
#[derive(Debug, Clone, Default)]
pub struct BitstreamAssembler {
    bitpos: usize,
    accumulator: u32,
}

impl BitstreamAssembler {
    pub fn reset(&mut self) {
        self.bitpos = 0;
        self.accumulator = 0;
    }

    /// Number of bytes consumed so far
    pub fn bitpos(&self) -> usize {
        self.bitpos
    }

    pub fn accumulator(&self) -> u32 {
        self.accumulator
    }

    /// Shift one byte in; the oldest byte of a word ends up most significant.
    pub fn shift(&mut self, byte: u8, layout: &BitstreamLayout) -> Shifted {
        self.accumulator = (self.accumulator << 8) | byte as u32;
        let completes_word = self.bitpos % WORD_SIZE == WORD_SIZE - 1;
        let last = self.bitpos == layout.last_offset();
        self.bitpos += 1;

        Shifted {
            word: completes_word.then_some(self.accumulator),
            last,
        }
    }
}

/// A complete trigger configuration, ready to be streamed to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerBitstream {
    bytes: Bytes,
}

impl TriggerBitstream {
    pub fn from_words(words: &[u32], layout: &BitstreamLayout) -> Result<Self, ProbeError> {
        let mut buf = BytesMut::with_capacity(words.len() * WORD_SIZE);
        for word in words {
            buf.put_u32(*word);
        }
        Self::from_bytes(buf.freeze(), layout)
    }

    pub fn from_bytes(bytes: impl Into<Bytes>, layout: &BitstreamLayout) -> Result<Self, ProbeError> {
        let bytes = bytes.into();
        if bytes.len() != layout.size() {
            return Err(ProbeError::BitstreamLength {
                expected: layout.size(),
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    /// All-zero configuration of the right length
    pub fn zeroed(layout: &BitstreamLayout) -> Self {
        Self {
            bytes: Bytes::from(vec![0u8; layout.size()]),
        }
    }

    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.bytes
            .chunks_exact(WORD_SIZE)
            .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_reference_width() {
        let layout = BitstreamLayout::for_width(128).unwrap();
        assert_eq!(layout.size(), 256);
        assert_eq!(layout.word_count(), 64);
        assert_eq!(layout.last_offset(), 255);
    }

    #[test]
    fn test_layout_rejects_misaligned_width() {
        assert!(matches!(
            BitstreamLayout::for_width(7),
            Err(ProbeError::UnalignedBitstream { width: 7, size: 14 })
        ));
        assert!(BitstreamLayout::for_width(0).is_err());
        assert!(BitstreamLayout::for_width(2).is_ok());
    }

    #[test]
    fn test_assembler_builds_big_endian_words() {
        let layout = BitstreamLayout::for_width(4).unwrap();
        let mut asm = BitstreamAssembler::default();
        let input = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        let results: Vec<Shifted> = input.iter().map(|b| asm.shift(*b, &layout)).collect();

        assert_eq!(results[3].word, Some(0xDEADBEEF));
        assert_eq!(results[7].word, Some(0x01020304));
        assert!(results[7].last);
        assert!(results[..7].iter().all(|r| !r.last));
        assert_eq!(results.iter().filter(|r| r.word.is_some()).count(), 2);
        assert_eq!(asm.bitpos(), 8);

        asm.reset();
        assert_eq!(asm.bitpos(), 0);
        assert_eq!(asm.accumulator(), 0);
    }

    #[test]
    fn test_trigger_bitstream_length_checked() {
        let layout = BitstreamLayout::for_width(64).unwrap();
        let words: Vec<u32> = (0..32).collect();
        let stream = TriggerBitstream::from_words(&words, &layout).unwrap();
        assert_eq!(stream.len(), 128);
        assert_eq!(stream.words().collect::<Vec<_>>(), words);

        let err = TriggerBitstream::from_words(&words[..31], &layout).unwrap_err();
        assert!(matches!(err, ProbeError::BitstreamLength { expected: 128, actual: 124 }));
    }
}
