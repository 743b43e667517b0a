use byteorder::{ByteOrder, NativeEndian};

use super::constants::WORD_SIZE;
use super::error::EndOfBuffer;

/// A bounds checked cursor over a raw SIS3153 buffer.
///
/// Words are read in native byte order, the SIS3153 sends data in the host's
/// order once the 3 byte packet header has been stripped. One iterator is
/// created per processing call and never shared.
#[derive(Debug, Clone)]
pub struct BufferIterator<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BufferIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read the next 32-bit word and advance by 4 bytes
    pub fn extract_u32(&mut self) -> Result<u32, EndOfBuffer> {
        let bytes = self.take(WORD_SIZE)?;
        Ok(NativeEndian::read_u32(bytes))
    }

    /// Borrow the next `size` bytes without advancing. Used to hand an embedded
    /// event to the single event processor.
    pub fn sub_slice(&self, size: usize) -> Result<&'a [u8], EndOfBuffer> {
        self.check(size)?;
        Ok(&self.data[self.position..self.position + size])
    }

    /// Advance by `count` words of `word_size` bytes each
    pub fn skip(&mut self, word_size: usize, count: usize) -> Result<(), EndOfBuffer> {
        self.take(word_size * count).map(|_| ())
    }

    pub fn longwords_left(&self) -> usize {
        self.bytes_left() / WORD_SIZE
    }

    pub fn bytes_left(&self) -> usize {
        self.data.len() - self.position
    }

    fn check(&self, needed: usize) -> Result<(), EndOfBuffer> {
        let available = self.bytes_left();
        if needed > available {
            Err(EndOfBuffer { needed, available })
        } else {
            Ok(())
        }
    }

    fn take(&mut self, size: usize) -> Result<&'a [u8], EndOfBuffer> {
        self.check(size)?;
        let slice = &self.data[self.position..self.position + size];
        self.position += size;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        let mut bytes = vec![0u8; words.len() * WORD_SIZE];
        NativeEndian::write_u32_into(words, &mut bytes);
        bytes
    }

    #[test]
    fn test_extract_until_exhausted() {
        let bytes = words_to_bytes(&[0xbb000001, 0x87654321]);
        let mut iter = BufferIterator::new(&bytes);
        assert_eq!(iter.longwords_left(), 2);
        assert_eq!(iter.extract_u32(), Ok(0xbb000001));
        assert_eq!(iter.extract_u32(), Ok(0x87654321));
        assert_eq!(iter.bytes_left(), 0);
        assert_eq!(
            iter.extract_u32(),
            Err(EndOfBuffer {
                needed: 4,
                available: 0
            })
        );
    }

    #[test]
    fn test_trailing_bytes_are_not_a_word() {
        let mut bytes = words_to_bytes(&[1]);
        bytes.extend_from_slice(&[0xaa, 0xbb]);
        let mut iter = BufferIterator::new(&bytes);
        assert_eq!(iter.longwords_left(), 1);
        assert_eq!(iter.bytes_left(), 6);
        iter.extract_u32().unwrap();
        assert_eq!(iter.longwords_left(), 0);
        assert!(iter.extract_u32().is_err());
        // A failed read does not move the cursor
        assert_eq!(iter.bytes_left(), 2);
    }

    #[test]
    fn test_skip_and_sub_slice() {
        let bytes = words_to_bytes(&[1, 2, 3, 4]);
        let mut iter = BufferIterator::new(&bytes);
        iter.skip(WORD_SIZE, 1).unwrap();
        let sub = iter.sub_slice(2 * WORD_SIZE).unwrap();
        assert_eq!(NativeEndian::read_u32(sub), 2);
        assert_eq!(iter.bytes_left(), 3 * WORD_SIZE);
        iter.skip(WORD_SIZE, 2).unwrap();
        assert_eq!(iter.extract_u32(), Ok(4));
        assert!(iter.skip(WORD_SIZE, 1).is_err());
        assert!(iter.sub_slice(1).is_err());
    }
}
