use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use spdlog::info;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use super::constants::READ_BUFFER_SIZE;
use super::error::RawBufferError;

/// One receive result of a raw buffer recording.
///
/// On disk an entry is `i32 error_code, i32 wsa_error, i32 byte_count,
/// u8 data[byte_count]` in native byte order. The data starts with a single
/// padding byte which aligns the payload after the 3 byte packet header. A
/// byte count of zero or less carries no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBufferEntry {
    pub error_code: i32,
    pub wsa_error: i32,
    pub data: Vec<u8>,
}

impl RawBufferEntry {
    /// The received datagram without the padding byte
    pub fn datagram(&self) -> &[u8] {
        self.data.get(1..).unwrap_or(&[])
    }

    pub fn has_data(&self) -> bool {
        self.data.len() > 1
    }
}

/// Appends receive results to a raw buffer file
#[derive(Debug)]
pub struct RawBufferRecorder<W: Write> {
    out: W,
    entries: usize,
}

impl RawBufferRecorder<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, RawBufferError> {
        let file = File::create(path)?;
        info!("Writing raw readout buffers to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> RawBufferRecorder<W> {
    pub fn new(out: W) -> Self {
        Self { out, entries: 0 }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Record a successfully received datagram
    pub fn record_datagram(&mut self, datagram: &[u8]) -> Result<(), RawBufferError> {
        self.out.write_i32::<NativeEndian>(0)?;
        self.out.write_i32::<NativeEndian>(0)?;
        self.out.write_i32::<NativeEndian>(datagram.len() as i32 + 1)?;
        self.out.write_u8(0)?;
        self.out.write_all(datagram)?;
        self.entries += 1;
        Ok(())
    }

    /// Record a receive that produced no data. `error_code` is the OS error,
    /// 0 for a plain timeout.
    pub fn record_failure(&mut self, error_code: i32) -> Result<(), RawBufferError> {
        self.out.write_i32::<NativeEndian>(error_code)?;
        self.out.write_i32::<NativeEndian>(0)?;
        self.out.write_i32::<NativeEndian>(0)?;
        self.entries += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RawBufferError> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads the entries of a raw buffer file in order
#[derive(Debug)]
pub struct RawBufferReader<R: Read> {
    input: R,
    entries: usize,
}

impl RawBufferReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, RawBufferError> {
        if !path.exists() {
            return Err(RawBufferError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> RawBufferReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, entries: 0 }
    }

    /// Number of entries read so far
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Next entry, or `None` at a clean end of file
    pub fn read_entry(&mut self) -> Result<Option<RawBufferEntry>, RawBufferError> {
        let index = self.entries;
        let error_code = match self.input.read_i32::<NativeEndian>() {
            Ok(value) => value,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let wsa_error = self.read_field(index)?;
        let byte_count = self.read_field(index)?;

        // Padding byte plus the largest datagram we ever receive
        if byte_count as i64 > READ_BUFFER_SIZE as i64 + 1 {
            return Err(RawBufferError::InvalidEntrySize(index, byte_count));
        }

        let mut data = vec![0u8; byte_count.max(0) as usize];
        if let Err(e) = self.input.read_exact(&mut data) {
            return Err(match e.kind() {
                ErrorKind::UnexpectedEof => RawBufferError::TruncatedEntry(index),
                _ => e.into(),
            });
        }

        self.entries += 1;
        Ok(Some(RawBufferEntry {
            error_code,
            wsa_error,
            data,
        }))
    }

    fn read_field(&mut self, index: usize) -> Result<i32, RawBufferError> {
        self.input.read_i32::<NativeEndian>().map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => RawBufferError::TruncatedEntry(index),
            _ => e.into(),
        })
    }
}

impl<R: Read> Iterator for RawBufferReader<R> {
    type Item = Result<RawBufferEntry, RawBufferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_record_and_read_back() {
        let mut recorder = RawBufferRecorder::new(Vec::new());
        recorder.record_datagram(&[0x08, 0, 0, 1, 2, 3, 4]).unwrap();
        recorder.record_failure(11).unwrap();
        assert_eq!(recorder.entries(), 2);
        let bytes = recorder.into_inner();
        // 3 fields, padding byte, 7 data bytes, then 3 fields
        assert_eq!(bytes.len(), 12 + 8 + 12);

        let entries: Vec<RawBufferEntry> = RawBufferReader::new(Cursor::new(bytes))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].data[0], 0);
        assert_eq!(entries[0].datagram(), &[0x08, 0, 0, 1, 2, 3, 4]);
        assert!(!entries[1].has_data());
        assert_eq!(entries[1].error_code, 11);
        assert!(entries[1].datagram().is_empty());
    }

    #[test]
    fn test_truncated_entry() {
        let mut recorder = RawBufferRecorder::new(Vec::new());
        recorder.record_datagram(&[1, 2, 3, 4, 5]).unwrap();
        let mut bytes = recorder.into_inner();
        bytes.truncate(bytes.len() - 2);
        let mut reader = RawBufferReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_entry(),
            Err(RawBufferError::TruncatedEntry(0))
        ));
    }

    #[test]
    fn test_negative_byte_count_has_no_data() {
        let mut bytes = Vec::new();
        bytes.write_i32::<NativeEndian>(11).unwrap();
        bytes.write_i32::<NativeEndian>(0).unwrap();
        bytes.write_i32::<NativeEndian>(-1).unwrap();
        bytes.write_i32::<NativeEndian>(0).unwrap();
        bytes.write_i32::<NativeEndian>(0).unwrap();
        bytes.write_i32::<NativeEndian>(1 << 20).unwrap();
        let mut reader = RawBufferReader::new(Cursor::new(bytes));
        let entry = reader.read_entry().unwrap().unwrap();
        assert!(entry.data.is_empty());
        assert!(matches!(
            reader.read_entry(),
            Err(RawBufferError::InvalidEntrySize(1, _))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sis3153_raw_buffers.bin");
        let mut recorder = RawBufferRecorder::create(&path).unwrap();
        recorder.record_datagram(&[0x08, 1, 2]).unwrap();
        recorder.flush().unwrap();
        drop(recorder);

        let mut reader = RawBufferReader::open(&path).unwrap();
        assert_eq!(reader.read_entry().unwrap().unwrap().datagram(), &[0x08, 1, 2]);
        assert!(reader.read_entry().unwrap().is_none());
        assert!(matches!(
            RawBufferReader::open(&dir.path().join("missing.bin")),
            Err(RawBufferError::BadFilePath(_))
        ));
    }
}
