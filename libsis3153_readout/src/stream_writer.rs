use super::constants::*;
use super::data_buffer::DataBuffer;
use super::error::StreamWriterError;

/// Set when a module section hit its configured maximum and words were dropped
pub const MODULE_SIZE_EXCEEDED: u8 = 1;

/// Incrementally serializes one event section (with its module subsections)
/// into a [`DataBuffer`].
///
/// Layout of an event section:
/// `[event header][module header, data words..., EndMarker]*[EndMarker]`.
/// Header size fields are patched in when a section is closed. The writer only
/// stores offsets, the buffer is passed to every call so the same writer can
/// continue an event across multiple input datagrams.
///
/// An event section never grows past `SECTION_MAX_WORDS`: any write that would
/// need more room fails with [`StreamWriterError::EventSizeExceeded`] and the
/// event has to be discarded.
#[derive(Debug, Clone, Default)]
pub struct StreamWriter {
    event_header_offset: Option<usize>,
    module_header_offset: Option<usize>,
    event_size: u32,
    module_size: u32,
    module_max_words: u32,
    flags: u8,
}

impl StreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_event_section(
        &mut self,
        buffer: &mut DataBuffer,
        event_index: usize,
    ) -> Result<(), StreamWriterError> {
        if self.has_open_event_section() {
            return Err(StreamWriterError::EventSectionOpen);
        }
        if self.has_open_module_section() {
            return Err(StreamWriterError::ModuleSectionOpen);
        }
        self.event_header_offset = Some(buffer.used());
        self.event_size = 0;
        buffer.push_u32(
            ((SECTION_TYPE_EVENT << SECTION_TYPE_SHIFT) & SECTION_TYPE_MASK)
                | (((event_index as u32) << EVENT_TYPE_SHIFT) & EVENT_TYPE_MASK),
        );
        Ok(())
    }

    /// Patch the event header size and return the section size in words
    pub fn close_event_section(&mut self, buffer: &mut DataBuffer) -> Result<u32, StreamWriterError> {
        let offset = self
            .event_header_offset
            .ok_or(StreamWriterError::NoEventSection)?;
        if self.has_open_module_section() {
            return Err(StreamWriterError::ModuleSectionOpen);
        }
        patch_size(buffer, offset, self.event_size, SECTION_SIZE_SHIFT, SECTION_SIZE_MASK)?;
        self.event_header_offset = None;
        Ok(self.event_size)
    }

    /// Open a module subsection. `max_words` limits the section including its
    /// terminating EndMarker.
    pub fn open_module_section(
        &mut self,
        buffer: &mut DataBuffer,
        module_type: u8,
        max_words: u32,
    ) -> Result<(), StreamWriterError> {
        if !self.has_open_event_section() {
            return Err(StreamWriterError::NoEventSection);
        }
        if self.has_open_module_section() {
            return Err(StreamWriterError::ModuleSectionOpen);
        }
        self.check_event_room()?;
        self.module_header_offset = Some(buffer.used());
        self.module_size = 0;
        self.module_max_words = max_words.clamp(1, SUBEVENT_MAX_WORDS);
        self.event_size += 1;
        buffer.push_u32(((module_type as u32) << MODULE_TYPE_SHIFT) & MODULE_TYPE_MASK);
        Ok(())
    }

    /// Patch the module header size and return the number of bytes of module
    /// data written
    pub fn close_module_section(&mut self, buffer: &mut DataBuffer) -> Result<usize, StreamWriterError> {
        if !self.has_open_event_section() {
            return Err(StreamWriterError::NoEventSection);
        }
        let offset = self
            .module_header_offset
            .ok_or(StreamWriterError::NoModuleSection)?;
        patch_size(buffer, offset, self.module_size, SUBEVENT_SIZE_SHIFT, SUBEVENT_SIZE_MASK)?;
        self.module_header_offset = None;
        Ok(self.module_size as usize * WORD_SIZE)
    }

    /// Append a word to the open module section. Words past the module limit
    /// are dropped and flagged, the module's EndMarker always fits.
    pub fn write_module_data(&mut self, buffer: &mut DataBuffer, word: u32) -> Result<(), StreamWriterError> {
        if !self.has_open_event_section() {
            return Err(StreamWriterError::NoEventSection);
        }
        if !self.has_open_module_section() {
            return Err(StreamWriterError::NoModuleSection);
        }
        let reserved = if word == END_MARKER { 0 } else { 1 };
        if self.module_size + reserved >= self.module_max_words {
            self.flags |= MODULE_SIZE_EXCEEDED;
            return Ok(());
        }
        self.check_event_room()?;
        buffer.push_u32(word);
        self.module_size += 1;
        self.event_size += 1;
        Ok(())
    }

    /// Append a word directly to the event section, outside of any module
    pub fn write_event_data(&mut self, buffer: &mut DataBuffer, word: u32) -> Result<(), StreamWriterError> {
        if !self.has_open_event_section() {
            return Err(StreamWriterError::NoEventSection);
        }
        if self.has_open_module_section() {
            return Err(StreamWriterError::ModuleSectionOpen);
        }
        self.check_event_room()?;
        buffer.push_u32(word);
        self.event_size += 1;
        Ok(())
    }

    fn check_event_room(&self) -> Result<(), StreamWriterError> {
        if self.event_size >= SECTION_MAX_WORDS {
            return Err(StreamWriterError::EventSizeExceeded);
        }
        Ok(())
    }

    pub fn has_open_event_section(&self) -> bool {
        self.event_header_offset.is_some()
    }

    pub fn has_open_module_section(&self) -> bool {
        self.module_header_offset.is_some()
    }

    pub fn event_size(&self) -> u32 {
        self.event_size
    }

    pub fn module_size(&self) -> u32 {
        self.module_size
    }

    /// Return and clear the size exceeded flags
    pub fn take_flags(&mut self) -> u8 {
        std::mem::take(&mut self.flags)
    }
}

fn patch_size(
    buffer: &mut DataBuffer,
    offset: usize,
    size: u32,
    shift: u32,
    mask: u32,
) -> Result<(), StreamWriterError> {
    let header = buffer
        .get_u32(offset)
        .ok_or(StreamWriterError::NoEventSection)?;
    buffer
        .set_u32(offset, header | ((size << shift) & mask))
        .map_err(|_| StreamWriterError::NoEventSection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_with_two_modules() {
        let mut buffer = DataBuffer::default();
        let mut writer = StreamWriter::new();
        writer.open_event_section(&mut buffer, 2).unwrap();
        writer.open_module_section(&mut buffer, 5, SUBEVENT_MAX_WORDS).unwrap();
        writer.write_module_data(&mut buffer, 0x1111).unwrap();
        writer.write_module_data(&mut buffer, END_MARKER).unwrap();
        assert_eq!(writer.close_module_section(&mut buffer), Ok(8));
        writer.open_module_section(&mut buffer, 9, SUBEVENT_MAX_WORDS).unwrap();
        writer.write_module_data(&mut buffer, END_MARKER).unwrap();
        assert_eq!(writer.close_module_section(&mut buffer), Ok(4));
        writer.write_event_data(&mut buffer, END_MARKER).unwrap();
        assert_eq!(writer.close_event_section(&mut buffer), Ok(6));

        let words: Vec<u32> = buffer.words().collect();
        assert_eq!(
            words,
            vec![
                (SECTION_TYPE_EVENT << SECTION_TYPE_SHIFT) | (2 << EVENT_TYPE_SHIFT) | 6,
                (5 << MODULE_TYPE_SHIFT) | 2,
                0x1111,
                END_MARKER,
                (9 << MODULE_TYPE_SHIFT) | 1,
                END_MARKER,
                END_MARKER,
            ]
        );
        assert_eq!(writer.take_flags(), 0);
    }

    #[test]
    fn test_module_limit_truncates_and_flags() {
        let mut buffer = DataBuffer::default();
        let mut writer = StreamWriter::new();
        writer.open_event_section(&mut buffer, 0).unwrap();
        writer.open_module_section(&mut buffer, 1, 3).unwrap();
        for word in 0..5 {
            writer.write_module_data(&mut buffer, word).unwrap();
        }
        writer.write_module_data(&mut buffer, END_MARKER).unwrap();
        writer.close_module_section(&mut buffer).unwrap();
        assert_eq!(writer.module_size(), 3);
        assert_eq!(writer.take_flags(), MODULE_SIZE_EXCEEDED);
        assert_eq!(writer.take_flags(), 0);
        let words: Vec<u32> = buffer.words().collect();
        assert_eq!(&words[2..], &[0, 1, END_MARKER]);
    }

    #[test]
    fn test_misuse_is_reported() {
        let mut buffer = DataBuffer::default();
        let mut writer = StreamWriter::new();
        assert_eq!(
            writer.open_module_section(&mut buffer, 1, 10),
            Err(StreamWriterError::NoEventSection)
        );
        assert_eq!(
            writer.close_event_section(&mut buffer),
            Err(StreamWriterError::NoEventSection)
        );
        writer.open_event_section(&mut buffer, 0).unwrap();
        assert_eq!(
            writer.open_event_section(&mut buffer, 0),
            Err(StreamWriterError::EventSectionOpen)
        );
        assert_eq!(
            writer.write_module_data(&mut buffer, 1),
            Err(StreamWriterError::NoModuleSection)
        );
        writer.open_module_section(&mut buffer, 1, 10).unwrap();
        assert!(writer.has_open_module_section());
        assert_eq!(
            writer.close_event_section(&mut buffer),
            Err(StreamWriterError::ModuleSectionOpen)
        );
        assert_eq!(
            writer.write_event_data(&mut buffer, END_MARKER),
            Err(StreamWriterError::ModuleSectionOpen)
        );
    }

    #[test]
    fn test_event_section_never_exceeds_maximum() {
        let mut buffer = DataBuffer::default();
        let mut writer = StreamWriter::new();
        writer.open_event_section(&mut buffer, 0).unwrap();
        writer.open_module_section(&mut buffer, 1, SUBEVENT_MAX_WORDS).unwrap();
        for word in 0..SECTION_MAX_WORDS + 10 {
            writer.write_module_data(&mut buffer, word & 0xffff).unwrap();
        }
        assert_eq!(writer.take_flags(), MODULE_SIZE_EXCEEDED);
        assert_eq!(writer.event_size(), SECTION_MAX_WORDS);

        // No room left for the module's EndMarker, another module or the
        // closing EndMarker
        assert_eq!(
            writer.write_module_data(&mut buffer, END_MARKER),
            Err(StreamWriterError::EventSizeExceeded)
        );
        writer.close_module_section(&mut buffer).unwrap();
        assert_eq!(
            writer.open_module_section(&mut buffer, 2, SUBEVENT_MAX_WORDS),
            Err(StreamWriterError::EventSizeExceeded)
        );
        assert_eq!(
            writer.write_event_data(&mut buffer, END_MARKER),
            Err(StreamWriterError::EventSizeExceeded)
        );
        assert_eq!(writer.event_size(), SECTION_MAX_WORDS);

        // The patched header still describes exactly the words written
        let size = writer.close_event_section(&mut buffer).unwrap();
        let header = buffer.get_u32(0).unwrap();
        assert_eq!(size, SECTION_MAX_WORDS);
        assert_eq!(header & SECTION_SIZE_MASK, size);
        assert_eq!(buffer.used(), (size as usize + 1) * WORD_SIZE);
    }

    #[test]
    fn test_module_end_marker_needs_event_room() {
        let mut buffer = DataBuffer::default();
        let mut writer = StreamWriter::new();
        writer.open_event_section(&mut buffer, 0).unwrap();
        writer.open_module_section(&mut buffer, 1, SUBEVENT_MAX_WORDS).unwrap();
        for word in 0..SUBEVENT_MAX_WORDS - 2 {
            writer.write_module_data(&mut buffer, word & 0xffff).unwrap();
        }
        writer.write_module_data(&mut buffer, END_MARKER).unwrap();
        writer.close_module_section(&mut buffer).unwrap();
        assert_eq!(writer.event_size(), SECTION_MAX_WORDS);
        assert_eq!(writer.take_flags(), 0);
        assert_eq!(
            writer.open_module_section(&mut buffer, 2, SUBEVENT_MAX_WORDS),
            Err(StreamWriterError::EventSizeExceeded)
        );
    }
}
