use byteorder::{NativeEndian, WriteBytesExt};
use spdlog::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use time::format_description::well_known::Iso8601;
use time::OffsetDateTime;

use super::buffer_iterator::BufferIterator;
use super::config::Config;
use super::constants::*;
use super::data_buffer::DataBuffer;
use super::error::{EndOfBuffer, SinkError};
use super::sink::Sink;

/// Writes a version 1 listfile: preamble, the YAML configuration as Config
/// sections, all flushed buffers and a closing End section.
#[derive(Debug)]
pub struct ListfileWriter<W: Write> {
    out: W,
    bytes_written: u64,
}

impl ListfileWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path)?;
        info!("Writing listfile to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> ListfileWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn write_preamble(&mut self) -> Result<(), SinkError> {
        self.out.write_all(LISTFILE_FOURCC)?;
        self.out.write_u32::<NativeEndian>(LISTFILE_VERSION)?;
        self.bytes_written += 8;
        Ok(())
    }

    /// Split `contents` over as many Config sections as needed
    pub fn write_config(&mut self, contents: &[u8]) -> Result<(), SinkError> {
        let padded = pad_to_words(contents);
        let max_bytes = SECTION_MAX_WORDS as usize * WORD_SIZE;
        for chunk in padded.chunks(max_bytes) {
            self.write_section(SECTION_TYPE_CONFIG, chunk)?;
        }
        Ok(())
    }

    /// End section carrying the current time in ISO 8601 format
    pub fn write_end_section(&mut self) -> Result<(), SinkError> {
        let stamp = OffsetDateTime::now_utc()
            .format(&Iso8601::DEFAULT)
            .unwrap_or_else(|_| String::from("unknown"));
        self.write_section(SECTION_TYPE_END, &pad_to_words(stamp.as_bytes()))
    }

    fn write_section(&mut self, section_type: u32, padded: &[u8]) -> Result<(), SinkError> {
        let words = (padded.len() / WORD_SIZE) as u32;
        let header = ((section_type << SECTION_TYPE_SHIFT) & SECTION_TYPE_MASK)
            | ((words << SECTION_SIZE_SHIFT) & SECTION_SIZE_MASK);
        self.out.write_u32::<NativeEndian>(header)?;
        self.out.write_all(padded)?;
        self.bytes_written += (WORD_SIZE + padded.len()) as u64;
        Ok(())
    }
}

impl<W: Write> Sink for ListfileWriter<W> {
    fn begin_run(&mut self, config: &Config) -> Result<(), SinkError> {
        let yaml = serde_yaml::to_string(config)?;
        self.write_preamble()?;
        self.write_config(yaml.as_bytes())
    }

    fn write_buffer(&mut self, buffer: &DataBuffer) -> Result<(), SinkError> {
        self.out.write_all(buffer.as_slice())?;
        self.bytes_written += buffer.used() as u64;
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), SinkError> {
        self.write_end_section()?;
        self.out.flush()?;
        Ok(())
    }
}

fn pad_to_words(contents: &[u8]) -> Vec<u8> {
    let mut padded = contents.to_vec();
    while padded.len() % WORD_SIZE != 0 {
        padded.push(b' ');
    }
    padded
}

/// Module subsection of an event section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSection {
    pub module_type: u8,
    /// Module data including the terminating EndMarker
    pub data: Vec<u32>,
}

/// One parsed section of an output buffer or listfile body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Event {
        event_index: u8,
        modules: Vec<ModuleSection>,
    },
    Timetick,
    Config(Vec<u8>),
    End(Vec<u8>),
    Other {
        section_type: u32,
        words: Vec<u32>,
    },
}

/// Parse the sections of a buffer. Event sections are split into their
/// module subsections, the trailing event EndMarker is dropped.
pub fn read_sections(data: &[u8]) -> Result<Vec<Section>, EndOfBuffer> {
    let mut iter = BufferIterator::new(data);
    let mut sections = Vec::new();
    while iter.longwords_left() > 0 {
        let header = iter.extract_u32()?;
        let section_type = (header & SECTION_TYPE_MASK) >> SECTION_TYPE_SHIFT;
        let size = ((header & SECTION_SIZE_MASK) >> SECTION_SIZE_SHIFT) as usize;
        let body = iter.sub_slice(size * WORD_SIZE)?;
        iter.skip(WORD_SIZE, size)?;
        let section = match section_type {
            SECTION_TYPE_EVENT => {
                let event_index = ((header & EVENT_TYPE_MASK) >> EVENT_TYPE_SHIFT) as u8;
                Section::Event {
                    event_index,
                    modules: read_modules(body)?,
                }
            }
            SECTION_TYPE_TIMETICK => Section::Timetick,
            SECTION_TYPE_CONFIG => Section::Config(body.to_vec()),
            SECTION_TYPE_END => Section::End(body.to_vec()),
            _ => {
                let mut body_iter = BufferIterator::new(body);
                let mut words = Vec::with_capacity(size);
                while body_iter.longwords_left() > 0 {
                    words.push(body_iter.extract_u32()?);
                }
                Section::Other {
                    section_type,
                    words,
                }
            }
        };
        sections.push(section);
    }
    Ok(sections)
}

fn read_modules(body: &[u8]) -> Result<Vec<ModuleSection>, EndOfBuffer> {
    let mut iter = BufferIterator::new(body);
    let mut modules = Vec::new();
    // The last word of an event section is the event EndMarker
    while iter.longwords_left() > 1 {
        let header = iter.extract_u32()?;
        let module_type = ((header & MODULE_TYPE_MASK) >> MODULE_TYPE_SHIFT) as u8;
        let size = ((header & SUBEVENT_SIZE_MASK) >> SUBEVENT_SIZE_SHIFT) as usize;
        let mut data = Vec::with_capacity(size);
        for _ in 0..size {
            data.push(iter.extract_u32()?);
        }
        modules.push(ModuleSection { module_type, data });
    }
    Ok(modules)
}

/// Sections of a complete listfile, after checking the preamble. Returns
/// `None` if the preamble does not match.
pub fn read_listfile(data: &[u8]) -> Result<Option<Vec<Section>>, EndOfBuffer> {
    if data.len() < 8 || &data[0..4] != LISTFILE_FOURCC {
        return Ok(None);
    }
    let mut iter = BufferIterator::new(&data[4..]);
    if iter.extract_u32()? != LISTFILE_VERSION {
        return Ok(None);
    }
    read_sections(&data[8..]).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_writer::StreamWriter;

    fn event_buffer() -> DataBuffer {
        let mut buffer = DataBuffer::default();
        let mut writer = StreamWriter::new();
        writer.open_event_section(&mut buffer, 3).unwrap();
        writer.open_module_section(&mut buffer, 7, 100).unwrap();
        writer.write_module_data(&mut buffer, 0xabcd).unwrap();
        writer.write_module_data(&mut buffer, END_MARKER).unwrap();
        writer.close_module_section(&mut buffer).unwrap();
        writer.write_event_data(&mut buffer, END_MARKER).unwrap();
        writer.close_event_section(&mut buffer).unwrap();
        buffer.push_u32((SECTION_TYPE_TIMETICK << SECTION_TYPE_SHIFT) & SECTION_TYPE_MASK);
        buffer
    }

    #[test]
    fn test_read_event_and_timetick() {
        let sections = read_sections(event_buffer().as_slice()).unwrap();
        assert_eq!(
            sections,
            vec![
                Section::Event {
                    event_index: 3,
                    modules: vec![ModuleSection {
                        module_type: 7,
                        data: vec![0xabcd, END_MARKER]
                    }]
                },
                Section::Timetick
            ]
        );
    }

    #[test]
    fn test_truncated_section_is_an_error() {
        let mut buffer = DataBuffer::default();
        buffer.push_u32((SECTION_TYPE_EVENT << SECTION_TYPE_SHIFT) | 5);
        buffer.push_u32(0);
        assert!(read_sections(buffer.as_slice()).is_err());
    }

    #[test]
    fn test_listfile_layout() {
        let mut writer = ListfileWriter::new(Vec::new());
        writer.begin_run(&Config::default()).unwrap();
        writer.write_buffer(&event_buffer()).unwrap();
        writer.end_run().unwrap();
        let written = writer.bytes_written();
        let bytes = writer.into_inner();
        assert_eq!(written, bytes.len() as u64);

        let sections = read_listfile(&bytes).unwrap().unwrap();
        assert_eq!(sections.len(), 4);
        match &sections[0] {
            Section::Config(contents) => {
                let text = String::from_utf8(contents.clone()).unwrap();
                let config: Config = serde_yaml::from_str(text.trim_end()).unwrap();
                assert_eq!(config, Config::default());
            }
            other => panic!("expected config section, got {other:?}"),
        }
        assert!(matches!(sections[1], Section::Event { event_index: 3, .. }));
        assert_eq!(sections[2], Section::Timetick);
        match &sections[3] {
            Section::End(stamp) => {
                let text = String::from_utf8(stamp.clone()).unwrap();
                assert!(text.trim_end().contains('T'));
            }
            other => panic!("expected end section, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_preamble() {
        assert_eq!(read_listfile(b"MVLC\x01\x00\x00\x00"), Ok(None));
        assert_eq!(read_listfile(b"MV"), Ok(None));
    }

    #[test]
    fn test_file_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.mvmelst");
        let mut writer = ListfileWriter::create(&path).unwrap();
        writer.begin_run(&Config::default()).unwrap();
        writer.end_run().unwrap();
        drop(writer);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], LISTFILE_FOURCC);
    }
}
