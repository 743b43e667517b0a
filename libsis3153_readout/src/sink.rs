use super::config::Config;
use super::data_buffer::DataBuffer;
use super::error::SinkError;

/// Receives every flushed output buffer of a run, in completion order.
pub trait Sink {
    fn begin_run(&mut self, _config: &Config) -> Result<(), SinkError> {
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &DataBuffer) -> Result<(), SinkError>;

    fn end_run(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn begin_run(&mut self, config: &Config) -> Result<(), SinkError> {
        (**self).begin_run(config)
    }

    fn write_buffer(&mut self, buffer: &DataBuffer) -> Result<(), SinkError> {
        (**self).write_buffer(buffer)
    }

    fn end_run(&mut self) -> Result<(), SinkError> {
        (**self).end_run()
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn write_buffer(&mut self, _buffer: &DataBuffer) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps a copy of every buffer
#[derive(Debug, Default)]
pub struct MemorySink {
    pub buffers: Vec<DataBuffer>,
    pub runs_begun: usize,
    pub runs_ended: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All buffers concatenated
    pub fn contents(&self) -> Vec<u8> {
        self.buffers
            .iter()
            .flat_map(|b| b.as_slice().iter().copied())
            .collect()
    }
}

impl Sink for MemorySink {
    fn begin_run(&mut self, _config: &Config) -> Result<(), SinkError> {
        self.runs_begun += 1;
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &DataBuffer) -> Result<(), SinkError> {
        self.buffers.push(buffer.clone());
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), SinkError> {
        self.runs_ended += 1;
        Ok(())
    }
}
