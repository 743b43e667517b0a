use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;
use super::worker_status::DaqState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("End of buffer reached: needed {needed} bytes but only {available} left")]
pub struct EndOfBuffer {
    pub needed: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamWriterError {
    #[error("StreamWriter cannot open an event section while another one is open")]
    EventSectionOpen,
    #[error("StreamWriter has no open event section")]
    NoEventSection,
    #[error("StreamWriter operation not allowed while a module section is open")]
    ModuleSectionOpen,
    #[error("StreamWriter has no open module section")]
    NoModuleSection,
    #[error("StreamWriter event section size exceeded")]
    EventSizeExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("Buffer processing ran past the end of the input: {0}")]
    EndOfBuffer(#[from] EndOfBuffer),
    #[error("Buffer processing failed due to stream writer error: {0}")]
    StreamWriter(#[from] StreamWriterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventLossError {
    #[error("EventLossTracker was asked to begin leaving DAQ mode but is already leaving")]
    AlreadyLeavingDaq,
    #[error("EventLossTracker was asked to end leaving DAQ mode but was not leaving")]
    NotLeavingDaq,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Controller communication failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Controller register access at 0x{0:08x} failed: {1}")]
    RegisterAccess(u32, String),
    #[error("Controller failed to upload stack list to 0x{0:08x}: {1}")]
    StackListUpload(u32, String),
    #[error("Controller failed due to raw buffer error: {0}")]
    RawBufferError(#[from] RawBufferError),
}

impl ControllerError {
    /// A receive that timed out is the normal way of saying "no data" and is not an error
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::IOError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StackListError {
    #[error("Stack list for {0} is empty")]
    Empty(String),
    #[error("Stack list for {name} with {words} words does not fit into stack RAM (offset 0x{offset:04x}, limit 0x{limit:04x})", limit=STACK_RAM_OFFSET_LIMIT)]
    StackRamExceeded {
        name: String,
        words: usize,
        offset: u32,
    },
    #[error("Event {0} needs a stack list but all {num} are in use", num=NUMBER_OF_STACK_LISTS)]
    NoStackListLeft(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Sink failed to convert config to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has {0} events but the SIS3153 supports at most {num}", num=NUMBER_OF_STACK_LISTS)]
    TooManyEvents(usize),
    #[error("SIS3153 readout supports no more than 1 periodic event (found {0})")]
    TooManyPeriodicEvents(usize),
    #[error("Invalid timer period {1} s for event {0}")]
    InvalidTimerPeriod(String, f64),
    #[error("Maximum timer period exceeded for event {0} (timer value {1})")]
    TimerPeriodExceeded(String, u32),
    #[error("Invalid IRQ level {1} for event {0}; expected 1 to 7")]
    InvalidIrqLevel(String, u8),
    #[error("Event {0} has no modules")]
    NoModules(String),
    #[error("Config max_drain_packets must be at least 1")]
    InvalidDrainLimit,
}

#[derive(Debug, Error)]
pub enum RawBufferError {
    #[error("Raw buffer file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Raw buffer file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Raw buffer entry #{0} is truncated")]
    TruncatedEntry(usize),
    #[error("Raw buffer entry #{0} has invalid size {1}")]
    InvalidEntrySize(usize, i32),
}

#[derive(Debug, Error)]
pub enum ReadoutError {
    #[error("Readout can only be started from the Idle state, current state is {0}")]
    NotIdle(DaqState),
    #[error("Readout failed due to controller error: {0}")]
    ControllerError(#[from] ControllerError),
    #[error("Readout failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Readout failed due to stack list error: {0}")]
    StackListError(#[from] StackListError),
    #[error("Readout failed due to event loss tracking error: {0}")]
    EventLossError(#[from] EventLossError),
    #[error("Readout failed due to sink error: {0}")]
    SinkError(#[from] SinkError),
    #[error("Readout failed due to raw buffer error: {0}")]
    RawBufferError(#[from] RawBufferError),
    #[error("Readout failed to {0} DAQ mode: {1}")]
    DaqMode(&'static str, ControllerError),
}
