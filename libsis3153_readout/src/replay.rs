use fxhash::FxHashMap;
use spdlog::{debug, info};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::controller::Controller;
use super::error::ControllerError;
use super::raw_buffers::RawBufferReader;
use super::registers::{MODULE_ID_AND_FIRMWARE, SERIAL_NUMBER};

// Firmware 0x1606 is what the recordings we have were taken with
const REPLAY_MODULE_ID_AND_FIRMWARE: u32 = 0x3153_1606;
const REPLAY_SERIAL_NUMBER: u32 = 0;
const EXHAUSTED_RECEIVE_DELAY_MS: u64 = 10;

/// A [`Controller`] that plays back a raw buffer recording.
///
/// Register accesses are emulated with an in-memory register map. Once the
/// recording is used up every receive times out and the exhausted flag is set,
/// so the owner can stop the readout.
#[derive(Debug)]
pub struct ReplayController<R: Read> {
    reader: RawBufferReader<R>,
    registers: FxHashMap<u32, u32>,
    stack_lists: FxHashMap<u32, Vec<u32>>,
    jumbo_frames: bool,
    exhausted: Arc<AtomicBool>,
    datagrams: u64,
}

impl ReplayController<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, ControllerError> {
        let reader = RawBufferReader::open(path)?;
        info!("Replaying raw buffers from {}", path.display());
        Ok(Self::new(reader))
    }
}

impl<R: Read> ReplayController<R> {
    pub fn new(reader: RawBufferReader<R>) -> Self {
        let mut registers = FxHashMap::default();
        registers.insert(MODULE_ID_AND_FIRMWARE, REPLAY_MODULE_ID_AND_FIRMWARE);
        registers.insert(SERIAL_NUMBER, REPLAY_SERIAL_NUMBER);
        Self {
            reader,
            registers,
            stack_lists: FxHashMap::default(),
            jumbo_frames: false,
            exhausted: Arc::new(AtomicBool::new(false)),
            datagrams: 0,
        }
    }

    /// Flag set once every recorded entry has been handed out
    pub fn exhausted_flag(&self) -> Arc<AtomicBool> {
        self.exhausted.clone()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub fn datagrams_replayed(&self) -> u64 {
        self.datagrams
    }

    pub fn register(&self, address: u32) -> Option<u32> {
        self.registers.get(&address).copied()
    }

    pub fn stack_list(&self, load_address: u32) -> Option<&[u32]> {
        self.stack_lists.get(&load_address).map(|l| l.as_slice())
    }

    pub fn jumbo_frames(&self) -> bool {
        self.jumbo_frames
    }
}

impl<R: Read> Controller for ReplayController<R> {
    fn read_register(&mut self, address: u32) -> Result<u32, ControllerError> {
        Ok(self.registers.get(&address).copied().unwrap_or(0))
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), ControllerError> {
        debug!("Replay register write 0x{:08x} = 0x{:08x}", address, value);
        self.registers.insert(address, value);
        Ok(())
    }

    fn receive_datagram(&mut self, buffer: &mut [u8]) -> Result<usize, ControllerError> {
        if self.is_exhausted() {
            std::thread::sleep(Duration::from_millis(EXHAUSTED_RECEIVE_DELAY_MS));
            return Ok(0);
        }

        let Some(entry) = self.reader.read_entry()? else {
            info!(
                "Raw buffer recording exhausted after {} entries ({} datagrams)",
                self.reader.entries(),
                self.datagrams
            );
            self.exhausted.store(true, Ordering::Release);
            return Ok(0);
        };

        if !entry.has_data() {
            if entry.error_code != 0 {
                return Err(std::io::Error::from_raw_os_error(entry.error_code).into());
            }
            return Ok(0);
        }

        let datagram = entry.datagram();
        let length = datagram.len().min(buffer.len());
        buffer[..length].copy_from_slice(&datagram[..length]);
        self.datagrams += 1;
        Ok(length)
    }

    fn upload_stack_list(&mut self, load_address: u32, words: &[u32]) -> Result<(), ControllerError> {
        debug!(
            "Replay stack list upload of {} words to 0x{:08x}",
            words.len(),
            load_address
        );
        self.stack_lists.insert(load_address, words.to_vec());
        Ok(())
    }

    fn set_jumbo_frames(&mut self, enable: bool) -> Result<(), ControllerError> {
        self.jumbo_frames = enable;
        Ok(())
    }
}
