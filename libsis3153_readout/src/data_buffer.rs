use byteorder::{ByteOrder, NativeEndian};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use spdlog::warn;
use std::sync::Arc;
use std::time::Duration;

use super::constants::*;
use super::error::EndOfBuffer;

/// A growable output buffer holding serialized listfile sections in native
/// byte order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBuffer {
    data: Vec<u8>,
}

impl DataBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn push_u32(&mut self, word: u32) {
        let mut bytes = [0u8; WORD_SIZE];
        NativeEndian::write_u32(&mut bytes, word);
        self.data.extend_from_slice(&bytes);
    }

    /// Overwrite the word at byte offset `offset`
    pub fn set_u32(&mut self, offset: usize, word: u32) -> Result<(), EndOfBuffer> {
        let available = self.data.len().saturating_sub(offset);
        match self.data.get_mut(offset..offset + WORD_SIZE) {
            Some(bytes) => {
                NativeEndian::write_u32(bytes, word);
                Ok(())
            }
            None => Err(EndOfBuffer {
                needed: WORD_SIZE,
                available,
            }),
        }
    }

    pub fn get_u32(&self, offset: usize) -> Option<u32> {
        self.data
            .get(offset..offset + WORD_SIZE)
            .map(NativeEndian::read_u32)
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn ensure_capacity(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Number of bytes in use
    pub fn used(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.data.chunks_exact(WORD_SIZE).map(NativeEndian::read_u32)
    }
}

/// The free and filled buffer pools shared between the readout thread and a
/// consumer. The readout thread is the only consumer of the free queue and
/// the only producer of the filled queue.
#[derive(Debug)]
pub struct BufferQueues {
    free: ArrayQueue<DataBuffer>,
    filled: ArrayQueue<DataBuffer>,
    filled_lock: Mutex<()>,
    filled_cond: Condvar,
}

impl BufferQueues {
    /// Create the pools with `count` free buffers of `capacity` bytes
    pub fn new(count: usize, capacity: usize) -> Arc<Self> {
        let count = count.max(1);
        let queues = Self {
            free: ArrayQueue::new(count),
            filled: ArrayQueue::new(count),
            filled_lock: Mutex::new(()),
            filled_cond: Condvar::new(),
        };
        for _ in 0..count {
            let _ = queues.free.push(DataBuffer::with_capacity(capacity));
        }
        Arc::new(queues)
    }

    pub fn pop_free(&self) -> Option<DataBuffer> {
        self.free.pop()
    }

    /// Return a buffer to the free pool. Consumers call this once they are done
    /// with a filled buffer.
    pub fn recycle(&self, mut buffer: DataBuffer) {
        buffer.clear();
        if self.free.push(buffer).is_err() {
            warn!("Free buffer queue is full, dropping a buffer");
        }
    }

    pub fn push_filled(&self, buffer: DataBuffer) {
        if let Err(buffer) = self.filled.push(buffer) {
            warn!("Filled buffer queue is full, recycling the buffer");
            self.recycle(buffer);
            return;
        }
        let _guard = self.filled_lock.lock();
        self.filled_cond.notify_one();
    }

    pub fn pop_filled(&self) -> Option<DataBuffer> {
        self.filled.pop()
    }

    /// Wait up to `timeout` for a filled buffer
    pub fn wait_filled(&self, timeout: Duration) -> Option<DataBuffer> {
        let mut guard = self.filled_lock.lock();
        if let Some(buffer) = self.filled.pop() {
            return Some(buffer);
        }
        self.filled_cond.wait_for(&mut guard, timeout);
        self.filled.pop()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn filled_count(&self) -> usize {
        self.filled.len()
    }
}

/// Where the current output buffer came from
#[derive(Debug)]
enum OutputSlot {
    Pooled(DataBuffer),
    Local,
}

/// What happened to a buffer handed to [`OutputBuffers::flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    NothingToFlush,
    Queued,
    /// Written from the local fallback buffer, cannot be handed to the consumer
    Dropped,
}

/// The output buffer arena of the readout thread: at most one buffer taken from
/// the free pool, plus local fallback buffers used when the pool is empty.
#[derive(Debug)]
pub struct OutputBuffers {
    queues: Arc<BufferQueues>,
    current: Option<OutputSlot>,
    local_event_buffer: DataBuffer,
    local_timetick_buffer: DataBuffer,
}

impl OutputBuffers {
    pub fn new(queues: Arc<BufferQueues>) -> Self {
        Self {
            queues,
            current: None,
            local_event_buffer: DataBuffer::with_capacity(LOCAL_BUFFER_SIZE),
            local_timetick_buffer: DataBuffer::with_capacity(TIMETICK_BUFFER_SIZE),
        }
    }

    pub fn queues(&self) -> &Arc<BufferQueues> {
        &self.queues
    }

    /// Get the current output buffer, taking a fresh one if none is held
    pub fn acquire(&mut self) -> &mut DataBuffer {
        if self.current.is_none() {
            let slot = match self.queues.pop_free() {
                Some(mut buffer) => {
                    buffer.clear();
                    OutputSlot::Pooled(buffer)
                }
                None => {
                    self.local_event_buffer.clear();
                    OutputSlot::Local
                }
            };
            self.current = Some(slot);
        }
        match self.current {
            Some(OutputSlot::Pooled(ref mut buffer)) => buffer,
            _ => &mut self.local_event_buffer,
        }
    }

    pub fn has_buffer(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.current, Some(OutputSlot::Local))
    }

    /// Hand the current buffer to `write` and then to the filled queue
    pub fn flush<F>(&mut self, write: F) -> FlushOutcome
    where
        F: FnOnce(&DataBuffer),
    {
        match self.current.take() {
            Some(OutputSlot::Pooled(buffer)) => {
                write(&buffer);
                self.queues.push_filled(buffer);
                FlushOutcome::Queued
            }
            Some(OutputSlot::Local) => {
                write(&self.local_event_buffer);
                self.local_event_buffer.clear();
                FlushOutcome::Dropped
            }
            None => FlushOutcome::NothingToFlush,
        }
    }

    /// Discard the contents of the current buffer and give it back to the pool
    pub fn release(&mut self) {
        match self.current.take() {
            Some(OutputSlot::Pooled(buffer)) => self.queues.recycle(buffer),
            Some(OutputSlot::Local) => self.local_event_buffer.clear(),
            None => (),
        }
    }

    /// Write a single Timetick section into its own buffer and flush it
    pub fn flush_timetick<F>(&mut self, write: F) -> FlushOutcome
    where
        F: FnOnce(&DataBuffer),
    {
        let header = (SECTION_TYPE_TIMETICK << SECTION_TYPE_SHIFT) & SECTION_TYPE_MASK;
        match self.queues.pop_free() {
            Some(mut buffer) => {
                buffer.clear();
                buffer.push_u32(header);
                write(&buffer);
                self.queues.push_filled(buffer);
                FlushOutcome::Queued
            }
            None => {
                self.local_timetick_buffer.clear();
                self.local_timetick_buffer.push_u32(header);
                write(&self.local_timetick_buffer);
                FlushOutcome::Dropped
            }
        }
    }
}
