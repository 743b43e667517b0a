use spdlog::{debug, info, trace, warn};
use std::sync::Arc;

use super::buffer_iterator::BufferIterator;
use super::constants::*;
use super::counters::Counters;
use super::data_buffer::{BufferQueues, FlushOutcome, OutputBuffers};
use super::error::{ProcessingError, StreamWriterError};
use super::event_loss::{EventLossTracker, SequenceCheck};
use super::sink::Sink;
use super::stack_list::StackListBindings;
use super::stream_writer::{StreamWriter, MODULE_SIZE_EXCEEDED};

/// Result bits of a buffer handler. No bits set means "done, reset state".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorAction(u8);

impl ProcessorAction {
    pub const NONE_SET: Self = Self(0);
    /// Keep the partial event state for the next buffer
    pub const KEEP_STATE: Self = Self(1 << 0);
    /// Hand the output buffer to the sink and the filled queue
    pub const FLUSH_BUFFER: Self = Self(1 << 1);
    /// Input was unusable, discard output and count an error
    pub const SKIP_INPUT: Self = Self(1 << 2);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ProcessorAction {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ProcessorAction {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

/// State of an event being reassembled from multiple datagrams
#[derive(Debug, Clone, Default)]
struct ProcessingState {
    stack_list: Option<usize>,
    module_index: usize,
    expected_status: u8,
    writer: StreamWriter,
}

fn is_begin_marker(word: u32) -> bool {
    word & BEGIN_EVENT_MASK == BEGIN_EVENT_RESULT
}

fn is_end_marker(word: u32) -> bool {
    word & END_EVENT_MASK == END_EVENT_RESULT
}

fn next_fragment_status(status: u8) -> u8 {
    (status & !FRAGMENT_STATUS_NIBBLE_MASK) | (status.wrapping_add(1) & FRAGMENT_STATUS_NIBBLE_MASK)
}

/// Turns SIS3153 datagrams into listfile event sections.
///
/// Datagrams come in three framings: one complete event, several complete
/// events packed into one multi event packet, or one event split over several
/// consecutive datagrams. Completed output buffers go to the sink and then to
/// the filled buffer queue, strictly in completion order.
#[derive(Debug)]
pub struct BufferProcessor<S: Sink> {
    bindings: Arc<StackListBindings>,
    tracker: EventLossTracker,
    counters: Counters,
    output: OutputBuffers,
    sink: S,
    state: ProcessingState,
    size_flags: u8,
    log_buffers: bool,
}

impl<S: Sink> BufferProcessor<S> {
    pub fn new(bindings: StackListBindings, queues: Arc<BufferQueues>, sink: S) -> Self {
        let mut counters = Counters::default();
        counters.watchdog_stack_list = bindings.watchdog();
        Self {
            bindings: Arc::new(bindings),
            tracker: EventLossTracker::new(),
            counters,
            output: OutputBuffers::new(queues),
            sink,
            state: ProcessingState::default(),
            size_flags: 0,
            log_buffers: false,
        }
    }

    /// Prepare for a new run with the given stack list setup. Counters, loss
    /// tracking and any partial event of a previous run are reset.
    pub fn begin_run(&mut self, bindings: StackListBindings) {
        self.discard_partial_event();
        self.bindings = Arc::new(bindings);
        self.tracker = EventLossTracker::new();
        self.reset_counters();
    }

    pub fn set_log_buffers(&mut self, log_buffers: bool) {
        self.log_buffers = log_buffers;
    }

    pub fn bindings(&self) -> &StackListBindings {
        &self.bindings
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Clear all counters, e.g. at the start of a run
    pub fn reset_counters(&mut self) {
        self.counters = Counters {
            watchdog_stack_list: self.bindings.watchdog(),
            ..Default::default()
        };
    }

    pub fn tracker(&self) -> &EventLossTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut EventLossTracker {
        &mut self.tracker
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn is_partial_in_progress(&self) -> bool {
        self.state.stack_list.is_some()
    }

    /// Drop any partially assembled event and give its buffer back
    pub fn discard_partial_event(&mut self) {
        if let Some(stack_list) = self.state.stack_list {
            debug!("Discarding partial event of stack list {}", stack_list);
        }
        self.state = ProcessingState::default();
        self.output.release();
    }

    pub fn record_read_error(&mut self) {
        self.counters.read_errors += 1;
    }

    /// Account for and process one received datagram
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> ProcessorAction {
        self.counters.total_bytes_read += datagram.len() as u64;
        self.counters.total_buffers_read += 1;
        let buffer_number = self.counters.total_buffers_read;

        if datagram.len() < PACKET_HEADER_SIZE {
            warn!(
                "SIS3153 Warning: (buffer #{}) read {} bytes, less than the packet header size ({} bytes)",
                buffer_number,
                datagram.len(),
                PACKET_HEADER_SIZE
            );
            self.counters.buffers_with_errors += 1;
            return ProcessorAction::SKIP_INPUT;
        }

        let (ack, ident, status) = (datagram[0], datagram[1], datagram[2]);
        trace!(
            "buffer #{}: ack=0x{:02x}, ident=0x{:02x}, status=0x{:02x}, bytesRead={}",
            buffer_number,
            ack,
            ident,
            status,
            datagram.len()
        );
        self.process_buffer(ack, ident, status, &datagram[PACKET_HEADER_SIZE..])
    }

    /// Classify a datagram by its header bytes, run the matching handler and
    /// apply the resulting action
    pub fn process_buffer(&mut self, ack: u8, ident: u8, status: u8, data: &[u8]) -> ProcessorAction {
        let buffer_number = self.counters.total_buffers_read;

        if self.log_buffers {
            log_buffer(buffer_number, data);
        }

        let result = if ack == MULTI_EVENT_PACKET_ACK {
            trace!("buffer #{} -> multi event buffer", buffer_number);
            self.counters.multi_event_packets += 1;
            self.process_multi_event_data(data, buffer_number)
        } else {
            let is_last_packet = ack & ACK_IS_LAST_PACKET_MASK != 0;
            if self.state.stack_list.is_some() || !is_last_packet {
                trace!("buffer #{} -> partial event buffer", buffer_number);
                self.process_partial_event_data(ack, status, data, buffer_number)
            } else {
                trace!("buffer #{} -> single event buffer", buffer_number);
                self.process_single_event_data(ack, ident, status, data, buffer_number)
            }
        };

        self.size_flags |= self.state.writer.take_flags();
        self.report_size_flags(buffer_number);

        let action = match result {
            Ok(action) => action,
            Err(e) => {
                warn!(
                    "SIS3153 Warning: (buffer #{}) {}. Skipping buffer.",
                    buffer_number, e
                );
                self.counters.buffers_with_errors += 1;
                if e == ProcessingError::StreamWriter(StreamWriterError::EventSizeExceeded) {
                    self.counters.event_size_exceeded += 1;
                }
                self.state = ProcessingState::default();
                self.output.release();
                return ProcessorAction::SKIP_INPUT;
            }
        };

        if !action.contains(ProcessorAction::KEEP_STATE) || action.contains(ProcessorAction::SKIP_INPUT) {
            self.state = ProcessingState::default();
            if action.contains(ProcessorAction::SKIP_INPUT) {
                self.counters.buffers_with_errors += 1;
            }
        }

        if action.contains(ProcessorAction::FLUSH_BUFFER) && !action.contains(ProcessorAction::SKIP_INPUT) {
            self.flush_output();
        }

        // Anything still held without a partial event in progress is garbage
        if self.state.stack_list.is_none() && self.output.has_buffer() {
            self.output.release();
        }

        action
    }

    /// Emit a Timetick section
    pub fn timetick(&mut self) {
        let sink = &mut self.sink;
        let counters = &mut self.counters;
        let outcome = self.output.flush_timetick(|buffer| {
            if let Err(e) = sink.write_buffer(buffer) {
                counters.sink_errors += 1;
                warn!("Sink failed to write timetick: {}", e);
            }
        });
        if outcome == FlushOutcome::Dropped {
            self.counters.dropped_buffers += 1;
        }
    }

    fn flush_output(&mut self) {
        let sink = &mut self.sink;
        let counters = &mut self.counters;
        let outcome = self.output.flush(|buffer| {
            if let Err(e) = sink.write_buffer(buffer) {
                counters.sink_errors += 1;
                warn!("Sink failed to write buffer: {}", e);
            }
        });
        if outcome == FlushOutcome::Dropped {
            self.counters.dropped_buffers += 1;
        }
    }

    fn report_size_flags(&mut self, buffer_number: u64) {
        let flags = std::mem::take(&mut self.size_flags);
        if flags & MODULE_SIZE_EXCEEDED != 0 {
            self.counters.module_size_exceeded += 1;
            warn!(
                "SIS3153 Warning: (buffer #{}) module data exceeded the configured maximum, data was truncated",
                buffer_number
            );
        }
    }

    /// Feed a begin marker to the loss tracker. Returns true for stale data.
    fn check_sequence(&mut self, begin_marker: u32, buffer_number: u64) -> bool {
        let sequence_number = begin_marker & BEGIN_EVENT_SEQUENCE_NUMBER_MASK;
        match self.tracker.handle_sequence_number(sequence_number, buffer_number) {
            SequenceCheck::StaleData => {
                self.counters.stale_events += 1;
                return true;
            }
            SequenceCheck::EventsLost(lost) => {
                self.counters.lost_events += lost as u64;
                debug!(
                    "(buffer #{}) {} events lost before sequence number {}",
                    buffer_number, lost, sequence_number
                );
            }
            SequenceCheck::Duplicate => self.counters.sequence_anomalies += 1,
            SequenceCheck::InSequence | SequenceCheck::LeavingDaq => (),
        }
        false
    }

    fn add_bus_errors(&mut self, stack_list: usize, end_marker: u32) {
        self.counters.add_bus_errors(
            stack_list,
            (end_marker & END_EVENT_BERR_BLOCK_MASK) >> END_EVENT_BERR_BLOCK_SHIFT,
            (end_marker & END_EVENT_BERR_READ_MASK) >> END_EVENT_BERR_READ_SHIFT,
            (end_marker & END_EVENT_BERR_WRITE_MASK) >> END_EVENT_BERR_WRITE_SHIFT,
        );
    }

    /// Several complete events packed back to back, each with a 4 byte
    /// embedded header
    fn process_multi_event_data(
        &mut self,
        data: &[u8],
        buffer_number: u64,
    ) -> Result<ProcessorAction, ProcessingError> {
        if self.state.stack_list.is_some() {
            warn!("SIS3153 Warning: (buffer #{}) got multievent packet while partial event processing is in progress! Skipping buffer.", buffer_number);
            return Ok(ProcessorAction::SKIP_INPUT);
        }

        let mut action = ProcessorAction::NONE_SET;
        let mut iter = BufferIterator::new(data);

        while iter.longwords_left() > 0 {
            let header = iter.extract_u32()?;
            let internal_ack = (header & EMBEDDED_ACK_MASK) as u8;
            let internal_ident = (header >> EMBEDDED_IDENT_SHIFT) as u8;
            let length = (((header & EMBEDDED_LENGTH_LOW_MASK) >> EMBEDDED_LENGTH_LOW_SHIFT)
                | (header & EMBEDDED_LENGTH_HIGH_MASK)) as usize;

            trace!(
                "buffer #{}: embedded ack=0x{:02x}, ident=0x{:02x}, length={} ({} bytes), header=0x{:08x}",
                buffer_number,
                internal_ack,
                internal_ident,
                length,
                length * WORD_SIZE,
                header
            );

            let stack_list = (internal_ack & ACK_STACK_LIST_MASK) as usize;
            self.counters.embedded_events[stack_list] += 1;

            let event_data = iter.sub_slice(length * WORD_SIZE)?;
            let event_action =
                self.process_single_event_data(internal_ack, internal_ident, 0, event_data, buffer_number)?;

            if event_action.contains(ProcessorAction::SKIP_INPUT) {
                return Ok(ProcessorAction::SKIP_INPUT);
            }
            iter.skip(WORD_SIZE, length)?;

            if event_action.contains(ProcessorAction::FLUSH_BUFFER) {
                action = ProcessorAction::FLUSH_BUFFER;
            }
        }

        if iter.bytes_left() > 0 {
            warn!(
                "SIS3153 Warning: (buffer #{}) {} bytes left at end of multievent iteration!",
                buffer_number,
                iter.bytes_left()
            );
        }

        Ok(action)
    }

    /// One complete event. Also called for each event of a multi event packet.
    fn process_single_event_data(
        &mut self,
        ack: u8,
        _ident: u8,
        _status: u8,
        data: &[u8],
        buffer_number: u64,
    ) -> Result<ProcessorAction, ProcessingError> {
        let stack_list = (ack & ACK_STACK_LIST_MASK) as usize;
        self.counters.packets_per_stack_list[stack_list] += 1;

        let mut iter = BufferIterator::new(data);

        let begin_header = iter.extract_u32()?;
        if !is_begin_marker(begin_header) {
            warn!(
                "SIS3153 Warning: (buffer #{}) Invalid beginHeader 0x{:08x} (singleEvent). Skipping buffer.",
                buffer_number, begin_header
            );
            return Ok(ProcessorAction::SKIP_INPUT);
        }

        if self.check_sequence(begin_header, buffer_number) {
            trace!("(buffer #{}) dropping stale single event", buffer_number);
            return Ok(ProcessorAction::NONE_SET);
        }

        if self.bindings.is_watchdog(stack_list) {
            let payload = iter.extract_u32()?;
            if payload != WATCHDOG_PAYLOAD {
                warn!(
                    "SIS3153 Warning: (buffer #{}) Unexpected watchdog payload: 0x{:08x}",
                    buffer_number, payload
                );
                return Ok(ProcessorAction::SKIP_INPUT);
            }

            let end_header = iter.extract_u32()?;
            if !is_end_marker(end_header) {
                warn!(
                    "SIS3153 Warning: (buffer #{}) Invalid watchdog endHeader: 0x{:08x}",
                    buffer_number, end_header
                );
                return Ok(ProcessorAction::SKIP_INPUT);
            }

            if iter.bytes_left() > 0 {
                warn!(
                    "SIS3153 Warning: (buffer #{}) {} bytes left at end of watchdog packet",
                    buffer_number,
                    iter.bytes_left()
                );
                return Ok(ProcessorAction::SKIP_INPUT);
            }

            self.add_bus_errors(stack_list, end_header);
            self.counters.watchdog_events += 1;
            return Ok(ProcessorAction::KEEP_STATE);
        }

        let bindings = Arc::clone(&self.bindings);
        let Some(event) = bindings.event(stack_list) else {
            warn!(
                "SIS3153 Warning: (buffer #{}) No event for stackList={} (singleEvent). Skipping buffer.",
                buffer_number, stack_list
            );
            return Ok(ProcessorAction::SKIP_INPUT);
        };

        let buffer = self.output.acquire();
        buffer.ensure_capacity(data.len() * 2);
        let mut writer = StreamWriter::new();

        writer.open_event_section(buffer, event.event_index)?;
        for module in event.modules.iter() {
            writer.open_module_section(buffer, module.type_id, module.max_words)?;
            loop {
                let word = iter.extract_u32()?;
                writer.write_module_data(buffer, word)?;
                if word == END_MARKER {
                    break;
                }
            }
            self.counters.total_net_bytes_read += writer.close_module_section(buffer)? as u64;
        }

        let end_header = iter.extract_u32()?;
        self.size_flags |= writer.take_flags();
        if !is_end_marker(end_header) {
            warn!(
                "SIS3153 Warning: (buffer #{}) Invalid endHeader: 0x{:08x}",
                buffer_number, end_header
            );
            return Ok(ProcessorAction::SKIP_INPUT);
        }

        writer.write_event_data(buffer, END_MARKER)?;
        writer.close_event_section(buffer)?;

        self.add_bus_errors(stack_list, end_header);
        self.counters.stack_list_counts[stack_list] += 1;

        Ok(ProcessorAction::FLUSH_BUFFER)
    }

    /// Start or continue an event spread over several datagrams
    fn process_partial_event_data(
        &mut self,
        ack: u8,
        status: u8,
        data: &[u8],
        buffer_number: u64,
    ) -> Result<ProcessorAction, ProcessingError> {
        let stack_list = (ack & ACK_STACK_LIST_MASK) as usize;
        let is_last_packet = ack & ACK_IS_LAST_PACKET_MASK != 0;
        self.counters.packets_per_stack_list[stack_list] += 1;
        self.counters.partial_fragments[stack_list] += 1;

        let mut iter = BufferIterator::new(data);
        let bindings = Arc::clone(&self.bindings);

        if self.state.stack_list.is_none() {
            let begin_header = iter.extract_u32()?;
            if !is_begin_marker(begin_header) {
                warn!(
                    "SIS3153 Warning: (buffer #{}) Invalid beginHeader 0x{:08x} (partialEvent). Skipping buffer.",
                    buffer_number, begin_header
                );
                return Ok(ProcessorAction::SKIP_INPUT);
            }

            if self.check_sequence(begin_header, buffer_number) {
                debug!("(buffer #{}) skipping stale partial event", buffer_number);
                return Ok(ProcessorAction::SKIP_INPUT);
            }

            let Some(event) = bindings.event(stack_list) else {
                warn!(
                    "SIS3153 Warning: (buffer #{}) No event for stackList={} (partialEvent). Skipping buffer.",
                    buffer_number, stack_list
                );
                return Ok(ProcessorAction::SKIP_INPUT);
            };

            let buffer = self.output.acquire();
            self.state = ProcessingState {
                stack_list: Some(stack_list),
                module_index: 0,
                expected_status: status,
                writer: StreamWriter::new(),
            };
            self.state.writer.open_event_section(buffer, event.event_index)?;
        }

        if self.state.stack_list != Some(stack_list) {
            warn!(
                "SIS3153 Warning: (buffer #{}) stackList mismatch during partialEvent processing (stackList={}, expected={:?}). Skipping buffer.",
                buffer_number, stack_list, self.state.stack_list
            );
            return Ok(ProcessorAction::SKIP_INPUT);
        }

        if status != self.state.expected_status {
            warn!(
                "SIS3153 Warning: (buffer #{}) fragment status mismatch during partialEvent processing (status=0x{:02x}, expected=0x{:02x}). Skipping buffer.",
                buffer_number, status, self.state.expected_status
            );
            return Ok(ProcessorAction::SKIP_INPUT);
        }
        self.state.expected_status = next_fragment_status(self.state.expected_status);

        let Some(event) = bindings.event(stack_list) else {
            warn!(
                "SIS3153 Warning: (buffer #{}) No event for stackList={} (partialEvent). Skipping buffer.",
                buffer_number, stack_list
            );
            return Ok(ProcessorAction::SKIP_INPUT);
        };

        let buffer = self.output.acquire();
        buffer.ensure_capacity(data.len() * 2);
        // The last packet ends with the event end marker
        let min_words = if is_last_packet { 1 } else { 0 };

        while iter.longwords_left() > min_words {
            let Some(module) = event.modules.get(self.state.module_index) else {
                warn!(
                    "SIS3153 Warning: (buffer #{}) moduleIndex out of range (eventIndex={}, moduleIndex={}, moduleCount={}). Skipping buffer.",
                    buffer_number,
                    event.event_index,
                    self.state.module_index,
                    event.modules.len()
                );
                return Ok(ProcessorAction::SKIP_INPUT);
            };

            if !self.state.writer.has_open_module_section() {
                self.state
                    .writer
                    .open_module_section(buffer, module.type_id, module.max_words)?;
            }

            let word = iter.extract_u32()?;
            self.state.writer.write_module_data(buffer, word)?;
            if word == END_MARKER {
                self.counters.total_net_bytes_read +=
                    self.state.writer.close_module_section(buffer)? as u64;
                self.state.module_index += 1;
            }
        }

        if !is_last_packet {
            return Ok(ProcessorAction::KEEP_STATE);
        }

        let end_header = iter.extract_u32()?;
        if !is_end_marker(end_header) {
            warn!(
                "SIS3153 Warning: (buffer #{}) Invalid endHeader 0x{:08x} (partialEvent). Skipping buffer.",
                buffer_number, end_header
            );
            return Ok(ProcessorAction::SKIP_INPUT);
        }

        if self.state.writer.has_open_module_section() {
            warn!(
                "SIS3153 Warning: (buffer #{}) module data of moduleIndex={} not terminated at end of partialEvent. Skipping buffer.",
                buffer_number, self.state.module_index
            );
            return Ok(ProcessorAction::SKIP_INPUT);
        }

        self.state.writer.write_event_data(buffer, END_MARKER)?;
        self.state.writer.close_event_section(buffer)?;

        self.add_bus_errors(stack_list, end_header);
        self.counters.reassembled_partials[stack_list] += 1;
        self.counters.stack_list_counts[stack_list] += 1;

        Ok(ProcessorAction::FLUSH_BUFFER)
    }
}

/// Dump a raw buffer to the log, one word per line
fn log_buffer(buffer_number: u64, data: &[u8]) {
    info!(">>> Begin buffer #{}", buffer_number);
    let mut iter = BufferIterator::new(data);
    while let Ok(word) = iter.extract_u32() {
        info!("  0x{:08x}", word);
    }
    if iter.bytes_left() > 0 {
        info!("  ({} trailing bytes)", iter.bytes_left());
    }
    info!("<<< End buffer #{}", buffer_number);
}
