use parking_lot::Mutex;
use spdlog::{debug, error, info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::{timer_value_for_event, timer_value_from_seconds, Config, TriggerCondition};
use super::constants::*;
use super::controller::Controller;
use super::counters::{Counters, ReadoutCounters};
use super::data_buffer::BufferQueues;
use super::error::{ControllerError, ReadoutError};
use super::processor::BufferProcessor;
use super::raw_buffers::RawBufferRecorder;
use super::registers::*;
use super::sink::Sink;
use super::stack_list::{
    build_event_stack_list, build_watchdog_stack_list, stack_list_config_value, StackListBindings,
    StackRamAllocator,
};
use super::worker_status::{DaqState, WorkerStatus};

const COUNTER_PUBLISH_INTERVAL_MS: u64 = 100;

#[derive(Debug)]
struct SharedState {
    state: AtomicU8,
    desired: AtomicU8,
    counters: Mutex<Counters>,
}

/// Control and monitoring side of a [`ReadoutWorker`].
///
/// Cheap to clone and safe to use from any thread. `stop`, `pause` and
/// `resume` only record the desired state, the readout thread acts on it
/// between datagrams.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shared: Arc<SharedState>,
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedState {
                state: AtomicU8::new(DaqState::Idle as u8),
                desired: AtomicU8::new(DaqState::Idle as u8),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    pub fn state(&self) -> DaqState {
        DaqState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn desired_state(&self) -> DaqState {
        DaqState::from_u8(self.shared.desired.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() != DaqState::Idle
    }

    /// Request the end of the run. Ignored unless running or paused.
    pub fn stop(&self) {
        if matches!(self.state(), DaqState::Running | DaqState::Paused) {
            self.set_desired(DaqState::Stopping);
        }
    }

    /// Ignored unless running
    pub fn pause(&self) {
        if self.state() == DaqState::Running {
            self.set_desired(DaqState::Paused);
        }
    }

    /// Ignored unless paused
    pub fn resume(&self) {
        if self.state() == DaqState::Paused {
            self.set_desired(DaqState::Running);
        }
    }

    fn set_desired(&self, state: DaqState) {
        self.shared.desired.store(state as u8, Ordering::Release);
    }

    fn set_state(&self, state: DaqState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    fn publish(&self, counters: &Counters) {
        self.shared.counters.lock().clone_from(counters);
    }
}

impl ReadoutCounters for WorkerHandle {
    fn counters(&self) -> Counters {
        self.shared.counters.lock().clone()
    }
}

/// Drives one SIS3153 through a run: programs the stack lists, triggers and
/// watchdog, then receives and processes datagrams until stopped.
///
/// The worker is meant to live on its own thread; [`ReadoutWorker::start`]
/// blocks for the whole run. Use the [`WorkerHandle`] to control it.
#[derive(Debug)]
pub struct ReadoutWorker<C: Controller, S: Sink> {
    controller: C,
    config: Config,
    queues: Arc<BufferQueues>,
    processor: BufferProcessor<S>,
    handle: WorkerHandle,
    status_tx: Option<Sender<WorkerStatus>>,
    read_buffer: Vec<u8>,
    raw_recorder: Option<RawBufferRecorder<BufWriter<File>>>,
    stack_list_control: u32,
    cycles_to_run: u32,
    last_publish: Instant,
}

impl<C: Controller, S: Sink> ReadoutWorker<C, S> {
    pub fn new(controller: C, config: Config, sink: S) -> Self {
        let queues = BufferQueues::new(config.free_buffer_count, config.buffer_capacity);
        let processor = BufferProcessor::new(StackListBindings::new(), queues.clone(), sink);
        Self {
            controller,
            config,
            queues,
            processor,
            handle: WorkerHandle::new(),
            status_tx: None,
            read_buffer: vec![0u8; READ_BUFFER_SIZE],
            raw_recorder: None,
            stack_list_control: 0,
            cycles_to_run: 0,
            last_publish: Instant::now(),
        }
    }

    /// Publish a [`WorkerStatus`] on every state change
    pub fn with_status_sender(mut self, tx: Sender<WorkerStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// The buffer pools; consumers take filled buffers from here and recycle them
    pub fn queues(&self) -> Arc<BufferQueues> {
        self.queues.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    pub fn sink(&self) -> &S {
        self.processor.sink()
    }

    pub fn into_sink(self) -> S {
        self.processor.into_sink()
    }

    /// StackListControl value of the current (or last) run
    pub fn stack_list_control(&self) -> u32 {
        self.stack_list_control
    }

    pub fn bindings(&self) -> &StackListBindings {
        self.processor.bindings()
    }

    /// Run the DAQ. Blocks until stopped, or until `cycles` loop iterations have
    /// run if `cycles` is non-zero. Always returns to Idle.
    pub fn start(&mut self, cycles: u32) -> Result<(), ReadoutError> {
        let state = self.handle.state();
        if state != DaqState::Idle {
            return Err(ReadoutError::NotIdle(state));
        }

        self.cycles_to_run = cycles;
        self.handle.set_desired(DaqState::Running);
        self.set_state(DaqState::Starting);
        info!(
            "SIS3153 readout starting on {}",
            time::OffsetDateTime::now_utc()
        );

        let result = self.run();
        if let Err(e) = &result {
            error!("SIS3153 readout error: {}", e);
        }

        if let Some(mut recorder) = self.raw_recorder.take() {
            info!(
                "Closing raw buffer file ({} entries)",
                recorder.entries()
            );
            if let Err(e) = recorder.flush() {
                warn!("Failed to flush raw buffer file: {}", e);
            }
        }

        self.log_summary();
        self.handle.set_desired(DaqState::Idle);
        self.set_state(DaqState::Idle);
        result
    }

    fn run(&mut self) -> Result<(), ReadoutError> {
        let bindings = self.setup_controller()?;
        self.processor.begin_run(bindings);
        self.processor
            .set_log_buffers(self.config.log_buffers || self.cycles_to_run > 0);

        if let Some(path) = self.config.raw_buffer_path.clone() {
            self.raw_recorder = Some(RawBufferRecorder::create(&path)?);
        }

        self.processor.sink_mut().begin_run(&self.config)?;
        self.enter_daq_mode()?;
        self.readout_loop()?;

        self.set_state(DaqState::Stopping);
        self.leave_daq_mode()?;
        self.processor.discard_partial_event();
        self.processor.sink_mut().end_run()?;
        info!(
            "SIS3153 readout stopped on {}",
            time::OffsetDateTime::now_utc()
        );
        Ok(())
    }

    /// Program the controller for the configured events. Returns the stack
    /// list bindings of the run.
    fn setup_controller(&mut self) -> Result<StackListBindings, ReadoutError> {
        self.config.validate()?;

        let firmware = self.controller.read_register(MODULE_ID_AND_FIRMWARE)?;
        let serial = self.controller.read_register(SERIAL_NUMBER)?;
        info!(
            "SIS3153 (SerialNumber={}, Firmware={:02x}.{:02x})",
            serial,
            (firmware & 0xff00) >> 8,
            firmware & 0xff
        );

        if self.config.use_jumbo_frames {
            info!("Enabling Jumbo Frame Support");
        }
        self.controller.set_jumbo_frames(self.config.use_jumbo_frames)?;

        for stack_list in 0..NUMBER_OF_STACK_LISTS {
            self.controller
                .write_register(stack_list_config_register(stack_list), 0)?;
            self.controller
                .write_register(stack_list_trigger_register(stack_list), 0)?;
        }

        let mut bindings = StackListBindings::from_config(&self.config);
        let mut allocator = StackRamAllocator::new();
        let mut control = CONTROL_LIST_BUFFER_ENABLE;

        for (stack_list, event) in self.config.events.iter().enumerate() {
            let list = build_event_stack_list(event);
            let load_address = allocator.allocate(&event.name, &list)?;
            debug!(
                "Event {} uses stack list {} ({} words at 0x{:08x})",
                event.name,
                stack_list,
                list.len(),
                load_address
            );
            self.controller.upload_stack_list(load_address, &list)?;
            self.controller.write_register(
                stack_list_config_register(stack_list),
                stack_list_config_value(load_address, list.len()),
            )?;

            let trigger = match event.trigger {
                TriggerCondition::Interrupt { level } => level as u32,
                TriggerCondition::Periodic { period_s } => {
                    let timer_value = timer_value_for_event(&event.name, period_s)?;
                    self.controller
                        .write_register(STACK_LIST_TIMER1_CONFIG, timer_value)?;
                    control |= CONTROL_TIMER1_ENABLE;
                    TRIGGER_SOURCE_TIMER1
                }
                TriggerCondition::Input1RisingEdge => TRIGGER_SOURCE_INPUT1_RISING,
                TriggerCondition::Input1FallingEdge => TRIGGER_SOURCE_INPUT1_FALLING,
                TriggerCondition::Input2RisingEdge => TRIGGER_SOURCE_INPUT2_RISING,
                TriggerCondition::Input2FallingEdge => TRIGGER_SOURCE_INPUT2_FALLING,
            };
            self.controller
                .write_register(stack_list_trigger_register(stack_list), trigger)?;
            control |= CONTROL_STACK_LIST_ENABLE;
        }

        match bindings.first_free() {
            Some(stack_list) => {
                let list = build_watchdog_stack_list();
                let load_address = allocator.allocate("watchdog", &list)?;
                self.controller.upload_stack_list(load_address, &list)?;
                self.controller.write_register(
                    stack_list_config_register(stack_list),
                    stack_list_config_value(load_address, list.len()),
                )?;
                self.controller.write_register(
                    STACK_LIST_TIMER2_CONFIG,
                    timer_value_from_seconds(WATCHDOG_TIMEOUT_S) | TIMER_WATCHDOG_ENABLE,
                )?;
                self.controller
                    .write_register(stack_list_trigger_register(stack_list), TRIGGER_SOURCE_TIMER2)?;
                control |= CONTROL_STACK_LIST_ENABLE | CONTROL_TIMER2_ENABLE;
                bindings.set_watchdog(Some(stack_list));
                info!("Watchdog uses stack list {}", stack_list);
            }
            None => warn!("No free stack list left, running without the watchdog"),
        }

        self.stack_list_control = control;
        info!(
            "StackListControlValue: 0x{:08x} ({})",
            control,
            format_stack_list_control(control)
        );
        Ok(bindings)
    }

    fn enter_daq_mode(&mut self) -> Result<(), ReadoutError> {
        self.controller
            .write_register(STACK_LIST_CONTROL, self.stack_list_control)
            .map_err(|e| ReadoutError::DaqMode("enter", e))
    }

    /// Disable the stack lists and process whatever is still in flight.
    /// Returns the number of drained packets.
    fn leave_daq_mode(&mut self) -> Result<u32, ReadoutError> {
        self.controller
            .write_register(
                STACK_LIST_CONTROL,
                self.stack_list_control << CONTROL_DISABLE_SHIFT,
            )
            .map_err(|e| ReadoutError::DaqMode("leave", e))?;

        self.processor.tracker_mut().begin_leaving_daq()?;
        let mut packets = 0;
        let mut drained = false;
        while packets < self.config.max_drain_packets {
            if self.read_and_process() == 0 {
                drained = true;
                break;
            }
            packets += 1;
        }
        if !drained {
            warn!(
                "SIS3153 drain stopped at the limit of {} packets, the controller may still be sending data",
                packets
            );
        }
        self.processor.tracker_mut().end_leaving_daq()?;

        info!(
            "SIS3153 readout left DAQ mode ({} remaining packets received)",
            packets
        );
        Ok(packets)
    }

    fn readout_loop(&mut self) -> Result<(), ReadoutError> {
        self.set_state(DaqState::Running);

        let mut tick_timer = Instant::now();
        let mut read_error_timer = Instant::now();
        let mut read_error_count: u32 = 0;
        let read_error_interval = Duration::from_millis(READ_ERROR_LOG_INTERVAL_MS);

        loop {
            let elapsed_seconds = tick_timer.elapsed().as_millis() as u64 / TIMETICK_INTERVAL_MS;
            if elapsed_seconds >= 1 {
                for _ in 0..elapsed_seconds {
                    self.processor.timetick();
                }
                tick_timer = Instant::now();
            }

            match (self.handle.state(), self.handle.desired_state()) {
                (DaqState::Running, DaqState::Running) => {
                    if self.read_and_process() == 0 {
                        read_error_count += 1;
                        if read_error_timer.elapsed() >= read_error_interval {
                            warn!(
                                "SIS3153 Warning: received no data with the past {} reads",
                                read_error_count
                            );
                            read_error_timer = Instant::now();
                            read_error_count = 0;
                        }
                    }

                    if self.cycles_to_run > 0 {
                        if self.cycles_to_run == 1 {
                            break;
                        }
                        self.cycles_to_run -= 1;
                    }
                }
                (DaqState::Running, DaqState::Paused) => {
                    self.leave_daq_mode()?;
                    self.processor.discard_partial_event();
                    self.set_state(DaqState::Paused);
                    info!("SIS3153 readout paused");
                }
                (DaqState::Paused, DaqState::Running) => {
                    // Numbering restarts at 1 when DAQ mode is entered again
                    self.processor.tracker_mut().mark_stale();
                    self.enter_daq_mode()?;
                    self.set_state(DaqState::Running);
                    info!("SIS3153 readout resumed");
                }
                (_, DaqState::Stopping) => {
                    info!("SIS3153 readout stopping");
                    break;
                }
                (DaqState::Paused, _) => {
                    std::thread::sleep(Duration::from_millis(PAUSED_POLL_INTERVAL_MS));
                }
                (state, desired) => {
                    error!(
                        "SIS3153 readout in unexpected state {} (desired {}), stopping",
                        state, desired
                    );
                    break;
                }
            }

            self.publish_counters(false);
        }
        Ok(())
    }

    /// Receive one datagram and hand it to the processor. Returns the number of
    /// bytes read, 0 for timeouts and receive errors.
    fn read_and_process(&mut self) -> usize {
        match self.controller.receive_datagram(&mut self.read_buffer) {
            Ok(0) => {
                self.record_raw(|r| r.record_failure(0));
                0
            }
            Ok(bytes_read) => {
                let datagram = &self.read_buffer[..bytes_read];
                if let Some(recorder) = self.raw_recorder.as_mut() {
                    if let Err(e) = recorder.record_datagram(datagram) {
                        warn!("Raw buffer recording failed, disabling it: {}", e);
                        self.raw_recorder = None;
                    }
                }
                self.processor.handle_datagram(datagram);
                bytes_read
            }
            Err(e) => {
                let code = os_error_code(&e);
                self.record_raw(|r| r.record_failure(code));
                if !e.is_timeout() {
                    warn!("SIS3153 Warning: {}", e);
                    self.processor.record_read_error();
                }
                0
            }
        }
    }

    fn record_raw<F>(&mut self, record: F)
    where
        F: FnOnce(&mut RawBufferRecorder<BufWriter<File>>) -> Result<(), crate::error::RawBufferError>,
    {
        if let Some(recorder) = self.raw_recorder.as_mut() {
            if let Err(e) = record(recorder) {
                warn!("Raw buffer recording failed, disabling it: {}", e);
                self.raw_recorder = None;
            }
        }
    }

    fn set_state(&mut self, state: DaqState) {
        self.handle.set_state(state);
        self.publish_counters(true);
        debug!("SIS3153 readout state: {}", state);
        if let Some(tx) = &self.status_tx {
            if tx
                .send(WorkerStatus::new(state, self.processor.counters().clone()))
                .is_err()
            {
                debug!("Worker status receiver is gone");
                self.status_tx = None;
            }
        }
    }

    fn publish_counters(&mut self, force: bool) {
        if force || self.last_publish.elapsed() >= Duration::from_millis(COUNTER_PUBLISH_INTERVAL_MS) {
            self.handle.publish(self.processor.counters());
            self.last_publish = Instant::now();
        }
    }

    fn log_summary(&self) {
        let counters = self.processor.counters();
        info!(
            "SIS3153 read {} in {} buffers ({} net event data), {} buffers with errors",
            human_bytes::human_bytes(counters.total_bytes_read as f64),
            counters.total_buffers_read,
            human_bytes::human_bytes(counters.total_net_bytes_read as f64),
            counters.buffers_with_errors
        );
        info!(
            "SIS3153 events: {} complete, {} lost, {} stale, {} watchdog, {} dropped buffers",
            counters.total_events(),
            counters.lost_events,
            counters.stale_events,
            counters.watchdog_events,
            counters.dropped_buffers
        );
    }
}

impl<C: Controller, S: Sink> ReadoutCounters for ReadoutWorker<C, S> {
    fn counters(&self) -> Counters {
        self.processor.counters().clone()
    }
}

fn os_error_code(error: &ControllerError) -> i32 {
    match error {
        ControllerError::IOError(e) => e.raw_os_error().unwrap_or(-1),
        _ => -1,
    }
}
