//! # libsis3153_readout
//!
//! libsis3153_readout is the readout side of a VME data acquisition using the Struck
//! SIS3153 ethernet VME controller, written in Rust. It programs the controller's stack
//! lists for the configured events, receives the UDP datagrams the controller sends while
//! in DAQ mode, and turns them into event sections of the version 1 listfile format.
//!
//! ## Datagrams
//!
//! Every datagram starts with three header bytes (`ack`, `ident`, `status`). The `ack`
//! byte carries the stack list index (bits 0-2) and a last packet flag (bit 3); the value
//! `0x60` marks a multi event packet. There are three framings:
//!
//! - Single event: one complete event, framed by a begin marker (`0xBB` plus a 24 bit
//! sequence number) and an end marker (`0xEE` plus bus error counts).
//! - Multi event: several complete events, each preceded by a 4 byte embedded header
//! containing its own ack byte and its length in words.
//! - Partial event: an event too large for one datagram, split over consecutive
//! datagrams. The low nibble of the status byte counts the fragments.
//!
//! Module data inside an event is terminated by the `0x87654321` EndMarker, which the
//! stack list builder appends after every module's readout commands.
//!
//! ## Event loss
//!
//! The sequence numbers of the begin markers are tracked per controller. Gaps are
//! counted as lost events. After (re)entering DAQ mode everything is considered stale
//! until a sequence number of 1 is seen, and while leaving DAQ mode the remaining
//! in-flight datagrams are processed without loss accounting.
//!
//! ## Usage
//!
//! A [`readout_worker::ReadoutWorker`] owns a [`controller::Controller`] and a
//! [`sink::Sink`]. Calling `start` programs the controller and blocks for the whole run,
//! so it is typically moved onto its own thread. The [`readout_worker::WorkerHandle`]
//! stops, pauses and resumes the run and hands out counter snapshots. Completed output
//! buffers are written to the sink and then pushed onto the filled buffer queue, where a
//! consumer can pick them up and recycle them.
//!
//! The `sis3153_readout_cli` crate shows a complete example, replaying a raw buffer
//! recording through the worker.
//!
//! ## Configuration
//!
//! Configurations are YAML files. A minimal example:
//!
//! ```yml
//! use_jumbo_frames: false
//! events:
//! - name: event0
//!   trigger:
//!     type: interrupt
//!     level: 1
//!   modules:
//!   - name: module0
//!     type_id: 1
//!     max_words: null
//!     readout:
//!     - command: block_read
//!       address: 0
//!       byte_count: 65535
//!       mode: mblt
//!       fifo: true
//! free_buffer_count: 10
//! buffer_capacity: 1048576
//! listfile_path: null
//! raw_buffer_path: null
//! log_buffers: false
//! max_drain_packets: 100000
//! ```
//!
//! Periodic events use `type: periodic` with a `period_s` field (at most one periodic
//! event, up to 6.5 s). A free stack list is used for a 50 ms watchdog so that the link
//! keeps sending packets even without triggers.
//!
//! ## Output
//!
//! Output buffers contain a sequence of sections. Event sections have the layout
//! `[event header][module header, data..., EndMarker]*[EndMarker]`, Timetick sections are
//! emitted once per second. The [`listfile::ListfileWriter`] sink wraps these buffers in
//! a complete listfile with the configuration and an end section.
pub mod buffer_iterator;
pub mod config;
pub mod constants;
pub mod controller;
pub mod counters;
pub mod data_buffer;
pub mod error;
pub mod event_loss;
pub mod listfile;
pub mod processor;
pub mod raw_buffers;
pub mod readout_worker;
pub mod registers;
pub mod replay;
pub mod sink;
pub mod stack_list;
pub mod stream_writer;
pub mod worker_status;

#[cfg(test)]
mod test_data;
