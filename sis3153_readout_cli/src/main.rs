//! # sis3153_readout_cli
//!
//! Part of the sis3153_readout crate family.
//!
//! Command line front end of the SIS3153 readout. It writes template configurations and
//! replays raw buffer recordings (made with `raw_buffer_path` set) through the complete
//! readout worker, optionally producing a listfile.
//!
//! ## Use
//!
//! ```bash
//! sis3153_readout_cli -p config.yaml new
//! sis3153_readout_cli -p config.yaml replay -i sis3153_raw_buffers.bin
//! ```
use clap::{Arg, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libsis3153_readout::config::Config;
use libsis3153_readout::counters::{Counters, ReadoutCounters};
use libsis3153_readout::data_buffer::BufferQueues;
use libsis3153_readout::listfile::{read_sections, ListfileWriter, Section};
use libsis3153_readout::readout_worker::ReadoutWorker;
use libsis3153_readout::replay::ReplayController;
use libsis3153_readout::sink::{NullSink, Sink};

const CONSUMER_WAIT_MS: u64 = 100;
const SPINNER_UPDATE_MS: u64 = 200;

#[derive(Debug, Default)]
struct ConsumerStats {
    buffers: u64,
    events: u64,
    timeticks: u64,
    bad_buffers: u64,
}

/// Analysis side stand in: takes filled buffers, counts sections and hands the
/// buffers back to the free queue
fn consume_buffers(queues: Arc<BufferQueues>, done: Arc<AtomicBool>) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    loop {
        let Some(buffer) = queues.wait_filled(Duration::from_millis(CONSUMER_WAIT_MS)) else {
            if done.load(Ordering::Acquire) && queues.filled_count() == 0 {
                break;
            }
            continue;
        };
        stats.buffers += 1;
        match read_sections(buffer.as_slice()) {
            Ok(sections) => {
                for section in sections {
                    match section {
                        Section::Event { .. } => stats.events += 1,
                        Section::Timetick => stats.timeticks += 1,
                        _ => (),
                    }
                }
            }
            Err(e) => {
                stats.bad_buffers += 1;
                spdlog::warn!("Consumer could not parse buffer: {e}");
            }
        }
        queues.recycle(buffer);
    }
    stats
}

fn log_counters(counters: &Counters) {
    spdlog::info!(
        "Read {} in {} buffers, {} net event data",
        human_bytes::human_bytes(counters.total_bytes_read as f64),
        counters.total_buffers_read,
        human_bytes::human_bytes(counters.total_net_bytes_read as f64)
    );
    spdlog::info!(
        "Events: {} (multi event packets: {}, reassembled partial events: {})",
        counters.total_events(),
        counters.multi_event_packets,
        counters.reassembled_partials.iter().sum::<u64>()
    );
    spdlog::info!(
        "Lost events: {} Stale events: {} Watchdog events: {}",
        counters.lost_events,
        counters.stale_events,
        counters.watchdog_events
    );
    spdlog::info!(
        "Buffers with errors: {} Dropped buffers: {} Read errors: {} Oversized events: {}",
        counters.buffers_with_errors,
        counters.dropped_buffers,
        counters.read_errors,
        counters.event_size_exceeded
    );
    for (stack_list, count) in counters.stack_list_counts.iter().enumerate() {
        if *count > 0 {
            spdlog::info!(
                "Stack list {}: {} events, bus errors (block/read/write) {}/{}/{}",
                stack_list,
                count,
                counters.berr_block[stack_list],
                counters.berr_read[stack_list],
                counters.berr_write[stack_list]
            );
        }
    }
}

fn replay(config: Config, input: &Path) {
    let controller = match ReplayController::open(input) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    let exhausted = controller.exhausted_flag();

    let sink: Box<dyn Sink + Send> = match &config.listfile_path {
        Some(path) => match ListfileWriter::create(path) {
            Ok(writer) => Box::new(writer),
            Err(e) => {
                spdlog::error!("{e}");
                return;
            }
        },
        None => Box::new(NullSink),
    };

    let mut worker = ReadoutWorker::new(controller, config, sink);
    let handle = worker.handle();
    let queues = worker.queues();

    let done = Arc::new(AtomicBool::new(false));
    let consumer_done = done.clone();
    let consumer = std::thread::spawn(move || consume_buffers(queues, consumer_done));
    let readout = std::thread::spawn(move || worker.start(0));

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );

    loop {
        std::thread::sleep(Duration::from_millis(SPINNER_UPDATE_MS));
        let counters = handle.counters();
        pb.set_message(format!(
            "{} | {} buffers | {} events | {} lost",
            handle.state(),
            counters.total_buffers_read,
            counters.total_events(),
            counters.lost_events
        ));
        pb.tick();

        if exhausted.load(Ordering::Acquire) {
            handle.stop();
        }

        if readout.is_finished() {
            match readout.join() {
                Ok(result) => match result {
                    Ok(_) => spdlog::info!("Replay finished."),
                    Err(e) => spdlog::error!("Replay failed with error: {e}"),
                },
                Err(_) => spdlog::error!("Failed to join readout task!"),
            }
            break;
        }
    }
    pb.finish_and_clear();

    done.store(true, Ordering::Release);
    match consumer.join() {
        Ok(stats) => spdlog::info!(
            "Consumer saw {} buffers: {} events, {} timeticks, {} unreadable",
            stats.buffers,
            stats.events,
            stats.timeticks,
            stats.bad_buffers
        ),
        Err(_) => spdlog::error!("Failed to join consumer task!"),
    }

    log_counters(&handle.counters());
}

fn main() {
    let matches = Command::new("sis3153_readout_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("replay")
                .about("Replay a raw SIS3153 buffer recording through the readout")
                .arg(
                    Arg::new("input")
                        .short('i')
                        .long("input")
                        .required(true)
                        .help("Path to the raw buffer file"),
                ),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Log to the terminal and to a file
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./sis3153_readout.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .expect("Could not create log file!"),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .sinks(spdlog::default_logger().sinks().iter().cloned())
            .sink(file_sink)
            .flush_level_filter(spdlog::LevelFilter::All)
            .build()
            .expect("Could not create logger!"),
    );
    spdlog::set_default_logger(logger);

    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    match matches.subcommand() {
        Some(("new", _)) => {
            spdlog::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            match Config::default().write_config_file(&config_path) {
                Ok(()) => spdlog::info!("Done."),
                Err(e) => spdlog::error!("{e}"),
            }
        }
        Some(("replay", args)) => {
            spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
            let config = match Config::read_config_file(&config_path) {
                Ok(c) => c,
                Err(e) => {
                    spdlog::error!("{e}");
                    return;
                }
            };
            spdlog::info!("Config successfully loaded.");
            spdlog::info!("Events: {}", config.events.len());
            spdlog::info!("Jumbo frames: {}", config.use_jumbo_frames);
            if let Some(path) = &config.listfile_path {
                spdlog::info!("Listfile: {}", path.to_string_lossy());
            }

            let input = PathBuf::from(args.get_one::<String>("input").expect("We require args"));
            replay(config, &input);
            spdlog::info!("Done.");
        }
        _ => spdlog::error!("Unknown command, see --help"),
    }
}
