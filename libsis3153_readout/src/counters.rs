use super::constants::NUMBER_OF_STACK_LISTS;

/// Readout statistics of one SIS3153 run.
///
/// Owned and mutated by the readout thread only. Other threads get a copy
/// through [`ReadoutCounters::counters`], which is consistent as a whole but
/// may lag behind the readout by a few buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    /// Completed events per stack list
    pub stack_list_counts: [u64; NUMBER_OF_STACK_LISTS],
    pub packets_per_stack_list: [u64; NUMBER_OF_STACK_LISTS],
    pub embedded_events: [u64; NUMBER_OF_STACK_LISTS],
    pub partial_fragments: [u64; NUMBER_OF_STACK_LISTS],
    pub reassembled_partials: [u64; NUMBER_OF_STACK_LISTS],
    pub berr_block: [u64; NUMBER_OF_STACK_LISTS],
    pub berr_read: [u64; NUMBER_OF_STACK_LISTS],
    pub berr_write: [u64; NUMBER_OF_STACK_LISTS],
    pub multi_event_packets: u64,
    pub lost_events: u64,
    pub stale_events: u64,
    pub sequence_anomalies: u64,
    pub watchdog_events: u64,
    pub total_bytes_read: u64,
    pub total_buffers_read: u64,
    pub total_net_bytes_read: u64,
    pub buffers_with_errors: u64,
    pub dropped_buffers: u64,
    pub read_errors: u64,
    pub module_size_exceeded: u64,
    /// Events discarded because they did not fit one listfile section
    pub event_size_exceeded: u64,
    pub sink_errors: u64,
    pub watchdog_stack_list: Option<usize>,
}

impl Counters {
    /// Sum of completed events over all stack lists
    pub fn total_events(&self) -> u64 {
        self.stack_list_counts.iter().sum()
    }

    /// Add the bus error fields of an event end marker
    pub fn add_bus_errors(&mut self, stack_list: usize, block: u32, read: u32, write: u32) {
        if stack_list < NUMBER_OF_STACK_LISTS {
            self.berr_block[stack_list] += block as u64;
            self.berr_read[stack_list] += read as u64;
            self.berr_write[stack_list] += write as u64;
        }
    }
}

/// Capability of every readout worker flavor: hand out a snapshot of its
/// counters without the caller knowing the concrete worker type.
pub trait ReadoutCounters {
    fn counters(&self) -> Counters;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_errors_and_totals() {
        let mut counters = Counters::default();
        counters.add_bus_errors(1, 2, 3, 4);
        counters.add_bus_errors(1, 1, 0, 0);
        counters.add_bus_errors(NUMBER_OF_STACK_LISTS, 9, 9, 9);
        assert_eq!(counters.berr_block[1], 3);
        assert_eq!(counters.berr_read[1], 3);
        assert_eq!(counters.berr_write[1], 4);
        counters.stack_list_counts[0] = 5;
        counters.stack_list_counts[3] = 2;
        assert_eq!(counters.total_events(), 7);
    }
}
