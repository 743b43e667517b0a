use spdlog::warn;

use super::constants::{BEGIN_EVENT_SEQUENCE_NUMBER_MASK, SEQUENCE_NUMBER_MODULUS};
use super::error::EventLossError;

/// Outcome of feeding one sequence number to the [`EventLossTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Exactly one more than the previous number
    InSequence,
    /// Data left over from before the last (re)start, drop it
    StaleData,
    /// A gap was detected, the payload is the number of events lost
    EventsLost(u32),
    /// Same number as the previous event. Should never happen on a healthy link
    Duplicate,
    /// Recorded while draining, no accounting done
    LeavingDaq,
}

/// Tracks the 24-bit wrapping event sequence number of one SIS3153 and counts
/// lost events.
///
/// After construction (or [`EventLossTracker::mark_stale`]) all data is
/// considered stale until a sequence number of 1 is seen, as the controller
/// restarts its numbering when entering DAQ mode. While leaving DAQ mode the
/// running maximum is recorded but gaps are not counted.
#[derive(Debug, Clone)]
pub struct EventLossTracker {
    last_received: u32,
    is_stale: bool,
    is_leaving_daq: bool,
    lost_events: u64,
    anomalies: u64,
}

impl Default for EventLossTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLossTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            is_stale: true,
            is_leaving_daq: false,
            lost_events: 0,
            anomalies: 0,
        }
    }

    /// Feed the sequence number of the event at hand. `buffer_number` is only
    /// used for log messages.
    pub fn handle_sequence_number(&mut self, sequence_number: u32, buffer_number: u64) -> SequenceCheck {
        let sequence_number = sequence_number & BEGIN_EVENT_SEQUENCE_NUMBER_MASK;

        if self.is_stale {
            self.last_received = sequence_number;
            if sequence_number == 1 {
                self.is_stale = false;
                return SequenceCheck::InSequence;
            }
            return SequenceCheck::StaleData;
        }

        let diff = forward_distance(self.last_received, sequence_number);

        if self.is_leaving_daq {
            // Only move forward, trailing packets may arrive out of order
            if diff > 0 && diff < SEQUENCE_NUMBER_MODULUS / 2 {
                self.last_received = sequence_number;
            }
            return SequenceCheck::LeavingDaq;
        }

        self.last_received = sequence_number;

        match diff {
            0 => {
                self.anomalies += 1;
                warn!(
                    "SIS3153 Warning: (buffer #{}) repeated event sequence number {} (anomaly #{})",
                    buffer_number, sequence_number, self.anomalies
                );
                SequenceCheck::Duplicate
            }
            1 => SequenceCheck::InSequence,
            _ => {
                let lost = (diff - 1) as u32;
                self.lost_events += lost as u64;
                SequenceCheck::EventsLost(lost)
            }
        }
    }

    /// Start the drain window. Calling this twice is a contract violation.
    pub fn begin_leaving_daq(&mut self) -> Result<(), EventLossError> {
        if self.is_leaving_daq {
            return Err(EventLossError::AlreadyLeavingDaq);
        }
        self.is_leaving_daq = true;
        Ok(())
    }

    pub fn end_leaving_daq(&mut self) -> Result<(), EventLossError> {
        if !self.is_leaving_daq {
            return Err(EventLossError::NotLeavingDaq);
        }
        self.is_leaving_daq = false;
        Ok(())
    }

    /// Open a new stale data window, e.g. when resuming. Hardware numbering
    /// restarts at 1.
    pub fn mark_stale(&mut self) {
        self.is_stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn is_leaving_daq(&self) -> bool {
        self.is_leaving_daq
    }

    pub fn last_received(&self) -> u32 {
        self.last_received
    }

    pub fn lost_events(&self) -> u64 {
        self.lost_events
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }
}

/// Distance from `from` to `to` going forward modulo 2^24
fn forward_distance(from: u32, to: u32) -> i64 {
    let mut diff = to as i64 - from as i64;
    if diff < 0 {
        diff += SEQUENCE_NUMBER_MODULUS;
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(tracker: &mut EventLossTracker, numbers: &[u32]) -> Vec<SequenceCheck> {
        numbers
            .iter()
            .enumerate()
            .map(|(i, n)| tracker.handle_sequence_number(*n, i as u64))
            .collect()
    }

    #[test]
    fn test_contiguous_sequence() {
        let mut tracker = EventLossTracker::new();
        let checks = feed(&mut tracker, &[1, 2, 3, 4]);
        assert!(checks.iter().all(|c| *c == SequenceCheck::InSequence));
        assert_eq!(tracker.lost_events(), 0);
        assert!(!tracker.is_stale());
    }

    #[test]
    fn test_loss_is_sum_of_gaps() {
        let mut tracker = EventLossTracker::new();
        let checks = feed(&mut tracker, &[1, 2, 5, 6, 10]);
        assert_eq!(checks[2], SequenceCheck::EventsLost(2));
        assert_eq!(checks[4], SequenceCheck::EventsLost(3));
        assert_eq!(tracker.lost_events(), 5);
    }

    #[test]
    fn test_wraparound() {
        let mut tracker = EventLossTracker::new();
        feed(&mut tracker, &[1]);
        let max = BEGIN_EVENT_SEQUENCE_NUMBER_MASK;
        let checks = feed(&mut tracker, &[max - 1, max, 0, 1, 3]);
        // 1 -> max-1 is a big forward jump
        assert_eq!(checks[0], SequenceCheck::EventsLost(max - 3));
        assert_eq!(checks[1], SequenceCheck::InSequence);
        assert_eq!(checks[2], SequenceCheck::InSequence);
        assert_eq!(checks[3], SequenceCheck::InSequence);
        assert_eq!(checks[4], SequenceCheck::EventsLost(1));
        assert_eq!(tracker.lost_events(), (max - 3) as u64 + 1);
    }

    #[test]
    fn test_decrease_is_wraparound_not_replay() {
        let mut tracker = EventLossTracker::new();
        feed(&mut tracker, &[1, 2, 3, 10]);
        let lost_before = tracker.lost_events();
        // 10 -> 5 can only be a wrap all the way around
        let check = tracker.handle_sequence_number(5, 0);
        let expected = (SEQUENCE_NUMBER_MODULUS - 5 - 1) as u32;
        assert_eq!(check, SequenceCheck::EventsLost(expected));
        assert_eq!(tracker.lost_events(), lost_before + expected as u64);
    }

    #[test]
    fn test_stale_window_counts_nothing() {
        let mut tracker = EventLossTracker::new();
        let checks = feed(&mut tracker, &[500, 17, 20000, 3, 0xffffff, 42]);
        assert!(checks.iter().all(|c| *c == SequenceCheck::StaleData));
        assert_eq!(tracker.lost_events(), 0);
        assert!(tracker.is_stale());

        assert_eq!(tracker.handle_sequence_number(1, 6), SequenceCheck::InSequence);
        assert!(!tracker.is_stale());
        assert_eq!(tracker.handle_sequence_number(3, 7), SequenceCheck::EventsLost(1));
    }

    #[test]
    fn test_mark_stale_on_resume() {
        let mut tracker = EventLossTracker::new();
        feed(&mut tracker, &[1, 2, 3]);
        tracker.mark_stale();
        assert_eq!(tracker.handle_sequence_number(4, 0), SequenceCheck::StaleData);
        assert_eq!(tracker.handle_sequence_number(1, 1), SequenceCheck::InSequence);
        assert_eq!(tracker.lost_events(), 0);
    }

    #[test]
    fn test_duplicate_is_counted_not_fatal() {
        let mut tracker = EventLossTracker::new();
        let checks = feed(&mut tracker, &[1, 2, 2, 3]);
        assert_eq!(checks[2], SequenceCheck::Duplicate);
        assert_eq!(checks[3], SequenceCheck::InSequence);
        assert_eq!(tracker.anomalies(), 1);
        assert_eq!(tracker.lost_events(), 0);
    }

    #[test]
    fn test_leaving_daq_records_max_without_loss() {
        let mut tracker = EventLossTracker::new();
        feed(&mut tracker, &[1, 2]);
        tracker.begin_leaving_daq().unwrap();
        let checks = feed(&mut tracker, &[5, 4, 9, 7]);
        assert!(checks.iter().all(|c| *c == SequenceCheck::LeavingDaq));
        assert_eq!(tracker.last_received(), 9);
        assert_eq!(tracker.lost_events(), 0);
        tracker.end_leaving_daq().unwrap();
        assert_eq!(tracker.handle_sequence_number(10, 0), SequenceCheck::InSequence);
    }

    #[test]
    fn test_leaving_daq_contract() {
        let mut tracker = EventLossTracker::new();
        assert_eq!(tracker.end_leaving_daq(), Err(EventLossError::NotLeavingDaq));
        tracker.begin_leaving_daq().unwrap();
        assert_eq!(
            tracker.begin_leaving_daq(),
            Err(EventLossError::AlreadyLeavingDaq)
        );
        assert!(tracker.is_leaving_daq());
        tracker.end_leaving_daq().unwrap();
        assert!(!tracker.is_leaving_daq());
    }
}
