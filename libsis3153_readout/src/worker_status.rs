use super::counters::Counters;

/// Run state of a readout worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum DaqState {
    #[default]
    Idle = 0,
    Starting = 1,
    Running = 2,
    Paused = 3,
    Stopping = 4,
}

impl DaqState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for DaqState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Sent by the readout worker on every state change
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub state: DaqState,
    pub counters: Counters,
}

impl WorkerStatus {
    pub fn new(state: DaqState, counters: Counters) -> Self {
        Self { state, counters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            DaqState::Idle,
            DaqState::Starting,
            DaqState::Running,
            DaqState::Paused,
            DaqState::Stopping,
        ] {
            assert_eq!(DaqState::from_u8(state as u8), state);
        }
        assert_eq!(DaqState::Paused.to_string(), "Paused");
    }
}
