use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::constants::*;
use super::error::ConfigError;

/// What starts the readout of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// VME interrupt of the given level (1-7)
    Interrupt { level: u8 },
    /// Timer driven readout
    Periodic { period_s: f64 },
    Input1RisingEdge,
    Input1FallingEdge,
    Input2RisingEdge,
    Input2FallingEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataWidth {
    D16,
    #[default]
    D32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockMode {
    Blt,
    Mblt,
}

/// One VME command of a module's readout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ReadoutCommand {
    Read {
        address: u32,
        #[serde(default)]
        width: DataWidth,
    },
    Write {
        address: u32,
        value: u32,
        #[serde(default)]
        width: DataWidth,
    },
    Marker {
        value: u32,
    },
    /// Block transfer. `byte_count` goes to the controller unchanged.
    BlockRead {
        address: u32,
        byte_count: u32,
        mode: BlockMode,
        #[serde(default)]
        fifo: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    /// Module type tag written to the module section header
    pub type_id: u8,
    /// Limit of the module section in words, including the EndMarker
    #[serde(default)]
    pub max_words: Option<u32>,
    pub readout: Vec<ReadoutCommand>,
}

impl ModuleConfig {
    pub fn max_words(&self) -> u32 {
        self.max_words.unwrap_or(SUBEVENT_MAX_WORDS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub name: String,
    pub trigger: TriggerCondition,
    pub modules: Vec<ModuleConfig>,
}

/// Structure representing the readout configuration. Contains the VME event
/// setup and the readout buffer settings.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub use_jumbo_frames: bool,
    pub events: Vec<EventConfig>,
    pub free_buffer_count: usize,
    /// Initial capacity of each pooled output buffer in bytes
    pub buffer_capacity: usize,
    pub listfile_path: Option<PathBuf>,
    /// If set every received datagram is recorded here for debugging
    pub raw_buffer_path: Option<PathBuf>,
    pub log_buffers: bool,
    /// Upper bound on the number of packets read while leaving DAQ mode
    pub max_drain_packets: u32,
}

impl Default for Config {
    /// A single interrupt driven event with one MBLT module
    fn default() -> Self {
        Self {
            use_jumbo_frames: false,
            events: vec![EventConfig {
                name: String::from("event0"),
                trigger: TriggerCondition::Interrupt { level: 1 },
                modules: vec![ModuleConfig {
                    name: String::from("module0"),
                    type_id: 1,
                    max_words: None,
                    readout: vec![
                        ReadoutCommand::BlockRead {
                            address: 0x00000000,
                            byte_count: 65535,
                            mode: BlockMode::Mblt,
                            fifo: true,
                        },
                        ReadoutCommand::Write {
                            address: 0x00006034,
                            value: 1,
                            width: DataWidth::D16,
                        },
                    ],
                }],
            }],
            free_buffer_count: 10,
            buffer_capacity: LOCAL_BUFFER_SIZE,
            listfile_path: None,
            raw_buffer_path: None,
            log_buffers: false,
            max_drain_packets: DEFAULT_MAX_DRAIN_PACKETS,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check the event setup against what the SIS3153 can do
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.events.len() > NUMBER_OF_STACK_LISTS {
            return Err(ConfigError::TooManyEvents(self.events.len()));
        }

        if self.max_drain_packets == 0 {
            return Err(ConfigError::InvalidDrainLimit);
        }

        let n_periodic = self
            .events
            .iter()
            .filter(|e| matches!(e.trigger, TriggerCondition::Periodic { .. }))
            .count();
        if n_periodic > 1 {
            return Err(ConfigError::TooManyPeriodicEvents(n_periodic));
        }

        for event in self.events.iter() {
            if event.modules.is_empty() {
                return Err(ConfigError::NoModules(event.name.clone()));
            }
            match event.trigger {
                TriggerCondition::Interrupt { level } => {
                    if !(1..=7).contains(&level) {
                        return Err(ConfigError::InvalidIrqLevel(event.name.clone(), level));
                    }
                }
                TriggerCondition::Periodic { period_s } => {
                    timer_value_for_event(&event.name, period_s)?;
                }
                _ => (),
            }
        }
        Ok(())
    }
}

/// Timer register value for a period in seconds. The timers count in units of
/// 100 us.
pub fn timer_value_from_seconds(period_s: f64) -> u32 {
    let period_100us = period_s * 1e6 / 100.0;
    (period_100us - 1.0).max(0.0) as u32
}

/// Validated timer value for a periodic event
pub fn timer_value_for_event(name: &str, period_s: f64) -> Result<u32, ConfigError> {
    if period_s.is_nan() || period_s <= 0.0 {
        return Err(ConfigError::InvalidTimerPeriod(name.to_string(), period_s));
    }
    let value = timer_value_from_seconds(period_s);
    if value > 0xffff {
        return Err(ConfigError::TimerPeriodExceeded(name.to_string(), value));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, trigger: TriggerCondition) -> EventConfig {
        EventConfig {
            name: name.to_string(),
            trigger,
            modules: Config::default().events[0].modules.clone(),
        }
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config
            .events
            .push(event("ticks", TriggerCondition::Periodic { period_s: 1.0 }));
        config.raw_buffer_path = Some(PathBuf::from("raw.bin"));
        config.write_config_file(&path).unwrap();
        let read_back = Config::read_config_file(&path).unwrap();
        assert_eq!(read_back, config);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::read_config_file(Path::new("/does/not/exist.yaml"));
        assert!(matches!(result, Err(ConfigError::BadFilePath(_))));
    }

    #[test]
    fn test_parse_readout_commands() {
        let yaml = r#"
name: mdpp
type_id: 9
readout:
  - command: block_read
    address: 0x01000000
    byte_count: 65535
    mode: mblt
    fifo: true
  - command: write
    address: 0x0100603a
    value: 1
    width: d16
  - command: read
    address: 0x01006030
"#;
        let module: ModuleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(module.max_words(), SUBEVENT_MAX_WORDS);
        assert_eq!(
            module.readout[0],
            ReadoutCommand::BlockRead {
                address: 0x01000000,
                byte_count: 65535,
                mode: BlockMode::Mblt,
                fifo: true
            }
        );
        assert_eq!(
            module.readout[2],
            ReadoutCommand::Read {
                address: 0x01006030,
                width: DataWidth::D32
            }
        );
    }

    #[test]
    fn test_validation() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.events = (0..9)
            .map(|i| event(&format!("e{i}"), TriggerCondition::Interrupt { level: 1 }))
            .collect();
        assert!(matches!(config.validate(), Err(ConfigError::TooManyEvents(9))));

        config.events = vec![
            event("a", TriggerCondition::Periodic { period_s: 0.5 }),
            event("b", TriggerCondition::Periodic { period_s: 1.0 }),
        ];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyPeriodicEvents(2))
        ));

        config.events = vec![event("a", TriggerCondition::Periodic { period_s: 0.0 })];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimerPeriod(_, _))
        ));

        config.events = vec![event("a", TriggerCondition::Periodic { period_s: 10.0 })];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimerPeriodExceeded(_, 99999))
        ));

        config.events = vec![event("a", TriggerCondition::Interrupt { level: 8 })];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIrqLevel(_, 8))
        ));

        let mut config = Config::default();
        config.max_drain_packets = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDrainLimit)
        ));
    }

    #[test]
    fn test_timer_values() {
        assert_eq!(timer_value_from_seconds(1.0), 9999);
        assert_eq!(timer_value_from_seconds(WATCHDOG_TIMEOUT_S), 499);
        assert_eq!(timer_value_for_event("x", 6.5).unwrap(), 64999);
    }
}
