use super::config::{BlockMode, Config, DataWidth, EventConfig, ReadoutCommand};
use super::constants::*;
use super::error::StackListError;
use super::registers::STACK_RAM_START;

const LIST_HEADER: u32 = 0xAAAA9000;
const LIST_TRAILER: u32 = 0xAAAAA000;
const LIST_MARKER: u32 = 0xAAAA8000;
const LIST_VME_ACCESS: u32 = 0xAAAA4000;

const ACCESS_SIZE_16: u32 = 1;
const ACCESS_SIZE_32: u32 = 2;
const ACCESS_SIZE_64: u32 = 3;

const AMOD_A32_SINGLE: u32 = 0x9;
const AMOD_A32_BLT: u32 = 0xB;
// MBLT (0x8) with bit 10 set makes the controller swap the two 32-bit halves
const AMOD_A32_MBLT_SWAPPED: u32 = 0x0408;

/// Module of an event as seen by the buffer processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleBinding {
    pub name: String,
    pub type_id: u8,
    pub max_words: u32,
}

/// Event bound to one stack list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBinding {
    pub name: String,
    pub event_index: usize,
    pub modules: Vec<ModuleBinding>,
}

impl EventBinding {
    pub fn from_config(event: &EventConfig, event_index: usize) -> Self {
        Self {
            name: event.name.clone(),
            event_index,
            modules: event
                .modules
                .iter()
                .map(|m| ModuleBinding {
                    name: m.name.clone(),
                    type_id: m.type_id,
                    max_words: m.max_words(),
                })
                .collect(),
        }
    }
}

/// Mapping from stack list index to the event read out by it. Built once when
/// the DAQ starts. The watchdog stack list never has an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackListBindings {
    events: [Option<EventBinding>; NUMBER_OF_STACK_LISTS],
    watchdog: Option<usize>,
}

impl StackListBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events get consecutive stack lists in configuration order
    pub fn from_config(config: &Config) -> Self {
        let mut bindings = Self::new();
        for (index, event) in config.events.iter().take(NUMBER_OF_STACK_LISTS).enumerate() {
            bindings.bind_event(index, EventBinding::from_config(event, index));
        }
        bindings
    }

    pub fn bind_event(&mut self, stack_list: usize, binding: EventBinding) {
        if let Some(slot) = self.events.get_mut(stack_list) {
            *slot = Some(binding);
        }
    }

    pub fn set_watchdog(&mut self, stack_list: Option<usize>) {
        self.watchdog = stack_list.filter(|s| *s < NUMBER_OF_STACK_LISTS);
    }

    pub fn event(&self, stack_list: usize) -> Option<&EventBinding> {
        self.events.get(stack_list).and_then(|e| e.as_ref())
    }

    pub fn watchdog(&self) -> Option<usize> {
        self.watchdog
    }

    pub fn is_watchdog(&self, stack_list: usize) -> bool {
        self.watchdog == Some(stack_list)
    }

    /// First stack list with neither an event nor the watchdog
    pub fn first_free(&self) -> Option<usize> {
        (0..NUMBER_OF_STACK_LISTS).find(|i| self.events[*i].is_none() && !self.is_watchdog(*i))
    }
}

fn access_size(width: DataWidth) -> u32 {
    match width {
        DataWidth::D16 => ACCESS_SIZE_16,
        DataWidth::D32 => ACCESS_SIZE_32,
    }
}

fn vme_access_word(write: bool, fifo: bool, access_size: u32, n_bytes: u32) -> u32 {
    LIST_VME_ACCESS
        | ((write as u32) << 11)
        | ((fifo as u32) << 10)
        | (access_size << 8)
        | ((n_bytes >> 16) & 0xff)
}

fn push_command(list: &mut Vec<u32>, command: &ReadoutCommand) {
    match command {
        ReadoutCommand::Read { address, width } => {
            let size = access_size(*width);
            let n_bytes = 1u32 << size;
            list.push(vme_access_word(false, false, size, n_bytes));
            list.push((AMOD_A32_SINGLE << 16) | (n_bytes & 0xffff));
            list.push(*address);
        }
        ReadoutCommand::Write {
            address,
            value,
            width,
        } => {
            let size = access_size(*width);
            let n_bytes = 1u32 << size;
            list.push(vme_access_word(true, false, size, n_bytes));
            list.push((AMOD_A32_SINGLE << 16) | (n_bytes & 0xffff));
            list.push(address & 0xfffffffc);
            list.push(*value);
        }
        ReadoutCommand::Marker { value } => {
            list.push(LIST_MARKER);
            list.push(*value);
        }
        ReadoutCommand::BlockRead {
            address,
            byte_count,
            mode,
            fifo,
        } => {
            let (size, amod) = match mode {
                BlockMode::Mblt => (ACCESS_SIZE_64, AMOD_A32_MBLT_SWAPPED),
                BlockMode::Blt => (ACCESS_SIZE_32, AMOD_A32_BLT),
            };
            list.push(vme_access_word(false, *fifo, size, *byte_count));
            list.push(((amod & 0xffff) << 16) | (byte_count & 0xffff));
            list.push(*address);
        }
    }
}

/// Encode a command list framed by the list header and trailer
pub fn build_stack_list(commands: &[ReadoutCommand]) -> Vec<u32> {
    let mut list = vec![LIST_HEADER, 0];
    for command in commands {
        push_command(&mut list, command);
    }
    list.push(LIST_TRAILER);
    list.push(0);
    list
}

/// Stack list of an event: every module's readout followed by an EndMarker
/// marker, so each module's data is terminated in the datagram stream.
pub fn build_event_stack_list(event: &EventConfig) -> Vec<u32> {
    let mut commands = Vec::new();
    for module in event.modules.iter() {
        commands.extend(module.readout.iter().cloned());
        commands.push(ReadoutCommand::Marker { value: END_MARKER });
    }
    build_stack_list(&commands)
}

/// A single marker producing the watchdog payload
pub fn build_watchdog_stack_list() -> Vec<u32> {
    build_stack_list(&[ReadoutCommand::Marker {
        value: WATCHDOG_PAYLOAD,
    }])
}

/// Hands out consecutive load addresses in stack RAM
#[derive(Debug, Clone)]
pub struct StackRamAllocator {
    next_offset: u32,
}

impl Default for StackRamAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StackRamAllocator {
    pub fn new() -> Self {
        Self { next_offset: 0 }
    }

    /// Reserve room for `list` and return its load address
    pub fn allocate(&mut self, name: &str, list: &[u32]) -> Result<u32, StackListError> {
        if list.is_empty() {
            return Err(StackListError::Empty(name.to_string()));
        }
        let offset = self.next_offset;
        let end = offset as usize + list.len();
        if end > STACK_RAM_OFFSET_LIMIT as usize {
            return Err(StackListError::StackRamExceeded {
                name: name.to_string(),
                words: list.len(),
                offset,
            });
        }
        self.next_offset = end as u32;
        Ok(STACK_RAM_START + offset)
    }
}

/// Value of a stack list config register for a list at `load_address`
pub fn stack_list_config_value(load_address: u32, list_len: usize) -> u32 {
    (((list_len as u32).saturating_sub(1)) << 16) | (load_address - STACK_RAM_START)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_access_encoding() {
        let list = build_stack_list(&[
            ReadoutCommand::Read {
                address: 0x6030,
                width: DataWidth::D16,
            },
            ReadoutCommand::Write {
                address: 0x6037,
                value: 3,
                width: DataWidth::D32,
            },
        ]);
        assert_eq!(
            list,
            vec![
                0xAAAA9000, 0,
                0xAAAA4100, 0x00090002, 0x6030,
                0xAAAA4A00, 0x00090004, 0x6034, 3,
                0xAAAAA000, 0,
            ]
        );
    }

    #[test]
    fn test_block_read_encoding() {
        let list = build_stack_list(&[
            ReadoutCommand::BlockRead {
                address: 0x01000000,
                byte_count: 0x12345,
                mode: BlockMode::Mblt,
                fifo: true,
            },
            ReadoutCommand::BlockRead {
                address: 0x02000000,
                byte_count: 256,
                mode: BlockMode::Blt,
                fifo: false,
            },
        ]);
        assert_eq!(&list[2..5], &[0xAAAA4701, 0x04082345, 0x01000000]);
        assert_eq!(&list[5..8], &[0xAAAA4200, 0x000B0100, 0x02000000]);
    }

    #[test]
    fn test_event_list_terminates_modules() {
        let config = Config::default();
        let mut event = config.events[0].clone();
        event.modules.push(event.modules[0].clone());
        let list = build_event_stack_list(&event);
        let markers = list
            .windows(2)
            .filter(|w| w[0] == LIST_MARKER && w[1] == END_MARKER)
            .count();
        assert_eq!(markers, 2);
        assert_eq!(
            build_watchdog_stack_list(),
            vec![0xAAAA9000, 0, 0xAAAA8000, WATCHDOG_PAYLOAD, 0xAAAAA000, 0]
        );
    }

    #[test]
    fn test_stack_ram_allocation() {
        let mut alloc = StackRamAllocator::new();
        let list = vec![0u32; 10];
        let first = alloc.allocate("a", &list).unwrap();
        let second = alloc.allocate("b", &list).unwrap();
        assert_eq!(first, STACK_RAM_START);
        assert_eq!(second, STACK_RAM_START + 10);
        assert_eq!(stack_list_config_value(second, list.len()), (9 << 16) | 10);

        let huge = vec![0u32; STACK_RAM_OFFSET_LIMIT as usize];
        assert!(matches!(
            alloc.allocate("c", &huge),
            Err(StackListError::StackRamExceeded { offset: 20, .. })
        ));
        assert!(matches!(alloc.allocate("d", &[]), Err(StackListError::Empty(_))));
    }

    #[test]
    fn test_bindings() {
        let mut config = Config::default();
        config.events.push(config.events[0].clone());
        let mut bindings = StackListBindings::from_config(&config);
        assert_eq!(bindings.event(1).unwrap().event_index, 1);
        assert!(bindings.event(2).is_none());
        assert_eq!(bindings.first_free(), Some(2));
        bindings.set_watchdog(Some(2));
        assert!(bindings.is_watchdog(2));
        assert_eq!(bindings.first_free(), Some(3));
        bindings.set_watchdog(Some(NUMBER_OF_STACK_LISTS));
        assert_eq!(bindings.watchdog(), None);
    }
}
