//! SIS3153 register map as far as the readout needs it

pub const MODULE_ID_AND_FIRMWARE: u32 = 0x1;
pub const SERIAL_NUMBER: u32 = 0x2;

pub const STACK_LIST_CONTROL: u32 = 0x01000010;
pub const STACK_LIST_TIMER1_CONFIG: u32 = 0x01000014;
pub const STACK_LIST_TIMER2_CONFIG: u32 = 0x01000015;
pub const STACK_RAM_START: u32 = 0x01800000;

const STACK_LIST1_CONFIG: u32 = 0x01000000;
const STACK_LIST1_TRIGGER_SOURCE: u32 = 0x01000001;

//Stack list control bits
pub const CONTROL_STACK_LIST_ENABLE: u32 = 1 << 0;
pub const CONTROL_TIMER1_ENABLE: u32 = 1 << 1;
pub const CONTROL_TIMER2_ENABLE: u32 = 1 << 2;
pub const CONTROL_LIST_BUFFER_ENABLE: u32 = 1 << 15;
/// Writing the control bits shifted by this amount clears them
pub const CONTROL_DISABLE_SHIFT: u32 = 16;

pub const TIMER_WATCHDOG_ENABLE: u32 = 1 << 31;

//Stack list trigger sources (IRQ levels 1-7 map to themselves)
pub const TRIGGER_SOURCE_TIMER1: u32 = 8;
pub const TRIGGER_SOURCE_TIMER2: u32 = 9;
pub const TRIGGER_SOURCE_INPUT1_RISING: u32 = 0xC;
pub const TRIGGER_SOURCE_INPUT1_FALLING: u32 = 0xD;
pub const TRIGGER_SOURCE_INPUT2_RISING: u32 = 0xE;
pub const TRIGGER_SOURCE_INPUT2_FALLING: u32 = 0xF;

pub fn stack_list_config_register(stack_list: usize) -> u32 {
    STACK_LIST1_CONFIG + 2 * stack_list as u32
}

pub fn stack_list_trigger_register(stack_list: usize) -> u32 {
    STACK_LIST1_TRIGGER_SOURCE + 2 * stack_list as u32
}

/// Human readable form of the stack list control register, e.g.
/// `Buffering | Timer2 | StackListEnable`
pub fn format_stack_list_control(value: u32) -> String {
    let names = [
        (CONTROL_LIST_BUFFER_ENABLE, "Buffering"),
        (CONTROL_TIMER2_ENABLE, "Timer2"),
        (CONTROL_TIMER1_ENABLE, "Timer1"),
        (CONTROL_STACK_LIST_ENABLE, "StackListEnable"),
    ];
    let parts: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| value & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if parts.is_empty() {
        String::from("None")
    } else {
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_addresses() {
        assert_eq!(stack_list_config_register(0), 0x01000000);
        assert_eq!(stack_list_trigger_register(0), 0x01000001);
        assert_eq!(stack_list_config_register(7), 0x0100000e);
        assert_eq!(stack_list_trigger_register(7), 0x0100000f);
    }

    #[test]
    fn test_format_control() {
        let value = CONTROL_LIST_BUFFER_ENABLE | CONTROL_TIMER2_ENABLE | CONTROL_STACK_LIST_ENABLE;
        assert_eq!(
            format_stack_list_control(value),
            "Buffering | Timer2 | StackListEnable"
        );
        assert_eq!(format_stack_list_control(0), "None");
    }
}
