//! Builders for synthetic SIS3153 datagrams used by the unit tests

use byteorder::{ByteOrder, NativeEndian};

use crate::constants::*;
use crate::stack_list::{EventBinding, ModuleBinding, StackListBindings};

pub const WATCHDOG_STACK_LIST: usize = 1;

pub fn begin_marker(sequence_number: u32) -> u32 {
    BEGIN_EVENT_RESULT | (sequence_number & BEGIN_EVENT_SEQUENCE_NUMBER_MASK)
}

pub fn end_marker(berr_block: u8, berr_read: u8, berr_write: u8) -> u32 {
    END_EVENT_RESULT
        | ((berr_block as u32) << END_EVENT_BERR_BLOCK_SHIFT)
        | ((berr_read as u32) << END_EVENT_BERR_READ_SHIFT)
        | ((berr_write as u32) << END_EVENT_BERR_WRITE_SHIFT)
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; words.len() * WORD_SIZE];
    NativeEndian::write_u32_into(words, &mut bytes);
    bytes
}

/// Module payload words, each module terminated by the EndMarker
pub fn module_payload(modules: &[&[u32]]) -> Vec<u32> {
    let mut words = Vec::new();
    for module in modules {
        words.extend_from_slice(module);
        words.push(END_MARKER);
    }
    words
}

/// A complete event as the controller sends it
pub fn event_words(sequence_number: u32, modules: &[&[u32]]) -> Vec<u32> {
    let mut words = vec![begin_marker(sequence_number)];
    words.extend(module_payload(modules));
    words.push(end_marker(0, 0, 0));
    words
}

pub fn watchdog_words(sequence_number: u32) -> Vec<u32> {
    vec![
        begin_marker(sequence_number),
        WATCHDOG_PAYLOAD,
        end_marker(0, 0, 0),
    ]
}

/// Raw datagram: ack, ident and status bytes followed by the words
pub fn datagram(ack: u8, ident: u8, status: u8, words: &[u32]) -> Vec<u8> {
    let mut bytes = vec![ack, ident, status];
    bytes.extend(words_to_bytes(words));
    bytes
}

pub fn single_event_ack(stack_list: usize) -> u8 {
    (stack_list as u8 & ACK_STACK_LIST_MASK) | ACK_IS_LAST_PACKET_MASK
}

pub fn embedded_header(ack: u8, ident: u8, length_words: u16) -> u32 {
    let length = length_words as u32;
    ((ident as u32) << EMBEDDED_IDENT_SHIFT)
        | ((length & 0xff) << EMBEDDED_LENGTH_LOW_SHIFT)
        | (length & EMBEDDED_LENGTH_HIGH_MASK)
        | (ack as u32 & EMBEDDED_ACK_MASK)
}

/// Multi event datagram from `(stack_list, event words)` pairs
pub fn multi_event_datagram(events: &[(usize, Vec<u32>)]) -> Vec<u8> {
    let mut words = Vec::new();
    for (stack_list, event) in events {
        words.push(embedded_header(
            single_event_ack(*stack_list),
            0,
            event.len() as u16,
        ));
        words.extend_from_slice(event);
    }
    datagram(MULTI_EVENT_PACKET_ACK, 0, 0, &words)
}

/// Stack list 0 reads event "A" with two modules (types 1 and 2), stack list 1
/// is the watchdog
pub fn two_module_bindings() -> StackListBindings {
    let mut bindings = StackListBindings::new();
    bindings.bind_event(
        0,
        EventBinding {
            name: String::from("A"),
            event_index: 0,
            modules: vec![
                ModuleBinding {
                    name: String::from("adc"),
                    type_id: 1,
                    max_words: SUBEVENT_MAX_WORDS,
                },
                ModuleBinding {
                    name: String::from("tdc"),
                    type_id: 2,
                    max_words: SUBEVENT_MAX_WORDS,
                },
            ],
        },
    );
    bindings.set_watchdog(Some(WATCHDOG_STACK_LIST));
    bindings
}
