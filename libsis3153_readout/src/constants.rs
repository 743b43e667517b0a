//SIS3153 packet framing
pub const MULTI_EVENT_PACKET_ACK: u8 = 0x60; //packetAck value of a buffered multi event packet
pub const ACK_STACK_LIST_MASK: u8 = 0x7;
pub const ACK_IS_LAST_PACKET_MASK: u8 = 0x8;
pub const PACKET_HEADER_SIZE: usize = 3; //ack, ident, status
pub const FRAGMENT_STATUS_STALE_BIT: u8 = 0x80;
pub const FRAGMENT_STATUS_NIBBLE_MASK: u8 = 0x0f;

//Words added by the SIS3153 around each event
pub const BEGIN_EVENT_MASK: u32 = 0xff000000;
pub const BEGIN_EVENT_RESULT: u32 = 0xbb000000;
pub const BEGIN_EVENT_SEQUENCE_NUMBER_MASK: u32 = 0x00ffffff;
pub const END_EVENT_MASK: u32 = 0xff000000;
pub const END_EVENT_RESULT: u32 = 0xee000000;
pub const END_EVENT_BERR_BLOCK_MASK: u32 = 0x00ff0000;
pub const END_EVENT_BERR_BLOCK_SHIFT: u32 = 16;
pub const END_EVENT_BERR_READ_MASK: u32 = 0x0000ff00;
pub const END_EVENT_BERR_READ_SHIFT: u32 = 8;
pub const END_EVENT_BERR_WRITE_MASK: u32 = 0x000000ff;
pub const END_EVENT_BERR_WRITE_SHIFT: u32 = 0;

//Sequence numbers are 24 bit and wrap
pub const SEQUENCE_NUMBER_MODULUS: i64 = 1 << 24;

//Embedded event header inside multi event packets
pub const EMBEDDED_ACK_MASK: u32 = 0x000000ff;
pub const EMBEDDED_IDENT_SHIFT: u32 = 24;
pub const EMBEDDED_LENGTH_LOW_MASK: u32 = 0x00ff0000;
pub const EMBEDDED_LENGTH_LOW_SHIFT: u32 = 16;
pub const EMBEDDED_LENGTH_HIGH_MASK: u32 = 0x0000ff00;

//Controller resources
pub const NUMBER_OF_STACK_LISTS: usize = 8;
pub const WATCHDOG_PAYLOAD: u32 = 0xbeefbeef;
pub const WATCHDOG_TIMEOUT_S: f64 = 0.050;
pub const STACK_RAM_OFFSET_LIMIT: u32 = 1 << 13;

//Marker terminating each module's data and each event section
pub const END_MARKER: u32 = 0x87654321;

//Buffer sizes
pub const READ_BUFFER_SIZE: usize = 16 * 1024; //largest datagram is 8000 bytes with jumbo frames
pub const LOCAL_BUFFER_SIZE: usize = 1024 * 1024;
pub const TIMETICK_BUFFER_SIZE: usize = 4;
pub const WORD_SIZE: usize = 4;

//Listfile (version 1) section layout
pub const LISTFILE_FOURCC: &[u8; 4] = b"MVME";
pub const LISTFILE_VERSION: u32 = 1;
pub const SECTION_MAX_WORDS: u32 = 0xfffff;
pub const SECTION_TYPE_MASK: u32 = 0xe0000000;
pub const SECTION_TYPE_SHIFT: u32 = 29;
pub const SECTION_SIZE_MASK: u32 = 0x000fffff;
pub const SECTION_SIZE_SHIFT: u32 = 0;
pub const EVENT_TYPE_MASK: u32 = 0x1e000000;
pub const EVENT_TYPE_SHIFT: u32 = 25;
pub const MODULE_TYPE_MASK: u32 = 0xff000000;
pub const MODULE_TYPE_SHIFT: u32 = 24;
pub const SUBEVENT_MAX_WORDS: u32 = 0xfffff;
pub const SUBEVENT_SIZE_MASK: u32 = 0x000fffff;
pub const SUBEVENT_SIZE_SHIFT: u32 = 0;

//Listfile section types
pub const SECTION_TYPE_CONFIG: u32 = 0;
pub const SECTION_TYPE_EVENT: u32 = 1;
pub const SECTION_TYPE_END: u32 = 2;
pub const SECTION_TYPE_TIMETICK: u32 = 3;

//Readout loop timing
pub const READ_ERROR_LOG_INTERVAL_MS: u64 = 5000;
pub const TIMETICK_INTERVAL_MS: u64 = 1000;
pub const PAUSED_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_DRAIN_PACKETS: u32 = 100_000;
