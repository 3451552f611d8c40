//! ## Constants
//!
//! Protocol constants used throughout the driver.
//!

pub mod usb {
    /// The class code for usbtmc
    pub const USBTMC_CLASS_CODE: u8 = 0xFE;
    /// The subclass code for usbtmc
    pub const USBTMC_SUBCLASS_CODE: u8 = 0x03;
    /// The protocol code for the USB488 subclass of usbtmc
    pub const USB488_PROTOCOL_CODE: u8 = 0x01;
}

pub mod misc {
    /// The size in bytes of a USBTMC header in a bulk transfer
    pub const USBTMC_HEADER_SIZE: usize = 12;
    /// Default size of the scratch buffer used for a single bulk transfer
    pub const DEFAULT_IO_BUFFER_SIZE: usize = 2048;
    /// Smallest accepted scratch buffer size
    pub const MIN_IO_BUFFER_SIZE: usize = 512;
    /// Default transfer timeout in milliseconds
    pub const DEFAULT_TIMEOUT_MS: u32 = 2000;
    /// Smallest accepted transfer timeout in milliseconds
    pub const MIN_TIMEOUT_MS: u32 = 500;
    /// Upper bound on bulk-in reads while draining after an abort or clear
    pub const MAX_DRAIN: usize = 100;
    /// Default termination character (the NI-VISA default '\n')
    pub const DEFAULT_TERM_CHAR: u8 = b'\n';
    /// Slice used by the interrupt dispatcher to poll the endpoint between
    /// shutdown checks, in milliseconds
    pub const INTERRUPT_POLL_MS: u64 = 100;
}

pub mod usbtmc_status {
    /// Success
    pub const STATUS_SUCCESS: u8 = 0x01;
    /// The device has received a split transaction CHECK_STATUS request and the request is being processed
    pub const STATUS_PENDING: u8 = 0x02;
    /// Failure for unspecified or undefined reason
    pub const STATUS_FAILED: u8 = 0x80;
}

pub mod control_requests {
    pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
    pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
    pub const INITIATE_ABORT_BULK_IN: u8 = 3;
    pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
    pub const INITIATE_CLEAR: u8 = 5;
    pub const CHECK_CLEAR_STATUS: u8 = 6;
    pub const GET_CAPABILITIES: u8 = 7;
    pub const INDICATOR_PULSE: u8 = 64;
    // USB488 subclass requests
    pub const READ_STATUS_BYTE: u8 = 128;
    pub const REN_CONTROL: u8 = 160;
    pub const GO_TO_LOCAL: u8 = 161;
    pub const LOCAL_LOCKOUT: u8 = 162;
}

pub mod bulk_msg_id {
    pub const DEVICE_DEPENDENT_MSG_OUT: u8 = 1;
    pub const REQUEST_DEVICE_DEPENDENT_MSG_IN: u8 = 2;
    pub const DEVICE_DEPENDENT_MSG_IN: u8 = 2;
    /// USB488 trigger message, carried as a header-only bulk-out transfer
    pub const TRIGGER: u8 = 128;
}

#[allow(unused)]
pub mod capability_bits {
    // interface capabilities, byte 4 of the GET_CAPABILITIES reply
    pub const LISTEN_ONLY: u8 = 0x01;
    pub const TALK_ONLY: u8 = 0x02;
    pub const INDICATOR_PULSE: u8 = 0x04;
    // device capabilities, byte 5
    pub const TERM_CHAR: u8 = 0x01;
    // coalesced USB488 capability byte: low three bits from the USB488
    // interface capabilities, high nibble from the USB488 device capabilities
    pub const USB488_TRIGGER: u8 = 0x01;
    pub const USB488_SIMPLE: u8 = 0x02;
    pub const USB488_IS_488_2: u8 = 0x04;
    pub const USB488_DT1: u8 = 0x10;
    pub const USB488_RL1: u8 = 0x20;
    pub const USB488_SR1: u8 = 0x40;
    pub const USB488_SCPI: u8 = 0x80;
}
