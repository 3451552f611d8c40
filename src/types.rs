//! ## Types
//!
//! The different types used across the crate
//!

use std::time::Duration;

use rusb::{Direction, TransferType};

use crate::constants::{capability_bits, misc};

/// ### Bulk Tag
///
/// The rotating bTag stamped into bulk transfer headers.
///
/// After each use the tag is incremented; zero is skipped, so the values
/// cycle through 1..=255.
///
#[derive(Debug, Clone)]
pub(crate) struct BulkTag(u8);

impl BulkTag {
    pub fn new() -> BulkTag {
        BulkTag(1)
    }

    /// The tag to stamp into the next header.
    pub fn current(&self) -> u8 {
        self.0
    }

    /// Rotate after a transfer went out on the wire.
    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
        if self.0 == 0 {
            self.0 = 1;
        }
    }
}

/// ### Interrupt Tag
///
/// The tag carried in READ_STATUS_BYTE requests and echoed back by the
/// device's interrupt-in notification. Cycles through 2..=127; the value 1
/// is reserved for service requests.
///
#[derive(Debug, Clone)]
pub(crate) struct InterruptTag(u8);

impl InterruptTag {
    pub fn new() -> InterruptTag {
        InterruptTag(2)
    }

    pub fn current(&self) -> u8 {
        self.0
    }

    pub fn advance(&mut self) {
        self.0 += 1;
        if self.0 > 127 {
            self.0 = 2;
        }
    }
}

/// USB device address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAddr {
    /// USB bus number
    pub bus: u8,
    /// USB device number
    pub device: u8,
}

/// USB device identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceId {
    /// USB Id Vendor
    pub vendor_id: u16,
    /// USB Id Product
    pub product_id: u16,
}

/// USB device info
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub address: DeviceAddr,
}

/// ### Interface Mode
///
/// The configuration, interface and alternate-setting numbers selected for
/// the USBTMC interface, and whether a kernel driver had to be detached.
///
#[derive(Debug, Clone, Default)]
pub struct InterfaceMode {
    /// The USB configuration number
    pub config_number: u8,
    /// The interface number specific to the configuration
    pub interface_number: u8,
    /// The setting number specific to the interface
    pub setting_number: u8,
    /// If the interface had a kernel driver. Important for returning control to the OS (on Linux).
    pub has_kernel_driver: bool,
}

/// ### Endpoint
///
/// Properties of an endpoint.
///
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// Address of the endpoint on the interface
    pub address: u8,
    /// The maximal size a packet can have on this endpoint
    pub max_packet_size: u16,
    /// Polling interval in frames, meaningful for interrupt endpoints only
    pub interval: u8,
    /// The transfer type of the endpoint (for USBTMC, Bulk or Interrupt)
    pub transfer_type: TransferType,
    /// The direction of the endpoint (for USBTMC, In or Out)
    pub direction: Direction,
}

/// ### USBTMC Endpoints
///
/// Endpoints specific to the USBTMC spec.
///
#[derive(Clone, Debug)]
pub struct UsbtmcEndpoints {
    /// The mandatory BULK OUT endpoint
    pub bulk_out_ep: Endpoint,
    /// The mandatory BULK IN endpoint
    pub bulk_in_ep: Endpoint,
    /// The optional INTERRUPT IN endpoint
    pub interrupt_ep: Option<Endpoint>,
}

/// ### Capabilities
///
/// The raw capability bytes reported by GET_CAPABILITIES, with accessors
/// for the bits the driver acts on.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    pub bcd_usbtmc: u16,
    /// USBTMC interface capabilities, byte 4 of the reply
    pub interface_caps: u8,
    /// USBTMC device capabilities, byte 5 of the reply
    pub device_caps: u8,
    pub bcd_usb488: u16,
    /// USB488 interface capabilities, byte 14 of the reply
    pub usb488_interface_caps: u8,
    /// USB488 device capabilities, byte 15 of the reply
    pub usb488_device_caps: u8,
}

impl Capabilities {
    /// Can accept a control command for pulse
    pub fn accepts_indicator_pulse(&self) -> bool {
        self.interface_caps & capability_bits::INDICATOR_PULSE != 0
    }

    /// Only sends data to the controller
    pub fn is_talk_only(&self) -> bool {
        self.interface_caps & capability_bits::TALK_ONLY != 0
    }

    /// Only accepts data from the controller
    pub fn is_listen_only(&self) -> bool {
        self.interface_caps & capability_bits::LISTEN_ONLY != 0
    }

    /// When returning data, the device can terminate a bulk-in transfer on
    /// a termination character
    pub fn supports_term_char(&self) -> bool {
        self.device_caps & capability_bits::TERM_CHAR != 0
    }

    /// The coalesced USB488 capability byte: low three bits from the
    /// interface capabilities, high nibble from the device capabilities.
    pub fn usb488(&self) -> u8 {
        (self.usb488_interface_caps & 0x07) | ((self.usb488_device_caps & 0x0F) << 4)
    }

    /// REN_CONTROL, GO_TO_LOCAL and LOCAL_LOCKOUT are only legal when this
    /// reports true.
    pub fn supports_simple_488(&self) -> bool {
        self.usb488() & capability_bits::USB488_SIMPLE != 0
    }
}

/// ### Config
///
/// Process-wide knobs inherited by every attached device.
///
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Size of the scratch buffer allocated for each bulk transfer.
    /// Clamped to at least 512 bytes and rounded down to a multiple of 4.
    pub io_buffer_size: usize,
    /// Initial transfer timeout. Clamped to at least 500 ms.
    pub usb_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            io_buffer_size: misc::DEFAULT_IO_BUFFER_SIZE,
            usb_timeout: Duration::from_millis(misc::DEFAULT_TIMEOUT_MS as u64),
        }
    }
}

impl Config {
    /// Apply the clamps. Called once at attach; the stored values are the
    /// sanitized ones.
    pub(crate) fn sanitized(self) -> Config {
        let io_buffer_size = self.io_buffer_size.max(misc::MIN_IO_BUFFER_SIZE) & !3;
        let min = Duration::from_millis(misc::MIN_TIMEOUT_MS as u64);
        Config {
            io_buffer_size,
            usb_timeout: self.usb_timeout.max(min),
        }
    }
}

/// ### Control Request
///
/// A generic control transfer forwarded verbatim to the control endpoint.
/// The direction bit of `bm_request_type` selects between an IN and an OUT
/// transfer; the payload length is taken from the buffer handed to
/// [`crate::Handle::control_request`].
///
#[derive(Clone, Copy, Debug)]
pub struct CtrlRequest {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
}
