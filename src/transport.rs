//! ## Transport
//!
//! Thin facade over the USB stack. The bulk engine and the class-request
//! state machines go through this trait, which keeps them testable against
//! a scripted fake and keeps every rusb call in one place.
//!

use std::time::Duration;

use rusb::{Context, DeviceHandle};

use crate::types::InterfaceMode;

/// ### UsbTransport
///
/// The operations the driver needs from the USB stack. Implementations own
/// no protocol state; endpoint addresses are passed in by the caller.
///
/// All transfers are synchronous and bounded by `timeout`.
///
pub trait UsbTransport: Send + Sync {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn interrupt_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn clear_halt(&self, endpoint: u8) -> rusb::Result<()>;
}

/// ### RusbTransport
///
/// Production transport backed by a claimed rusb device handle. Dropping it
/// releases the interface and hands the device back to the kernel driver if
/// one had to be detached at attach time.
///
/// rusb device handles are internally synchronized, so the interrupt
/// dispatcher may poll while a bulk transfer is in flight.
///
pub struct RusbTransport {
    handle: DeviceHandle<Context>,
    mode: InterfaceMode,
}

impl RusbTransport {
    pub fn new(handle: DeviceHandle<Context>, mode: InterfaceMode) -> RusbTransport {
        RusbTransport { handle, mode }
    }
}

impl UsbTransport for RusbTransport {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .write_control(request_type, request, value, index, buf, timeout)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, data, timeout)
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }

    fn interrupt_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_interrupt(endpoint, buf, timeout)
    }

    fn clear_halt(&self, endpoint: u8) -> rusb::Result<()> {
        self.handle.clear_halt(endpoint)
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.mode.interface_number);
        if self.mode.has_kernel_driver {
            let _ = self.handle.attach_kernel_driver(self.mode.interface_number);
        }
    }
}
