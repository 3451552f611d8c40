//! ## Control
//!
//! Class control requests: the INITIATE/CHECK state machines for abort and
//! clear, the USB488 management requests, capability retrieval and the
//! generic passthrough.
//!
//! Every class request here uses the receive-pipe variant even when it is
//! conceptually OUT, because each one reads back at least a status byte.
//!

use std::time::Instant;

use anyhow::Result;
use log::{debug, warn};
use rusb::{Direction, Recipient, RequestType};

use crate::constants::{control_requests, misc, usbtmc_status};
use crate::device::{DeviceState, IoState};
use crate::error::Error;
use crate::transport::UsbTransport;
use crate::types::{Capabilities, CtrlRequest};

fn class_in(recipient: Recipient) -> u8 {
    rusb::request_type(Direction::In, RequestType::Class, recipient)
}

/// ### Get Capabilities
///
/// Fetch and parse the GET_CAPABILITIES reply. Runs against the bare
/// transport so attach can call it before the device record exists.
///
pub(crate) fn get_capabilities(
    transport: &dyn UsbTransport,
    ifnum: u8,
    timeout: std::time::Duration,
) -> Result<Capabilities> {
    let mut buffer = [0u8; 0x18];
    let n = transport
        .control_in(
            class_in(Recipient::Interface),
            control_requests::GET_CAPABILITIES,
            0,
            ifnum as u16,
            &mut buffer,
            timeout,
        )
        .map_err(Error::Usb)?;
    parse_capabilities(&buffer[..n])
}

fn parse_capabilities(buffer: &[u8]) -> Result<Capabilities> {
    if buffer.is_empty() {
        return Err(Error::TruncatedControlResponse.into());
    }
    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        return Err(Error::from_status(buffer[0]).into());
    }
    if buffer.len() < 6 {
        return Err(Error::TruncatedControlResponse.into());
    }

    let mut caps = Capabilities {
        bcd_usbtmc: u16::from_le_bytes([buffer[2], buffer[3]]),
        interface_caps: buffer[4],
        device_caps: buffer[5],
        ..Capabilities::default()
    };

    // USB488 devices extend the reply; plain USBTMC devices may not.
    if buffer.len() >= 16 {
        caps.bcd_usb488 = u16::from_le_bytes([buffer[12], buffer[13]]);
        caps.usb488_interface_caps = buffer[14];
        caps.usb488_device_caps = buffer[15];
    }

    Ok(caps)
}

/// Read full-size packets off the bulk-in endpoint until a short packet
/// marks the end of the device's FIFO. Bounded: a device that keeps the
/// pipe full past `MAX_DRAIN` reads is broken.
fn drain_bulk_in(dev: &DeviceState, timeout: std::time::Duration) -> Result<()> {
    let mut buf = dev.scratch(dev.io_buffer_size)?;
    for _ in 0..misc::MAX_DRAIN {
        let n = dev.bulk_in(&mut buf, timeout)?;
        if n < buf.len() {
            return Ok(());
        }
    }
    Err(Error::DrainLimitExceeded(misc::MAX_DRAIN).into())
}

/// ### Abort Bulk-In
///
/// Abort the outstanding bulk-in transfer named by the last read tag:
/// INITIATE, drain the endpoint, then poll CHECK_ABORT_BULK_IN_STATUS
/// until the device reports SUCCESS, draining again whenever it reports
/// data still queued.
///
pub(crate) fn abort_bulk_in(dev: &DeviceState, io: &mut IoState) -> Result<()> {
    let endpoint = dev.endpoints.bulk_in_ep.address;

    let mut reply = [0u8; 2];
    let n = dev.control_in(
        class_in(Recipient::Endpoint),
        control_requests::INITIATE_ABORT_BULK_IN,
        io.btag_last_read as u16,
        endpoint as u16,
        &mut reply,
        io.timeout,
    )?;
    if n < 1 {
        return Err(Error::TruncatedControlResponse.into());
    }
    match reply[0] {
        usbtmc_status::STATUS_SUCCESS => {}
        usbtmc_status::STATUS_FAILED => {
            // no transfer in progress, nothing to abort
            debug!("abort bulk-in: no transfer in progress");
            return Ok(());
        }
        other => return Err(Error::UnexpectedStatus(other).into()),
    }

    drain_bulk_in(dev, io.timeout)?;

    loop {
        let mut status = [0u8; 8];
        let n = dev.control_in(
            class_in(Recipient::Endpoint),
            control_requests::CHECK_ABORT_BULK_IN_STATUS,
            0,
            endpoint as u16,
            &mut status,
            io.timeout,
        )?;
        if n < 2 {
            return Err(Error::TruncatedControlResponse.into());
        }
        match status[0] {
            usbtmc_status::STATUS_SUCCESS => return Ok(()),
            usbtmc_status::STATUS_PENDING => {
                if status[1] == 1 {
                    drain_bulk_in(dev, io.timeout)?;
                }
            }
            other => return Err(Error::UnexpectedStatus(other).into()),
        }
    }
}

/// ### Abort Bulk-Out
///
/// Abort the outstanding bulk-out transfer named by the last write tag:
/// INITIATE, poll CHECK_ABORT_BULK_OUT_STATUS a bounded number of times,
/// then clear the bulk-out halt.
///
pub(crate) fn abort_bulk_out(dev: &DeviceState, io: &mut IoState) -> Result<()> {
    let endpoint = dev.endpoints.bulk_out_ep.address;

    let mut reply = [0u8; 2];
    let n = dev.control_in(
        class_in(Recipient::Endpoint),
        control_requests::INITIATE_ABORT_BULK_OUT,
        io.btag_last_write as u16,
        endpoint as u16,
        &mut reply,
        io.timeout,
    )?;
    if n < 1 {
        return Err(Error::TruncatedControlResponse.into());
    }
    if reply[0] != usbtmc_status::STATUS_SUCCESS {
        return Err(Error::from_status(reply[0]).into());
    }

    for _ in 0..misc::MAX_DRAIN {
        let mut status = [0u8; 8];
        let n = dev.control_in(
            class_in(Recipient::Endpoint),
            control_requests::CHECK_ABORT_BULK_OUT_STATUS,
            0,
            endpoint as u16,
            &mut status,
            io.timeout,
        )?;
        if n < 1 {
            return Err(Error::TruncatedControlResponse.into());
        }
        match status[0] {
            usbtmc_status::STATUS_SUCCESS => return dev.clear_bulk_out_halt(),
            usbtmc_status::STATUS_PENDING => {}
            other => return Err(Error::UnexpectedStatus(other).into()),
        }
    }

    Err(Error::DrainLimitExceeded(misc::MAX_DRAIN).into())
}

/// ### Clear
///
/// Clear the device's input and output message buffers: INITIATE_CLEAR,
/// poll CHECK_CLEAR_STATUS (draining the bulk-in endpoint while the device
/// reports queued data), then clear the bulk-out halt.
///
pub(crate) fn clear(dev: &DeviceState, io: &mut IoState) -> Result<()> {
    let mut reply = [0u8; 1];
    let n = dev.control_in(
        class_in(Recipient::Interface),
        control_requests::INITIATE_CLEAR,
        0,
        dev.ifnum as u16,
        &mut reply,
        io.timeout,
    )?;
    if n < 1 {
        return Err(Error::TruncatedControlResponse.into());
    }
    if reply[0] != usbtmc_status::STATUS_SUCCESS {
        return Err(Error::from_status(reply[0]).into());
    }

    loop {
        let mut status = [0u8; 2];
        let n = dev.control_in(
            class_in(Recipient::Interface),
            control_requests::CHECK_CLEAR_STATUS,
            0,
            dev.ifnum as u16,
            &mut status,
            io.timeout,
        )?;
        if n < 2 {
            return Err(Error::TruncatedControlResponse.into());
        }
        match status[0] {
            usbtmc_status::STATUS_SUCCESS => break,
            usbtmc_status::STATUS_PENDING => {
                if status[1] == 1 {
                    drain_bulk_in(dev, io.timeout)?;
                }
            }
            other => return Err(Error::UnexpectedStatus(other).into()),
        }
    }

    dev.clear_bulk_out_halt()
}

/// ### Indicator Pulse
///
/// Ask the device to blink its activity indicator. Requires the
/// indicator-pulse capability.
///
pub(crate) fn indicator_pulse(dev: &DeviceState, io: &IoState) -> Result<()> {
    if !dev.capabilities.accepts_indicator_pulse() {
        return Err(Error::UnsupportedFeature.into());
    }

    let mut reply = [0u8; 1];
    let n = dev.control_in(
        class_in(Recipient::Interface),
        control_requests::INDICATOR_PULSE,
        0,
        dev.ifnum as u16,
        &mut reply,
        io.timeout,
    )?;
    if n < 1 {
        return Err(Error::TruncatedControlResponse.into());
    }
    if reply[0] != usbtmc_status::STATUS_SUCCESS {
        return Err(Error::from_status(reply[0]).into());
    }
    Ok(())
}

/// ### Read Status Byte
///
/// The USB488 READ_STATUS_BYTE exchange. The request carries the current
/// interrupt tag; when the device has an interrupt-in endpoint the status
/// byte arrives as a notification the dispatcher flags through
/// `iin_data_valid`, and this call waits on the device wait point for it.
/// The interrupt tag advances on every exit, successful or not.
///
pub(crate) fn read_status_byte(dev: &DeviceState, io: &mut IoState) -> Result<u8> {
    let result = read_status_byte_exchange(dev, io);
    io.iin_btag.advance();
    result
}

fn read_status_byte_exchange(dev: &DeviceState, io: &IoState) -> Result<u8> {
    let tag = io.iin_btag.current();
    dev.iin_data_valid.store(false, std::sync::atomic::Ordering::SeqCst);

    let mut reply = [0u8; 3];
    let n = dev.control_in(
        class_in(Recipient::Interface),
        control_requests::READ_STATUS_BYTE,
        tag as u16,
        dev.ifnum as u16,
        &mut reply,
        io.timeout,
    )?;
    if n < 1 {
        return Err(Error::TruncatedControlResponse.into());
    }
    if reply[0] != usbtmc_status::STATUS_SUCCESS {
        return Err(Error::from_status(reply[0]).into());
    }

    if dev.endpoints.interrupt_ep.is_some() {
        let deadline = Instant::now() + io.timeout;
        let mut shared = dev.shared.lock().unwrap();
        loop {
            if dev.is_zombie() {
                return Err(Error::NotPresent.into());
            }
            if dev.iin_data_valid.load(std::sync::atomic::Ordering::SeqCst) {
                if shared.bnotify1 & 0x7F != tag {
                    warn!(
                        "status byte notification tag 0x{:02x} does not match request tag {}",
                        shared.bnotify1, tag
                    );
                }
                return Ok(shared.bnotify2);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WaitTimeout.into());
            }
            let (guard, _) = dev.waitq.wait_timeout(shared, deadline - now).unwrap();
            shared = guard;
        }
    }

    if n < 3 {
        return Err(Error::TruncatedControlResponse.into());
    }
    Ok(reply[2])
}

fn usb488_simple_request(
    dev: &DeviceState,
    io: &IoState,
    request: u8,
    value: u16,
) -> Result<()> {
    if !dev.capabilities.supports_simple_488() {
        return Err(Error::UnsupportedFeature.into());
    }

    let mut reply = [0u8; 1];
    let n = dev.control_in(
        class_in(Recipient::Interface),
        request,
        value,
        dev.ifnum as u16,
        &mut reply,
        io.timeout,
    )?;
    if n < 1 {
        return Err(Error::TruncatedControlResponse.into());
    }
    if reply[0] != usbtmc_status::STATUS_SUCCESS {
        return Err(Error::from_status(reply[0]).into());
    }
    Ok(())
}

pub(crate) fn ren_control(dev: &DeviceState, io: &mut IoState, enable: bool) -> Result<()> {
    usb488_simple_request(dev, io, control_requests::REN_CONTROL, enable as u16)
}

pub(crate) fn goto_local(dev: &DeviceState, io: &mut IoState) -> Result<()> {
    usb488_simple_request(dev, io, control_requests::GO_TO_LOCAL, 0)
}

pub(crate) fn local_lockout(dev: &DeviceState, io: &mut IoState) -> Result<()> {
    usb488_simple_request(dev, io, control_requests::LOCAL_LOCKOUT, 0)
}

/// ### Passthrough
///
/// Forward an arbitrary control transfer. The direction bit of
/// `bm_request_type` picks the pipe; `data.len()` becomes `wLength`, and a
/// zero-length request goes out with an empty buffer.
///
pub(crate) fn passthrough(
    dev: &DeviceState,
    io: &IoState,
    request: &CtrlRequest,
    data: &mut [u8],
) -> Result<usize> {
    if request.bm_request_type & 0x80 != 0 {
        dev.control_in(
            request.bm_request_type,
            request.b_request,
            request.w_value,
            request.w_index,
            data,
            io.timeout,
        )
    } else {
        dev.control_out(
            request.bm_request_type,
            request.b_request,
            request.w_value,
            request.w_index,
            data,
            io.timeout,
        )
    }
}
