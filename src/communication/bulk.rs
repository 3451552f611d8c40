//! Bulk
//!
//! The 12-byte USBTMC header codec and the bulk message engine built on it.
//!

use anyhow::Result;
use log::debug;

use crate::communication::control;
use crate::constants::{bulk_msg_id, misc};
use crate::device::{DeviceState, IoState};
use crate::error::Error;

/// Per-handle knobs the engine needs for one operation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IoParams {
    pub term_char: u8,
    pub term_char_enabled: bool,
    pub auto_abort: bool,
    pub eom: bool,
}

/// A decoded DEV_DEP_MSG_IN header.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MsgInHeader {
    pub n_characters: u32,
    pub eom: bool,
}

pub(crate) fn dev_dep_msg_out_header(btag: u8, transfer_size: u32, end_of_message: bool) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0] = bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT;
    header[1] = btag;
    header[2] = !btag;
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if end_of_message {
        header[8] = 0x01;
    }
    header
}

pub(crate) fn request_dev_dep_msg_in_header(
    btag: u8,
    transfer_size: u32,
    term_char: Option<u8>,
) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0] = bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN;
    header[1] = btag;
    header[2] = !btag;
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if let Some(tc) = term_char {
        header[8] = 0x02;
        header[9] = tc;
    }
    header
}

pub(crate) fn trigger_header(btag: u8) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0] = bulk_msg_id::TRIGGER;
    header[1] = btag;
    header[2] = !btag;
    header
}

/// Validate the first packet of a device reply against the tag of the
/// request that solicited it and the transfer size that was requested.
pub(crate) fn decode_msg_in_header(
    buf: &[u8],
    expected_tag: u8,
    requested: u32,
) -> Result<MsgInHeader> {
    if buf.len() < misc::USBTMC_HEADER_SIZE {
        return Err(Error::TruncatedHeader.into());
    }
    if buf[0] != bulk_msg_id::DEVICE_DEPENDENT_MSG_IN {
        return Err(Error::InvalidMsgId.into());
    }
    if buf[1] != expected_tag {
        return Err(Error::TagMismatch.into());
    }
    let n_characters = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if n_characters > requested {
        return Err(Error::TransferTooLarge.into());
    }
    Ok(MsgInHeader {
        n_characters,
        eom: buf[8] & 0x01 != 0,
    })
}

/// Zero-pad so the total length on the wire is a multiple of 4.
fn pad_to_quad(wire: &mut Vec<u8>) {
    while wire.len() % 4 != 0 {
        wire.push(0);
    }
}

/// ### Read
///
/// Request a device-dependent message and copy up to `out.len()` bytes of
/// it into `out`. The first bulk-in packet carries the reply header, which
/// is validated before any data is accepted; continuation packets carry
/// raw data. On failure with auto-abort enabled the matching abort state
/// machine runs before the original error is surfaced.
///
pub(crate) fn read(dev: &DeviceState, params: &IoParams, out: &mut [u8]) -> Result<usize> {
    if out.is_empty() {
        return Ok(0);
    }

    let mut io = dev.lock_io()?;
    let count = out.len() as u32;
    let timeout = io.timeout;

    // Ask the device to send. The request tag names both this bulk-out
    // transfer and the reply it solicits.
    let tag = io.btag.current();
    let term_char = params.term_char_enabled.then_some(params.term_char);
    let request = request_dev_dep_msg_in_header(tag, count, term_char);
    if let Err(err) = dev.bulk_out(&request, timeout) {
        if params.auto_abort {
            best_effort_abort_out(dev, &mut io);
        }
        return Err(err);
    }
    io.btag_last_write = tag;
    io.btag_last_read = tag;
    io.btag.advance();

    match read_reply(dev, &io, count, out, tag) {
        Ok(done) => Ok(done),
        Err(err) => {
            if params.auto_abort {
                best_effort_abort_in(dev, &mut io);
            }
            Err(err)
        }
    }
}

fn read_reply(
    dev: &DeviceState,
    io: &IoState,
    count: u32,
    out: &mut [u8],
    tag: u8,
) -> Result<usize> {
    let mut buf = dev.scratch(dev.io_buffer_size)?;
    let mut remaining = count as usize;
    let mut done = 0usize;
    let mut first = true;

    while remaining > 0 {
        let n = dev.bulk_in(&mut buf, io.timeout)?;

        if first {
            first = false;
            let header = decode_msg_in_header(&buf[..n], tag, count)?;
            remaining = remaining.min(header.n_characters as usize);
            let actual = (n - misc::USBTMC_HEADER_SIZE).min(remaining);
            out[done..done + actual]
                .copy_from_slice(&buf[misc::USBTMC_HEADER_SIZE..misc::USBTMC_HEADER_SIZE + actual]);
            done += actual;
            remaining -= actual;
            if header.eom && actual >= header.n_characters as usize {
                remaining = 0;
            }
        } else {
            let actual = n.min(remaining);
            out[done..done + actual].copy_from_slice(&buf[..actual]);
            done += actual;
            remaining -= actual;
        }
    }

    Ok(done)
}

/// ### Write
///
/// Send `data` as a device-dependent message, chunked so each transfer
/// fits the scratch buffer with its header. The end-of-message flag is
/// carried by the final chunk only; every chunk is zero-padded to a
/// multiple of 4 on the wire. A partial send is retried from the unsent
/// tail.
///
pub(crate) fn write(dev: &DeviceState, params: &IoParams, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }

    let mut io = dev.lock_io()?;
    let timeout = io.timeout;
    let chunk_cap = dev.io_buffer_size - misc::USBTMC_HEADER_SIZE;
    let last_index = data.len().div_ceil(chunk_cap) - 1;

    for (index, chunk) in data.chunks(chunk_cap).enumerate() {
        let eom = params.eom && index == last_index;
        let tag = io.btag.current();

        let mut wire = dev.scratch(misc::USBTMC_HEADER_SIZE + chunk.len())?;
        wire[..misc::USBTMC_HEADER_SIZE]
            .copy_from_slice(&dev_dep_msg_out_header(tag, chunk.len() as u32, eom));
        wire[misc::USBTMC_HEADER_SIZE..].copy_from_slice(chunk);
        pad_to_quad(&mut wire);

        let mut sent = 0usize;
        while sent < wire.len() {
            match dev.bulk_out(&wire[sent..], timeout) {
                Ok(0) => {
                    if params.auto_abort {
                        best_effort_abort_out(dev, &mut io);
                    }
                    return Err(Error::StalledBulkOut.into());
                }
                Ok(n) => sent += n,
                Err(err) => {
                    if params.auto_abort {
                        best_effort_abort_out(dev, &mut io);
                    }
                    return Err(err);
                }
            }
        }

        io.btag_last_write = tag;
        io.btag.advance();
    }

    Ok(data.len())
}

/// ### Trigger
///
/// Emit the USB488 trigger message: a header-only bulk-out transfer.
///
pub(crate) fn trigger(dev: &DeviceState) -> Result<()> {
    let mut io = dev.lock_io()?;
    let tag = io.btag.current();
    dev.bulk_out(&trigger_header(tag), io.timeout)?;
    io.btag_last_write = tag;
    io.btag.advance();
    Ok(())
}

fn best_effort_abort_in(dev: &DeviceState, io: &mut IoState) {
    if let Err(err) = control::abort_bulk_in(dev, io) {
        debug!("abort of failed bulk-in also failed: {err:#}");
    }
}

fn best_effort_abort_out(dev: &DeviceState, io: &mut IoState) {
    if let Err(err) = control::abort_bulk_out(dev, io) {
        debug!("abort of failed bulk-out also failed: {err:#}");
    }
}
