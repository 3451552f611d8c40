//! Shared test rig: a scripted transport standing in for the USB stack.
//!
//! Bulk-in and interrupt-in traffic is fed through channels so tests can
//! hold a reader blocked and release it at a chosen moment; control
//! requests are answered by a replaceable handler closure.

#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::{Direction, TransferType};
use usbtmc_host::{Config, Device, Endpoint, UsbTransport, UsbtmcEndpoints};

pub const BULK_OUT_EP: u8 = 0x02;
pub const BULK_IN_EP: u8 = 0x82;
pub const INTR_IN_EP: u8 = 0x83;

pub const STATUS_SUCCESS: u8 = 0x01;
pub const STATUS_PENDING: u8 = 0x02;
pub const STATUS_FAILED: u8 = 0x80;

pub const GET_CAPABILITIES: u8 = 7;
pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
pub const INITIATE_ABORT_BULK_IN: u8 = 3;
pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
pub const INITIATE_CLEAR: u8 = 5;
pub const CHECK_CLEAR_STATUS: u8 = 6;
pub const READ_STATUS_BYTE: u8 = 128;
pub const REN_CONTROL: u8 = 160;

#[derive(Clone, Debug)]
pub struct ControlCall {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: usize,
}

type ControlHandler = Box<dyn FnMut(&ControlCall, &mut [u8]) -> rusb::Result<usize> + Send>;

pub struct MockTransport {
    pub bulk_out_frames: Mutex<Vec<Vec<u8>>>,
    pub control_log: Mutex<Vec<ControlCall>>,
    pub halts_cleared: Mutex<Vec<u8>>,
    bulk_in_rx: Mutex<Receiver<rusb::Result<Vec<u8>>>>,
    intr_rx: Mutex<Receiver<Vec<u8>>>,
    handler: Mutex<ControlHandler>,
}

impl MockTransport {
    pub fn set_control_handler<F>(&self, handler: F)
    where
        F: FnMut(&ControlCall, &mut [u8]) -> rusb::Result<usize> + Send + 'static,
    {
        *self.handler.lock().unwrap() = Box::new(handler);
    }

    /// Requests seen since attach, most recent last.
    pub fn control_requests(&self) -> Vec<u8> {
        self.control_log.lock().unwrap().iter().map(|c| c.request).collect()
    }
}

/// The transport handed to the device: a shared view on the mock.
pub struct MockLink(pub Arc<MockTransport>);

impl UsbTransport for MockLink {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let call = ControlCall {
            request_type,
            request,
            value,
            index,
            length: buf.len(),
        };
        self.0.control_log.lock().unwrap().push(call.clone());
        let mut handler = self.0.handler.lock().unwrap();
        (*handler)(&call, buf)
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.0.control_log.lock().unwrap().push(ControlCall {
            request_type,
            request,
            value,
            index,
            length: buf.len(),
        });
        Ok(buf.len())
    }

    fn bulk_out(&self, _endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        self.0.bulk_out_frames.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn bulk_in(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        let rx = self.0.bulk_in_rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(Ok(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Err(rusb::Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(rusb::Error::NoDevice),
        }
    }

    fn interrupt_in(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        let rx = self.0.intr_rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => Err(rusb::Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(rusb::Error::Pipe),
        }
    }

    fn clear_halt(&self, endpoint: u8) -> rusb::Result<()> {
        self.0.halts_cleared.lock().unwrap().push(endpoint);
        Ok(())
    }
}

pub struct RigOpts {
    pub with_interrupt: bool,
    pub io_buffer_size: usize,
    pub timeout: Duration,
    pub interface_caps: u8,
    pub device_caps: u8,
    pub usb488_interface_caps: u8,
    pub usb488_device_caps: u8,
}

impl Default for RigOpts {
    fn default() -> RigOpts {
        RigOpts {
            with_interrupt: false,
            io_buffer_size: 2048,
            timeout: Duration::from_secs(2),
            interface_caps: 0x04,        // indicator pulse
            device_caps: 0x01,           // termination character
            usb488_interface_caps: 0x07, // 488.2 + simple + trigger
            usb488_device_caps: 0x0F,    // SCPI + SR1 + RL1 + DT1
        }
    }
}

pub struct Rig {
    pub device: Device,
    pub mock: Arc<MockTransport>,
    pub bulk_in: Sender<rusb::Result<Vec<u8>>>,
    pub interrupt: Sender<Vec<u8>>,
}

fn endpoints(with_interrupt: bool) -> UsbtmcEndpoints {
    UsbtmcEndpoints {
        bulk_out_ep: Endpoint {
            address: BULK_OUT_EP,
            max_packet_size: 512,
            interval: 0,
            transfer_type: TransferType::Bulk,
            direction: Direction::Out,
        },
        bulk_in_ep: Endpoint {
            address: BULK_IN_EP,
            max_packet_size: 512,
            interval: 0,
            transfer_type: TransferType::Bulk,
            direction: Direction::In,
        },
        interrupt_ep: with_interrupt.then_some(Endpoint {
            address: INTR_IN_EP,
            max_packet_size: 8,
            interval: 1,
            transfer_type: TransferType::Interrupt,
            direction: Direction::In,
        }),
    }
}

pub fn rig(opts: RigOpts) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();

    let (bulk_tx, bulk_rx) = channel();
    let (intr_tx, intr_rx) = channel();

    let caps = (
        opts.interface_caps,
        opts.device_caps,
        opts.usb488_interface_caps,
        opts.usb488_device_caps,
    );
    let default_handler = move |call: &ControlCall, buf: &mut [u8]| -> rusb::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        buf.fill(0);
        buf[0] = STATUS_SUCCESS;
        if call.request == GET_CAPABILITIES {
            buf[2] = 0x00;
            buf[3] = 0x01; // bcdUSBTMC 1.00
            buf[4] = caps.0;
            buf[5] = caps.1;
            buf[12] = 0x10;
            buf[13] = 0x01; // bcdUSB488 1.10
            buf[14] = caps.2;
            buf[15] = caps.3;
        }
        Ok(buf.len())
    };

    let mock = Arc::new(MockTransport {
        bulk_out_frames: Mutex::new(Vec::new()),
        control_log: Mutex::new(Vec::new()),
        halts_cleared: Mutex::new(Vec::new()),
        bulk_in_rx: Mutex::new(bulk_rx),
        intr_rx: Mutex::new(intr_rx),
        handler: Mutex::new(Box::new(default_handler)),
    });

    let config = Config {
        io_buffer_size: opts.io_buffer_size,
        usb_timeout: opts.timeout,
    };
    let device = Device::with_transport(
        Box::new(MockLink(Arc::clone(&mock))),
        endpoints(opts.with_interrupt),
        0,
        config,
    )
    .expect("device attach over mock transport");

    Rig {
        device,
        mock,
        bulk_in: bulk_tx,
        interrupt: intr_tx,
    }
}

/// Build a DEV_DEP_MSG_IN packet: reply header plus payload.
pub fn msg_in_packet(tag: u8, n_characters: u32, eom: bool, data: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 12 + data.len()];
    packet[0] = 2;
    packet[1] = tag;
    packet[2] = !tag;
    packet[4..8].copy_from_slice(&n_characters.to_le_bytes());
    if eom {
        packet[8] = 0x01;
    }
    packet[12..].copy_from_slice(data);
    packet
}

/// Pull the USBTMC header fields out of a captured bulk-out frame.
pub struct OutFrame {
    pub msg_id: u8,
    pub tag: u8,
    pub tag_inverse: u8,
    pub transfer_size: u32,
    pub attributes: u8,
    pub term_char: u8,
    pub payload: Vec<u8>,
}

pub fn parse_out_frame(frame: &[u8]) -> OutFrame {
    assert!(frame.len() >= 12, "bulk-out frame shorter than a header");
    OutFrame {
        msg_id: frame[0],
        tag: frame[1],
        tag_inverse: frame[2],
        transfer_size: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
        attributes: frame[8],
        term_char: frame[9],
        payload: frame[12..].to_vec(),
    }
}
