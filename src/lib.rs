//! # USBTMC Host
//!
//! Host-side driver for the USB Test & Measurement Class (USBTMC),
//! including the USB488 subclass, written in pure Rust on top of rusb.
//!
//! The driver multiplexes three kinds of traffic to an instrument:
//! stream-oriented SCPI-style messages over the bulk endpoints,
//! asynchronous service-request and status-byte notifications over the
//! interrupt-in endpoint, and the class management requests (abort,
//! clear, read status byte, trigger, remote/local, indicator pulse) on
//! the control endpoint.
//!
//! ## Usage
//!
//! To use, add the following line to your project's Cargo.toml dependencies:
//! ```toml
//! usbtmc-host = "0.1"
//! ```
//!
//! ## Example
//!
//! The example below attaches the first instrument on the bus, opens a
//! handle on it and runs an identification query.
//!
//! ```no_run
//! use usbtmc_host::{Config, Device};
//!
//! fn main() -> anyhow::Result<()> {
//!     // attach the device and bring the interface up
//!     let device = Device::attach((), Config::default())?;
//!
//!     // open a handle; any number may be open at once
//!     let handle = device.open()?;
//!
//!     // send a command and read the reply
//!     let id = handle.query("*IDN?\n")?;
//!     println!("connected to {id}");
//!
//!     // service requests raised by the instrument are fanned out to
//!     // every open handle
//!     if handle.poll_srq()? {
//!         let stb = handle.read_stb()?;
//!         println!("srq with status byte {stb:#04x}");
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! Handles stay valid when the instrument is unplugged; every operation
//! on them fails with [`Error::NotPresent`] from that point on.
//!

mod constants;
mod device;
mod error;
mod init;
mod interrupt;
mod transport;
mod types;
mod communication {
    pub mod bulk;
    pub mod control;
}

use rusb::DeviceDescriptor;

pub use device::{Device, Handle, HandleDefaults};
pub use error::Error;
pub use transport::{RusbTransport, UsbTransport};
pub use types::{
    Capabilities, Config, CtrlRequest, DeviceAddr, DeviceId, DeviceInfo, Endpoint, InterfaceMode,
    UsbtmcEndpoints,
};

/// Device filter
pub trait DeviceFilter {
    fn apply_filter<T: rusb::UsbContext>(
        &self,
        device: &rusb::Device<T>,
        device_desc: &DeviceDescriptor,
    ) -> bool;
}
