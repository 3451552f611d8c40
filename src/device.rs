//! ## Device
//!
//! The shared per-device record and the per-open handle built on top of it.
//!
//! One [`DeviceState`] exists per attached USBTMC interface. It is kept
//! alive by the [`Device`] returned from attach, by every open [`Handle`],
//! and by the interrupt dispatcher thread while it runs. Disconnect flips
//! the zombie flag and wakes every waiter; handles stay valid objects but
//! all further I/O fails with [`Error::NotPresent`].
//!

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::debug;

use crate::communication::{bulk, control};
use crate::constants::misc;
use crate::error::Error;
use crate::init;
use crate::interrupt;
use crate::transport::{RusbTransport, UsbTransport};
use crate::types::{
    BulkTag, Capabilities, Config, CtrlRequest, DeviceInfo, InterruptTag, UsbtmcEndpoints,
};
use crate::DeviceFilter;

/// Protocol state that must stay coherent across the single-tag bulk pipes.
/// Lives under the I/O exclusion lock, which serializes every read, write,
/// abort, clear, trigger, status-byte read and configuration call.
pub(crate) struct IoState {
    pub(crate) btag: BulkTag,
    pub(crate) iin_btag: InterruptTag,
    pub(crate) btag_last_write: u8,
    pub(crate) btag_last_read: u8,
    pub(crate) timeout: Duration,
}

/// Per-handle defaults, snapshotted into each new handle at open.
#[derive(Clone, Copy, Debug)]
pub struct HandleDefaults {
    pub term_char: u8,
    pub term_char_enabled: bool,
    pub auto_abort: bool,
    pub eom: bool,
}

impl Default for HandleDefaults {
    fn default() -> HandleDefaults {
        HandleDefaults {
            term_char: misc::DEFAULT_TERM_CHAR,
            term_char_enabled: false,
            auto_abort: false,
            eom: true,
        }
    }
}

/// State guarded by the short device lock: the open-handle list, the
/// interrupt notification scratch and the handle defaults. The interrupt
/// dispatcher confines itself to this lock and never touches the I/O lock.
pub(crate) struct SharedState {
    pub(crate) handles: Vec<Weak<HandleShared>>,
    pub(crate) bnotify1: u8,
    pub(crate) bnotify2: u8,
    pub(crate) defaults: HandleDefaults,
}

/// The slice of a handle the interrupt dispatcher may touch.
pub(crate) struct HandleShared {
    pub(crate) srq_byte: AtomicU8,
    pub(crate) srq_asserted: AtomicBool,
    pub(crate) notifier: Mutex<Option<Arc<dyn Fn(u8) + Send + Sync>>>,
}

pub(crate) struct DeviceState {
    pub(crate) transport: Box<dyn UsbTransport>,
    pub(crate) endpoints: UsbtmcEndpoints,
    pub(crate) ifnum: u8,
    pub(crate) io_buffer_size: usize,
    pub(crate) capabilities: Capabilities,
    pub(crate) io: Mutex<IoState>,
    pub(crate) shared: Mutex<SharedState>,
    /// Wait point shared by READ_STB (keyed on `iin_data_valid`) and by
    /// SRQ polling. Paired with the `shared` mutex.
    pub(crate) waitq: Condvar,
    pub(crate) zombie: AtomicBool,
    pub(crate) iin_data_valid: AtomicBool,
    pub(crate) intr_shutdown: AtomicBool,
}

impl DeviceState {
    pub(crate) fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_present(&self) -> Result<()> {
        if self.is_zombie() {
            return Err(Error::NotPresent.into());
        }
        Ok(())
    }

    /// Acquire the I/O exclusion lock, refusing on a disconnected device.
    pub(crate) fn lock_io(&self) -> Result<MutexGuard<'_, IoState>> {
        let guard = self.io.lock().unwrap();
        self.ensure_present()?;
        Ok(guard)
    }

    /// Flag the device as gone and wake every blocked waiter.
    pub(crate) fn mark_gone(&self) {
        if !self.zombie.swap(true, Ordering::SeqCst) {
            debug!("usbtmc device on interface {} is gone", self.ifnum);
        }
        self.waitq.notify_all();
    }

    fn map_usb(&self, err: rusb::Error) -> anyhow::Error {
        if err == rusb::Error::NoDevice {
            self.mark_gone();
            Error::NotPresent.into()
        } else {
            Error::Usb(err).into()
        }
    }

    pub(crate) fn bulk_out(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        self.ensure_present()?;
        self.transport
            .bulk_out(self.endpoints.bulk_out_ep.address, data, timeout)
            .map_err(|e| self.map_usb(e))
    }

    pub(crate) fn bulk_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.ensure_present()?;
        self.transport
            .bulk_in(self.endpoints.bulk_in_ep.address, buf, timeout)
            .map_err(|e| self.map_usb(e))
    }

    pub(crate) fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.ensure_present()?;
        self.transport
            .control_in(request_type, request, value, index, buf, timeout)
            .map_err(|e| self.map_usb(e))
    }

    pub(crate) fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.ensure_present()?;
        self.transport
            .control_out(request_type, request, value, index, buf, timeout)
            .map_err(|e| self.map_usb(e))
    }

    pub(crate) fn clear_bulk_in_halt(&self) -> Result<()> {
        self.ensure_present()?;
        self.transport
            .clear_halt(self.endpoints.bulk_in_ep.address)
            .map_err(|e| self.map_usb(e))
    }

    pub(crate) fn clear_bulk_out_halt(&self) -> Result<()> {
        self.ensure_present()?;
        self.transport
            .clear_halt(self.endpoints.bulk_out_ep.address)
            .map_err(|e| self.map_usb(e))
    }

    /// One scratch buffer per bulk operation; nothing longer-lived exists.
    pub(crate) fn scratch(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| Error::Alloc)?;
        buf.resize(len, 0);
        Ok(buf)
    }
}

/// ### Device
///
/// An attached USBTMC interface. Open any number of [`Handle`]s on it;
/// dropping the device (or calling [`Device::detach`]) is the disconnect
/// path: open handles survive as objects but every operation on them
/// returns [`Error::NotPresent`].
///
pub struct Device {
    state: Arc<DeviceState>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// ### TMC devices
    ///
    /// Get a list of USB TMC devices
    ///
    pub fn devices() -> Result<Vec<DeviceInfo>> {
        let mut context = rusb::Context::new()?;
        init::list_devices(&mut context)
    }

    /// ### Attach
    ///
    /// Open a USBTMC device on the bus and bring the interface up.
    ///
    /// Use `filter` to select the instrument:
    /// - `()` - first found USBTMC device
    /// - `(idVendor, idProduct)` or `DeviceId` - device by USB identifiers
    /// - `(bus, device)` or `DeviceAddr` - device by USB bus and device number
    /// - `DeviceInfo` - device by both USB identifiers and address
    ///
    pub fn attach(filter: impl DeviceFilter, config: Config) -> Result<Device> {
        let mut context = rusb::Context::new()?;
        let (device, mut handle) = init::open_device(&mut context, filter)?;

        let mut mode = init::probe_interface(&device)?;
        init::detach_kernel_driver(&mut mode, &mut handle)?;

        let endpoints = init::discover_endpoints(&mode, &device)?;

        handle.set_active_configuration(mode.config_number)?;
        handle.claim_interface(mode.interface_number)?;
        handle.set_alternate_setting(mode.interface_number, mode.setting_number)?;

        let ifnum = mode.interface_number;
        let transport = Box::new(RusbTransport::new(handle, mode));
        Device::with_transport(transport, endpoints, ifnum, config)
    }

    /// ### With Transport
    ///
    /// Bring up a device over an already-claimed transport. This is the
    /// seam for simulators and tests; [`Device::attach`] funnels into it.
    ///
    /// Queries GET_CAPABILITIES and, when the interface carries an
    /// interrupt-in endpoint, starts the notification dispatcher.
    ///
    pub fn with_transport(
        transport: Box<dyn UsbTransport>,
        endpoints: UsbtmcEndpoints,
        ifnum: u8,
        config: Config,
    ) -> Result<Device> {
        let config = config.sanitized();

        let capabilities =
            control::get_capabilities(transport.as_ref(), ifnum, config.usb_timeout)?;

        let state = Arc::new(DeviceState {
            transport,
            endpoints,
            ifnum,
            io_buffer_size: config.io_buffer_size,
            capabilities,
            io: Mutex::new(IoState {
                btag: BulkTag::new(),
                iin_btag: InterruptTag::new(),
                btag_last_write: 0,
                btag_last_read: 0,
                timeout: config.usb_timeout,
            }),
            shared: Mutex::new(SharedState {
                handles: Vec::new(),
                bnotify1: 0,
                bnotify2: 0,
                defaults: HandleDefaults::default(),
            }),
            waitq: Condvar::new(),
            zombie: AtomicBool::new(false),
            iin_data_valid: AtomicBool::new(false),
            intr_shutdown: AtomicBool::new(false),
        });

        let dispatcher = if state.endpoints.interrupt_ep.is_some() {
            Some(interrupt::spawn_dispatcher(Arc::clone(&state))?)
        } else {
            None
        };

        Ok(Device {
            state,
            dispatcher: Mutex::new(dispatcher),
        })
    }

    /// ### Open
    ///
    /// Create a new handle on the device. The handle snapshots the device
    /// defaults and joins the notification fan-out list.
    ///
    pub fn open(&self) -> Result<Handle> {
        self.state.ensure_present()?;

        let shared = Arc::new(HandleShared {
            srq_byte: AtomicU8::new(0),
            srq_asserted: AtomicBool::new(false),
            notifier: Mutex::new(None),
        });

        let defaults = {
            let mut guard = self.state.shared.lock().unwrap();
            guard.handles.push(Arc::downgrade(&shared));
            guard.defaults
        };

        Ok(Handle {
            dev: Arc::clone(&self.state),
            shared,
            term_char: defaults.term_char,
            term_char_enabled: defaults.term_char_enabled,
            auto_abort: defaults.auto_abort,
            eom: defaults.eom,
        })
    }

    /// ### Detach
    ///
    /// The disconnect path: flags the device as gone, wakes every blocked
    /// waiter and stops the interrupt dispatcher. Runs automatically when
    /// the device is dropped.
    ///
    pub fn detach(&self) {
        self.state.intr_shutdown.store(true, Ordering::SeqCst);
        self.state.mark_gone();
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// The four raw capability bytes plus the USB488 capability pair.
    pub fn capabilities(&self) -> Capabilities {
        self.state.capabilities
    }

    /// The coalesced USB488 capability byte.
    pub fn usb488_caps(&self) -> u8 {
        self.state.capabilities.usb488()
    }

    /// Defaults inherited by handles opened after this call.
    pub fn defaults(&self) -> HandleDefaults {
        self.state.shared.lock().unwrap().defaults
    }

    pub fn set_default_term_char(&self, term_char: u8, enabled: bool) -> Result<()> {
        if enabled && !self.state.capabilities.supports_term_char() {
            return Err(Error::UnsupportedFeature.into());
        }
        let mut guard = self.state.shared.lock().unwrap();
        guard.defaults.term_char = term_char;
        guard.defaults.term_char_enabled = enabled;
        Ok(())
    }

    pub fn set_default_auto_abort(&self, auto_abort: bool) {
        self.state.shared.lock().unwrap().defaults.auto_abort = auto_abort;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.detach();
    }
}

/// ### Handle
///
/// The file-descriptor equivalent: one per open. Handles on the same
/// device may be driven from separate threads; the per-device I/O lock
/// serializes the transport-visible operations.
///
pub struct Handle {
    dev: Arc<DeviceState>,
    shared: Arc<HandleShared>,
    term_char: u8,
    term_char_enabled: bool,
    auto_abort: bool,
    eom: bool,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

impl Handle {
    fn params(&self) -> bulk::IoParams {
        bulk::IoParams {
            term_char: self.term_char,
            term_char_enabled: self.term_char_enabled,
            auto_abort: self.auto_abort,
            eom: self.eom,
        }
    }

    /// ### Read
    ///
    /// Ask the device for up to `buf.len()` bytes of a device-dependent
    /// message and copy them into `buf`. Returns the number of bytes read,
    /// which falls short of the capacity when the device ends the message
    /// early.
    ///
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        bulk::read(&self.dev, &self.params(), buf)
    }

    /// ### Write
    ///
    /// Send `data` to the device as a device-dependent message, chunked
    /// into bulk transfers as needed. Returns `data.len()` on success.
    ///
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        bulk::write(&self.dev, &self.params(), data)
    }

    /// ### Command
    ///
    /// Send a command string to the device.
    ///
    pub fn command(&self, cmd: &str) -> Result<()> {
        self.write(cmd.as_bytes())?;
        Ok(())
    }

    /// ### Query
    ///
    /// Send a command and read the response back as a UTF-8 string.
    ///
    pub fn query(&self, cmd: &str) -> Result<String> {
        self.write(cmd.as_bytes())?;
        let mut buf = self.dev.scratch(self.dev.io_buffer_size)?;
        let n = self.read(&mut buf)?;
        let resp = std::str::from_utf8(&buf[..n])?.trim();
        Ok(String::from(resp))
    }

    /// Abort the outstanding bulk-in transfer and drain the endpoint.
    pub fn abort_bulk_in(&self) -> Result<()> {
        let mut io = self.dev.lock_io()?;
        control::abort_bulk_in(&self.dev, &mut io)
    }

    /// Abort the outstanding bulk-out transfer.
    pub fn abort_bulk_out(&self) -> Result<()> {
        let mut io = self.dev.lock_io()?;
        control::abort_bulk_out(&self.dev, &mut io)
    }

    /// ### Clear
    ///
    /// Clear the device's input and output buffers, then clear the
    /// bulk-out halt.
    ///
    pub fn clear(&self) -> Result<()> {
        let mut io = self.dev.lock_io()?;
        control::clear(&self.dev, &mut io)
    }

    pub fn clear_in_halt(&self) -> Result<()> {
        let _io = self.dev.lock_io()?;
        self.dev.clear_bulk_in_halt()
    }

    pub fn clear_out_halt(&self) -> Result<()> {
        let _io = self.dev.lock_io()?;
        self.dev.clear_bulk_out_halt()
    }

    /// Ask the device to blink its activity indicator.
    pub fn indicator_pulse(&self) -> Result<()> {
        let io = self.dev.lock_io()?;
        control::indicator_pulse(&self.dev, &io)
    }

    /// ### Read STB
    ///
    /// Read the IEEE-488 status byte. A service request seen since the
    /// last call is answered from the handle's SRQ slot without touching
    /// the device; otherwise the status byte is fetched with a
    /// READ_STATUS_BYTE exchange, waiting on the interrupt endpoint when
    /// the device has one.
    ///
    pub fn read_stb(&self) -> Result<u8> {
        let mut io = self.dev.lock_io()?;
        if self.shared.srq_asserted.swap(false, Ordering::SeqCst) {
            let stb = self.shared.srq_byte.load(Ordering::SeqCst);
            // the interrupt tag advances on every exit, cache hit included
            io.iin_btag.advance();
            return Ok(stb);
        }
        control::read_status_byte(&self.dev, &mut io)
    }

    /// Assert or release remote enable. Requires the USB488 `SIMPLE`
    /// capability.
    pub fn ren_control(&self, enable: bool) -> Result<()> {
        let mut io = self.dev.lock_io()?;
        control::ren_control(&self.dev, &mut io, enable)
    }

    /// Return the device to local control. Requires the USB488 `SIMPLE`
    /// capability.
    pub fn goto_local(&self) -> Result<()> {
        let mut io = self.dev.lock_io()?;
        control::goto_local(&self.dev, &mut io)
    }

    /// Lock out the device's front panel. Requires the USB488 `SIMPLE`
    /// capability.
    pub fn local_lockout(&self) -> Result<()> {
        let mut io = self.dev.lock_io()?;
        control::local_lockout(&self.dev, &mut io)
    }

    /// Send a USB488 trigger message on the bulk-out endpoint.
    pub fn trigger(&self) -> Result<()> {
        bulk::trigger(&self.dev)
    }

    /// ### Control Request
    ///
    /// Generic control-transfer passthrough. The direction bit of
    /// `bm_request_type` selects IN or OUT; `data` is the payload buffer
    /// and its length becomes `wLength`. A zero-length request is issued
    /// with an empty buffer and no scratch allocation.
    ///
    pub fn control_request(&self, request: &CtrlRequest, data: &mut [u8]) -> Result<usize> {
        let io = self.dev.lock_io()?;
        control::passthrough(&self.dev, &io, request, data)
    }

    pub fn timeout(&self) -> Result<Duration> {
        let io = self.dev.lock_io()?;
        Ok(io.timeout)
    }

    /// Set the transfer timeout for the whole device. Values under 500 ms
    /// are rejected and leave the stored timeout unchanged.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout < Duration::from_millis(misc::MIN_TIMEOUT_MS as u64) {
            return Err(Error::TimeoutTooShort.into());
        }
        let mut io = self.dev.lock_io()?;
        io.timeout = timeout;
        Ok(())
    }

    pub fn eom_enabled(&self) -> bool {
        self.eom
    }

    /// Enable or disable the end-of-message flag on the final chunk of a
    /// write. Only the values 0 and 1 are accepted.
    pub fn set_eom_enable(&mut self, value: u8) -> Result<()> {
        self.dev.ensure_present()?;
        if value > 1 {
            return Err(Error::InvalidEomValue.into());
        }
        self.eom = value == 1;
        Ok(())
    }

    pub fn term_char(&self) -> (u8, bool) {
        (self.term_char, self.term_char_enabled)
    }

    /// Configure the termination character for bulk-in requests. Enabling
    /// it requires the device's termination-character capability.
    pub fn config_term_char(&mut self, term_char: u8, enabled: bool) -> Result<()> {
        self.dev.ensure_present()?;
        if enabled && !self.dev.capabilities.supports_term_char() {
            return Err(Error::UnsupportedFeature.into());
        }
        self.term_char = term_char;
        self.term_char_enabled = enabled;
        Ok(())
    }

    pub fn auto_abort(&self) -> bool {
        self.auto_abort
    }

    /// When set, a failed bulk transfer triggers the matching abort state
    /// machine before the error is surfaced.
    pub fn set_auto_abort(&mut self, auto_abort: bool) {
        self.auto_abort = auto_abort;
    }

    pub fn capabilities(&self) -> Capabilities {
        self.dev.capabilities
    }

    pub fn usb488_caps(&self) -> u8 {
        self.dev.capabilities.usb488()
    }

    /// ### Poll SRQ
    ///
    /// True when a service request has been seen on this handle and not
    /// yet acknowledged with [`Handle::read_stb`].
    ///
    pub fn poll_srq(&self) -> Result<bool> {
        self.dev.ensure_present()?;
        Ok(self.shared.srq_asserted.load(Ordering::SeqCst))
    }

    /// ### Wait SRQ
    ///
    /// Block until a service request is raised on this handle, the device
    /// disconnects, or `timeout` elapses. Returns the status byte carried
    /// by the notification; the asserted flag stays set until the request
    /// is acknowledged with [`Handle::read_stb`].
    ///
    pub fn wait_srq(&self, timeout: Duration) -> Result<u8> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.dev.shared.lock().unwrap();
        loop {
            if self.dev.is_zombie() {
                return Err(Error::NotPresent.into());
            }
            if self.shared.srq_asserted.load(Ordering::SeqCst) {
                return Ok(self.shared.srq_byte.load(Ordering::SeqCst));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WaitTimeout.into());
            }
            let (g, _) = self.dev.waitq.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    /// ### On SRQ
    ///
    /// Register a notifier invoked once per service request with the
    /// status byte, from the dispatcher's context. The SIGIO equivalent.
    ///
    pub fn on_srq<F>(&self, notifier: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        *self.shared.notifier.lock().unwrap() = Some(Arc::new(notifier));
    }

    pub fn clear_srq_notifier(&self) {
        *self.shared.notifier.lock().unwrap() = None;
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let target = Arc::downgrade(&self.shared);
        let mut guard = self.dev.shared.lock().unwrap();
        guard.handles.retain(|h| !Weak::ptr_eq(h, &target));
    }
}
