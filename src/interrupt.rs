//! ## Interrupt
//!
//! The notification dispatcher. A dedicated thread keeps a read pending on
//! the interrupt-in endpoint and routes what arrives: status-byte
//! notifications flip `iin_data_valid` for the READ_STB waiter, service
//! requests fan out to every open handle. The thread confines itself to
//! the short device lock so it can run while a user thread holds the I/O
//! lock.
//!

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};

use crate::constants::misc;
use crate::device::DeviceState;

/// Leading byte of a service-request notification; greater values carry a
/// status byte tagged with the low seven bits.
const SRQ_NOTIFICATION: u8 = 0x81;

pub(crate) fn spawn_dispatcher(dev: Arc<DeviceState>) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("usbtmc-intr".into())
        .spawn(move || run(dev))?;
    Ok(handle)
}

fn run(dev: Arc<DeviceState>) {
    let endpoint = match &dev.endpoints.interrupt_ep {
        Some(ep) => ep.clone(),
        None => return,
    };
    let poll = Duration::from_millis(misc::INTERRUPT_POLL_MS);
    let mut buf = vec![0u8; endpoint.max_packet_size as usize];

    loop {
        if dev.intr_shutdown.load(Ordering::SeqCst) || dev.is_zombie() {
            break;
        }
        match dev.transport.interrupt_in(endpoint.address, &mut buf, poll) {
            Ok(n) => dispatch(&dev, &buf[..n]),
            // nothing pending in this poll slice
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => continue,
            Err(rusb::Error::NoDevice) => {
                debug!("interrupt endpoint: device gone");
                dev.mark_gone();
                break;
            }
            Err(err) => {
                warn!("interrupt endpoint torn down: {err}");
                break;
            }
        }
    }
}

fn dispatch(dev: &DeviceState, packet: &[u8]) {
    if packet.len() < 2 {
        warn!("runt interrupt packet of {} bytes", packet.len());
        return;
    }

    if packet[0] == SRQ_NOTIFICATION {
        let stb = packet[1];
        let mut notifiers = Vec::new();
        {
            let mut shared = dev.shared.lock().unwrap();
            shared.handles.retain(|weak| match weak.upgrade() {
                Some(handle) => {
                    handle.srq_byte.store(stb, Ordering::SeqCst);
                    handle.srq_asserted.store(true, Ordering::SeqCst);
                    if let Some(notifier) = handle.notifier.lock().unwrap().clone() {
                        notifiers.push(notifier);
                    }
                    true
                }
                None => false,
            });
        }
        dev.waitq.notify_all();
        debug!("srq 0x{stb:02x} fanned out to {} notifiers", notifiers.len());
        // user callbacks run outside the device lock
        for notifier in notifiers {
            notifier(stb);
        }
    } else if packet[0] > SRQ_NOTIFICATION {
        let mut shared = dev.shared.lock().unwrap();
        shared.bnotify1 = packet[0];
        shared.bnotify2 = packet[1];
        dev.iin_data_valid.store(true, Ordering::SeqCst);
        drop(shared);
        dev.waitq.notify_all();
    } else {
        warn!("unexpected interrupt notification 0x{:02x}", packet[0]);
    }
}
