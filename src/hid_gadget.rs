//! # USB Gadget HID Transport
//!
//! Writes reports to the Linux USB gadget HID device files
//! (`/dev/hidg0` for the boot keyboard, `/dev/hidg1` for the consumer
//! control). The files are opened non-blocking: when the host has not
//! drained the previous report the write fails with `WouldBlock`, which
//! maps to a Busy outcome so the emitter retries on a later tick instead
//! of stalling the loop.

use crate::transport::{HidReport, HidTransport, SendOutcome};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;

pub struct GadgetHid {
    keyboard: File,
    consumer: File,
}

fn open_nonblocking(path: &str) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

impl GadgetHid {
    pub fn open(keyboard_dev: &str, consumer_dev: &str) -> io::Result<Self> {
        Ok(GadgetHid {
            keyboard: open_nonblocking(keyboard_dev)?,
            consumer: open_nonblocking(consumer_dev)?,
        })
    }
}

impl HidTransport for GadgetHid {
    fn send_report(&mut self, report: &HidReport) -> SendOutcome {
        let result = match *report {
            HidReport::Keyboard { modifiers, keys } => {
                // Boot keyboard report: modifiers, reserved byte, six keys.
                let mut buf = [0u8; 8];
                buf[0] = modifiers;
                buf[2..8].copy_from_slice(&keys);
                self.keyboard.write(&buf)
            }
            HidReport::Consumer { usage } => self.consumer.write(&usage.to_le_bytes()),
        };
        match result {
            Ok(_) => SendOutcome::Sent,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => SendOutcome::Busy,
            Err(err) => {
                warn!("hid gadget write failed: {err}");
                SendOutcome::Failed
            }
        }
    }
}
