// Bare-bones stub devices for ports this core must dispatch to but doesn't
// implement behaviourally (spec.md §1 non-goals; SPEC_FULL.md §3): no
// scancode tables, no ATA command protocol, no serial-mouse packet framing.
// Each owns an input queue with the same mutex discipline spec.md §5 gives
// the keyboard/mouse event queues, so a UI thread could push input without
// touching the CPU thread. They exist so the I/O dispatcher and the
// concurrency model have something concrete to route to and lock; a real
// BIOS/driver would replace all three.

use crate::io::{IoDevice, PortMask};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A byte queue behind a mutex, shared between a stub device and whatever
/// feeds it (a UI thread posting scancodes/mouse packets, or a test).
#[derive(Clone, Default)]
pub struct InputQueue(Arc<Mutex<VecDeque<u8>>>);

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, byte: u8) {
        self.0.lock().expect("input queue mutex poisoned").push_back(byte);
    }

    fn pop(&self) -> Option<u8> {
        self.0.lock().expect("input queue mutex poisoned").pop_front()
    }
}

/// PS/2 keyboard controller on 0x60 (data) / 0x64 (status/command). Reads
/// of 0x60 drain the queue (0 once empty); writes to 0x64 are stored back
/// as the "status" a guest polling for a response would see, since there's
/// no real command protocol behind it.
pub struct KeyboardStub {
    queue: InputQueue,
    status: u8,
}

impl KeyboardStub {
    pub fn new(queue: InputQueue) -> Self {
        KeyboardStub { queue, status: 0 }
    }
}

impl IoDevice for KeyboardStub {
    fn ports(&self) -> Vec<(u16, PortMask)> {
        vec![(0x60, PortMask::READ_WRITE), (0x64, PortMask::READ_WRITE)]
    }

    fn read8(&mut self, port: u16) -> u8 {
        match port {
            0x60 => self.queue.pop().unwrap_or(0),
            0x64 => self.status,
            _ => 0xff,
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        if port == 0x64 {
            self.status = value;
        }
    }
}

/// A serial (COM1, 0x3F8-0x3FF) mouse stub: no line discipline, just a
/// packet queue a UI thread could fill and a guest driver could drain from
/// the data register.
pub struct MouseStub {
    queue: InputQueue,
    line_control: u8,
}

impl MouseStub {
    pub fn new(queue: InputQueue) -> Self {
        MouseStub { queue, line_control: 0 }
    }
}

impl IoDevice for MouseStub {
    fn ports(&self) -> Vec<(u16, PortMask)> {
        (0x3f8..=0x3ff).map(|port| (port, PortMask::READ_WRITE)).collect()
    }

    fn read8(&mut self, port: u16) -> u8 {
        match port {
            0x3f8 => self.queue.pop().unwrap_or(0),
            0x3f5 => self.line_control,
            _ => 0,
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        if port == 0x3fb {
            self.line_control = value;
        }
    }
}

/// Primary ATA channel (0x1F0-0x1F7 plus the alternate-status/control port
/// 0x3F6). Accepts command-register writes and always answers status reads
/// with "ready, no error, no data request", since no disk image I/O is
/// implemented here (spec.md §1).
pub struct DiskStub {
    queue: InputQueue,
}

const ATA_STATUS_READY: u8 = 0x40;

impl DiskStub {
    pub fn new(queue: InputQueue) -> Self {
        DiskStub { queue }
    }
}

impl IoDevice for DiskStub {
    fn ports(&self) -> Vec<(u16, PortMask)> {
        let mut ports: Vec<(u16, PortMask)> = (0x1f0..=0x1f7).map(|port| (port, PortMask::READ_WRITE)).collect();
        ports.push((0x3f6, PortMask::READ_WRITE));
        ports
    }

    fn read8(&mut self, port: u16) -> u8 {
        match port {
            0x1f0 => self.queue.pop().unwrap_or(0),
            0x1f7 | 0x3f6 => ATA_STATUS_READY,
            _ => 0,
        }
    }

    fn write8(&mut self, _port: u16, _value: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_drains_queue_then_reads_zero() {
        let queue = InputQueue::new();
        queue.push(0x1e);
        let mut keyboard = KeyboardStub::new(queue);
        assert_eq!(keyboard.read8(0x60), 0x1e);
        assert_eq!(keyboard.read8(0x60), 0);
    }

    #[test]
    fn disk_stub_always_reports_ready() {
        let mut disk = DiskStub::new(InputQueue::new());
        assert_eq!(disk.read8(0x1f7) & ATA_STATUS_READY, ATA_STATUS_READY);
    }

    #[test]
    fn mouse_stub_reads_pushed_packet_bytes_in_order() {
        let queue = InputQueue::new();
        queue.push(0x08);
        queue.push(0x00);
        let mut mouse = MouseStub::new(queue);
        assert_eq!(mouse.read8(0x3f8), 0x08);
        assert_eq!(mouse.read8(0x3f8), 0x00);
    }
}
