// IRQ acceptance and the interrupt/exception dispatch sequence (spec.md
// §4.8), plus the minimal 8259 PIC pair SPEC_FULL.md §3 adds so "PIC base"
// and "unmasked line" have a concrete implementation to drive. Grounded on
// `original_source`'s cascaded-PIC references and on `io.rs`'s IoDevice
// shape for the port-facing half.

use crate::io::{IoDevice, PortMask};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A master/slave 8259 pair on the standard ports (0x20/0x21 master,
/// 0xA0/0xA1 slave). Implements just enough of ICW1-4/OCW2 to let a guest
/// remap vectors and mask lines; nothing in this core issues an IRQ2
/// cascade between the two halves since nothing here drives slave-only
/// devices yet.
pub struct Pic {
    base_vector: u8,
    mask: u8,
    pending: u8,
    in_service: u8,
    icw_step: u8,
    auto_eoi: bool,
}

impl Pic {
    pub fn new(default_base: u8) -> Self {
        Pic { base_vector: default_base, mask: 0xff, pending: 0, in_service: 0, icw_step: 0, auto_eoi: false }
    }

    pub fn raise(&mut self, line: u8) {
        self.pending |= 1 << line;
    }

    pub fn lower(&mut self, line: u8) {
        self.pending &= !(1 << line);
    }

    /// The highest-priority unmasked, pending line's vector, if any.
    /// spec.md §4.8: "the highest-priority unmasked line drives a vector
    /// computed from the PIC base".
    pub fn highest_priority_vector(&mut self) -> Option<u8> {
        let runnable = self.pending & !self.mask;
        if runnable == 0 {
            return None;
        }
        let line = runnable.trailing_zeros() as u8;
        self.in_service |= 1 << line;
        if self.auto_eoi {
            // Auto-EOI acknowledges immediately instead of waiting for an
            // OCW2 EOI write, so in_service must not accumulate.
            self.pending &= !(1 << line);
            self.in_service &= !(1 << line);
        }
        Some(self.base_vector + line)
    }

    fn end_of_interrupt(&mut self, specific_line: Option<u8>) {
        match specific_line {
            Some(line) => self.in_service &= !(1 << line),
            None => {
                if self.in_service != 0 {
                    let line = self.in_service.trailing_zeros() as u8;
                    self.in_service &= !(1 << line);
                }
            }
        }
    }
}

impl IoDevice for Pic {
    fn ports(&self) -> Vec<(u16, PortMask)> {
        vec![(0, PortMask::READ_WRITE), (1, PortMask::READ_WRITE)]
    }

    fn read8(&mut self, port: u16) -> u8 {
        match port {
            0 => self.in_service,
            1 => self.mask,
            _ => 0xff,
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        match port {
            0 => {
                if value & 0x10 != 0 {
                    // ICW1: start initialization sequence.
                    self.icw_step = 1;
                    self.mask = 0;
                } else if value & 0x20 != 0 {
                    // OCW2 non-specific or specific EOI.
                    let specific = if value & 0x40 != 0 { Some(value & 0x7) } else { None };
                    self.end_of_interrupt(specific);
                }
            }
            1 => match self.icw_step {
                1 => {
                    self.base_vector = value & 0xf8;
                    self.icw_step = 2;
                }
                2 => self.icw_step = 3, // ICW3, ignored (cascade wiring).
                3 => {
                    self.auto_eoi = value & 0x2 != 0;
                    self.icw_step = 0;
                }
                _ => self.mask = value,
            },
            _ => {}
        }
    }
}

/// Since `Pic` is registered on port offsets 0/1 relative to its own base,
/// `PicPair` wraps a master at 0x20/0x21 and a slave at 0xA0/0xA1, each
/// implementing `IoDevice` with ports relative to that base.
pub struct OffsetPic {
    pic: Pic,
    base_port: u16,
}

impl OffsetPic {
    pub fn new(base_port: u16, default_vector: u8) -> Self {
        OffsetPic { pic: Pic::new(default_vector), base_port }
    }

    pub fn raise(&mut self, line: u8) {
        self.pic.raise(line)
    }

    pub fn lower(&mut self, line: u8) {
        self.pic.lower(line)
    }

    pub fn highest_priority_vector(&mut self) -> Option<u8> {
        self.pic.highest_priority_vector()
    }
}

impl IoDevice for OffsetPic {
    fn ports(&self) -> Vec<(u16, PortMask)> {
        vec![(self.base_port, PortMask::READ_WRITE), (self.base_port + 1, PortMask::READ_WRITE)]
    }

    fn read8(&mut self, port: u16) -> u8 {
        self.pic.read8(port - self.base_port)
    }

    fn write8(&mut self, port: u16, value: u8) {
        self.pic.write8(port - self.base_port, value)
    }
}

/// `Cpu` needs to call `highest_priority_vector` directly every `step()`,
/// but a guest programs the same PIC through ports dispatched by `IoBus`
/// (ICW1-4, OCW2 EOI, IMR). `Rc<RefCell<_>>` lets one `OffsetPic` back both
/// paths without `Cpu` hand-rolling a special case in its IN/OUT handling
/// for just these four ports.
pub type SharedPic = Rc<RefCell<OffsetPic>>;

/// The `IoBus`-registrable half of a shared PIC: forwards to the same
/// `OffsetPic` `Cpu` polls directly.
pub struct PicPort(pub SharedPic);

impl IoDevice for PicPort {
    fn ports(&self) -> Vec<(u16, PortMask)> {
        self.0.borrow().ports()
    }

    fn read8(&mut self, port: u16) -> u8 {
        self.0.borrow_mut().read8(port)
    }

    fn write8(&mut self, port: u16, value: u8) {
        self.0.borrow_mut().write8(port, value)
    }
}

/// Command queue the host (debugger/UI thread) enqueues into; the CPU
/// worker drains it between instruction batches (spec.md §4.12/§5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    EnterDebugger,
    ExitDebugger,
    HardReboot,
}

#[derive(Default)]
pub struct CommandQueue {
    queue: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, command: Command) {
        self.queue.push_back(command);
    }

    pub fn drain(&mut self) -> Vec<Command> {
        self.queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_line_never_surfaces() {
        let mut pic = Pic::new(0x08);
        pic.mask = 0xff;
        pic.raise(0);
        assert_eq!(pic.highest_priority_vector(), None);
    }

    #[test]
    fn unmasked_line_computes_vector_from_base() {
        let mut pic = Pic::new(0x08);
        pic.mask = 0xfe; // unmask line 0
        pic.raise(0);
        assert_eq!(pic.highest_priority_vector(), Some(0x08));
    }

    #[test]
    fn icw_sequence_remaps_base_vector() {
        let mut pic = Pic::new(0x08);
        pic.write8(0, 0x11); // ICW1
        pic.write8(1, 0x20); // ICW2: base = 0x20
        pic.write8(1, 0x04); // ICW3
        pic.write8(1, 0x01); // ICW4
        pic.mask = 0xfe;
        pic.raise(0);
        assert_eq!(pic.highest_priority_vector(), Some(0x20));
    }

    #[test]
    fn command_queue_drains_in_order() {
        let mut queue = CommandQueue::new();
        queue.post(Command::EnterDebugger);
        queue.post(Command::HardReboot);
        assert_eq!(queue.drain(), vec![Command::EnterDebugger, Command::HardReboot]);
    }
}
