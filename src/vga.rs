// VGA graphics/text memory and register ports (spec.md §4.11, §6), plus the
// default palette and misc-output/feature-control behaviours SPEC_FULL.md §3
// supplements. Grounded on `original_source/hw/vga.cpp` for the write-mode
// machinery, the default DAC table, and the handful of port behaviours
// spec.md leaves silent (0x3BA write, 0x3CA/0x3CC readback).
//
// One `VgaState` is shared by three thin views (`GraphicsMemory`,
// `TextMemory`, `VgaPorts`) behind a single `Arc<Mutex<_>>`, the way a
// device that's addressed through more than one interface has to be when
// `Cpu` registers memory providers and I/O devices as separate trait
// objects. Spec.md §5 only requires the *palette* to be mutex-guarded and
// everything else to tolerate unsynchronised, torn reads; one mutex over
// the whole state is a stricter simplification of that (see DESIGN.md), but
// every method here still locks only for the duration of its own access and
// never calls into another device while holding it, which is the discipline
// §5 actually cares about.

use crate::io::{IoDevice, PortMask};
use crate::memory::MemoryProvider;
use log::warn;
use std::sync::{Arc, Mutex};

pub const GRAPHICS_BASE: usize = 0xa0000;
pub const GRAPHICS_SIZE: usize = 0x10000;
pub const TEXT_BASE: usize = 0xb8000;
pub const TEXT_SIZE: usize = 0x8000;

const PLANE_SIZE: usize = 0x10000;

/// The classic 16-color CGA/VGA low palette, replicated across the DAC's
/// four 64-entry banks (`original_source/hw/vga.cpp`'s reset table), so a
/// freshly reset machine shows sane colors before any `OUT 0x3C9` traffic.
/// Values are the standard 6-bit-per-channel RGB VGA uses internally.
const DEFAULT_PALETTE_16: [(u8, u8, u8); 16] = [
    (0x00, 0x00, 0x00),
    (0x00, 0x00, 0x2a),
    (0x00, 0x2a, 0x00),
    (0x00, 0x2a, 0x2a),
    (0x2a, 0x00, 0x00),
    (0x2a, 0x00, 0x2a),
    (0x2a, 0x15, 0x00),
    (0x2a, 0x2a, 0x2a),
    (0x15, 0x15, 0x15),
    (0x15, 0x15, 0x3f),
    (0x15, 0x3f, 0x15),
    (0x15, 0x3f, 0x3f),
    (0x3f, 0x15, 0x15),
    (0x3f, 0x15, 0x3f),
    (0x3f, 0x3f, 0x15),
    (0x3f, 0x3f, 0x3f),
];

fn default_dac() -> Vec<(u8, u8, u8)> {
    let mut dac = Vec::with_capacity(256);
    for _ in 0..4 {
        dac.extend_from_slice(&DEFAULT_PALETTE_16);
    }
    dac
}

fn rotate_right8(value: u8, count: u8) -> u8 {
    value.rotate_right(u32::from(count & 0x7))
}

/// Everything the adapter owns: the four planar graphics banks plus their
/// read latches, the text framebuffer, and the CRTC/sequencer/graphics
/// controller/attribute-controller/DAC register files (spec.md §4.11).
pub struct VgaState {
    planes: [Vec<u8>; 4],
    latches: [u8; 4],
    text: Vec<u8>,
    text_dirty: bool,

    crtc_index: u8,
    crtc: [u8; 0x19],

    gc_index: u8,
    gc: [u8; 0x09],

    seq_index: u8,
    seq: [u8; 0x07],

    attr_index: u8,
    attr_next_is_index: bool,
    attr_palette: [u8; 16],
    attr_misc: [u8; 5],

    misc_output: u8,
    status_toggle: bool,

    dac: Vec<(u8, u8, u8)>,
    dac_read_index: u8,
    dac_write_index: u8,
    dac_sub_index: u8,
    palette_dirty: bool,
}

impl VgaState {
    pub fn new() -> Self {
        VgaState {
            planes: [
                vec![0; PLANE_SIZE],
                vec![0; PLANE_SIZE],
                vec![0; PLANE_SIZE],
                vec![0; PLANE_SIZE],
            ],
            latches: [0; 4],
            text: vec![0; TEXT_SIZE],
            text_dirty: false,
            crtc_index: 0,
            crtc: [0; 0x19],
            gc_index: 0,
            gc: [0; 0x09],
            seq_index: 0,
            seq: [0; 0x07],
            attr_index: 0,
            attr_next_is_index: true,
            attr_palette: [0; 16],
            attr_misc: [0; 5],
            misc_output: 0,
            status_toggle: false,
            dac: default_dac(),
            dac_read_index: 0,
            dac_write_index: 0,
            dac_sub_index: 0,
            palette_dirty: false,
        }
    }

    fn chain4(&self) -> bool {
        self.seq[4] & 0x8 != 0
    }

    fn map_mask(&self) -> u8 {
        self.seq[2] & 0xf
    }

    fn read_plane_select(&self) -> usize {
        (self.gc[4] & 0x3) as usize
    }

    fn write_mode(&self) -> u8 {
        self.gc[5] & 0x3
    }

    /// Loads all four latches from `offset` (every graphics-memory read
    /// does this as a side effect, spec.md §4.11), then returns the
    /// currently-selected plane's byte. Mode-1 (color-compare) reads are
    /// out of scope beyond logging; mode 0's byte is returned regardless.
    fn graphics_read(&mut self, offset: usize) -> u8 {
        for plane in 0..4 {
            self.latches[plane] = self.planes[plane][offset];
        }
        if self.gc[5] & 0x8 != 0 {
            warn!(target: "vga", "read mode 1 (color compare) not implemented, returning mode-0 byte");
        }
        self.latches[self.read_plane_select()]
    }

    fn graphics_write(&mut self, offset: usize, value: u8) {
        let mask = self.map_mask();
        match self.write_mode() {
            0 => {
                let rotated = rotate_right8(value, self.gc[3] & 0x7);
                let logic_op = (self.gc[3] >> 3) & 0x3;
                let bitmask = self.gc[8];
                for plane in 0..4 {
                    if mask & (1 << plane) == 0 {
                        continue;
                    }
                    let source = if self.gc[1] & (1 << plane) != 0 {
                        if self.gc[0] & (1 << plane) != 0 {
                            0xff
                        } else {
                            0x00
                        }
                    } else {
                        rotated
                    };
                    let latch = self.latches[plane];
                    let combined = match logic_op {
                        0 => source,
                        1 => source & latch,
                        2 => source | latch,
                        _ => source ^ latch,
                    };
                    self.planes[plane][offset] = (combined & bitmask) | (latch & !bitmask);
                }
            }
            1 => {
                for plane in 0..4 {
                    if mask & (1 << plane) != 0 {
                        self.planes[plane][offset] = self.latches[plane];
                    }
                }
            }
            2 => {
                let bitmask = self.gc[8];
                for plane in 0..4 {
                    if mask & (1 << plane) == 0 {
                        continue;
                    }
                    let source = if value & (1 << plane) != 0 { 0xff } else { 0x00 };
                    let latch = self.latches[plane];
                    self.planes[plane][offset] = (source & bitmask) | (latch & !bitmask);
                }
            }
            _ => {
                warn!(target: "vga", "graphics write mode 3 not implemented, byte dropped");
            }
        }
    }

    fn attribute_write(&mut self, value: u8) {
        if self.attr_next_is_index {
            // The raw byte (including bit 5, palette-source enable) is what
            // a read of 0x3C0 echoes back; only the low 5 bits select a
            // register.
            self.attr_index = value;
            self.attr_next_is_index = false;
        } else {
            let index = (self.attr_index & 0x1f) as usize;
            if index < self.attr_palette.len() {
                self.attr_palette[index] = value;
            } else if index < self.attr_palette.len() + self.attr_misc.len() {
                self.attr_misc[index - self.attr_palette.len()] = value;
            } else {
                warn!(target: "vga", "attribute controller index {:#04x} out of range", index);
            }
            self.attr_next_is_index = true;
            self.palette_dirty = true;
        }
    }

    fn attribute_read(&mut self) -> u8 {
        let index = (self.attr_index & 0x1f) as usize;
        if index < self.attr_palette.len() {
            self.attr_palette[index]
        } else if index < self.attr_palette.len() + self.attr_misc.len() {
            self.attr_misc[index - self.attr_palette.len()]
        } else {
            0xff
        }
    }

    fn dac_write(&mut self, value: u8) {
        let index = self.dac_write_index as usize;
        if index >= self.dac.len() {
            return;
        }
        let (r, g, b) = self.dac[index];
        let sixbit = value & 0x3f;
        self.dac[index] = match self.dac_sub_index {
            0 => (sixbit, g, b),
            1 => (r, sixbit, b),
            _ => (r, g, sixbit),
        };
        self.palette_dirty = true;
        self.dac_sub_index += 1;
        if self.dac_sub_index == 3 {
            self.dac_sub_index = 0;
            self.dac_write_index = self.dac_write_index.wrapping_add(1);
        }
    }

    fn dac_read(&mut self) -> u8 {
        let index = self.dac_read_index as usize;
        let (r, g, b) = self.dac.get(index).copied().unwrap_or((0, 0, 0));
        let value = match self.dac_sub_index {
            0 => r,
            1 => g,
            _ => b,
        };
        self.dac_sub_index += 1;
        if self.dac_sub_index == 3 {
            self.dac_sub_index = 0;
            self.dac_read_index = self.dac_read_index.wrapping_add(1);
        }
        value
    }

    /// Display-start (0x0C/0x0D) and cursor-location (0x0E/0x0F) CRTC
    /// registers, read as word pairs for a screen refresher's convenience.
    pub fn display_start(&self) -> u16 {
        u16::from(self.crtc[0x0c]) << 8 | u16::from(self.crtc[0x0d])
    }

    pub fn cursor_location(&self) -> u16 {
        u16::from(self.crtc[0x0e]) << 8 | u16::from(self.crtc[0x0f])
    }

    pub fn palette(&self) -> &[(u8, u8, u8)] {
        &self.dac
    }

    pub fn take_palette_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.palette_dirty, false)
    }

    pub fn take_text_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.text_dirty, false)
    }

    pub fn text(&self) -> &[u8] {
        &self.text
    }

    pub fn plane(&self, index: usize) -> &[u8] {
        &self.planes[index]
    }
}

impl Default for VgaState {
    fn default() -> Self {
        Self::new()
    }
}

/// A read-only handle a screen refresher thread can hold without owning the
/// CPU; cloning is just an `Arc` bump (spec.md §4.12/§5).
#[derive(Clone)]
pub struct VgaHandle(Arc<Mutex<VgaState>>);

impl VgaHandle {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, VgaState> {
        self.0.lock().expect("vga state mutex poisoned")
    }
}

/// Constructs the three registrable views plus the handle a screen
/// refresher can clone, all sharing one `VgaState`.
pub fn new_adapter() -> (Box<dyn MemoryProvider>, Box<dyn MemoryProvider>, Box<dyn IoDevice>, VgaHandle) {
    let state = Arc::new(Mutex::new(VgaState::new()));
    let graphics = Box::new(GraphicsMemory { state: Arc::clone(&state) });
    let text = Box::new(TextMemory { state: Arc::clone(&state) });
    let ports = Box::new(VgaPorts { state: Arc::clone(&state) });
    (graphics, text, ports, VgaHandle(state))
}

struct GraphicsMemory {
    state: Arc<Mutex<VgaState>>,
}

impl MemoryProvider for GraphicsMemory {
    fn range(&self) -> (usize, usize) {
        (GRAPHICS_BASE, GRAPHICS_BASE + GRAPHICS_SIZE)
    }

    fn read8(&mut self, address: usize) -> u8 {
        let mut state = self.state.lock().expect("vga state mutex poisoned");
        let local = address - GRAPHICS_BASE;
        if state.chain4() {
            let plane = local & 0x3;
            let offset = local >> 2;
            state.latches[plane] = state.planes[plane][offset];
            state.planes[plane][offset]
        } else {
            state.graphics_read(local)
        }
    }

    fn write8(&mut self, address: usize, value: u8) {
        let mut state = self.state.lock().expect("vga state mutex poisoned");
        let local = address - GRAPHICS_BASE;
        if state.chain4() {
            let plane = local & 0x3;
            let offset = local >> 2;
            state.planes[plane][offset] = value;
        } else {
            state.graphics_write(local, value);
        }
    }
}

struct TextMemory {
    state: Arc<Mutex<VgaState>>,
}

impl MemoryProvider for TextMemory {
    fn range(&self) -> (usize, usize) {
        (TEXT_BASE, TEXT_BASE + TEXT_SIZE)
    }

    fn read8(&mut self, address: usize) -> u8 {
        let state = self.state.lock().expect("vga state mutex poisoned");
        state.text[address - TEXT_BASE]
    }

    fn write8(&mut self, address: usize, value: u8) {
        let mut state = self.state.lock().expect("vga state mutex poisoned");
        state.text[address - TEXT_BASE] = value;
        state.text_dirty = true;
    }
}

struct VgaPorts {
    state: Arc<Mutex<VgaState>>,
}

impl IoDevice for VgaPorts {
    fn ports(&self) -> Vec<(u16, PortMask)> {
        vec![
            (0x3b4, PortMask::READ_WRITE),
            (0x3b5, PortMask::READ_WRITE),
            (0x3ba, PortMask::READ_WRITE),
            (0x3c0, PortMask::READ_WRITE),
            (0x3c1, PortMask::READ_ONLY),
            (0x3c2, PortMask::READ_WRITE),
            (0x3c4, PortMask::READ_WRITE),
            (0x3c5, PortMask::READ_WRITE),
            (0x3c7, PortMask::WRITE_ONLY),
            (0x3c8, PortMask::READ_WRITE),
            (0x3c9, PortMask::READ_WRITE),
            (0x3ca, PortMask::READ_ONLY),
            (0x3cc, PortMask::READ_ONLY),
            (0x3ce, PortMask::READ_WRITE),
            (0x3cf, PortMask::READ_WRITE),
            (0x3d4, PortMask::READ_WRITE),
            (0x3d5, PortMask::READ_WRITE),
            (0x3da, PortMask::READ_WRITE),
        ]
    }

    fn read8(&mut self, port: u16) -> u8 {
        let mut state = self.state.lock().expect("vga state mutex poisoned");
        match port {
            0x3b4 | 0x3d4 => state.crtc_index,
            0x3b5 | 0x3d5 => state.crtc.get(state.crtc_index as usize).copied().unwrap_or(0),
            0x3c0 => state.attr_index,
            0x3c1 => state.attribute_read(),
            0x3c2 => state.misc_output,
            0x3c4 => state.seq_index,
            0x3c5 => state.seq.get(state.seq_index as usize).copied().unwrap_or(0),
            0x3c8 => state.dac_write_index,
            0x3c9 => state.dac_read(),
            0x3ca => 0,
            0x3cc => state.misc_output,
            0x3ce => state.gc_index,
            0x3cf => state.gc.get(state.gc_index as usize).copied().unwrap_or(0),
            0x3ba | 0x3da => {
                let value = if state.status_toggle { 0x01 } else { 0x00 };
                state.status_toggle = !state.status_toggle;
                state.attr_next_is_index = true;
                value
            }
            _ => 0xff,
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        let mut state = self.state.lock().expect("vga state mutex poisoned");
        match port {
            0x3b4 | 0x3d4 => state.crtc_index = value,
            0x3b5 | 0x3d5 => {
                let index = state.crtc_index as usize;
                if index < state.crtc.len() {
                    state.crtc[index] = value;
                } else {
                    warn!(target: "vga", "CRTC index {:#04x} out of range", index);
                }
            }
            0x3c0 => state.attribute_write(value),
            0x3c2 => state.misc_output = value,
            0x3c4 => state.seq_index = value & 0x7,
            0x3c5 => {
                let index = state.seq_index as usize;
                if index < state.seq.len() {
                    state.seq[index] = value;
                } else {
                    warn!(target: "vga", "sequencer index {:#04x} out of range", index);
                }
            }
            0x3c7 => {
                state.dac_read_index = value;
                state.dac_sub_index = 0;
            }
            0x3c8 => {
                state.dac_write_index = value;
                state.dac_sub_index = 0;
            }
            0x3c9 => state.dac_write(value),
            0x3ce => state.gc_index = value & 0xf,
            0x3cf => {
                let index = state.gc_index as usize;
                if index < state.gc.len() {
                    state.gc[index] = value;
                } else {
                    warn!(target: "vga", "graphics controller index {:#04x} out of range", index);
                }
            }
            0x3ba => warn!(target: "vga", "write to 0x3BA (feature control select) ignored"),
            0x3da => {}
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dac_seeds_standard_sixteen_colors() {
        let state = VgaState::new();
        assert_eq!(state.palette()[0], (0, 0, 0));
        assert_eq!(state.palette()[7], (0x2a, 0x2a, 0x2a));
        assert_eq!(state.palette()[64], (0, 0, 0));
    }

    #[test]
    fn mode_zero_write_with_no_rotate_or_logic_stores_verbatim() {
        let (mut graphics, _text, _ports, _handle) = new_adapter();
        graphics.write8(GRAPHICS_BASE, 0xaa);
        assert_eq!(graphics.read8(GRAPHICS_BASE), 0xaa);
    }

    #[test]
    fn chain4_addressing_picks_plane_from_low_two_bits() {
        let (mut graphics, _text, mut ports, _handle) = new_adapter();
        ports.write8(0x3c4, 4); // sequencer index 4: memory mode
        ports.write8(0x3c5, 0x08); // chain-4 bit
        graphics.write8(GRAPHICS_BASE, 0x11);
        graphics.write8(GRAPHICS_BASE + 1, 0x22);
        assert_eq!(graphics.read8(GRAPHICS_BASE), 0x11);
        assert_eq!(graphics.read8(GRAPHICS_BASE + 1), 0x22);
    }

    #[test]
    fn attribute_controller_latch_resets_on_status_read() {
        let (_graphics, _text, mut ports, _handle) = new_adapter();
        ports.read8(0x3da); // forces the next 0x3C0 write to be "index"
        ports.write8(0x3c0, 0x23); // index 3, palette-source enable
        ports.write8(0x3c0, 0x17); // data
        assert_eq!(ports.read8(0x3c1), 0x17);
        assert_eq!(ports.read8(0x3c0), 0x23);
    }

    #[test]
    fn dac_write_auto_increments_after_blue_and_sets_dirty() {
        let (_graphics, _text, mut ports, handle) = new_adapter();
        ports.write8(0x3c8, 10);
        ports.write8(0x3c9, 0x3f);
        ports.write8(0x3c9, 0x00);
        ports.write8(0x3c9, 0x3f);
        assert!(handle.lock().take_palette_dirty());
        ports.write8(0x3c7, 10);
        assert_eq!(ports.read8(0x3c9), 0x3f);
    }

    #[test]
    fn text_write_marks_dirty_and_stores_verbatim() {
        let (_graphics, mut text, _ports, handle) = new_adapter();
        text.write8(TEXT_BASE, b'A');
        assert!(handle.lock().take_text_dirty());
        assert_eq!(text.read8(TEXT_BASE), b'A');
    }
}
