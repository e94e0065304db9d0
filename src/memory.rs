// Physical memory and the memory-provider registry (spec.md §3-4.1).
// Grounded on `memory::Bus`/`memory::RAM` in the teacher (a flat byte
// vector plus a device list scanned by range) and on
// `original_source/hw/MemoryProvider.cpp`, whose `writeMemory16`/
// `writeMemory32` compose wider accesses from the 8-bit primitive exactly
// as implemented below.

use crate::width::{weld16, weld32, Width};
use log::warn;

pub const MIN_RAM_CHUNK: usize = 16 * 1024;

/// A device that claims a physical address range and answers reads/writes
/// into it. 16/32-bit accesses default to little-endian composition of
/// 8-bit ones, the same contract `MemoryProvider::writeMemory16/32` gives
/// in the original Computron source. A provider can override the wide
/// methods (VGA's chain-4 mode does, see `vga.rs`) but most don't need to.
pub trait MemoryProvider {
    /// Half-open physical range `[start, end)` this provider claims.
    fn range(&self) -> (usize, usize);

    fn read8(&mut self, address: usize) -> u8;
    fn write8(&mut self, address: usize, value: u8);

    fn read16(&mut self, address: usize) -> u16 {
        weld16(self.read8(address + 1), self.read8(address))
    }
    fn write16(&mut self, address: usize, value: u16) {
        self.write8(address, value as u8);
        self.write8(address + 1, (value >> 8) as u8);
    }

    fn read32(&mut self, address: usize) -> u32 {
        weld32(self.read16(address + 2), self.read16(address))
    }
    fn write32(&mut self, address: usize, value: u32) {
        self.write16(address, value as u16);
        self.write16(address + 2, (value >> 16) as u16);
    }

    fn contains(&self, address: usize) -> bool {
        let (start, end) = self.range();
        address >= start && address < end
    }
}

/// BIOS data area field offsets referenced by spec.md §6. The BIOS service
/// routines themselves are out of scope; these are just named accessors
/// onto the same bytes original_source's `bios/video.c` pokes directly.
pub mod bda {
    pub const VIDEO_MODE: usize = 0x449;
    pub const COLUMNS: usize = 0x44a;
    pub const CURSOR_POSITION: usize = 0x450;
    pub const CURSOR_SCANLINES: usize = 0x460;
    pub const ROWS: usize = 0x484;
    pub const VIDEO_COMBINATION: usize = 0x48a;
}

/// Raw physical memory plus the provider registry. `read`/`write` implement
/// the three-step contract from spec.md §4.1: provider lookup, then
/// (for addresses below the RAM size) the flat array, then a logged
/// miss.
pub struct PhysicalMemory {
    ram: Vec<u8>,
    providers: Vec<Box<dyn MemoryProvider>>,
}

impl PhysicalMemory {
    /// `size` must be a multiple of 16 KiB (spec.md §3). Panics otherwise —
    /// this is a construction-time invariant, not a runtime fault.
    pub fn new(size: usize) -> Self {
        assert!(size % MIN_RAM_CHUNK == 0, "RAM size must be a multiple of 16 KiB");
        PhysicalMemory { ram: vec![0; size], providers: Vec::new() }
    }

    pub fn ram_size(&self) -> usize {
        self.ram.len()
    }

    /// Registers a provider. Ranges must not overlap an already-registered
    /// provider — spec.md §3 calls duplicate coverage of the same address
    /// a "truly impossible invariant" that aborts the process.
    pub fn register_provider(&mut self, provider: Box<dyn MemoryProvider>) {
        let (start, end) = provider.range();
        for existing in &self.providers {
            let (existing_start, existing_end) = existing.range();
            if start < existing_end && existing_start < end {
                panic!(
                    "memory-provider range {:#x}..{:#x} overlaps existing {:#x}..{:#x}",
                    start, end, existing_start, existing_end
                );
            }
        }
        self.providers.push(provider);
    }

    fn provider_for(&mut self, address: usize) -> Option<&mut Box<dyn MemoryProvider>> {
        self.providers.iter_mut().find(|p| p.contains(address))
    }

    pub fn read8(&mut self, address: usize) -> u8 {
        if let Some(provider) = self.provider_for(address) {
            return provider.read8(address);
        }
        if address < self.ram.len() {
            self.ram[address]
        } else {
            warn!(target: "memory", "read8 past end of RAM/providers at {:#x}", address);
            0xff
        }
    }

    pub fn write8(&mut self, address: usize, value: u8) {
        if let Some(provider) = self.provider_for(address) {
            provider.write8(address, value);
            return;
        }
        if address < self.ram.len() {
            self.ram[address] = value;
        } else {
            warn!(target: "memory", "write8 past end of RAM/providers at {:#x} (discarded)", address);
        }
    }

    pub fn read16(&mut self, address: usize) -> u16 {
        weld16(self.read8(address + 1), self.read8(address))
    }

    pub fn write16(&mut self, address: usize, value: u16) {
        self.write8(address, value as u8);
        self.write8(address + 1, (value >> 8) as u8);
    }

    pub fn read32(&mut self, address: usize) -> u32 {
        weld32(self.read16(address + 2), self.read16(address))
    }

    pub fn write32(&mut self, address: usize, value: u32) {
        self.write16(address, value as u16);
        self.write16(address + 2, (value >> 16) as u16);
    }

    pub fn read(&mut self, address: usize, width: Width) -> u32 {
        match width {
            Width::Byte => u32::from(self.read8(address)),
            Width::Word => u32::from(self.read16(address)),
            Width::Dword => self.read32(address),
        }
    }

    pub fn write(&mut self, address: usize, width: Width, value: u32) {
        match width {
            Width::Byte => self.write8(address, value as u8),
            Width::Word => self.write16(address, value as u16),
            Width::Dword => self.write32(address, value),
        }
    }

    pub fn load_image(&mut self, base: usize, image: &[u8]) {
        for (offset, &byte) in image.iter().enumerate() {
            self.write8(base + offset, byte);
        }
    }

    pub fn bda_cursor_position(&mut self) -> (u8, u8) {
        (self.read8(bda::CURSOR_POSITION), self.read8(bda::CURSOR_POSITION + 1))
    }

    pub fn bda_video_mode(&mut self) -> u8 {
        self.read8(bda::VIDEO_MODE)
    }

    pub fn bda_columns(&mut self) -> u8 {
        self.read8(bda::COLUMNS)
    }

    pub fn bda_rows(&mut self) -> u8 {
        self.read8(bda::ROWS)
    }

    pub fn bda_cursor_scanlines(&mut self) -> (u8, u8) {
        (self.read8(bda::CURSOR_SCANLINES), self.read8(bda::CURSOR_SCANLINES + 1))
    }

    pub fn bda_video_combination(&mut self) -> u8 {
        self.read8(bda::VIDEO_COMBINATION)
    }
}

/// Raw RAM that owns its bytes directly, for tests that want a second
/// provider-backed region without wiring up VGA.
pub struct RamProvider {
    start: usize,
    data: Vec<u8>,
}

impl RamProvider {
    pub fn new(start: usize, size: usize) -> Box<Self> {
        Box::new(RamProvider { start, data: vec![0; size] })
    }
}

impl MemoryProvider for RamProvider {
    fn range(&self) -> (usize, usize) {
        (self.start, self.start + self.data.len())
    }

    fn read8(&mut self, address: usize) -> u8 {
        self.data[address - self.start]
    }

    fn write8(&mut self, address: usize, value: u8) {
        self.data[address - self.start] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_composition_round_trips() {
        let mut mem = PhysicalMemory::new(MIN_RAM_CHUNK);
        mem.write16(0x10, 0x1234);
        assert_eq!(mem.read8(0x10), 0x34);
        assert_eq!(mem.read8(0x11), 0x12);
        assert_eq!(mem.read16(0x10), 0x1234);

        mem.write32(0x20, 0xdead_beef);
        assert_eq!(mem.read16(0x20), 0xbeef);
        assert_eq!(mem.read16(0x22), 0xdead);
        assert_eq!(mem.read32(0x20), 0xdead_beef);
    }

    #[test]
    fn unmapped_read_returns_0xff_and_write_is_discarded() {
        let mut mem = PhysicalMemory::new(MIN_RAM_CHUNK);
        assert_eq!(mem.read8(MIN_RAM_CHUNK + 100), 0xff);
        mem.write8(MIN_RAM_CHUNK + 100, 0x42); // must not panic
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn overlapping_providers_panic() {
        let mut mem = PhysicalMemory::new(MIN_RAM_CHUNK);
        mem.register_provider(RamProvider::new(0x100, 0x100));
        mem.register_provider(RamProvider::new(0x150, 0x100));
    }
}
