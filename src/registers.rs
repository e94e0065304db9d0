// The register file: general registers, segment registers with their
// hidden descriptor cache, EFLAGS, and the system registers (CR0/CR2/CR3,
// GDTR/IDTR, LDTR/TR). Grounded on `processor::CPU`'s register fields
// (`pc`, `sr`, `dr`, `ar`, ...) and the bit-twiddling helpers `set_bit`/
// `get_bit` at the bottom of `processor.rs` — we keep the "named bit in a
// plain integer" approach rather than reaching for a bitfield crate,
// because that's how the teacher represents its status register.

use crate::value::Value;
use crate::width::Width;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum GpReg {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl GpReg {
    pub fn from_index(index: usize) -> Self {
        match index & 7 {
            0 => GpReg::Eax,
            1 => GpReg::Ecx,
            2 => GpReg::Edx,
            3 => GpReg::Ebx,
            4 => GpReg::Esp,
            5 => GpReg::Ebp,
            6 => GpReg::Esi,
            _ => GpReg::Edi,
        }
    }
}

/// The 8 general-purpose registers, stored as raw 32-bit words the way
/// `fields::OpResult`/`memory::MemoryHandle::write` treats a register: byte
/// and word writes patch the low bits of the full dword in place, they
/// never truncate the upper bits away.
#[derive(Debug, Default, Clone)]
pub struct GpRegisterFile {
    regs: [u32; 8],
}

impl GpRegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read32(&self, reg: GpReg) -> u32 {
        self.regs[reg as usize]
    }

    pub fn write32(&mut self, reg: GpReg, value: u32) {
        self.regs[reg as usize] = value;
    }

    pub fn read(&self, reg: GpReg, width: Width) -> Value {
        let raw = self.regs[reg as usize];
        match width {
            Width::Byte => Value::Byte(raw as u8),
            Width::Word => Value::Word(raw as u16),
            Width::Dword => Value::Dword(raw),
        }
    }

    /// Read one of the four legacy high-byte registers (AH/CH/DH/BH).
    pub fn read_high_byte(&self, reg: GpReg) -> Value {
        Value::Byte((self.regs[reg as usize] >> 8) as u8)
    }

    pub fn write_high_byte(&mut self, reg: GpReg, byte: u8) {
        let slot = &mut self.regs[reg as usize];
        *slot = (*slot & 0xffff_00ff) | (u32::from(byte) << 8);
    }

    pub fn write(&mut self, reg: GpReg, value: Value) {
        let slot = &mut self.regs[reg as usize];
        match value {
            Value::Byte(b) => *slot = (*slot & 0xffff_ff00) | u32::from(b),
            Value::Word(w) => *slot = (*slot & 0xffff_0000) | u32::from(w),
            Value::Dword(d) => *slot = d,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

/// The hidden part of a segment register: what the CPU actually uses for
/// address translation and privilege checks, cached at load time so every
/// subsequent access doesn't have to re-walk the GDT/LDT. Real-mode
/// descriptors are synthesized (base = selector << 4, limit = 0xffff).
#[derive(Debug, Copy, Clone)]
pub struct SegmentDescriptor {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub granularity_4k: bool,
    pub default_big: bool,
    pub dpl: u8,
    pub present: bool,
    pub executable: bool,
    pub writable_or_readable: bool,
    pub conforming_or_expand_down: bool,
    pub is_system: bool,
}

impl SegmentDescriptor {
    pub fn real_mode(selector: u16) -> Self {
        SegmentDescriptor {
            selector,
            base: u32::from(selector) << 4,
            limit: 0xffff,
            granularity_4k: false,
            default_big: false,
            dpl: 0,
            present: true,
            executable: false,
            writable_or_readable: true,
            conforming_or_expand_down: false,
            is_system: false,
        }
    }

    /// Effective byte limit, granularity-adjusted per spec.md §4.2.
    pub fn effective_limit(&self) -> u32 {
        if self.granularity_4k {
            (self.limit << 12) | 0xfff
        } else {
            self.limit
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct SegmentRegister {
    pub descriptor: SegmentDescriptor,
}

impl SegmentRegister {
    pub fn new(selector: u16) -> Self {
        SegmentRegister { descriptor: SegmentDescriptor::real_mode(selector) }
    }

    pub fn selector(&self) -> u16 {
        self.descriptor.selector
    }
}

/// EFLAGS, as a plain bitfield with named accessors — mirrors `CCR`/`set_bit`/
/// `get_bit` in `processor.rs`, generalized from the 68k's 5 condition bits
/// to the fuller x86 flag set named in spec.md §3.
#[derive(Debug, Copy, Clone)]
pub struct Flags(pub u32);

impl Default for Flags {
    fn default() -> Self {
        Flags(0x2) // bit 1 is always set on real hardware.
    }
}

macro_rules! flag_bit {
    ($get:ident, $set:ident, $bit:expr) => {
        pub fn $get(&self) -> bool {
            self.0 & (1 << $bit) != 0
        }
        pub fn $set(&mut self, value: bool) {
            if value {
                self.0 |= 1 << $bit;
            } else {
                self.0 &= !(1 << $bit);
            }
        }
    };
}

impl Flags {
    flag_bit!(cf, set_cf, 0);
    flag_bit!(pf, set_pf, 2);
    flag_bit!(af, set_af, 4);
    flag_bit!(zf, set_zf, 6);
    flag_bit!(sf, set_sf, 7);
    flag_bit!(tf, set_tf, 8);
    flag_bit!(iflag, set_iflag, 9);
    flag_bit!(df, set_df, 10);
    flag_bit!(of, set_of, 11);
    flag_bit!(nt, set_nt, 14);
    flag_bit!(rf, set_rf, 16);
    flag_bit!(vm, set_vm, 17);
    flag_bit!(ac, set_ac, 18);

    pub fn iopl(&self) -> u8 {
        ((self.0 >> 12) & 0x3) as u8
    }

    pub fn set_iopl(&mut self, level: u8) {
        self.0 = (self.0 & !(0x3 << 12)) | (u32::from(level & 0x3) << 12);
    }

    pub fn apply(&mut self, update: &crate::value::FlagUpdate) {
        if let Some(v) = update.cf {
            self.set_cf(v);
        }
        if let Some(v) = update.pf {
            self.set_pf(v);
        }
        if let Some(v) = update.af {
            self.set_af(v);
        }
        if let Some(v) = update.zf {
            self.set_zf(v);
        }
        if let Some(v) = update.sf {
            self.set_sf(v);
        }
        if let Some(v) = update.of {
            self.set_of(v);
        }
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct ControlRegisters {
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
}

impl ControlRegisters {
    pub fn protected_mode(&self) -> bool {
        self.cr0 & 1 != 0
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0 & (1 << 31) != 0
    }

    pub fn task_switched(&self) -> bool {
        self.cr0 & (1 << 3) != 0
    }

    pub fn set_task_switched(&mut self, value: bool) {
        if value {
            self.cr0 |= 1 << 3;
        } else {
            self.cr0 &= !(1 << 3);
        }
    }

    pub fn write_protect(&self) -> bool {
        self.cr0 & (1 << 16) != 0
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct DescriptorTableRegister {
    pub base: u32,
    pub limit: u16,
}

#[derive(Debug, Copy, Clone)]
pub struct SystemSegmentRegister {
    pub selector: u16,
    pub descriptor: SegmentDescriptor,
}

impl Default for SystemSegmentRegister {
    fn default() -> Self {
        SystemSegmentRegister { selector: 0, descriptor: SegmentDescriptor::real_mode(0) }
    }
}

impl SystemSegmentRegister {
    pub fn new(selector: u16) -> Self {
        SystemSegmentRegister { selector, descriptor: SegmentDescriptor::real_mode(selector) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_write_preserves_upper_bits() {
        let mut gpr = GpRegisterFile::new();
        gpr.write32(GpReg::Eax, 0x1234_5678);
        gpr.write(GpReg::Eax, Value::Byte(0xff));
        assert_eq!(gpr.read32(GpReg::Eax), 0x1234_56ff);
    }

    #[test]
    fn word_write_preserves_upper_word() {
        let mut gpr = GpRegisterFile::new();
        gpr.write32(GpReg::Eax, 0x1234_5678);
        gpr.write(GpReg::Eax, Value::Word(0xaaaa));
        assert_eq!(gpr.read32(GpReg::Eax), 0x1234_aaaa);
    }

    #[test]
    fn flags_roundtrip() {
        let mut f = Flags::default();
        f.set_cf(true);
        f.set_zf(true);
        assert!(f.cf());
        assert!(f.zf());
        f.set_cf(false);
        assert!(!f.cf());
        assert!(f.zf());
    }
}
