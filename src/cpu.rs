// The execution core: register file composition, the fetch/decode/execute
// loop, operand read/write, and interrupt/exception vectoring (spec.md
// §3-4.4, §4.8). This replaces `processor::CPU` — the struct shape (one
// register file, one set of segment caches, one EFLAGS-analog, `memory`
// owned by value rather than shared) is the teacher's, generalized from
// the 68k's single address space to x86 segmentation/paging; the
// Debugger/Disassembly/TUI half of the teacher's `processor.rs` has no
// counterpart here (out of scope) and is not carried over.

use crate::decode::{decode, Condition, Instruction, MemoryOperand, Operand};
use crate::error::CpuException;
use crate::interrupts::{Command, CommandQueue, OffsetPic, PicPort, SharedPic};
use crate::io::IoBus;
use crate::memory::PhysicalMemory;
use crate::registers::{
    ControlRegisters, DescriptorTableRegister, Flags, GpReg, GpRegisterFile, SegReg,
    SegmentRegister, SystemSegmentRegister,
};
use crate::segmentation::{self, Access};
use crate::value::Value;
use crate::width::Width;
use log::{trace, warn};

pub const MAX_INSTRUCTIONS_PER_BATCH: usize = 2048;
/// Longest possible x86 instruction encoding this decoder needs to see at
/// once (legacy prefixes + opcode + ModR/M + SIB + disp32 + imm32).
const MAX_INSTRUCTION_LENGTH: usize = 16;

pub struct Cpu {
    pub gpr: GpRegisterFile,
    pub segments: [SegmentRegister; 6],
    pub eip: u32,
    pub flags: Flags,
    pub cr: ControlRegisters,
    pub gdtr: DescriptorTableRegister,
    pub idtr: DescriptorTableRegister,
    pub ldtr: SystemSegmentRegister,
    pub tr: SystemSegmentRegister,
    pub cpl: u8,
    pub halted: bool,
    /// DR0-DR7; no breakpoint logic is wired to them, they're just storage
    /// so MOV DRx round-trips (spec.md §4.4 "System").
    pub debug_regs: [u32; 8],
    pub memory: PhysicalMemory,
    pub io: IoBus,
    pub pic: SharedPic,
    pub commands: CommandQueue,
    pub trace_enabled: bool,
}

impl Cpu {
    pub fn new(memory: PhysicalMemory) -> Self {
        let pic: SharedPic = std::rc::Rc::new(std::cell::RefCell::new(OffsetPic::new(0x20, 0x08)));
        let mut io = IoBus::new();
        io.register(Box::new(PicPort(std::rc::Rc::clone(&pic))));
        Cpu {
            gpr: GpRegisterFile::new(),
            segments: [
                SegmentRegister::new(0),
                SegmentRegister::new(0xffff), // CS: reset vector segment.
                SegmentRegister::new(0),
                SegmentRegister::new(0),
                SegmentRegister::new(0),
                SegmentRegister::new(0),
            ],
            eip: 0, // CS base 0xffff0 + IP 0 = 0xffff0, the standard reset vector.
            flags: Flags::default(),
            cr: ControlRegisters::default(),
            gdtr: DescriptorTableRegister::default(),
            idtr: DescriptorTableRegister::default(),
            ldtr: SystemSegmentRegister::default(),
            tr: SystemSegmentRegister::default(),
            cpl: 0,
            halted: false,
            debug_regs: [0; 8],
            memory,
            io,
            pic,
            commands: CommandQueue::new(),
            trace_enabled: false,
        }
    }

    pub fn segment(&self, reg: SegReg) -> &SegmentRegister {
        &self.segments[reg as usize]
    }

    pub fn set_segment(&mut self, reg: SegReg, selector: u16) {
        // Real-mode only cache synthesis; protected-mode descriptor loads
        // (with their GDT/LDT fetch and privilege checks) are out of scope
        // for this design's normative coverage and fall back to the same
        // synthesis, matching spec.md §9's partial task-switch stance on
        // depth vs. breadth.
        self.segments[reg as usize] = SegmentRegister::new(selector);
    }

    /// LTR: load TR with a selector's full cached descriptor, read out of
    /// the GDT when the selector names a TSS (spec.md §4.4 "System"); falls
    /// back to the real-mode synthesis outside protected mode or when the
    /// selector doesn't resolve, matching `set_segment`'s own fallback.
    pub(crate) fn load_tr(&mut self, selector: u16) -> Result<(), CpuException> {
        if self.cr.protected_mode() {
            let gdtr = self.gdtr;
            if let Some(raw) = segmentation::read_gdt_entry(&mut self.memory, &gdtr, selector) {
                if raw.is_tss() {
                    self.tr = SystemSegmentRegister { selector, descriptor: self.gdt_descriptor(raw) };
                    return Ok(());
                }
            }
        }
        self.tr = SystemSegmentRegister::new(selector);
        Ok(())
    }

    /// Task switch via JMP/CALL far to a TSS descriptor, or LTR (spec.md
    /// §4.9). Partial by design (§9 open question 1): saves/restores the
    /// fields `tss.rs` exposes, sets CR0.TS, and writes the backlink on a
    /// CALL-style switch; it does not model nesting depth, the I/O
    /// permission bitmap, or task gates.
    pub(crate) fn task_switch(&mut self, new_selector: u16, is_call: bool) -> Result<(), CpuException> {
        let gdtr = self.gdtr;
        let descriptor = segmentation::read_gdt_entry(&mut self.memory, &gdtr, new_selector)
            .ok_or(CpuException::GeneralProtection(new_selector))?;
        if !descriptor.is_tss() {
            return Err(CpuException::GeneralProtection(new_selector));
        }
        let new_format = descriptor.tss_format();

        let outgoing = crate::tss::TssView::new(self.tr.descriptor.base, self.tr_format());
        outgoing.set_eip(&mut self.memory, self.eip);
        outgoing.set_eflags(&mut self.memory, self.flags.0);
        for (index, reg) in
            [GpReg::Eax, GpReg::Ecx, GpReg::Edx, GpReg::Ebx, GpReg::Esp, GpReg::Ebp, GpReg::Esi, GpReg::Edi]
                .iter()
                .enumerate()
        {
            outgoing.set_general_register(&mut self.memory, index, self.gpr.read32(*reg));
        }
        for (index, seg) in [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs]
            .iter()
            .enumerate()
        {
            outgoing.set_segment_selector(&mut self.memory, index, self.segment(*seg).selector());
        }

        let incoming = crate::tss::TssView::new(descriptor.base, new_format);
        if is_call {
            incoming.set_backlink(&mut self.memory, self.tr.selector);
        }
        self.eip = incoming.eip(&mut self.memory);
        self.flags = Flags(incoming.eflags(&mut self.memory));
        for (index, reg) in
            [GpReg::Eax, GpReg::Ecx, GpReg::Edx, GpReg::Ebx, GpReg::Esp, GpReg::Ebp, GpReg::Esi, GpReg::Edi]
                .iter()
                .enumerate()
        {
            self.gpr.write32(*reg, incoming.general_register(&mut self.memory, index));
        }
        for (index, seg) in [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs]
            .iter()
            .enumerate()
        {
            self.set_segment(*seg, incoming.segment_selector(&mut self.memory, index));
        }
        self.ldtr.selector = incoming.ldtr_selector(&mut self.memory);
        if new_format == crate::tss::TssFormat::Bits32 {
            self.cr.cr3 = incoming.cr3(&mut self.memory);
        }
        if is_call {
            self.flags.set_nt(true);
        }

        self.tr = SystemSegmentRegister { selector: new_selector, descriptor: self.gdt_descriptor(descriptor) };
        self.cr.set_task_switched(true);
        Ok(())
    }

    fn tr_format(&self) -> crate::tss::TssFormat {
        if self.tr.descriptor.limit >= 103 {
            crate::tss::TssFormat::Bits32
        } else {
            crate::tss::TssFormat::Bits16
        }
    }

    fn gdt_descriptor(&self, raw: segmentation::RawDescriptor) -> crate::registers::SegmentDescriptor {
        crate::registers::SegmentDescriptor {
            selector: 0,
            base: raw.base,
            limit: raw.limit,
            granularity_4k: false,
            default_big: false,
            dpl: (raw.access >> 5) & 0x3,
            present: raw.access & 0x80 != 0,
            executable: false,
            writable_or_readable: true,
            conforming_or_expand_down: false,
            is_system: true,
        }
    }

    fn default_operand_size(&self) -> Width {
        if self.segment(SegReg::Cs).descriptor.default_big {
            Width::Dword
        } else {
            Width::Word
        }
    }

    fn address_width(&self) -> Width {
        self.default_operand_size()
    }

    /// Operand-size width `instructions.rs` needs for CBW/CWD's choice of
    /// register pair — the same rule `default_operand_size` already encodes
    /// for CS. LOOP/JCXZ/REP use the decoded `inst.address_size` instead,
    /// since the 0x67 prefix can override it per instruction.
    pub(crate) fn operand_width(&self) -> Width {
        self.default_operand_size()
    }

    pub(crate) fn stack_push_width(&self) -> Width {
        self.stack_width()
    }

    /// Runs a bounded batch of instructions, draining the command queue
    /// first (spec.md §4.12). Returns early on HLT or a command that wants
    /// to suspend the batch.
    pub fn run_batch(&mut self) {
        for command in self.commands.drain() {
            match command {
                Command::HardReboot => {
                    *self = Cpu::new(std::mem::replace(&mut self.memory, PhysicalMemory::new(0)));
                    return;
                }
                Command::EnterDebugger | Command::ExitDebugger => {
                    // The debugger/tracer UI itself is an external collaborator;
                    // the core only needs to stop advancing while one is attached.
                }
            }
        }
        if self.halted {
            return;
        }
        for _ in 0..MAX_INSTRUCTIONS_PER_BATCH {
            if self.halted {
                break;
            }
            self.step();
        }
    }

    /// Fetches, decodes and executes one instruction, then services a
    /// pending unmasked IRQ if interrupts are enabled (spec.md §4.8).
    pub fn step(&mut self) {
        match self.fetch_and_decode() {
            Ok(instruction) => {
                if self.trace_enabled {
                    trace!(target: "trace", "{:#06x}:{:#010x} {:?}", self.segment(SegReg::Cs).selector(), self.eip, instruction.mnemonic);
                }
                let start_eip = self.eip;
                self.eip = self.eip.wrapping_add(instruction.length as u32);
                if let Err(exception) = crate::instructions::execute(self, &instruction) {
                    self.eip = start_eip;
                    self.raise_exception(exception);
                }
            }
            Err(exception) => self.raise_exception(exception),
        }

        if !self.halted && self.flags.iflag() {
            let vector = self.pic.borrow_mut().highest_priority_vector();
            if let Some(vector) = vector {
                self.dispatch_interrupt(vector, None);
            }
        }
    }

    fn fetch_and_decode(&mut self) -> Result<Instruction, CpuException> {
        let cs = *self.segment(SegReg::Cs);
        let mut window = [0u8; MAX_INSTRUCTION_LENGTH];
        for (offset, slot) in window.iter_mut().enumerate() {
            let linear = cs.descriptor.base.wrapping_add(self.eip.wrapping_add(offset as u32));
            *slot = self.memory.read8(linear as usize);
        }
        decode(&window, self.default_operand_size(), self.address_width())
    }

    /// Restartable-fault/trap dispatch per spec.md §4.8: real mode pushes
    /// FLAGS/CS/IP through the IVT; this core's protected-mode support is
    /// limited to computing the same triple through the IDT rather than
    /// modelling gate descriptors in full (see spec.md §9).
    pub fn raise_exception(&mut self, exception: CpuException) {
        warn!(target: "cpu", "exception {} at {:#06x}:{:#010x}", exception, self.segment(SegReg::Cs).selector(), self.eip);
        if let CpuException::PageFault { address, .. } = exception {
            self.cr.cr2 = address;
        }
        self.dispatch_interrupt(exception.vector(), exception.error_code());
    }

    pub(crate) fn dispatch_interrupt(&mut self, vector: u8, error_code: Option<u16>) {
        let flags = self.flags.0;
        let cs = self.segment(SegReg::Cs).selector();
        let ip = self.eip;

        if !self.cr.protected_mode() {
            self.push(Value::Word(flags as u16));
            self.push(Value::Word(cs));
            self.push(Value::Word(ip as u16));
            self.flags.set_iflag(false);
            self.flags.set_tf(false);
            let ivt_entry = u32::from(vector) * 4;
            let new_ip = self.memory.read16(ivt_entry as usize);
            let new_cs = self.memory.read16((ivt_entry + 2) as usize);
            self.set_segment(SegReg::Cs, new_cs);
            self.eip = u32::from(new_ip);
            return;
        }

        let gate_offset = self.idtr.base + u32::from(vector) * 8;
        let low = self.memory.read32(gate_offset as usize);
        let high = self.memory.read32((gate_offset + 4) as usize);
        let new_offset = (low & 0xffff) | (high & 0xffff_0000);
        let new_selector = ((low >> 16) & 0xffff) as u16;
        let gate_type = (high >> 8) & 0xf;
        let is_trap_gate = gate_type == 0xf;

        self.push(Value::Dword(flags));
        self.push(Value::Word(cs));
        self.push(Value::Dword(ip));
        if let Some(code) = error_code {
            self.push(Value::Word(code));
        }
        if !is_trap_gate {
            self.flags.set_iflag(false);
        }
        self.flags.set_tf(false);
        self.set_segment(SegReg::Cs, new_selector);
        self.eip = new_offset;
    }

    fn stack_width(&self) -> Width {
        if self.segment(SegReg::Ss).descriptor.default_big {
            Width::Dword
        } else {
            Width::Word
        }
    }

    pub fn push(&mut self, value: Value) {
        let width = self.stack_width();
        let value = value.zero_extend_to(width);
        let esp = self.gpr.read32(GpReg::Esp).wrapping_sub(width as u32);
        self.gpr.write32(GpReg::Esp, esp);
        let linear = self.segment(SegReg::Ss).descriptor.base.wrapping_add(esp);
        self.memory.write(linear as usize, width, value.as_u32());
    }

    pub fn pop(&mut self, width: Width) -> Value {
        let esp = self.gpr.read32(GpReg::Esp);
        let linear = self.segment(SegReg::Ss).descriptor.base.wrapping_add(esp);
        let raw = self.memory.read(linear as usize, width);
        self.gpr.write32(GpReg::Esp, esp.wrapping_add(width as u32));
        Value::from_u32(width, raw)
    }

    /// Resolves a `seg:offset` pair to a physical address, for string
    /// instructions and other handlers that address memory without going
    /// through a decoded `MemoryOperand` (spec.md §4.4 string ops, §4.2).
    pub fn translate(&mut self, seg: SegReg, offset: u32, access: Access) -> Result<u32, CpuException> {
        let descriptor = self.segment(seg).descriptor;
        segmentation::translate(&mut self.memory, &descriptor, &self.cr, offset, access, self.cpl)
    }

    /// The segment-relative offset a `MemoryOperand` addresses, before
    /// segmentation/paging: base + scaled index + displacement. LEA reads
    /// just this; every other memory access feeds it into `operand_address`.
    pub fn effective_address(&self, mem: &MemoryOperand) -> u32 {
        let mut offset: u32 = mem.displacement as u32;
        if let Some(base) = mem.base {
            offset = offset.wrapping_add(self.gpr.read32(GpReg::from_index(base as usize)));
        }
        if let Some((index, scale)) = mem.index {
            offset = offset
                .wrapping_add(self.gpr.read32(GpReg::from_index(index as usize)).wrapping_mul(u32::from(scale)));
        }
        if mem.address_size == Width::Word {
            offset &= 0xffff;
        }
        offset
    }

    /// Resolves a `MemoryOperand` to a linear+physical address through the
    /// segmentation/paging pipeline (§4.2).
    pub fn operand_address(&mut self, mem: &MemoryOperand, access: Access) -> Result<u32, CpuException> {
        let offset = self.effective_address(mem);
        let descriptor = self.segment(mem.segment).descriptor;
        segmentation::translate(&mut self.memory, &descriptor, &self.cr, offset, access, self.cpl)
    }

    pub fn read_operand(&mut self, operand: &Operand) -> Result<Value, CpuException> {
        Ok(match *operand {
            Operand::None => Value::Dword(0),
            Operand::Register(index, Width::Byte) if index < 4 => {
                Value::Byte(self.gpr.read(GpReg::from_index(index as usize), Width::Byte).as_u32() as u8)
            }
            Operand::Register(index, Width::Byte) => self.gpr.read_high_byte(GpReg::from_index(index as usize - 4)),
            Operand::Register(index, width) => self.gpr.read(GpReg::from_index(index as usize), width),
            Operand::SegmentRegister(seg) => Value::Word(self.segment(seg).selector()),
            Operand::ControlRegister(index) => Value::Dword(self.control_register(index)),
            Operand::Memory(mem) => {
                let address = self.operand_address(&mem, Access::Read)?;
                Value::from_u32(mem.width, self.memory.read(address as usize, mem.width))
            }
            Operand::Immediate(value) => value,
            Operand::Relative(offset) => Value::Dword(offset as u32),
            Operand::Far { offset, .. } => Value::Dword(offset),
        })
    }

    pub fn write_operand(&mut self, operand: &Operand, value: Value) -> Result<(), CpuException> {
        match *operand {
            Operand::None => {}
            Operand::Register(index, Width::Byte) if index < 4 => {
                self.gpr.write(GpReg::from_index(index as usize), value)
            }
            Operand::Register(index, Width::Byte) => {
                self.gpr.write_high_byte(GpReg::from_index(index as usize - 4), value.as_u32() as u8)
            }
            Operand::Register(index, _) => self.gpr.write(GpReg::from_index(index as usize), value),
            Operand::SegmentRegister(seg) => self.set_segment(seg, value.as_u32() as u16),
            Operand::ControlRegister(index) => self.set_control_register(index, value.as_u32()),
            Operand::Memory(mem) => {
                let address = self.operand_address(&mem, Access::Write)?;
                self.memory.write(address as usize, mem.width, value.as_u32());
            }
            Operand::Immediate(_) | Operand::Relative(_) | Operand::Far { .. } => {
                unreachable!("decoder never emits these as write targets")
            }
        }
        Ok(())
    }

    fn control_register(&self, index: u8) -> u32 {
        match index {
            0 => self.cr.cr0,
            2 => self.cr.cr2,
            3 => self.cr.cr3,
            _ => 0,
        }
    }

    fn set_control_register(&mut self, index: u8, value: u32) {
        match index {
            0 => self.cr.cr0 = value,
            2 => self.cr.cr2 = value,
            3 => self.cr.cr3 = value,
            _ => {}
        }
    }

    pub fn condition_holds(&self, condition: Condition) -> bool {
        let f = &self.flags;
        match condition {
            Condition::O => f.of(),
            Condition::No => !f.of(),
            Condition::B => f.cf(),
            Condition::Ae => !f.cf(),
            Condition::E => f.zf(),
            Condition::Ne => !f.zf(),
            Condition::Be => f.cf() || f.zf(),
            Condition::A => !f.cf() && !f.zf(),
            Condition::S => f.sf(),
            Condition::Ns => !f.sf(),
            Condition::P => f.pf(),
            Condition::Np => !f.pf(),
            Condition::L => f.sf() != f.of(),
            Condition::Ge => f.sf() == f.of(),
            Condition::Le => f.zf() || (f.sf() != f.of()),
            Condition::G => !f.zf() && (f.sf() == f.of()),
        }
    }

    pub fn load_real_mode_image(&mut self, segment: u16, offset: u16, image: &[u8]) {
        let base = (u32::from(segment) << 4) + u32::from(offset);
        self.memory.load_image(base as usize, image);
        self.set_segment(SegReg::Cs, segment);
        self.eip = u32::from(offset);
    }
}
