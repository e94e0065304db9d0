// Execute dispatch: one function per `Mnemonic`, driven off the operands
// `decode.rs` already resolved. Grounded on the same shape the teacher used
// for its `Instruction::execute` match, generalized from a fixed 68k opcode
// set to this decoder's much larger `Mnemonic` enum. Arithmetic/logic and
// their flag side effects live in `value.rs`; this module's job is wiring
// operands to those primitives and to `Cpu`'s control-flow/stack/IO surface.

use crate::cpu::Cpu;
use crate::decode::{Condition, Instruction, Mnemonic, Operand, RepPrefix};
use crate::error::CpuException;
use crate::registers::{GpReg, SegReg};
use crate::segmentation::{self, Access};
use crate::value::Value;
use crate::width::Width;

pub fn execute(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    match inst.mnemonic {
        Mnemonic::Mov | Mnemonic::MovSegment => exec_mov(cpu, inst),
        Mnemonic::Movzx => exec_movzx(cpu, inst),
        Mnemonic::Movsx => exec_movsx(cpu, inst),
        Mnemonic::Lea => exec_lea(cpu, inst),
        Mnemonic::Xchg => exec_xchg(cpu, inst),
        Mnemonic::Xlat => exec_xlat(cpu, inst),

        Mnemonic::Push => exec_push(cpu, inst),
        Mnemonic::Pop => exec_pop(cpu, inst),
        Mnemonic::Pusha => exec_pusha(cpu),
        Mnemonic::Popa => exec_popa(cpu),
        Mnemonic::Pushf => exec_pushf(cpu),
        Mnemonic::Popf => exec_popf(cpu),
        Mnemonic::Lahf => exec_lahf(cpu),
        Mnemonic::Sahf => exec_sahf(cpu),

        Mnemonic::Add => exec_binop(cpu, inst, BinOp::Add),
        Mnemonic::Adc => exec_binop(cpu, inst, BinOp::Adc),
        Mnemonic::Sub => exec_binop(cpu, inst, BinOp::Sub),
        Mnemonic::Sbb => exec_binop(cpu, inst, BinOp::Sbb),
        Mnemonic::Cmp => exec_binop(cpu, inst, BinOp::Cmp),
        Mnemonic::And => exec_binop(cpu, inst, BinOp::And),
        Mnemonic::Or => exec_binop(cpu, inst, BinOp::Or),
        Mnemonic::Xor => exec_binop(cpu, inst, BinOp::Xor),
        Mnemonic::Test => exec_binop(cpu, inst, BinOp::Test),

        Mnemonic::Inc => exec_unary(cpu, inst, UnaryOp::Inc),
        Mnemonic::Dec => exec_unary(cpu, inst, UnaryOp::Dec),
        Mnemonic::Neg => exec_unary(cpu, inst, UnaryOp::Neg),
        Mnemonic::Not => exec_unary(cpu, inst, UnaryOp::Not),

        Mnemonic::Mul => exec_mul(cpu, inst),
        Mnemonic::Imul => exec_imul(cpu, inst),
        Mnemonic::Div => exec_div(cpu, inst, false),
        Mnemonic::Idiv => exec_div(cpu, inst, true),

        Mnemonic::Aaa => exec_aaa(cpu),
        Mnemonic::Aas => exec_aas(cpu),
        Mnemonic::Aam => exec_aam(cpu, inst),
        Mnemonic::Aad => exec_aad(cpu, inst),
        Mnemonic::Daa => exec_daa(cpu),
        Mnemonic::Das => exec_das(cpu),

        Mnemonic::Rol | Mnemonic::Ror | Mnemonic::Rcl | Mnemonic::Rcr | Mnemonic::Shl
        | Mnemonic::Shr | Mnemonic::Sar => exec_shift(cpu, inst),
        Mnemonic::Shld => exec_shld(cpu, inst),
        Mnemonic::Shrd => exec_shrd(cpu, inst),

        Mnemonic::Bt => exec_bit_test(cpu, inst, BitOp::Test),
        Mnemonic::Bts => exec_bit_test(cpu, inst, BitOp::Set),
        Mnemonic::Btr => exec_bit_test(cpu, inst, BitOp::Reset),
        Mnemonic::Btc => exec_bit_test(cpu, inst, BitOp::Complement),
        Mnemonic::Bsf => exec_bsf_bsr(cpu, inst, true),
        Mnemonic::Bsr => exec_bsf_bsr(cpu, inst, false),

        Mnemonic::JmpNear => exec_jmp_near(cpu, inst),
        Mnemonic::JmpFar => exec_jmp_far(cpu, inst),
        Mnemonic::CallNear => exec_call_near(cpu, inst),
        Mnemonic::CallFar => exec_call_far(cpu, inst),
        Mnemonic::RetNear => exec_ret_near(cpu, inst),
        Mnemonic::RetFar => exec_ret_far(cpu, inst),
        Mnemonic::Jcc(condition) => exec_jcc(cpu, inst, condition),
        Mnemonic::Setcc(condition) => exec_setcc(cpu, inst, condition),
        Mnemonic::Loop => exec_loop(cpu, inst, LoopKind::Loop),
        Mnemonic::Loope => exec_loop(cpu, inst, LoopKind::Loope),
        Mnemonic::Loopne => exec_loop(cpu, inst, LoopKind::Loopne),
        Mnemonic::Jcxz => exec_jcxz(cpu, inst),

        Mnemonic::Int => exec_int(cpu, inst),
        Mnemonic::Int3 => cpu.dispatch_interrupt(3, None),
        Mnemonic::Into => exec_into(cpu),
        Mnemonic::Iret => exec_iret(cpu),

        Mnemonic::Cbw => exec_cbw(cpu),
        Mnemonic::Cwd => exec_cwd(cpu),
        Mnemonic::Salc => exec_salc(cpu),

        Mnemonic::Cld => {
            cpu.flags.set_df(false);
            Ok(())
        }
        Mnemonic::Std => {
            cpu.flags.set_df(true);
            Ok(())
        }
        Mnemonic::Cli => {
            cpu.flags.set_iflag(false);
            Ok(())
        }
        Mnemonic::Sti => {
            cpu.flags.set_iflag(true);
            Ok(())
        }
        Mnemonic::Clc => {
            cpu.flags.set_cf(false);
            Ok(())
        }
        Mnemonic::Stc => {
            cpu.flags.set_cf(true);
            Ok(())
        }
        Mnemonic::Cmc => {
            cpu.flags.set_cf(!cpu.flags.cf());
            Ok(())
        }
        Mnemonic::Nop => Ok(()),
        Mnemonic::Hlt => {
            cpu.halted = true;
            Ok(())
        }
        Mnemonic::FpuEscape => Ok(()),
        Mnemonic::Wbinvd => Ok(()),
        Mnemonic::Invlpg => Ok(()),
        Mnemonic::Clts => {
            cpu.cr.set_task_switched(false);
            Ok(())
        }

        Mnemonic::In => exec_in(cpu, inst),
        Mnemonic::Out => exec_out(cpu, inst),

        Mnemonic::Lds => exec_load_far_pointer(cpu, inst, SegReg::Ds),
        Mnemonic::Les => exec_load_far_pointer(cpu, inst, SegReg::Es),
        Mnemonic::Lfs => exec_load_far_pointer(cpu, inst, SegReg::Fs),
        Mnemonic::Lgs => exec_load_far_pointer(cpu, inst, SegReg::Gs),
        Mnemonic::Lss => exec_load_far_pointer(cpu, inst, SegReg::Ss),

        Mnemonic::Lgdt => exec_lgdt_sgdt(cpu, inst, true, true),
        Mnemonic::Sgdt => exec_lgdt_sgdt(cpu, inst, false, true),
        Mnemonic::Lidt => exec_lgdt_sgdt(cpu, inst, true, false),
        Mnemonic::Sidt => exec_lgdt_sgdt(cpu, inst, false, false),
        Mnemonic::Lldt => exec_lldt(cpu, inst),
        Mnemonic::Sldt => exec_sldt(cpu, inst),
        Mnemonic::Ltr => exec_ltr(cpu, inst),
        Mnemonic::Str => exec_str(cpu, inst),
        Mnemonic::Lmsw => exec_lmsw(cpu, inst),
        Mnemonic::Smsw => exec_smsw(cpu, inst),
        Mnemonic::MovCr => exec_mov_cr(cpu, inst),
        Mnemonic::MovDr => exec_mov_dr(cpu, inst),
        Mnemonic::Arpl => exec_arpl(cpu, inst),
        Mnemonic::Verr => exec_verr_verw(cpu, inst, Access::Read),
        Mnemonic::Verw => exec_verr_verw(cpu, inst, Access::Write),
        Mnemonic::Lar => exec_lar(cpu, inst),
        Mnemonic::Lsl => exec_lsl(cpu, inst),

        Mnemonic::Movs => exec_string_op(cpu, inst, StringOp::Movs),
        Mnemonic::Stos => exec_string_op(cpu, inst, StringOp::Stos),
        Mnemonic::Lods => exec_string_op(cpu, inst, StringOp::Lods),
        Mnemonic::Cmps => exec_string_op(cpu, inst, StringOp::Cmps),
        Mnemonic::Scas => exec_string_op(cpu, inst, StringOp::Scas),
        Mnemonic::Ins => exec_string_op(cpu, inst, StringOp::Ins),
        Mnemonic::Outs => exec_string_op(cpu, inst, StringOp::Outs),
    }
}

// ---------------------------------------------------------------------
// data movement
// ---------------------------------------------------------------------

fn exec_mov(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let value = cpu.read_operand(&inst.src)?;
    let value = value.zero_extend_to(inst.dst.width());
    cpu.write_operand(&inst.dst, value)
}

fn exec_movzx(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let value = cpu.read_operand(&inst.src)?;
    let value = value.zero_extend_to(inst.dst.width());
    cpu.write_operand(&inst.dst, value)
}

fn exec_movsx(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let value = cpu.read_operand(&inst.src)?;
    let value = value.sign_extend_to(inst.dst.width());
    cpu.write_operand(&inst.dst, value)
}

fn exec_lea(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let address = match &inst.src {
        Operand::Memory(mem) => cpu.effective_address(mem),
        _ => return Err(CpuException::InvalidOpcode),
    };
    let value = Value::from_u32(inst.dst.width(), address);
    cpu.write_operand(&inst.dst, value)
}

fn exec_xchg(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let a = cpu.read_operand(&inst.dst)?;
    let b = cpu.read_operand(&inst.src)?;
    cpu.write_operand(&inst.dst, b)?;
    cpu.write_operand(&inst.src, a)
}

fn exec_xlat(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let _ = inst;
    let al = cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32();
    let bx = cpu.gpr.read32(GpReg::Ebx);
    let offset = bx.wrapping_add(al);
    let address = cpu.translate(SegReg::Ds, offset, Access::Read)?;
    let value = cpu.memory.read8(address as usize);
    cpu.gpr.write(GpReg::Eax, Value::Byte(value));
    Ok(())
}

// ---------------------------------------------------------------------
// stack
// ---------------------------------------------------------------------

fn exec_push(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let value = cpu.read_operand(&inst.dst)?;
    cpu.push(value);
    Ok(())
}

fn exec_pop(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let width = inst.dst.width();
    let value = cpu.pop(width);
    cpu.write_operand(&inst.dst, value)
}

fn exec_pusha(cpu: &mut Cpu) -> Result<(), CpuException> {
    let width = cpu.stack_push_width();
    let order = [
        GpReg::Eax,
        GpReg::Ecx,
        GpReg::Edx,
        GpReg::Ebx,
        GpReg::Esp,
        GpReg::Ebp,
        GpReg::Esi,
        GpReg::Edi,
    ];
    let esp_before = cpu.gpr.read32(GpReg::Esp);
    for reg in order {
        let value = if reg == GpReg::Esp {
            Value::from_u32(width, esp_before)
        } else {
            cpu.gpr.read(reg, width)
        };
        cpu.push(value);
    }
    Ok(())
}

fn exec_popa(cpu: &mut Cpu) -> Result<(), CpuException> {
    let width = cpu.stack_push_width();
    let order = [
        GpReg::Edi,
        GpReg::Esi,
        GpReg::Ebp,
        GpReg::Esp, // discarded
        GpReg::Ebx,
        GpReg::Edx,
        GpReg::Ecx,
        GpReg::Eax,
    ];
    for reg in order {
        let value = cpu.pop(width);
        if reg != GpReg::Esp {
            cpu.gpr.write(reg, value);
        }
    }
    Ok(())
}

fn exec_pushf(cpu: &mut Cpu) -> Result<(), CpuException> {
    let width = cpu.stack_push_width();
    cpu.push(Value::from_u32(width, cpu.flags.0));
    Ok(())
}

fn exec_popf(cpu: &mut Cpu) -> Result<(), CpuException> {
    let width = cpu.stack_push_width();
    let value = cpu.pop(width);
    let mask = if cpu.cpl == 0 { 0x00fc_ffff } else { 0x00fc_ffff & !(3 << 12) };
    cpu.flags.0 = (cpu.flags.0 & !mask) | (value.as_u32() & mask) | 0x2;
    Ok(())
}

fn exec_lahf(cpu: &mut Cpu) -> Result<(), CpuException> {
    let byte = (cpu.flags.0 & 0xff) as u8;
    cpu.gpr.write_high_byte(GpReg::Eax, byte);
    Ok(())
}

fn exec_sahf(cpu: &mut Cpu) -> Result<(), CpuException> {
    let byte = cpu.gpr.read_high_byte(GpReg::Eax);
    cpu.flags.0 = (cpu.flags.0 & !0xff) | u32::from(byte) | 0x2;
    Ok(())
}

// ---------------------------------------------------------------------
// arithmetic / logic
// ---------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BinOp {
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    And,
    Or,
    Xor,
    Test,
}

fn exec_binop(cpu: &mut Cpu, inst: &Instruction, op: BinOp) -> Result<(), CpuException> {
    let dest = cpu.read_operand(&inst.dst)?;
    let src = cpu.read_operand(&inst.src)?.zero_extend_to(dest.width());
    let (result, update) = match op {
        BinOp::Add => dest.add(src, false),
        BinOp::Adc => dest.add(src, cpu.flags.cf()),
        BinOp::Sub | BinOp::Cmp => dest.sub(src, false),
        BinOp::Sbb => dest.sub(src, cpu.flags.cf()),
        BinOp::And | BinOp::Test => dest.and(src),
        BinOp::Or => dest.or(src),
        BinOp::Xor => dest.xor(src),
    };
    cpu.flags.apply(&update);
    match op {
        BinOp::Cmp | BinOp::Test => Ok(()),
        _ => cpu.write_operand(&inst.dst, result),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum UnaryOp {
    Inc,
    Dec,
    Neg,
    Not,
}

fn exec_unary(cpu: &mut Cpu, inst: &Instruction, op: UnaryOp) -> Result<(), CpuException> {
    let dest = cpu.read_operand(&inst.dst)?;
    let result = match op {
        UnaryOp::Inc => {
            let (result, update) = dest.inc();
            cpu.flags.apply(&update);
            result
        }
        UnaryOp::Dec => {
            let (result, update) = dest.dec();
            cpu.flags.apply(&update);
            result
        }
        UnaryOp::Neg => {
            let (result, update) = dest.neg();
            cpu.flags.apply(&update);
            result
        }
        UnaryOp::Not => dest.not(),
    };
    cpu.write_operand(&inst.dst, result)
}

fn exec_mul(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let src = cpu.read_operand(&inst.dst)?;
    match src.width() {
        Width::Byte => {
            let al = cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32();
            let product = al * src.as_u32();
            cpu.gpr.write(GpReg::Eax, Value::Word(product as u16));
            let overflow = product > 0xff;
            set_mul_flags(cpu, overflow);
        }
        Width::Word => {
            let ax = cpu.gpr.read(GpReg::Eax, Width::Word).as_u32();
            let product = ax * src.as_u32();
            cpu.gpr.write(GpReg::Eax, Value::Word(product as u16));
            cpu.gpr.write(GpReg::Edx, Value::Word((product >> 16) as u16));
            set_mul_flags(cpu, product > 0xffff);
        }
        Width::Dword => {
            let eax = cpu.gpr.read32(GpReg::Eax) as u64;
            let product = eax * u64::from(src.as_u32());
            cpu.gpr.write32(GpReg::Eax, product as u32);
            cpu.gpr.write32(GpReg::Edx, (product >> 32) as u32);
            set_mul_flags(cpu, product > 0xffff_ffff);
        }
    }
    Ok(())
}

fn set_mul_flags(cpu: &mut Cpu, overflow: bool) {
    cpu.flags.set_cf(overflow);
    cpu.flags.set_of(overflow);
}

fn exec_imul(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    match &inst.third {
        Operand::None => match &inst.src {
            Operand::None => {
                let src = cpu.read_operand(&inst.dst)?;
                store_imul_one_operand(cpu, src)
            }
            _ => {
                let dest = cpu.read_operand(&inst.dst)?;
                let src = cpu.read_operand(&inst.src)?;
                let (result, overflow) = imul_two(dest, src);
                cpu.write_operand(&inst.dst, result)?;
                set_mul_flags(cpu, overflow);
                Ok(())
            }
        },
        third => {
            let src = cpu.read_operand(&inst.src)?;
            let imm = cpu.read_operand(third)?;
            let (result, overflow) = imul_two(src, imm.sign_extend_to(src.width()));
            cpu.write_operand(&inst.dst, result)?;
            set_mul_flags(cpu, overflow);
            Ok(())
        }
    }
}

fn imul_two(a: Value, b: Value) -> (Value, bool) {
    let width = a.width();
    let product = i64::from(a.sign_extend_to_i32()) * i64::from(b.sign_extend_to_i32());
    let result = Value::from_u32(width, product as u32);
    let overflow = product != i64::from(result.sign_extend_to_i32());
    (result, overflow)
}

fn store_imul_one_operand(cpu: &mut Cpu, src: Value) -> Result<(), CpuException> {
    match src.width() {
        Width::Byte => {
            let al = cpu.gpr.read(GpReg::Eax, Width::Byte).sign_extend_to_i32();
            let product = al * i32::from(src.as_u32() as i8);
            cpu.gpr.write(GpReg::Eax, Value::Word(product as u16));
            let overflow = product != i32::from(product as i8);
            set_mul_flags(cpu, overflow);
        }
        Width::Word => {
            let ax = cpu.gpr.read(GpReg::Eax, Width::Word).sign_extend_to_i32();
            let product = ax * i32::from(src.as_u32() as i16);
            cpu.gpr.write(GpReg::Eax, Value::Word(product as u16));
            cpu.gpr.write(GpReg::Edx, Value::Word((product >> 16) as u16));
            let overflow = product != i32::from(product as i16);
            set_mul_flags(cpu, overflow);
        }
        Width::Dword => {
            let eax = cpu.gpr.read32(GpReg::Eax) as i32 as i64;
            let product = eax * (src.as_u32() as i32 as i64);
            cpu.gpr.write32(GpReg::Eax, product as u32);
            cpu.gpr.write32(GpReg::Edx, (product >> 32) as u32);
            let overflow = product != (product as i32 as i64);
            set_mul_flags(cpu, overflow);
        }
    }
    Ok(())
}

fn exec_div(cpu: &mut Cpu, inst: &Instruction, signed: bool) -> Result<(), CpuException> {
    let divisor = cpu.read_operand(&inst.dst)?;
    if divisor.as_u32() == 0 {
        return Err(CpuException::DivideError);
    }
    match divisor.width() {
        Width::Byte => {
            let ax = cpu.gpr.read(GpReg::Eax, Width::Word).as_u32();
            if signed {
                let dividend = ax as i16 as i32;
                let d = divisor.as_u32() as i8 as i32;
                let q = dividend / d;
                let r = dividend % d;
                if q < i32::from(i8::MIN) || q > i32::from(i8::MAX) {
                    return Err(CpuException::DivideError);
                }
                cpu.gpr.write(GpReg::Eax, Value::Byte(q as u8));
                cpu.gpr.write_high_byte(GpReg::Eax, r as u8);
            } else {
                let d = divisor.as_u32();
                let q = ax / d;
                let r = ax % d;
                if q > 0xff {
                    return Err(CpuException::DivideError);
                }
                cpu.gpr.write(GpReg::Eax, Value::Byte(q as u8));
                cpu.gpr.write_high_byte(GpReg::Eax, r as u8);
            }
        }
        Width::Word => {
            let dividend = crate::width::weld16(
                cpu.gpr.read(GpReg::Edx, Width::Word).as_u32() as u16,
                cpu.gpr.read(GpReg::Eax, Width::Word).as_u32() as u16,
            );
            if signed {
                let dividend = dividend as i32;
                let d = divisor.as_u32() as i16 as i32;
                let q = dividend / d;
                let r = dividend % d;
                if q < i32::from(i16::MIN) || q > i32::from(i16::MAX) {
                    return Err(CpuException::DivideError);
                }
                cpu.gpr.write(GpReg::Eax, Value::Word(q as u16));
                cpu.gpr.write(GpReg::Edx, Value::Word(r as u16));
            } else {
                let d = divisor.as_u32();
                let q = dividend / d;
                let r = dividend % d;
                if q > 0xffff {
                    return Err(CpuException::DivideError);
                }
                cpu.gpr.write(GpReg::Eax, Value::Word(q as u16));
                cpu.gpr.write(GpReg::Edx, Value::Word(r as u16));
            }
        }
        Width::Dword => {
            let dividend = crate::width::weld32(
                cpu.gpr.read32(GpReg::Edx),
                cpu.gpr.read32(GpReg::Eax),
            );
            if signed {
                let dividend = dividend as i64;
                let d = divisor.as_u32() as i32 as i64;
                let q = dividend / d;
                let r = dividend % d;
                if q < i64::from(i32::MIN) || q > i64::from(i32::MAX) {
                    return Err(CpuException::DivideError);
                }
                cpu.gpr.write32(GpReg::Eax, q as u32);
                cpu.gpr.write32(GpReg::Edx, r as u32);
            } else {
                let d = u64::from(divisor.as_u32());
                let q = dividend / d;
                let r = dividend % d;
                if q > 0xffff_ffff {
                    return Err(CpuException::DivideError);
                }
                cpu.gpr.write32(GpReg::Eax, q as u32);
                cpu.gpr.write32(GpReg::Edx, r as u32);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// BCD
// ---------------------------------------------------------------------

fn exec_aaa(cpu: &mut Cpu) -> Result<(), CpuException> {
    let al = cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32() as u8;
    let ah = cpu.gpr.read_high_byte(GpReg::Eax);
    if (al & 0x0f) > 9 || cpu.flags.af() {
        cpu.gpr.write(GpReg::Eax, Value::Byte(al.wrapping_add(6) & 0x0f));
        cpu.gpr.write_high_byte(GpReg::Eax, ah.wrapping_add(1));
        cpu.flags.set_af(true);
        cpu.flags.set_cf(true);
    } else {
        cpu.gpr.write(GpReg::Eax, Value::Byte(al & 0x0f));
        cpu.flags.set_af(false);
        cpu.flags.set_cf(false);
    }
    Ok(())
}

fn exec_aas(cpu: &mut Cpu) -> Result<(), CpuException> {
    let al = cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32() as u8;
    let ah = cpu.gpr.read_high_byte(GpReg::Eax);
    if (al & 0x0f) > 9 || cpu.flags.af() {
        cpu.gpr.write(GpReg::Eax, Value::Byte(al.wrapping_sub(6) & 0x0f));
        cpu.gpr.write_high_byte(GpReg::Eax, ah.wrapping_sub(1));
        cpu.flags.set_af(true);
        cpu.flags.set_cf(true);
    } else {
        cpu.gpr.write(GpReg::Eax, Value::Byte(al & 0x0f));
        cpu.flags.set_af(false);
        cpu.flags.set_cf(false);
    }
    Ok(())
}

fn exec_aam(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let base = match &inst.dst {
        Operand::Immediate(value) => value.as_u32() as u8,
        _ => 10,
    };
    let al = cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32() as u8;
    if base == 0 {
        return Err(CpuException::DivideError);
    }
    let ah = al / base;
    let al = al % base;
    cpu.gpr.write_high_byte(GpReg::Eax, ah);
    cpu.gpr.write(GpReg::Eax, Value::Byte(al));
    set_logical_flags_u8(cpu, al);
    Ok(())
}

fn exec_aad(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let base = match &inst.dst {
        Operand::Immediate(value) => value.as_u32() as u8,
        _ => 10,
    };
    let al = cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32() as u8;
    let ah = cpu.gpr.read_high_byte(GpReg::Eax);
    let result = al.wrapping_add(ah.wrapping_mul(base));
    cpu.gpr.write(GpReg::Eax, Value::Byte(result));
    cpu.gpr.write_high_byte(GpReg::Eax, 0);
    set_logical_flags_u8(cpu, result);
    Ok(())
}

fn set_logical_flags_u8(cpu: &mut Cpu, value: u8) {
    cpu.flags.set_cf(false);
    cpu.flags.set_of(false);
    cpu.flags.set_zf(value == 0);
    cpu.flags.set_sf(value & 0x80 != 0);
    cpu.flags.set_pf(crate::width::parity_even(u32::from(value)));
}

fn exec_daa(cpu: &mut Cpu) -> Result<(), CpuException> {
    let mut al = cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32() as u8;
    let old_al = al;
    let old_cf = cpu.flags.cf();
    let mut cf = false;
    if (al & 0x0f) > 9 || cpu.flags.af() {
        cf = old_cf || al > 0xf9;
        al = al.wrapping_add(6);
        cpu.flags.set_af(true);
    } else {
        cpu.flags.set_af(false);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        cf = true;
    }
    cpu.flags.set_cf(cf);
    cpu.gpr.write(GpReg::Eax, Value::Byte(al));
    set_logical_flags_u8(cpu, al);
    Ok(())
}

fn exec_das(cpu: &mut Cpu) -> Result<(), CpuException> {
    let mut al = cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32() as u8;
    let old_al = al;
    let old_cf = cpu.flags.cf();
    let mut cf = false;
    if (al & 0x0f) > 9 || cpu.flags.af() {
        cf = old_cf || al < 6;
        al = al.wrapping_sub(6);
        cpu.flags.set_af(true);
    } else {
        cpu.flags.set_af(false);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        cf = true;
    }
    cpu.flags.set_cf(cf);
    cpu.gpr.write(GpReg::Eax, Value::Byte(al));
    set_logical_flags_u8(cpu, al);
    Ok(())
}

// ---------------------------------------------------------------------
// shifts / rotates
// ---------------------------------------------------------------------

fn exec_shift(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let dest = cpu.read_operand(&inst.dst)?;
    let count = (cpu.read_operand(&inst.src)?.as_u32() & 0x1f) as u8;
    let (result, update) = match inst.mnemonic {
        Mnemonic::Rol => dest.rol(count),
        Mnemonic::Ror => dest.ror(count),
        Mnemonic::Rcl => dest.rcl(count, cpu.flags.cf()),
        Mnemonic::Rcr => dest.rcr(count, cpu.flags.cf()),
        Mnemonic::Shl => dest.shl(count),
        Mnemonic::Shr => dest.shr(count),
        Mnemonic::Sar => dest.sar(count),
        _ => unreachable!(),
    };
    cpu.flags.apply(&update);
    cpu.write_operand(&inst.dst, result)
}

fn exec_shld(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let dest = cpu.read_operand(&inst.dst)?;
    let src = cpu.read_operand(&inst.src)?;
    let count = (cpu.read_operand(&inst.third)?.as_u32() & 0x1f) as u8;
    let (result, update) = dest.shld(src, count);
    cpu.flags.apply(&update);
    cpu.write_operand(&inst.dst, result)
}

fn exec_shrd(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let dest = cpu.read_operand(&inst.dst)?;
    let src = cpu.read_operand(&inst.src)?;
    let count = (cpu.read_operand(&inst.third)?.as_u32() & 0x1f) as u8;
    let (result, update) = dest.shrd(src, count);
    cpu.flags.apply(&update);
    cpu.write_operand(&inst.dst, result)
}

// ---------------------------------------------------------------------
// bit instructions
// ---------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

fn exec_bit_test(cpu: &mut Cpu, inst: &Instruction, op: BitOp) -> Result<(), CpuException> {
    let bit_index = cpu.read_operand(&inst.src)?.as_u32();
    match &inst.dst {
        Operand::Register(_, width) => {
            let width = *width;
            let value = cpu.read_operand(&inst.dst)?.as_u32();
            let bit = bit_index % width.bits();
            let was_set = value & (1 << bit) != 0;
            cpu.flags.set_cf(was_set);
            let new_value = apply_bit_op(value, bit, was_set, op);
            cpu.write_operand(&inst.dst, Value::from_u32(width, new_value))
        }
        Operand::Memory(mem) => {
            let byte_offset = (bit_index / 8) as i32;
            let bit_in_byte = bit_index % 8;
            let mut addressed = mem.clone();
            addressed.displacement = addressed.displacement.wrapping_add(byte_offset);
            addressed.width = Width::Byte;
            let address = cpu.operand_address(&addressed, Access::Write)?;
            let byte = cpu.memory.read8(address as usize);
            let was_set = byte & (1 << bit_in_byte) != 0;
            cpu.flags.set_cf(was_set);
            let new_byte = apply_bit_op_u8(byte, bit_in_byte, was_set, op);
            if new_byte != byte {
                cpu.memory.write8(address as usize, new_byte);
            }
            Ok(())
        }
        _ => Err(CpuException::InvalidOpcode),
    }
}

fn apply_bit_op(value: u32, bit: u32, was_set: bool, op: BitOp) -> u32 {
    match op {
        BitOp::Test => value,
        BitOp::Set => value | (1 << bit),
        BitOp::Reset => value & !(1 << bit),
        BitOp::Complement => {
            if was_set {
                value & !(1 << bit)
            } else {
                value | (1 << bit)
            }
        }
    }
}

fn apply_bit_op_u8(value: u8, bit: u32, was_set: bool, op: BitOp) -> u8 {
    match op {
        BitOp::Test => value,
        BitOp::Set => value | (1 << bit),
        BitOp::Reset => value & !(1 << bit),
        BitOp::Complement => {
            if was_set {
                value & !(1 << bit)
            } else {
                value | (1 << bit)
            }
        }
    }
}

fn exec_bsf_bsr(cpu: &mut Cpu, inst: &Instruction, forward: bool) -> Result<(), CpuException> {
    let src = cpu.read_operand(&inst.src)?;
    let (result, zero) = if forward { src.bsf() } else { src.bsr() };
    cpu.flags.set_zf(zero);
    if !zero {
        cpu.write_operand(&inst.dst, result)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// control flow
// ---------------------------------------------------------------------

fn exec_jmp_near(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let target = jump_target(cpu, &inst.dst)?;
    cpu.eip = target;
    Ok(())
}

fn jump_target(cpu: &mut Cpu, operand: &Operand) -> Result<u32, CpuException> {
    match operand {
        Operand::Relative(delta) => Ok(cpu.eip.wrapping_add(*delta as u32)),
        _ => Ok(cpu.read_operand(operand)?.as_u32()),
    }
}

fn exec_jmp_far(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let (selector, offset) = far_operand(cpu, &inst.dst)?;
    if targets_tss(cpu, selector) {
        return cpu.task_switch(selector, false);
    }
    cpu.set_segment(SegReg::Cs, selector);
    cpu.eip = offset;
    Ok(())
}

/// True when `selector` names a TSS descriptor in the GDT, the trigger for
/// a task switch on a far JMP/CALL (spec.md §4.9). Always false in real
/// mode or when the selector doesn't resolve, so ordinary far jumps/calls
/// are unaffected.
fn targets_tss(cpu: &mut Cpu, selector: u16) -> bool {
    if !cpu.cr.protected_mode() {
        return false;
    }
    let gdtr = cpu.gdtr;
    segmentation::read_gdt_entry(&mut cpu.memory, &gdtr, selector).map_or(false, |d| d.is_tss())
}

fn far_operand(cpu: &mut Cpu, operand: &Operand) -> Result<(u16, u32), CpuException> {
    match operand {
        Operand::Far { selector, offset } => Ok((*selector, *offset)),
        Operand::Memory(mem) => {
            let address = cpu.operand_address(mem, Access::Read)?;
            let offset = cpu.memory.read(address as usize, mem.width);
            let selector = cpu.memory.read16((address as usize) + mem.width as usize);
            Ok((selector, offset))
        }
        _ => Err(CpuException::InvalidOpcode),
    }
}

fn exec_call_near(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let target = jump_target(cpu, &inst.dst)?;
    let width = cpu.stack_push_width();
    cpu.push(Value::from_u32(width, cpu.eip));
    cpu.eip = target;
    Ok(())
}

fn exec_call_far(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let (selector, offset) = far_operand(cpu, &inst.dst)?;
    if targets_tss(cpu, selector) {
        return cpu.task_switch(selector, true);
    }
    let width = cpu.stack_push_width();
    cpu.push(Value::from_u32(width, u32::from(cpu.segment(SegReg::Cs).selector())));
    cpu.push(Value::from_u32(width, cpu.eip));
    cpu.set_segment(SegReg::Cs, selector);
    cpu.eip = offset;
    Ok(())
}

fn exec_ret_near(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let width = cpu.stack_push_width();
    let target = cpu.pop(width).as_u32();
    cpu.eip = target;
    if let Operand::Immediate(imm) = &inst.dst {
        let esp = cpu.gpr.read32(GpReg::Esp);
        cpu.gpr.write32(GpReg::Esp, esp.wrapping_add(imm.as_u32()));
    }
    Ok(())
}

fn exec_ret_far(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let width = cpu.stack_push_width();
    let offset = cpu.pop(width).as_u32();
    let selector = cpu.pop(width).as_u32() as u16;
    cpu.eip = offset;
    cpu.set_segment(SegReg::Cs, selector);
    if let Operand::Immediate(imm) = &inst.dst {
        let esp = cpu.gpr.read32(GpReg::Esp);
        cpu.gpr.write32(GpReg::Esp, esp.wrapping_add(imm.as_u32()));
    }
    Ok(())
}

fn exec_jcc(cpu: &mut Cpu, inst: &Instruction, condition: Condition) -> Result<(), CpuException> {
    if cpu.condition_holds(condition) {
        let target = jump_target(cpu, &inst.dst)?;
        cpu.eip = target;
    }
    Ok(())
}

fn exec_setcc(cpu: &mut Cpu, inst: &Instruction, condition: Condition) -> Result<(), CpuException> {
    let value = if cpu.condition_holds(condition) { 1u8 } else { 0u8 };
    cpu.write_operand(&inst.dst, Value::Byte(value))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LoopKind {
    Loop,
    Loope,
    Loopne,
}

fn exec_loop(cpu: &mut Cpu, inst: &Instruction, kind: LoopKind) -> Result<(), CpuException> {
    let width = inst.address_size;
    let count = cpu.gpr.read(GpReg::Ecx, width).as_u32().wrapping_sub(1);
    cpu.gpr.write(GpReg::Ecx, Value::from_u32(width, count));
    let take = match kind {
        LoopKind::Loop => count != 0,
        LoopKind::Loope => count != 0 && cpu.flags.zf(),
        LoopKind::Loopne => count != 0 && !cpu.flags.zf(),
    };
    if take {
        let target = jump_target(cpu, &inst.dst)?;
        cpu.eip = target;
    }
    Ok(())
}

fn exec_jcxz(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let width = inst.address_size;
    let count = cpu.gpr.read(GpReg::Ecx, width).as_u32();
    if count == 0 {
        let target = jump_target(cpu, &inst.dst)?;
        cpu.eip = target;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// interrupts
// ---------------------------------------------------------------------

fn exec_int(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let vector = match &inst.dst {
        Operand::Immediate(value) => value.as_u32() as u8,
        _ => return Err(CpuException::InvalidOpcode),
    };
    cpu.dispatch_interrupt(vector, None)
}

fn exec_into(cpu: &mut Cpu) -> Result<(), CpuException> {
    if cpu.flags.of() {
        cpu.dispatch_interrupt(4, None)
    } else {
        Ok(())
    }
}

fn exec_iret(cpu: &mut Cpu) -> Result<(), CpuException> {
    let width = cpu.stack_push_width();
    let offset = cpu.pop(width).as_u32();
    let selector = cpu.pop(width).as_u32() as u16;
    let flags = cpu.pop(width).as_u32();
    cpu.eip = offset;
    cpu.set_segment(SegReg::Cs, selector);
    cpu.flags.0 = flags | 0x2;
    Ok(())
}

// ---------------------------------------------------------------------
// sign/zero extension helpers, misc
// ---------------------------------------------------------------------

fn exec_cbw(cpu: &mut Cpu) -> Result<(), CpuException> {
    match cpu.operand_width() {
        Width::Word | Width::Byte => {
            let al = cpu.gpr.read(GpReg::Eax, Width::Byte).sign_extend_to_i32();
            cpu.gpr.write(GpReg::Eax, Value::Word(al as u16));
        }
        Width::Dword => {
            let ax = cpu.gpr.read(GpReg::Eax, Width::Word).sign_extend_to_i32();
            cpu.gpr.write32(GpReg::Eax, ax as u32);
        }
    }
    Ok(())
}

fn exec_cwd(cpu: &mut Cpu) -> Result<(), CpuException> {
    match cpu.operand_width() {
        Width::Word | Width::Byte => {
            let ax = cpu.gpr.read(GpReg::Eax, Width::Word).sign_extend_to_i32();
            let dx = if ax < 0 { 0xffffu16 } else { 0 };
            cpu.gpr.write(GpReg::Edx, Value::Word(dx));
        }
        Width::Dword => {
            let eax = cpu.gpr.read32(GpReg::Eax) as i32;
            let edx = if eax < 0 { 0xffff_ffffu32 } else { 0 };
            cpu.gpr.write32(GpReg::Edx, edx);
        }
    }
    Ok(())
}

fn exec_salc(cpu: &mut Cpu) -> Result<(), CpuException> {
    let value = if cpu.flags.cf() { 0xffu8 } else { 0 };
    cpu.gpr.write(GpReg::Eax, Value::Byte(value));
    Ok(())
}

// ---------------------------------------------------------------------
// port IO
// ---------------------------------------------------------------------

fn exec_in(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let port = cpu.read_operand(&inst.src)?.as_u32() as u16;
    let width = inst.dst.width();
    let value = cpu.io.read(port, width);
    cpu.write_operand(&inst.dst, Value::from_u32(width, value))
}

fn exec_out(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let port = cpu.read_operand(&inst.dst)?.as_u32() as u16;
    let value = cpu.read_operand(&inst.src)?;
    cpu.io.write(port, value.width(), value.as_u32());
    Ok(())
}

// ---------------------------------------------------------------------
// segment and descriptor-table instructions
// ---------------------------------------------------------------------

fn exec_load_far_pointer(cpu: &mut Cpu, inst: &Instruction, target: SegReg) -> Result<(), CpuException> {
    let mem = match &inst.src {
        Operand::Memory(mem) => mem.clone(),
        _ => return Err(CpuException::InvalidOpcode),
    };
    let address = cpu.operand_address(&mem, Access::Read)?;
    let offset = cpu.memory.read(address as usize, mem.width);
    let selector = cpu.memory.read16((address as usize) + mem.width as usize);
    cpu.write_operand(&inst.dst, Value::from_u32(mem.width, offset))?;
    cpu.set_segment(target, selector);
    Ok(())
}

fn exec_lgdt_sgdt(cpu: &mut Cpu, inst: &Instruction, load: bool, gdt: bool) -> Result<(), CpuException> {
    let mem = match &inst.dst {
        Operand::Memory(mem) => mem.clone(),
        _ => return Err(CpuException::InvalidOpcode),
    };
    let address = cpu.operand_address(&mem, if load { Access::Read } else { Access::Write })?;
    if load {
        let limit = cpu.memory.read16(address as usize);
        let base = cpu.memory.read32((address as usize) + 2);
        let register = crate::registers::DescriptorTableRegister { base, limit };
        if gdt {
            cpu.gdtr = register;
        } else {
            cpu.idtr = register;
        }
    } else {
        let register = if gdt { cpu.gdtr } else { cpu.idtr };
        cpu.memory.write16(address as usize, register.limit);
        cpu.memory.write32((address as usize) + 2, register.base);
    }
    Ok(())
}

fn exec_lldt(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let selector = cpu.read_operand(&inst.dst)?.as_u32() as u16;
    cpu.ldtr = crate::registers::SystemSegmentRegister::new(selector);
    Ok(())
}

fn exec_sldt(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let value = Value::from_u32(inst.dst.width(), u32::from(cpu.ldtr.selector()));
    cpu.write_operand(&inst.dst, value)
}

fn exec_ltr(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let selector = cpu.read_operand(&inst.dst)?.as_u32() as u16;
    cpu.load_tr(selector)?;
    Ok(())
}

fn exec_str(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let value = Value::from_u32(inst.dst.width(), u32::from(cpu.tr.selector()));
    cpu.write_operand(&inst.dst, value)
}

fn exec_lmsw(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let value = cpu.read_operand(&inst.dst)?.as_u32() & 0xffff;
    cpu.cr.cr0 = (cpu.cr.cr0 & !0xffff) | value;
    Ok(())
}

fn exec_smsw(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let value = Value::from_u32(inst.dst.width(), cpu.cr.cr0 & 0xffff);
    cpu.write_operand(&inst.dst, value)
}

fn exec_mov_cr(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let to_register = matches!(inst.dst, Operand::ControlRegister(_));
    if to_register {
        let index = match inst.dst {
            Operand::ControlRegister(index) => index,
            _ => unreachable!(),
        };
        let value = cpu.read_operand(&inst.src)?.as_u32();
        match index {
            0 => cpu.cr.cr0 = value,
            2 => cpu.cr.cr2 = value,
            3 => cpu.cr.cr3 = value,
            _ => {}
        }
        Ok(())
    } else {
        let index = match inst.src {
            Operand::ControlRegister(index) => index,
            _ => return Err(CpuException::InvalidOpcode),
        };
        let value = match index {
            0 => cpu.cr.cr0,
            2 => cpu.cr.cr2,
            3 => cpu.cr.cr3,
            _ => 0,
        };
        cpu.write_operand(&inst.dst, Value::Dword(value))
    }
}

// MOV DRx reuses the decoder's `ControlRegister` operand shape but must not
// reuse the generic read_operand/write_operand path for it: that path's
// private control_register/set_control_register helpers only round-trip
// CR0/CR2/CR3 and silently discard any other index, which would make this
// instruction a no-op instead of touching the debug registers.
fn exec_mov_dr(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let to_register = matches!(inst.dst, Operand::ControlRegister(_));
    if to_register {
        let index = match inst.dst {
            Operand::ControlRegister(index) => index,
            _ => unreachable!(),
        };
        let value = cpu.read_operand(&inst.src)?.as_u32();
        cpu.debug_regs[(index & 7) as usize] = value;
        Ok(())
    } else {
        let index = match inst.src {
            Operand::ControlRegister(index) => index,
            _ => return Err(CpuException::InvalidOpcode),
        };
        let value = cpu.debug_regs[(index & 7) as usize];
        cpu.write_operand(&inst.dst, Value::Dword(value))
    }
}

fn exec_arpl(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let dest = cpu.read_operand(&inst.dst)?.as_u32() as u16;
    let src = cpu.read_operand(&inst.src)?.as_u32() as u16;
    let dest_rpl = dest & 0x3;
    let src_rpl = src & 0x3;
    if dest_rpl < src_rpl {
        let new_value = (dest & !0x3) | src_rpl;
        cpu.write_operand(&inst.dst, Value::Word(new_value))?;
        cpu.flags.set_zf(true);
    } else {
        cpu.flags.set_zf(false);
    }
    Ok(())
}

fn exec_verr_verw(cpu: &mut Cpu, inst: &Instruction, access: Access) -> Result<(), CpuException> {
    let selector = cpu.read_operand(&inst.dst)?.as_u32() as u16;
    let gdtr = cpu.gdtr;
    let ok = match segmentation::read_gdt_entry(&mut cpu.memory, &gdtr, selector) {
        Some(descriptor) => {
            let present = descriptor.access & 0x80 != 0;
            let executable = descriptor.access & 0x08 != 0;
            let writable = descriptor.access & 0x02 != 0;
            present
                && match access {
                    Access::Read => true,
                    Access::Write => !executable && writable,
                    Access::Execute => executable,
                }
        }
        None => false,
    };
    cpu.flags.set_zf(ok);
    Ok(())
}

fn exec_lar(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let selector = cpu.read_operand(&inst.src)?.as_u32() as u16;
    let gdtr = cpu.gdtr;
    match segmentation::read_gdt_entry(&mut cpu.memory, &gdtr, selector) {
        Some(descriptor) => {
            cpu.flags.set_zf(true);
            let value = (u32::from(descriptor.access) << 8) & 0xff00;
            cpu.write_operand(&inst.dst, Value::from_u32(inst.dst.width(), value))
        }
        None => {
            cpu.flags.set_zf(false);
            Ok(())
        }
    }
}

fn exec_lsl(cpu: &mut Cpu, inst: &Instruction) -> Result<(), CpuException> {
    let selector = cpu.read_operand(&inst.src)?.as_u32() as u16;
    let gdtr = cpu.gdtr;
    match segmentation::read_gdt_entry(&mut cpu.memory, &gdtr, selector) {
        Some(descriptor) => {
            cpu.flags.set_zf(true);
            cpu.write_operand(&inst.dst, Value::from_u32(inst.dst.width(), descriptor.limit))
        }
        None => {
            cpu.flags.set_zf(false);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------
// string instructions
//
// Each REP-prefixed string instruction runs its whole iteration count in a
// single `execute()` call rather than one iteration per `step()`, unlike
// real hardware where the loop is interruptible between iterations. This
// core has no mid-instruction interrupt sampling point to resume from, so
// treating REP as atomic is the simplification recorded for this family.
// ---------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum StringOp {
    Movs,
    Stos,
    Lods,
    Cmps,
    Scas,
    Ins,
    Outs,
}

fn exec_string_op(cpu: &mut Cpu, inst: &Instruction, op: StringOp) -> Result<(), CpuException> {
    let width = inst.operand_size;
    let repeated = !matches!(inst.rep, RepPrefix::None);

    if repeated {
        loop {
            let count_width = inst.address_size;
            let count = cpu.gpr.read(GpReg::Ecx, count_width).as_u32();
            if count == 0 {
                break;
            }
            string_op_iteration(cpu, inst, op, width)?;
            let count = count.wrapping_sub(1);
            cpu.gpr.write(GpReg::Ecx, Value::from_u32(count_width, count));
            let should_continue = match inst.rep {
                RepPrefix::Repe => matches!(op, StringOp::Cmps | StringOp::Scas) && cpu.flags.zf(),
                RepPrefix::Repne => matches!(op, StringOp::Cmps | StringOp::Scas) && !cpu.flags.zf(),
                RepPrefix::None => true,
            };
            if count == 0 || !should_continue {
                break;
            }
        }
    } else {
        string_op_iteration(cpu, inst, op, width)?;
    }
    Ok(())
}

fn string_op_iteration(
    cpu: &mut Cpu,
    inst: &Instruction,
    op: StringOp,
    width: Width,
) -> Result<(), CpuException> {
    let advance = if cpu.flags.df() { -(width as i64) } else { width as i64 };
    match op {
        StringOp::Movs => {
            let src_seg = inst.segment_override.unwrap_or(SegReg::Ds);
            let src_addr = string_address(cpu, src_seg, GpReg::Esi, Access::Read)?;
            let dst_addr = string_address(cpu, SegReg::Es, GpReg::Edi, Access::Write)?;
            let value = cpu.memory.read(src_addr as usize, width);
            cpu.memory.write(dst_addr as usize, width, value);
            advance_index(cpu, GpReg::Esi, advance);
            advance_index(cpu, GpReg::Edi, advance);
        }
        StringOp::Stos => {
            let dst_addr = string_address(cpu, SegReg::Es, GpReg::Edi, Access::Write)?;
            let value = cpu.gpr.read(GpReg::Eax, width).as_u32();
            cpu.memory.write(dst_addr as usize, width, value);
            advance_index(cpu, GpReg::Edi, advance);
        }
        StringOp::Lods => {
            let src_seg = inst.segment_override.unwrap_or(SegReg::Ds);
            let src_addr = string_address(cpu, src_seg, GpReg::Esi, Access::Read)?;
            let value = cpu.memory.read(src_addr as usize, width);
            cpu.gpr.write(GpReg::Eax, Value::from_u32(width, value));
            advance_index(cpu, GpReg::Esi, advance);
        }
        StringOp::Cmps => {
            let src_seg = inst.segment_override.unwrap_or(SegReg::Ds);
            let src_addr = string_address(cpu, src_seg, GpReg::Esi, Access::Read)?;
            let dst_addr = string_address(cpu, SegReg::Es, GpReg::Edi, Access::Read)?;
            let a = Value::from_u32(width, cpu.memory.read(src_addr as usize, width));
            let b = Value::from_u32(width, cpu.memory.read(dst_addr as usize, width));
            let (_, update) = a.sub(b, false);
            cpu.flags.apply(&update);
            advance_index(cpu, GpReg::Esi, advance);
            advance_index(cpu, GpReg::Edi, advance);
        }
        StringOp::Scas => {
            let dst_addr = string_address(cpu, SegReg::Es, GpReg::Edi, Access::Read)?;
            let a = cpu.gpr.read(GpReg::Eax, width);
            let b = Value::from_u32(width, cpu.memory.read(dst_addr as usize, width));
            let (_, update) = a.sub(b, false);
            cpu.flags.apply(&update);
            advance_index(cpu, GpReg::Edi, advance);
        }
        StringOp::Ins => {
            let dst_addr = string_address(cpu, SegReg::Es, GpReg::Edi, Access::Write)?;
            let port = cpu.gpr.read(GpReg::Edx, Width::Word).as_u32() as u16;
            let value = cpu.io.read(port, width);
            cpu.memory.write(dst_addr as usize, width, value);
            advance_index(cpu, GpReg::Edi, advance);
        }
        StringOp::Outs => {
            let src_seg = inst.segment_override.unwrap_or(SegReg::Ds);
            let src_addr = string_address(cpu, src_seg, GpReg::Esi, Access::Read)?;
            let port = cpu.gpr.read(GpReg::Edx, Width::Word).as_u32() as u16;
            let value = cpu.memory.read(src_addr as usize, width);
            cpu.io.write(port, width, value);
            advance_index(cpu, GpReg::Esi, advance);
        }
    }
    Ok(())
}

fn string_address(cpu: &mut Cpu, seg: SegReg, reg: GpReg, access: Access) -> Result<u32, CpuException> {
    let offset = cpu.gpr.read32(reg);
    cpu.translate(seg, offset, access)
}

fn advance_index(cpu: &mut Cpu, reg: GpReg, advance: i64) {
    let current = cpu.gpr.read32(reg);
    let next = (current as i64).wrapping_add(advance) as u32;
    cpu.gpr.write32(reg, next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::memory::{PhysicalMemory, MIN_RAM_CHUNK};

    fn make_cpu() -> Cpu {
        Cpu::new(PhysicalMemory::new(MIN_RAM_CHUNK * 4))
    }

    fn run(cpu: &mut Cpu, code: &[u8]) {
        cpu.load_real_mode_image(0, 0x100, code);
        cpu.step();
    }

    #[test]
    fn sub_ax_bx_seed_scenario() {
        let mut cpu = make_cpu();
        cpu.gpr.write(GpReg::Eax, Value::Word(5));
        cpu.gpr.write(GpReg::Ebx, Value::Word(3));
        run(&mut cpu, &[0x29, 0xd8]); // sub ax, bx
        assert_eq!(cpu.gpr.read(GpReg::Eax, Width::Word).as_u32(), 2);
        assert!(!cpu.flags.cf());
        assert!(!cpu.flags.zf());
    }

    #[test]
    fn sub_wraps_and_sets_cf_sf() {
        let mut cpu = make_cpu();
        cpu.gpr.write(GpReg::Eax, Value::Word(0));
        cpu.gpr.write(GpReg::Ebx, Value::Word(1));
        run(&mut cpu, &[0x29, 0xd8]);
        assert_eq!(cpu.gpr.read(GpReg::Eax, Width::Word).as_u32(), 0xffff);
        assert!(cpu.flags.cf());
        assert!(cpu.flags.sf());
    }

    #[test]
    fn shl_al_80_by_one() {
        let mut cpu = make_cpu();
        cpu.gpr.write(GpReg::Eax, Value::Byte(0x80));
        run(&mut cpu, &[0xd0, 0xe0]); // shl al, 1
        assert_eq!(cpu.gpr.read(GpReg::Eax, Width::Byte).as_u32(), 0);
        assert!(cpu.flags.cf());
        assert!(cpu.flags.zf());
    }

    #[test]
    fn rep_movsb_copies_n_bytes() {
        let mut cpu = make_cpu();
        let src = 0x2000u32;
        let dst = 0x3000u32;
        for (i, byte) in [1u8, 2, 3, 4].iter().enumerate() {
            cpu.memory.write8(src as usize + i, *byte);
        }
        cpu.gpr.write32(GpReg::Esi, src);
        cpu.gpr.write32(GpReg::Edi, dst);
        cpu.gpr.write32(GpReg::Ecx, 4);
        run(&mut cpu, &[0xf3, 0xa4]); // rep movsb
        for i in 0..4 {
            assert_eq!(cpu.memory.read8(dst as usize + i), cpu.memory.read8(src as usize + i));
        }
        assert_eq!(cpu.gpr.read32(GpReg::Ecx), 0);
    }

    #[test]
    fn movsb_direction_flag_reverses_advance() {
        let mut cpu = make_cpu();
        cpu.flags.set_df(true);
        let src = 0x2000u32;
        let dst = 0x3000u32;
        cpu.gpr.write32(GpReg::Esi, src);
        cpu.gpr.write32(GpReg::Edi, dst);
        run(&mut cpu, &[0xa4]); // movsb
        assert_eq!(cpu.gpr.read32(GpReg::Esi), src.wrapping_sub(1));
        assert_eq!(cpu.gpr.read32(GpReg::Edi), dst.wrapping_sub(1));
    }

    #[test]
    fn div_by_zero_raises_divide_error_and_vectors_through_ivt() {
        let mut cpu = make_cpu();
        cpu.memory.write16(0 * 4, 0x1234); // IVT entry 0: ip
        cpu.memory.write16(0 * 4 + 2, 0x0000); // cs
        cpu.gpr.write(GpReg::Eax, Value::Word(10));
        cpu.gpr.write(GpReg::Ebx, Value::Byte(0));
        run(&mut cpu, &[0xf6, 0xf3]); // div bl
        assert_eq!(cpu.eip, 0x1234);
    }

    #[test]
    fn call_near_pushes_return_address_and_jumps() {
        let mut cpu = make_cpu();
        cpu.gpr.write32(GpReg::Esp, 0x1000);
        run(&mut cpu, &[0xe8, 0x00, 0x00, 0x00, 0x00]); // call rel32 +0
        assert_eq!(cpu.gpr.read32(GpReg::Esp), 0x1000 - 4);
    }

    #[test]
    fn bt_memory_operand_indexes_into_bit_array() {
        let mut cpu = make_cpu();
        let base = 0x4000u32;
        cpu.gpr.write32(GpReg::Ebx, base);
        cpu.memory.write8(base as usize + 2, 0b0000_0100);
        cpu.gpr.write32(GpReg::Eax, 20); // byte 2, bit 4
        let code = [0x0f, 0xa3, 0x03];
        let inst = decode(&code, Width::Word, Width::Word).unwrap();
        execute(&mut cpu, &inst).unwrap();
        assert!(cpu.flags.cf());
    }
}
