// Error types for the core. `em68k`'s instruction layer never carried a
// typed error at all — malformed decode just panicked — so there is no
// teacher file to generalize directly; this is grounded on the sibling
// `StephanvanSchaik-hy-rs` example, which models a CPU's fault conditions
// as a `thiserror` enum instead of unwinding. Architectural exceptions are
// part of the emulated machine's observable behavior (they vector through
// the IDT/IVT, see `interrupts.rs`), so they're a distinct type from
// host-level setup failures.

use thiserror::Error;

/// One of the x86 exceptions this core raises. Carries an error code where
/// the architecture defines one, and the faulting linear address for #PF.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuException {
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    #[error("#GP general protection fault (error code {0:#06x})")]
    GeneralProtection(u16),
    #[error("#NP segment not present (error code {0:#06x})")]
    SegmentNotPresent(u16),
    #[error("#SS stack fault (error code {0:#06x})")]
    StackFault(u16),
    #[error("#PF page fault at {address:#010x} (error code {code:#06x})")]
    PageFault { address: u32, code: u16 },
    #[error("#DF double fault")]
    DoubleFault,
    #[error("#BP breakpoint")]
    Breakpoint,
    #[error("#OF overflow")]
    Overflow,
    #[error("#DE divide error")]
    DivideError,
    #[error("#BR bound range exceeded")]
    BoundRange,
    #[error("#TS invalid TSS (error code {0:#06x})")]
    InvalidTss(u16),
}

impl CpuException {
    /// Vector number this exception dispatches through (spec.md §4.8).
    pub fn vector(&self) -> u8 {
        match self {
            CpuException::DivideError => 0x00,
            CpuException::Breakpoint => 0x03,
            CpuException::Overflow => 0x04,
            CpuException::BoundRange => 0x05,
            CpuException::InvalidOpcode => 0x06,
            CpuException::DoubleFault => 0x08,
            CpuException::InvalidTss(_) => 0x0a,
            CpuException::SegmentNotPresent(_) => 0x0b,
            CpuException::StackFault(_) => 0x0c,
            CpuException::GeneralProtection(_) => 0x0d,
            CpuException::PageFault { .. } => 0x0e,
        }
    }

    /// The error code pushed onto the stack for exceptions that define one,
    /// per spec.md §4.8.
    pub fn error_code(&self) -> Option<u16> {
        match *self {
            CpuException::GeneralProtection(code)
            | CpuException::SegmentNotPresent(code)
            | CpuException::StackFault(code)
            | CpuException::InvalidTss(code) => Some(code),
            CpuException::PageFault { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Faults are restartable (the triggering instruction re-executes from
    /// scratch); traps and aborts are not. Only the distinction relevant to
    /// spec.md §7 partial-update rollback is modeled here.
    pub fn is_fault(&self) -> bool {
        !matches!(self, CpuException::Breakpoint | CpuException::Overflow)
    }
}

/// Host-visible setup failures: these are raised by `Machine`/`PhysicalMemory`
/// construction, not by emulated instruction execution.
#[derive(Error, Debug)]
pub enum MachineError {
    #[error("RAM size {0} is not a multiple of 16 KiB")]
    InvalidRamSize(usize),
    #[error("program image of {image_len} bytes does not fit at {base:#010x} in {ram_size}-byte RAM")]
    ImageDoesNotFit { image_len: usize, base: usize, ram_size: usize },
    #[error("memory-provider range {new_start:#x}..{new_end:#x} overlaps existing {existing_start:#x}..{existing_end:#x}")]
    OverlappingProviders {
        new_start: usize,
        new_end: usize,
        existing_start: usize,
        existing_end: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fault_carries_address_and_vector() {
        let e = CpuException::PageFault { address: 0x1000, code: 0x2 };
        assert_eq!(e.vector(), 0x0e);
        assert_eq!(e.error_code(), Some(0x2));
    }

    #[test]
    fn breakpoint_and_overflow_are_traps_not_faults() {
        assert!(!CpuException::Breakpoint.is_fault());
        assert!(!CpuException::Overflow.is_fault());
        assert!(CpuException::InvalidOpcode.is_fault());
    }
}
