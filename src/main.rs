// CLI entry point. Parses the normative flags from spec.md §6 with `clap`'s
// derive API (SPEC_FULL.md §2.4) — a standard, idiomatic choice for a flag
// set this shape, used here in place of the teacher's own hand-rolled,
// flag-free `main` that just calls `Emulator::run(path)`.

use clap::Parser;
use pcemu::{BootImage, Machine, MachineConfig};

/// IBM-PC-compatible x86 CPU/memory/I/O/VGA emulator core.
#[derive(Parser, Debug)]
#[clap(name = "pcemu")]
struct Args {
    /// Program image to load at the real-mode boot segment:offset.
    program: Option<String>,

    /// Segment of the boot image load address.
    #[clap(long, default_value = "0x7c0")]
    segment: String,

    /// Offset of the boot image load address.
    #[clap(long, default_value = "0x0")]
    offset: String,

    /// RAM size in 16 KiB units.
    #[clap(long, default_value = "64")]
    ram_chunks: usize,

    /// Log each software interrupt.
    #[clap(long)]
    trapint: bool,

    /// Log each IN/OUT.
    #[clap(long)]
    iopeek: bool,

    /// Log disk accesses.
    #[clap(long)]
    disklog: bool,

    /// Enable per-instruction tracing.
    #[clap(long)]
    trace: bool,

    /// Start halted in the debugger.
    #[clap(long)]
    debug: bool,
}

fn parse_hex_or_dec(value: &str) -> u32 {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        value.parse().unwrap_or(0)
    }
}

fn main() {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.trapint {
        builder.filter(Some("int"), log::LevelFilter::Info);
    }
    if args.iopeek {
        builder.filter(Some("io"), log::LevelFilter::Trace);
    }
    if args.disklog {
        builder.filter(Some("disk"), log::LevelFilter::Info);
    }
    builder.init();

    let config = MachineConfig {
        ram_size: args.ram_chunks.max(1) * pcemu::memory::MIN_RAM_CHUNK,
        boot_image: args.program.map(|path| BootImage {
            path,
            segment: parse_hex_or_dec(&args.segment) as u16,
            offset: parse_hex_or_dec(&args.offset) as u16,
        }),
        trap_interrupts: args.trapint,
        io_peek: args.iopeek,
        disk_log: args.disklog,
        trace: args.trace,
        start_halted: args.debug,
    };

    let mut machine = match Machine::new(&config) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("failed to start machine: {}", err);
            std::process::exit(1);
        }
    };

    machine.run();
}
