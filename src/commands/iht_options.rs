use iht::flags::Flags;
use std::{num::ParseIntError, path::PathBuf};
use structopt::{clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "iht",
    about = "Per-process Intel LBR tracing",
    after_help = "Use IHT_LOG to control logging; e.g. IHT_LOG=all:warn,state_list:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct IhtOptions {
    /// Force iht to assume it's running on a family 6 CPU with display model <model> even if
    /// CPUID says otherwise, e.g. `0x9e`.
    #[structopt(short = "A", long, parse(try_from_str = parse_int_u32))]
    pub model: Option<u32>,

    /// LBR_SELECT bits used when an ENABLE_TRACE request passes 0.
    #[structopt(long, parse(try_from_str = parse_int))]
    pub default_select: Option<u64>,

    /// Directory holding the per-cpu msr device nodes.
    #[structopt(long, default_value = "/dev/cpu", parse(from_os_str))]
    pub msr_root: PathBuf,

    /// Log at info level everywhere, overriding IHT_LOG.
    #[structopt(short = "v", long)]
    pub verbose: bool,

    #[structopt(
        short = "S",
        long,
        help = "Suppress warnings about issues in the environment that iht has no control over."
    )]
    pub suppress_environment_warnings: bool,

    #[structopt(subcommand)]
    pub cmd: IhtSubCommand,
}

impl IhtOptions {
    pub fn flags(&self) -> Flags {
        Flags {
            forced_model: self.model,
            default_select: self.default_select,
            msr_root: self.msr_root.clone(),
            suppress_environment_warnings: self.suppress_environment_warnings,
        }
    }
}

/// Accepts decimal, or hex with a `0x` prefix.
pub fn parse_int(s: &str) -> Result<u64, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    }
}

fn parse_int_u32(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    }
}

#[derive(StructOpt, Debug, Clone)]
pub enum IhtSubCommand {
    /// Print the CPU vendor, family and model and how many LBR entries it has.
    #[structopt(name = "cpu-info")]
    CpuInfo {
        /// Print as JSON
        #[structopt(long)]
        json: bool,
    },

    /// Load the LBR subsystem on an in-process host with software MSRs, trace a process and
    /// its children through a series of context switches, then dump and unload.
    #[structopt(name = "simulate")]
    Simulate {
        /// Pid of the traced process
        #[structopt(long, default_value = "1000")]
        pid: u32,

        /// How many children the traced process forks
        #[structopt(long, default_value = "2")]
        children: u32,

        /// LBR_SELECT bits to reconfigure the traced process with after enabling it
        #[structopt(long, parse(try_from_str = parse_int))]
        select: Option<u64>,

        /// How many context switches to run
        #[structopt(long, default_value = "8")]
        switches: u32,

        /// Number of LBR entries; defaults to what the CPU (or --model) says
        #[structopt(long)]
        capacity: Option<usize>,

        /// Print as JSON
        #[structopt(long)]
        json: bool,
    },

    /// Read the live LBR registers of one cpu through the msr driver. Needs root and the
    /// `msr` kernel module.
    #[structopt(name = "dump-msr")]
    DumpMsr {
        /// Cpu to read; defaults to the one we happen to run on
        #[structopt(long)]
        cpu: Option<usize>,

        /// Print as JSON
        #[structopt(long)]
        json: bool,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_ints() {
        assert_eq!(Ok(10), parse_int("10"));
        assert_eq!(Ok(0x1f), parse_int("0x1f"));
        assert_eq!(Ok(0x9e), parse_int_u32("0X9e"));
        assert!(parse_int("0xzz").is_err());
    }

    #[test]
    fn global_options_become_flags() {
        let options = IhtOptions::from_iter(&[
            "iht",
            "--model",
            "0x9e",
            "--default-select",
            "3",
            "-S",
            "simulate",
            "--pid",
            "7",
        ]);
        let flags = options.flags();
        assert_eq!(Some(0x9e), flags.forced_model);
        assert_eq!(Some(3), flags.default_select);
        assert!(flags.suppress_environment_warnings);
        assert_eq!(PathBuf::from("/dev/cpu"), flags.msr_root);
        match options.cmd {
            IhtSubCommand::Simulate {
                pid: 7,
                children: 2,
                switches: 8,
                ..
            } => (),
            other => panic!("unexpected {:?}", other),
        }
    }
}
