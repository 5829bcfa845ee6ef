#[macro_use]
extern crate iht;

mod commands;

use crate::commands::{
    cpu_info_command::CpuInfoCommand,
    dump_msr_command::DumpMsrCommand,
    iht_options::{IhtOptions, IhtSubCommand},
    simulate_command::SimulateCommand,
    IhtCommand,
};
use iht::{
    flags::Flags,
    log::{set_all_logging, LogLevel::*},
};
use structopt::StructOpt;

fn main() {
    let options = IhtOptions::from_args();
    if options.verbose {
        set_all_logging(LogInfo);
    }
    log!(LogDebug, "{:?}", options);
    Flags::set(options.flags());

    let res = match &options.cmd {
        IhtSubCommand::CpuInfo { .. } => CpuInfoCommand::new(&options).run(),
        IhtSubCommand::Simulate { .. } => SimulateCommand::new(&options).run(),
        IhtSubCommand::DumpMsr { .. } => DumpMsrCommand::new(&options).run(),
    };
    if let Err(e) = res {
        clean_fatal!("{}", e);
    }
}
