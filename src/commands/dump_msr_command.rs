use crate::commands::{
    iht_options::{IhtOptions, IhtSubCommand},
    to_io_error, IhtCommand,
};
use iht::{
    cpu::CpuPin,
    cpu_model::identify_capacity,
    flags::Flags,
    lbr::Lbr,
    lbr_state::{LbrSelect, LbrState},
    log::LogLevel::*,
    msr::MsrDevice,
};
use std::{io, sync::Arc};

pub struct DumpMsrCommand {
    cpu: Option<usize>,
    json: bool,
}

impl DumpMsrCommand {
    pub fn new(options: &IhtOptions) -> DumpMsrCommand {
        match options.cmd {
            IhtSubCommand::DumpMsr { cpu, json } => DumpMsrCommand { cpu, json },
            _ => panic!("Unexpected IhtSubCommand variant. Not a `DumpMsr` variant!"),
        }
    }
}

impl IhtCommand for DumpMsrCommand {
    fn run(&mut self) -> io::Result<()> {
        let flags = Flags::get();
        let capacity = identify_capacity(flags.forced_model).map_err(to_io_error)?;
        let msrs = match MsrDevice::open(&flags.msr_root) {
            Ok(msrs) => msrs,
            Err(e) => {
                log!(
                    LogError,
                    "Could not open msr devices under {:?}. Is the msr module loaded and are we root?",
                    flags.msr_root
                );
                return Err(e);
            }
        };

        let pin = match self.cpu {
            Some(cpu) => CpuPin::on(cpu)?,
            None => CpuPin::current()?,
        };
        let lbr = Lbr::new(Arc::new(msrs), capacity);
        let mut state = LbrState::new(0, LbrSelect::empty(), capacity).map_err(to_io_error)?;
        lbr.read_into(&pin, &mut state)?;
        let snapshot = state.snapshot(pin.cpu());
        drop(pin);

        if self.json {
            println!("{}", serde_json::to_string(&snapshot)?);
        } else {
            println!("{}", snapshot);
        }
        Ok(())
    }
}
