use crate::commands::{
    iht_options::{IhtOptions, IhtSubCommand},
    IhtCommand,
};
use iht::{
    cpu_model::{lbr_capacity_for, vendor, CpuSignature},
    flags::Flags,
};
use serde::Serialize;
use std::io;

pub struct CpuInfoCommand {
    json: bool,
}

impl CpuInfoCommand {
    pub fn new(options: &IhtOptions) -> CpuInfoCommand {
        match options.cmd {
            IhtSubCommand::CpuInfo { json } => CpuInfoCommand { json },
            _ => panic!("Unexpected IhtSubCommand variant. Not a `CpuInfo` variant!"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CpuInfo {
    vendor: Option<String>,
    family: Option<u32>,
    model: Option<u32>,
    forced_model: Option<u32>,
    lbr_capacity: Option<usize>,
}

impl IhtCommand for CpuInfoCommand {
    fn run(&mut self) -> io::Result<()> {
        let forced_model = Flags::get().forced_model;
        let sig = CpuSignature::current().map(|mut sig| {
            if let Some(model) = forced_model {
                sig.model = model;
            }
            sig
        });
        let info = CpuInfo {
            vendor: vendor(),
            family: sig.map(|s| s.family),
            model: sig.map(|s| s.model),
            forced_model,
            lbr_capacity: sig.and_then(|s| lbr_capacity_for(s).ok()),
        };

        if self.json {
            println!("{}", serde_json::to_string(&info)?);
            return Ok(());
        }

        println!("vendor:       {}", info.vendor.as_deref().unwrap_or("unknown"));
        match sig {
            Some(sig) => println!("family/model: {:x}_{:x}H", sig.family, sig.model),
            None => println!("family/model: unknown"),
        }
        match info.lbr_capacity {
            Some(capacity) => println!("lbr entries:  {}", capacity),
            None => println!("lbr entries:  unsupported"),
        }
        Ok(())
    }
}
