use crate::commands::{
    check_status,
    iht_options::{IhtOptions, IhtSubCommand},
    to_io_error, IhtCommand,
};
use iht::{
    cpu::{allowed_cpus, CpuPin},
    cpu_model::identify_capacity,
    flags::Flags,
    fork::FORK_SYMBOL,
    host::LocalHost,
    ioctl::{
        IoctlRequest, LIBIHT_IOC_DISABLE_TRACE, LIBIHT_IOC_ENABLE_TRACE, LIBIHT_IOC_SELECT_LBR,
    },
    lbr::LbrConfig,
    lbr_state::{LbrSelect, LbrSnapshot},
    log::LogLevel::*,
    module::{LbrModule, CONTROL_DEVICE_NAME},
    msr::{MsrBank, SoftMsrBank, MSR_LBR_NHM_FROM, MSR_LBR_NHM_TO, MSR_LBR_TOS},
    LbrError,
};
use serde::Serialize;
use std::{io, sync::Arc};

/// Used when the cpu has no known LBR capacity and none was given.
const FALLBACK_CAPACITY: usize = 16;

/// Stands in for the rest of the system; never traced.
const IDLE_PID: u32 = 1;

pub struct SimulateCommand {
    pid: u32,
    children: u32,
    select: Option<u64>,
    switches: u32,
    capacity: Option<usize>,
    json: bool,
}

impl SimulateCommand {
    pub fn new(options: &IhtOptions) -> SimulateCommand {
        match options.cmd.clone() {
            IhtSubCommand::Simulate {
                pid,
                children,
                select,
                switches,
                capacity,
                json,
            } => SimulateCommand {
                pid,
                children,
                select,
                switches,
                capacity,
                json,
            },
            _ => panic!("Unexpected IhtSubCommand variant. Not a `Simulate` variant!"),
        }
    }

    fn config(&self, flags: &Flags) -> io::Result<LbrConfig> {
        let capacity = match self.capacity {
            Some(capacity) => capacity,
            None => match identify_capacity(flags.forced_model) {
                Ok(capacity) => capacity,
                Err(e @ LbrError::UnsupportedCpu { .. }) => {
                    if !flags.suppress_environment_warnings {
                        log!(
                            LogWarn,
                            "{}; simulating {} entries instead",
                            e,
                            FALLBACK_CAPACITY
                        );
                    }
                    FALLBACK_CAPACITY
                }
                Err(e) => return Err(to_io_error(e)),
            },
        };
        let mut config = LbrConfig::new(capacity);
        if let Some(select) = flags.default_select {
            config.default_select = LbrSelect::from_raw(select);
        }
        Ok(config)
    }

    /// The traced process followed by its children.
    fn family(&self) -> io::Result<Vec<u32>> {
        (0..=self.children)
            .map(|i| {
                self.pid.checked_add(i).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "--pid {} with {} children runs past the largest pid",
                            self.pid, self.children
                        ),
                    )
                })
            })
            .collect()
    }
}

/// Fill the stack as if `pid` had just taken `capacity` branches.
fn record_branches(bank: &SoftMsrBank, cpu: usize, capacity: usize, pid: u32, round: u32) {
    let base = 0x40_0000 + ((pid as u64) << 12) + ((round as u64) << 8);
    let mut res = bank.wrmsr(cpu, MSR_LBR_TOS, round as u64 % capacity as u64);
    for i in 0..capacity as u32 {
        res = res
            .and_then(|_| bank.wrmsr(cpu, MSR_LBR_NHM_FROM + i, base + i as u64 * 0x10))
            .and_then(|_| bank.wrmsr(cpu, MSR_LBR_NHM_TO + i, base + i as u64 * 0x10 + 0x8));
    }
    if let Err(e) = res {
        log!(LogWarn, "Could not record branches for pid {}: {}", pid, e);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateReport {
    capacity: usize,
    traced: Vec<u32>,
    snapshots: Vec<LbrSnapshot>,
    disabled: usize,
    events: Vec<String>,
}

impl IhtCommand for SimulateCommand {
    fn run(&mut self) -> io::Result<()> {
        let family = self.family()?;
        let flags = Flags::get();
        let config = self.config(&flags)?;
        let nr_cpus = allowed_cpus()?.into_iter().max().map_or(1, |cpu| cpu + 1);
        let bank = Arc::new(SoftMsrBank::new(nr_cpus));
        let host = Arc::new(LocalHost::new());
        let module = LbrModule::init(host.clone(), bank.clone(), config).map_err(to_io_error)?;

        // Everything below happens "on" the cpu we are pinned to.
        let pin = CpuPin::current()?;
        let cpu = pin.cpu();
        let req = |pid| IoctlRequest { lbr_select: 0, pid }.to_bytes();

        // pid 0: the caller traces itself.
        check_status(
            "ENABLE_TRACE",
            host.ioctl(CONTROL_DEVICE_NAME, self.pid, LIBIHT_IOC_ENABLE_TRACE, &req(0), 0),
        )?;
        for &child in &family[1..] {
            host.fork(FORK_SYMBOL, self.pid, child);
        }
        if let Some(select) = self.select {
            check_status(
                "SELECT_LBR",
                host.ioctl(
                    CONTROL_DEVICE_NAME,
                    self.pid,
                    LIBIHT_IOC_SELECT_LBR,
                    &req(self.pid),
                    select,
                ),
            )?;
        }

        let mut runnable = family;
        runnable.push(IDLE_PID);
        for round in 0..self.switches {
            let next = runnable[round as usize % runnable.len()];
            host.context_switch(cpu, next);
            record_branches(&bank, cpu, config.capacity, next, round);
        }

        // Switch each traced process back in and dump what it left behind.
        let traced = module.tracer().traced_pids();
        let mut snapshots = Vec::with_capacity(traced.len());
        for &pid in &traced {
            host.context_switch(cpu, pid);
            snapshots.push(module.tracer().dump_lbr(Some(pid)).map_err(to_io_error)?);
        }
        host.context_switch(cpu, IDLE_PID);

        let before = module.tracer().nr_traced();
        check_status(
            "DISABLE_TRACE",
            host.ioctl(CONTROL_DEVICE_NAME, self.pid, LIBIHT_IOC_DISABLE_TRACE, &req(0), 0),
        )?;
        let disabled = before - module.tracer().nr_traced();
        drop(pin);
        module.exit();

        if is_logging!(LogDebug) {
            for event in host.events() {
                log!(LogDebug, "host: {}", event);
            }
        }

        let report = SimulateReport {
            capacity: config.capacity,
            traced,
            snapshots,
            disabled,
            events: host.events(),
        };
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("LBR entries: {}", report.capacity);
        println!("Traced: {:?}", report.traced);
        for snapshot in &report.snapshots {
            println!("{}\n", snapshot);
        }
        println!("Disabled {} states", report.disabled);
        Ok(())
    }
}
