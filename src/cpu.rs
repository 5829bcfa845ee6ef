//! Execution unit control: pinning the current thread to the cpu it is
//! running on, and masking asynchronous delivery (signals) for short critical
//! sections.

use crate::{error::nix_to_io, log::LogLevel::*};
use nix::{
    sched::{sched_getaffinity, sched_setaffinity, CpuSet},
    sys::signal::{pthread_sigmask, SigSet, SigmaskHow},
    unistd::Pid,
};
use std::io;

fn current_cpu() -> io::Result<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(cpu as usize)
    }
}

fn affinity() -> io::Result<CpuSet> {
    sched_getaffinity(Pid::from_raw(0)).map_err(nix_to_io)
}

fn set_affinity(set: &CpuSet) -> io::Result<()> {
    sched_setaffinity(Pid::from_raw(0), set).map_err(nix_to_io)
}

/// Exclusive, non-migratable use of the current cpu. get_cpu()/put_cpu() in
/// kernel terms: the thread is bound to the cpu it was found on until the pin
/// is dropped, at which point the previous affinity mask is restored.
pub struct CpuPin {
    cpu: usize,
    saved: CpuSet,
}

impl CpuPin {
    pub fn current() -> io::Result<CpuPin> {
        let saved = affinity()?;
        let cpu = current_cpu()?;
        let mut only = CpuSet::new();
        only.set(cpu).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // If we migrated after sched_getcpu() this moves us straight back.
        set_affinity(&only)?;
        Ok(CpuPin { cpu, saved })
    }

    /// Pin to a specific cpu, which need not be the one we are running on.
    pub fn on(cpu: usize) -> io::Result<CpuPin> {
        let saved = affinity()?;
        let mut only = CpuSet::new();
        only.set(cpu).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        set_affinity(&only)?;
        Ok(CpuPin { cpu, saved })
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl Drop for CpuPin {
    fn drop(&mut self) {
        if let Err(e) = set_affinity(&self.saved) {
            log!(LogWarn, "Could not restore affinity after cpu {}: {}", self.cpu, e);
        }
    }
}

/// The cpus the current thread may run on.
pub fn allowed_cpus() -> io::Result<Vec<usize>> {
    let set = affinity()?;
    Ok((0..libc::CPU_SETSIZE as usize)
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .collect())
}

/// Run `f` once on every cpu we are allowed to run on, pinned to it.
/// on_each_cpu() in kernel terms; returns how many cpus it ran on.
pub fn on_each_cpu<F>(mut f: F) -> io::Result<usize>
where
    F: FnMut(&CpuPin),
{
    let cpus = allowed_cpus()?;
    for &cpu in &cpus {
        let pin = CpuPin::on(cpu)?;
        f(&pin);
    }
    Ok(cpus.len())
}

/// Blocks every signal on the current thread until dropped (the user space
/// counterpart of local_irq_save()/local_irq_restore()).
pub struct IrqSave {
    old: SigSet,
    restore: bool,
}

impl IrqSave {
    pub fn new() -> IrqSave {
        let mut old = SigSet::empty();
        let restore =
            match pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut old)) {
                Ok(()) => true,
                Err(e) => {
                    log!(LogWarn, "Could not mask signals: {:?}", e);
                    false
                }
            };
        IrqSave { old, restore }
    }
}

impl Drop for IrqSave {
    fn drop(&mut self) {
        if self.restore {
            pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.old), None).unwrap_or(());
        }
    }
}
