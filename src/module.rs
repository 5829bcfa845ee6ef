//! Bringing the LBR subsystem up and tearing it down again.

use crate::{
    cpu::{on_each_cpu, CpuPin},
    cpu_model::identify_capacity,
    error::{LbrError, LbrResult},
    flags::Flags,
    fork::FORK_SYMBOL,
    host::{ControlDevice, Host, PreemptNotifier, SyscallHook},
    lbr::LbrConfig,
    lbr_state::LbrSelect,
    log::LogLevel::*,
    msr::MsrBank,
    tracer::LbrTracer,
};
use std::{io, sync::Arc};

/// Name the control device is published under.
pub const CONTROL_DEVICE_NAME: &str = "iht-info";

/// A loaded LBR subsystem: every hook registered and LBR recording switched
/// on for every cpu we may run on. Call `exit` to undo it all.
pub struct LbrModule {
    host: Arc<dyn Host>,
    tracer: Arc<LbrTracer>,
}

fn broadcast<F>(what: &str, mut f: F) -> io::Result<usize>
where
    F: FnMut(&CpuPin) -> io::Result<()>,
{
    let mut first_err = None;
    let n = on_each_cpu(|pin| {
        if let Err(e) = f(pin) {
            log!(LogWarn, "Could not {} LBR on cpu {}: {}", what, pin.cpu(), e);
            first_err.get_or_insert(e);
        }
    })?;
    match first_err {
        Some(e) => Err(e),
        None => Ok(n),
    }
}

impl LbrModule {
    /// Identify the cpu from CPUID (or `flags.forced_model`) and bring the
    /// subsystem up on `host`.
    pub fn init_identified(
        host: Arc<dyn Host>,
        msrs: Arc<dyn MsrBank>,
        flags: &Flags,
    ) -> LbrResult<LbrModule> {
        let capacity = identify_capacity(flags.forced_model)?;
        let mut config = LbrConfig::new(capacity);
        if let Some(select) = flags.default_select {
            config.default_select = LbrSelect::from_raw(select);
        }
        LbrModule::init(host, msrs, config)
    }

    /// Register the control device, the fork hook and the preempt notifier,
    /// then enable LBR everywhere. A failure at any step undoes the earlier
    /// ones, newest first.
    pub fn init(
        host: Arc<dyn Host>,
        msrs: Arc<dyn MsrBank>,
        config: LbrConfig,
    ) -> LbrResult<LbrModule> {
        log!(
            LogInfo,
            "Initializing LBR, capacity {}, default select {:#x}",
            config.capacity,
            config.default_select.bits()
        );
        let tracer = Arc::new(LbrTracer::new(msrs, config));

        let device: Arc<dyn ControlDevice> = tracer.clone();
        host.create_control_device(CONTROL_DEVICE_NAME, device)
            .map_err(|source| LbrError::HookRegistration {
                what: "control device",
                source,
            })?;

        let hook: Arc<dyn SyscallHook> = tracer.clone();
        if let Err(source) = host.register_syscall_hook(FORK_SYMBOL, hook) {
            host.remove_control_device(CONTROL_DEVICE_NAME);
            return Err(LbrError::HookRegistration {
                what: "fork hook",
                source,
            });
        }

        let notifier: Arc<dyn PreemptNotifier> = tracer.clone();
        if let Err(source) = host.register_preempt_notifier(notifier) {
            host.unregister_syscall_hook(FORK_SYMBOL);
            host.remove_control_device(CONTROL_DEVICE_NAME);
            return Err(LbrError::HookRegistration {
                what: "preempt notifier",
                source,
            });
        }

        let module = LbrModule { host, tracer };
        let lbr = module.tracer.lbr().clone();
        match broadcast("enable", |pin| lbr.enable(pin)) {
            Ok(n) => log!(LogDebug, "LBR enabled on {} cpus", n),
            Err(e) => {
                module.exit();
                return Err(e.into());
            }
        }
        Ok(module)
    }

    pub fn tracer(&self) -> &Arc<LbrTracer> {
        &self.tracer
    }

    /// Free every state, disable LBR and drop the hooks in the reverse order
    /// of `init`. Returns how many states were still live.
    pub fn exit(self) -> usize {
        let freed = self.tracer.drain();

        let lbr = self.tracer.lbr().clone();
        if let Err(e) = broadcast("disable", |pin| lbr.disable(pin)) {
            log!(LogWarn, "Could not disable LBR everywhere: {}", e);
        }

        let notifier: Arc<dyn PreemptNotifier> = self.tracer.clone();
        self.host.unregister_preempt_notifier(&notifier);
        self.host.unregister_syscall_hook(FORK_SYMBOL);
        self.host.remove_control_device(CONTROL_DEVICE_NAME);

        log!(LogInfo, "LBR exited, {} states freed", freed);
        freed
    }
}
