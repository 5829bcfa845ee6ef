//! The interfaces the LBR subsystem needs from its host, plus `LocalHost`,
//! an in-process host that keeps the registrations and lets callers play
//! scheduler, fork and control device client.

use crate::log::LogLevel::*;
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard},
};

/// Called around every context switch, from contexts that must not block.
pub trait PreemptNotifier: Send + Sync {
    /// `pid` is about to run on `cpu`.
    fn sched_in(&self, pid: u32, cpu: usize);
    /// `pid` is about to stop running; `next` runs after it.
    fn sched_out(&self, pid: u32, next: u32);
}

/// Called around a hooked system call.
pub trait SyscallHook: Send + Sync {
    fn pre_handler(&self, pid: u32);
    /// `child` is the pid the host created for `pid`, if any.
    fn post_handler(&self, pid: u32, child: Option<u32>);
}

/// The file-like control channel. Each ioctl carries a fixed-size request in
/// `request`; whatever the transport managed to copy in is all we get.
pub trait ControlDevice: Send + Sync {
    fn device_open(&self) -> i64;
    fn device_release(&self) -> i64;
    fn device_read(&self, caller: u32, buf: &mut [u8]) -> i64;
    fn device_write(&self, caller: u32, buf: &[u8]) -> i64;
    fn device_ioctl(&self, caller: u32, cmd: u32, request: &[u8], ioctl_param: u64) -> i64;
}

/// Hook registration. Each registration either fully succeeds or leaves
/// nothing behind.
pub trait Host: Send + Sync {
    fn register_preempt_notifier(&self, notifier: Arc<dyn PreemptNotifier>) -> io::Result<()>;
    fn unregister_preempt_notifier(&self, notifier: &Arc<dyn PreemptNotifier>);
    fn register_syscall_hook(&self, symbol: &str, hook: Arc<dyn SyscallHook>)
        -> io::Result<()>;
    fn unregister_syscall_hook(&self, symbol: &str);
    fn create_control_device(&self, name: &str, device: Arc<dyn ControlDevice>)
        -> io::Result<()>;
    fn remove_control_device(&self, name: &str);
}

/// Which registration `LocalHost` should refuse, to exercise unwinding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HookKind {
    PreemptNotifier,
    SyscallHook,
    ControlDevice,
}

#[derive(Default)]
struct LocalHostInner {
    notifiers: Vec<Arc<dyn PreemptNotifier>>,
    syscall_hooks: HashMap<String, Arc<dyn SyscallHook>>,
    devices: HashMap<String, Arc<dyn ControlDevice>>,
    /// Pid currently running on each cpu.
    running: HashMap<usize, u32>,
    refuse: Option<HookKind>,
    /// Registration history, oldest first.
    events: Vec<String>,
}

#[derive(Default)]
pub struct LocalHost {
    inner: Mutex<LocalHostInner>,
}

fn thin<T: ?Sized>(p: &Arc<T>) -> *const u8 {
    Arc::as_ptr(p).cast::<u8>()
}

impl LocalHost {
    pub fn new() -> LocalHost {
        LocalHost::default()
    }

    /// Make the next registrations of `kind` fail with EBUSY.
    pub fn refuse(&self, kind: HookKind) {
        self.inner().refuse = Some(kind);
    }

    fn inner(&self) -> MutexGuard<'_, LocalHostInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_refused(inner: &LocalHostInner, kind: HookKind) -> io::Result<()> {
        if inner.refuse == Some(kind) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(())
    }

    pub fn events(&self) -> Vec<String> {
        self.inner().events.clone()
    }

    pub fn nr_notifiers(&self) -> usize {
        self.inner().notifiers.len()
    }

    pub fn has_syscall_hook(&self, symbol: &str) -> bool {
        self.inner().syscall_hooks.contains_key(symbol)
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.inner().devices.contains_key(name)
    }

    pub fn running_on(&self, cpu: usize) -> Option<u32> {
        self.inner().running.get(&cpu).copied()
    }

    /// Switch `cpu` over to `next`, telling every notifier. Hooks are called
    /// without our own lock held.
    pub fn context_switch(&self, cpu: usize, next: u32) {
        let (prev, notifiers) = {
            let mut inner = self.inner();
            let prev = inner.running.insert(cpu, next);
            (prev, inner.notifiers.clone())
        };

        if let Some(prev) = prev {
            for n in &notifiers {
                n.sched_out(prev, next);
            }
        }
        for n in &notifiers {
            n.sched_in(next, cpu);
        }
    }

    /// `parent` called fork() on `symbol`'s path and got `child`.
    pub fn fork(&self, symbol: &str, parent: u32, child: u32) {
        let hook = self.inner().syscall_hooks.get(symbol).cloned();
        match hook {
            Some(hook) => {
                hook.pre_handler(parent);
                hook.post_handler(parent, Some(child));
            }
            None => log!(LogDebug, "No hook on {}, fork of {} unobserved", symbol, parent),
        }
    }

    fn device(&self, name: &str) -> Option<Arc<dyn ControlDevice>> {
        self.inner().devices.get(name).cloned()
    }

    pub fn ioctl(&self, name: &str, caller: u32, cmd: u32, request: &[u8], param: u64) -> i64 {
        match self.device(name) {
            Some(dev) => dev.device_ioctl(caller, cmd, request, param),
            None => -(libc::ENOENT as i64),
        }
    }

    pub fn read(&self, name: &str, caller: u32, buf: &mut [u8]) -> i64 {
        match self.device(name) {
            Some(dev) => dev.device_read(caller, buf),
            None => -(libc::ENOENT as i64),
        }
    }
}

impl Host for LocalHost {
    fn register_preempt_notifier(&self, notifier: Arc<dyn PreemptNotifier>) -> io::Result<()> {
        let mut inner = self.inner();
        LocalHost::check_refused(&inner, HookKind::PreemptNotifier)?;
        inner.notifiers.push(notifier);
        inner.events.push("register preempt notifier".into());
        Ok(())
    }

    fn unregister_preempt_notifier(&self, notifier: &Arc<dyn PreemptNotifier>) {
        let mut inner = self.inner();
        let target = thin(notifier);
        inner.notifiers.retain(|n| thin(n) != target);
        inner.events.push("unregister preempt notifier".into());
    }

    fn register_syscall_hook(
        &self,
        symbol: &str,
        hook: Arc<dyn SyscallHook>,
    ) -> io::Result<()> {
        let mut inner = self.inner();
        LocalHost::check_refused(&inner, HookKind::SyscallHook)?;
        inner.syscall_hooks.insert(symbol.to_owned(), hook);
        inner.events.push(format!("register syscall hook {}", symbol));
        Ok(())
    }

    fn unregister_syscall_hook(&self, symbol: &str) {
        let mut inner = self.inner();
        inner.syscall_hooks.remove(symbol);
        inner.events.push(format!("unregister syscall hook {}", symbol));
    }

    fn create_control_device(
        &self,
        name: &str,
        device: Arc<dyn ControlDevice>,
    ) -> io::Result<()> {
        let mut inner = self.inner();
        LocalHost::check_refused(&inner, HookKind::ControlDevice)?;
        if inner.devices.contains_key(name) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        inner.devices.insert(name.to_owned(), device);
        inner.events.push(format!("create device {}", name));
        Ok(())
    }

    fn remove_control_device(&self, name: &str) {
        let mut inner = self.inner();
        inner.devices.remove(name);
        inner.events.push(format!("remove device {}", name));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl PreemptNotifier for Recorder {
        fn sched_in(&self, pid: u32, cpu: usize) {
            self.calls.lock().unwrap().push(format!("in {} {}", pid, cpu));
        }

        fn sched_out(&self, pid: u32, next: u32) {
            self.calls.lock().unwrap().push(format!("out {} {}", pid, next));
        }
    }

    #[test]
    fn context_switch_calls_out_then_in() {
        let host = LocalHost::new();
        let rec = Arc::new(Recorder::default());
        host.register_preempt_notifier(rec.clone()).unwrap();

        host.context_switch(0, 10);
        host.context_switch(0, 20);
        assert_eq!(Some(20), host.running_on(0));
        assert_eq!(
            vec!["in 10 0", "out 10 20", "in 20 0"],
            *rec.calls.lock().unwrap()
        );
    }

    #[test]
    fn unregister_notifier() {
        let host = LocalHost::new();
        let rec = Arc::new(Recorder::default());
        let n: Arc<dyn PreemptNotifier> = rec.clone();
        host.register_preempt_notifier(n.clone()).unwrap();
        host.unregister_preempt_notifier(&n);
        assert_eq!(0, host.nr_notifiers());
        host.context_switch(1, 5);
        assert!(rec.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn refused_registration_leaves_nothing() {
        let host = LocalHost::new();
        host.refuse(HookKind::PreemptNotifier);
        let rec: Arc<dyn PreemptNotifier> = Arc::new(Recorder::default());
        let err = host.register_preempt_notifier(rec).err().unwrap();
        assert_eq!(Some(libc::EBUSY), err.raw_os_error());
        assert_eq!(0, host.nr_notifiers());
        assert!(host.events().is_empty());
    }

    #[test]
    fn ioctl_on_missing_device() {
        let host = LocalHost::new();
        assert_eq!(-(libc::ENOENT as i64), host.ioctl("nope", 1, 0, &[], 0));
    }
}
