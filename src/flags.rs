use std::{path::PathBuf, sync::RwLock};

lazy_static! {
    static ref FLAGS: RwLock<Flags> = RwLock::new(Flags::default());
}

#[derive(Clone, Debug)]
pub struct Flags {
    /// User override for the CPU model reported by CPUID, e.g. when running
    /// under a hypervisor that lies about it.
    pub forced_model: Option<u32>,
    /// LBR_SELECT value used by ENABLE_TRACE requests that pass 0.
    pub default_select: Option<u64>,
    /// Directory holding the per-cpu msr device nodes.
    pub msr_root: PathBuf,
    /// Suppress warnings related to environmental features outside our
    /// control.
    pub suppress_environment_warnings: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            forced_model: None,
            default_select: None,
            msr_root: PathBuf::from("/dev/cpu"),
            suppress_environment_warnings: false,
        }
    }
}

impl Flags {
    /// A copy of the current flags.
    pub fn get() -> Flags {
        match FLAGS.read() {
            Ok(flags) => flags.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install `flags` process wide. Meant to be called once, from main().
    pub fn set(flags: Flags) {
        match FLAGS.write() {
            Ok(mut f) => *f = flags,
            Err(poisoned) => *poisoned.into_inner() = flags,
        }
    }
}
