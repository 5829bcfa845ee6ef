//! Per-process Intel LBR (Last Branch Record) state, kept across context
//! switches and managed through an ioctl style control device.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate raw_cpuid;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate memoffset;

#[macro_use]
pub mod log;
pub mod context_switch;
pub mod cpu;
pub mod cpu_model;
pub mod error;
pub mod flags;
pub mod fork;
pub mod host;
pub mod ioctl;
pub mod irq_lock;
pub mod lbr;
pub mod lbr_state;
pub mod module;
pub mod msr;
pub mod scoped_fd;
pub mod state_list;
pub mod tracer;

pub use crate::{
    error::{LbrError, LbrResult},
    module::LbrModule,
    tracer::LbrTracer,
};
