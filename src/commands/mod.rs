use iht::LbrError;
use std::io;

pub mod cpu_info_command;
pub mod dump_msr_command;
pub mod iht_options;
pub mod simulate_command;

pub trait IhtCommand {
    fn run(&mut self) -> io::Result<()>;
}

/// Commands report through `io::Error`; keep the errno when there is one.
pub fn to_io_error(e: LbrError) -> io::Error {
    match e {
        LbrError::Io(e) => e,
        e => io::Error::new(io::ErrorKind::Other, e.to_string()),
    }
}

/// A control device status back into an error.
pub fn check_status(what: &str, status: i64) -> io::Result<()> {
    if status == 0 {
        return Ok(());
    }
    let err = io::Error::from_raw_os_error(-status as i32);
    Err(io::Error::new(
        err.kind(),
        format!("{} failed: {}", what, err),
    ))
}
