use std::io;

/// Everything that can go wrong in the LBR subsystem.
///
/// Control plane callers only ever see `status()`, the negative errno that
/// goes back through the ioctl.
#[derive(Debug, thiserror::Error)]
pub enum LbrError {
    #[error("CPU family {family:#x} model {model:#x} has no known LBR capacity")]
    UnsupportedCpu { family: u32, model: u32 },
    #[error("Could not allocate LBR state")]
    NoMemory,
    #[error("No LBR state for pid {0}")]
    NotFound(u32),
    #[error("Pid {0} is already being traced")]
    AlreadyTraced(u32),
    #[error("Malformed request: expected {expected} bytes, got {got}")]
    PartialRequest { expected: usize, got: usize },
    #[error("Unknown ioctl command {0:#x}")]
    BadCommand(u32),
    #[error("Handle does not refer to a live LBR state")]
    StaleHandle,
    #[error("Could not register {what}: {source}")]
    HookRegistration {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LbrError {
    /// The value returned to the control plane: a negated errno.
    pub fn status(&self) -> i64 {
        let errno = match self {
            LbrError::UnsupportedCpu { .. } => libc::ENODEV,
            LbrError::NoMemory => libc::ENOMEM,
            LbrError::NotFound(_) => libc::ENOENT,
            LbrError::AlreadyTraced(_) => libc::EEXIST,
            LbrError::PartialRequest { .. } => libc::EFAULT,
            LbrError::BadCommand(_) => libc::EINVAL,
            LbrError::StaleHandle => libc::ESTALE,
            LbrError::HookRegistration { .. } => libc::EBUSY,
            LbrError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        -(errno as i64)
    }
}

pub type LbrResult<T> = Result<T, LbrError>;

/// Keep the errno a nix call failed with rather than rereading errno later.
pub fn nix_to_io(err: nix::Error) -> io::Error {
    match err {
        nix::Error::Sys(errno) => io::Error::from_raw_os_error(errno as i32),
        err => io::Error::new(io::ErrorKind::Other, err),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statuses_are_distinguishable() {
        assert_eq!(-(libc::ENOENT as i64), LbrError::NotFound(7).status());
        assert_eq!(-(libc::EEXIST as i64), LbrError::AlreadyTraced(7).status());
        assert_eq!(
            -(libc::EFAULT as i64),
            LbrError::PartialRequest {
                expected: 16,
                got: 3
            }
            .status()
        );
        assert_eq!(-(libc::EINVAL as i64), LbrError::BadCommand(0).status());
    }

    #[test]
    fn io_status_uses_raw_errno() {
        let e = LbrError::from(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(-(libc::EACCES as i64), e.status());
        let e = LbrError::from(io::Error::new(io::ErrorKind::Other, "short read"));
        assert_eq!(-(libc::EIO as i64), e.status());
    }

    #[test]
    fn nix_errors_keep_their_errno() {
        let e = nix_to_io(nix::Error::Sys(nix::errno::Errno::EPERM));
        assert_eq!(Some(libc::EPERM), e.raw_os_error());
        let e = nix_to_io(nix::Error::InvalidPath);
        assert_eq!(None, e.raw_os_error());
        assert_eq!(-(libc::EIO as i64), LbrError::from(e).status());
    }
}
