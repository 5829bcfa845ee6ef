use crate::error::nix_to_io;
use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::close,
    NixPath,
};
use std::{io, os::unix::io::RawFd};

/// An owned file descriptor that is closed on drop.
// We DON'T want this to be Copy or Clone because of the Drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    /// Unlike a bare open(2) the error is surfaced, not swallowed into a -1.
    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> io::Result<Self> {
        match open(path, oflag, Mode::empty()) {
            Ok(fd) => Ok(ScopedFd { fd }),
            Err(e) => Err(nix_to_io(e)),
        }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close
            close(self.fd).unwrap_or(());
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_and_close() {
        let mut fd = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY).unwrap();
        assert!(fd.is_open());
        fd.close();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn open_missing_path_fails() {
        let err = ScopedFd::open_path("/nonexistent/iht/msr", OFlag::O_RDONLY)
            .err()
            .unwrap();
        assert_eq!(Some(libc::ENOENT), err.raw_os_error());
    }
}
