// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Database directory handling: a raw file descriptor used to flock the
//! directory for the lifetime of the SQLite connection, guarding against a
//! second process opening the same database.

use nix::fcntl::FlockArg;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

/// A file descriptor associated with a directory (not necessarily the sample
/// directory).
pub struct Fd(OwnedFd);

impl Fd {
    /// Opens the given path as a directory, optionally creating it first.
    pub fn open(path: &Path, mkdir: bool) -> Result<Fd, nix::Error> {
        if mkdir {
            match std::fs::create_dir(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(_) => return Err(nix::Error::EIO),
            }
        }
        let fd = nix::fcntl::open(
            path,
            nix::fcntl::OFlag::O_DIRECTORY | nix::fcntl::OFlag::O_RDONLY,
            nix::sys::stat::Mode::empty(),
        )?;
        // SAFETY: `open` returned a freshly opened fd we own.
        Ok(Fd(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Locks the directory with the specified `flock` operation.
    pub fn lock(&self, arg: FlockArg) -> Result<(), nix::Error> {
        nix::fcntl::flock(self.0.as_raw_fd(), arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_lock() {
        let tmpdir = tempfile::Builder::new()
            .prefix("moonfire-presence-test")
            .tempdir()
            .unwrap();
        let fd = Fd::open(tmpdir.path(), false).unwrap();
        fd.lock(FlockArg::LockExclusiveNonblock).unwrap();
    }

    #[test]
    fn mkdir() {
        let tmpdir = tempfile::Builder::new()
            .prefix("moonfire-presence-test")
            .tempdir()
            .unwrap();
        let sub = tmpdir.path().join("sub");
        Fd::open(&sub, true).unwrap();
        assert!(sub.is_dir());
    }
}
