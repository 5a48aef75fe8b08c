// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run a SQLite shell.

use super::OpenMode;
use base::{err, Error};
use bpaf::Bpaf;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

/// Runs a SQLite3 shell on the index database.
///
/// Note this locks the database to prevent simultaneous access with a
/// running server. The server maintains cached state which could be
/// invalidated otherwise.
#[derive(Bpaf, Debug)]
#[bpaf(command("sql"))]
pub struct Args {
    /// Directory holding the SQLite3 index database.
    #[bpaf(argument("PATH"), fallback(crate::DEFAULT_DB_DIR.into()))]
    db_dir: PathBuf,

    /// Opens the database in read-only mode and locks it only for shared
    /// access.
    ///
    /// This can be run simultaneously with a server.
    read_only: bool,

    /// Arguments to pass to sqlite3.
    #[bpaf(positional("ARG"))]
    arg: Vec<OsString>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mode = if args.read_only {
        OpenMode::ReadOnly
    } else {
        OpenMode::ReadWrite
    };
    let _db_dir = super::open_dir(&args.db_dir, mode)?;
    let mut db = OsString::new();
    db.push("file:");
    db.push(args.db_dir.join("db"));
    if args.read_only {
        db.push("?mode=ro");
    }
    Err(err!(
        Internal,
        msg("couldn't exec sqlite3"),
        source(Command::new("sqlite3").arg(&db).args(&args.arg).exec())
    ))
}
