// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes a database.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Directory holding the SQLite3 index database.
    #[bpaf(argument("PATH"), fallback(crate::DEFAULT_DB_DIR.into()))]
    db_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (_db_dir, mut conn) = super::open_conn(&args.db_dir, super::OpenMode::Create)?;

    // Check if the database has already been initialized.
    let cur_ver = db::schema::get_schema_version(&conn)?;
    if let Some(v) = cur_ver {
        info!("database is already initialized with schema version {v}");
        return Ok(0);
    }

    conn.execute_batch(
        r#"
        pragma journal_mode = wal;
        pragma page_size = 16384;
        "#,
    )
    .map_err(base::Error::from)?;
    db::schema::init(&mut conn)?;
    info!("database initialized");
    Ok(0)
}
