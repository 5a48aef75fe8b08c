// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! SQLite schema for Moonfire Presence.
//!
//! Timestamps are stored in 90,000ths of a second since the epoch, matching
//! `base::time::Time`. Attendance dates are `YYYY-mm-dd` strings in the
//! server's zone; the `(student_id, date)` uniqueness constraint is the
//! one-check-in-per-day contract.

use base::Error;

pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

pub(crate) const SCHEMA_SQL: &str = r#"
create table version (
  id integer primary key,

  -- seconds since epoch at which this schema version was created
  unix_time integer not null,

  notes text
);

create table student (
  id integer primary key,

  -- the external student number, e.g. "S2024-0042"
  student_number text unique not null,

  first_name text not null,
  last_name text not null,
  group_name text,
  created_90k integer not null
);

-- One enrollment image (and its face embedding) per row; a student has
-- between five and ten of these.
create table student_image (
  id integer primary key,
  student_id integer not null references student (id) on delete cascade,
  image_path text not null,

  -- the 512-dimension unit vector as little-endian f32s
  embedding blob not null,

  created_90k integer not null
);

create index student_image_student on student_image (student_id);

create table room (
  id integer primary key,
  name text unique not null,
  active integer not null default 1
);

create table camera (
  id integer primary key,
  room_id integer not null references room (id) on delete cascade,
  name text not null,
  rtsp_url text not null,
  active integer not null default 1
);

create index camera_room on camera (room_id);

-- At most one row per student: the student's current location. Stale rows
-- are removed by the reaper rather than expiring in place.
create table presence (
  student_id integer primary key references student (id) on delete cascade,
  room_id integer references room (id) on delete set null,
  camera_id integer references camera (id) on delete set null,
  last_seen_90k integer not null,
  confidence real not null
) without rowid;

create index presence_room on presence (room_id, last_seen_90k);

create table attendance (
  id integer primary key,
  student_id integer not null references student (id) on delete cascade,
  date text not null,
  time_90k integer not null,
  confidence real not null,
  snapshot_path text,
  unique (student_id, date)
);

create index attendance_date on attendance (date);

insert into version (id, unix_time, notes)
            values (1, strftime('%s', 'now'), 'db creation');
"#;

/// Initializes a fresh database. The caller is expected to also set the
/// per-connection pragmas via [`set_pragmas`].
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    set_pragmas(conn)?;
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_SQL)
        .map_err(|e| base::err!(Internal, msg("unable to create database schema"), source(e)))?;
    tx.commit()?;
    Ok(())
}

/// Sets the per-connection pragmas. Foreign keys in particular are off by
/// default in SQLite and the schema's cascades depend on them.
pub fn set_pragmas(conn: &rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        pragma foreign_keys = on;
        pragma fullfsync = off;
        pragma synchronous = normal;
        "#,
    )?;
    Ok(())
}

pub(crate) fn get_schema_version(conn: &rusqlite::Connection) -> Result<Option<i32>, Error> {
    let ver_tables: i32 = conn.query_row(
        "select count(*) from sqlite_master where name = 'version'",
        [],
        |row| row.get(0),
    )?;
    if ver_tables == 0 {
        return Ok(None);
    }
    Ok(Some(conn.query_row(
        "select max(id) from version",
        [],
        |row| row.get(0),
    )?))
}
