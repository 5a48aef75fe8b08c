// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw database access: SQLite statements which do not touch any cached
//! state.

use base::time::Time;
use base::Error;
use rusqlite::named_params;

/// Last-writer-wins upsert; the `student_id` primary key is the at-most-one
/// row-per-student invariant.
const UPSERT_PRESENCE_SQL: &str = r#"
    insert into presence (student_id,  room_id,  camera_id,  last_seen_90k,  confidence)
                  values (:student_id, :room_id, :camera_id, :last_seen_90k, :confidence)
    on conflict (student_id) do update set
      room_id = excluded.room_id,
      camera_id = excluded.camera_id,
      last_seen_90k = excluded.last_seen_90k,
      confidence = excluded.confidence
"#;

const LIST_ROOM_PRESENCE_SQL: &str = r#"
    select
      presence.student_id,
      student.student_number,
      student.first_name,
      student.last_name,
      student.group_name,
      presence.room_id,
      presence.camera_id,
      presence.last_seen_90k,
      presence.confidence
    from
      presence join student on (presence.student_id = student.id)
    where
      presence.room_id = :room_id and
      presence.last_seen_90k >= :cutoff_90k
    order by
      presence.last_seen_90k desc
"#;

const GET_STUDENT_PRESENCE_SQL: &str = r#"
    select
      presence.room_id,
      presence.camera_id,
      presence.last_seen_90k,
      presence.confidence
    from
      presence
    where
      presence.student_id = :student_id and
      presence.last_seen_90k >= :cutoff_90k
"#;

const DELETE_STALE_PRESENCE_SQL: &str =
    "delete from presence where last_seen_90k < :cutoff_90k";

const DELETE_ROOM_PRESENCE_SQL: &str = "delete from presence where room_id = :room_id";

const GET_ATTENDANCE_SQL: &str = r#"
    select
      id,
      time_90k,
      confidence,
      snapshot_path
    from
      attendance
    where
      student_id = :student_id and
      date = :date
"#;

const INSERT_ATTENDANCE_SQL: &str = r#"
    insert into attendance (student_id,  date,  time_90k,  confidence,  snapshot_path)
                    values (:student_id, :date, :time_90k, :confidence, :snapshot_path)
"#;

const LIST_ATTENDANCE_SQL: &str = r#"
    select
      attendance.id,
      attendance.student_id,
      attendance.time_90k,
      attendance.confidence,
      attendance.snapshot_path
    from
      attendance
    where
      attendance.date = :date
    order by
      attendance.time_90k
"#;

const INSERT_STUDENT_IMAGE_SQL: &str = r#"
    insert into student_image (student_id,  image_path,  embedding,  created_90k)
                       values (:student_id, :image_path, :embedding, :created_90k)
"#;

const LIST_EMBEDDINGS_SQL: &str =
    "select student_id, embedding from student_image order by id";

/// A presence row joined with the student's display fields.
#[derive(Clone, Debug, PartialEq)]
pub struct PresenceRow {
    pub student_id: i32,
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    pub group_name: Option<String>,
    pub room_id: i32,
    pub camera_id: Option<i32>,
    pub last_seen: Time,
    pub confidence: f32,
}

#[derive(Clone, Debug)]
pub struct StudentPresenceRow {
    pub room_id: Option<i32>,
    pub camera_id: Option<i32>,
    pub last_seen: Time,
    pub confidence: f32,
}

#[derive(Clone, Debug)]
pub struct AttendanceRow {
    pub id: i32,
    pub student_id: i32,
    pub time: Time,
    pub confidence: f32,
    pub snapshot_path: Option<String>,
}

pub(crate) fn upsert_presence(
    conn: &rusqlite::Connection,
    student_id: i32,
    room_id: i32,
    camera_id: Option<i32>,
    when: Time,
    confidence: f32,
) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached(UPSERT_PRESENCE_SQL)?;
    stmt.execute(named_params! {
        ":student_id": student_id,
        ":room_id": room_id,
        ":camera_id": camera_id,
        ":last_seen_90k": when.0,
        ":confidence": confidence,
    })?;
    Ok(())
}

/// Lists presence rows for the room with `last_seen >= cutoff`, most recent
/// first. Pass `Time::MIN` to include stale rows.
pub(crate) fn list_room_presence(
    conn: &rusqlite::Connection,
    room_id: i32,
    cutoff: Time,
) -> Result<Vec<PresenceRow>, Error> {
    let mut stmt = conn.prepare_cached(LIST_ROOM_PRESENCE_SQL)?;
    let mut rows = stmt.query(named_params! {
        ":room_id": room_id,
        ":cutoff_90k": cutoff.0,
    })?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(PresenceRow {
            student_id: row.get(0)?,
            student_number: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            group_name: row.get(4)?,
            room_id: row.get(5)?,
            camera_id: row.get(6)?,
            last_seen: Time(row.get(7)?),
            confidence: row.get(8)?,
        });
    }
    Ok(out)
}

pub(crate) fn get_student_presence(
    conn: &rusqlite::Connection,
    student_id: i32,
    cutoff: Time,
) -> Result<Option<StudentPresenceRow>, Error> {
    let mut stmt = conn.prepare_cached(GET_STUDENT_PRESENCE_SQL)?;
    let mut rows = stmt.query(named_params! {
        ":student_id": student_id,
        ":cutoff_90k": cutoff.0,
    })?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => Ok(Some(StudentPresenceRow {
            room_id: row.get(0)?,
            camera_id: row.get(1)?,
            last_seen: Time(row.get(2)?),
            confidence: row.get(3)?,
        })),
    }
}

/// Deletes rows strictly older than `cutoff`; a row exactly at the cutoff
/// is still active. Returns the count removed.
pub(crate) fn delete_stale_presence(
    conn: &rusqlite::Connection,
    cutoff: Time,
) -> Result<usize, Error> {
    let mut stmt = conn.prepare_cached(DELETE_STALE_PRESENCE_SQL)?;
    Ok(stmt.execute(named_params! {":cutoff_90k": cutoff.0})?)
}

pub(crate) fn delete_room_presence(
    conn: &rusqlite::Connection,
    room_id: i32,
) -> Result<usize, Error> {
    let mut stmt = conn.prepare_cached(DELETE_ROOM_PRESENCE_SQL)?;
    Ok(stmt.execute(named_params! {":room_id": room_id})?)
}

pub(crate) fn count_active_presence(
    conn: &rusqlite::Connection,
    cutoff: Time,
) -> Result<(usize, usize), Error> {
    let active: usize = conn.query_row(
        "select count(*) from presence where last_seen_90k >= :cutoff_90k",
        named_params! {":cutoff_90k": cutoff.0},
        |row| row.get(0),
    )?;
    let occupied: usize = conn.query_row(
        "select count(distinct room_id) from presence
         where last_seen_90k >= :cutoff_90k and room_id is not null",
        named_params! {":cutoff_90k": cutoff.0},
        |row| row.get(0),
    )?;
    Ok((active, occupied))
}

pub(crate) fn get_attendance(
    conn: &rusqlite::Connection,
    student_id: i32,
    date: &str,
) -> Result<Option<AttendanceRow>, Error> {
    let mut stmt = conn.prepare_cached(GET_ATTENDANCE_SQL)?;
    let mut rows = stmt.query(named_params! {
        ":student_id": student_id,
        ":date": date,
    })?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => Ok(Some(AttendanceRow {
            id: row.get(0)?,
            student_id,
            time: Time(row.get(1)?),
            confidence: row.get(2)?,
            snapshot_path: row.get(3)?,
        })),
    }
}

pub(crate) fn insert_attendance(
    conn: &rusqlite::Connection,
    student_id: i32,
    date: &str,
    when: Time,
    confidence: f32,
    snapshot_path: Option<&str>,
) -> Result<i32, Error> {
    let mut stmt = conn.prepare_cached(INSERT_ATTENDANCE_SQL)?;
    stmt.execute(named_params! {
        ":student_id": student_id,
        ":date": date,
        ":time_90k": when.0,
        ":confidence": confidence,
        ":snapshot_path": snapshot_path,
    })?;
    Ok(conn.last_insert_rowid() as i32)
}

pub(crate) fn list_attendance(
    conn: &rusqlite::Connection,
    date: &str,
) -> Result<Vec<AttendanceRow>, Error> {
    let mut stmt = conn.prepare_cached(LIST_ATTENDANCE_SQL)?;
    let mut rows = stmt.query(named_params! {":date": date})?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(AttendanceRow {
            id: row.get(0)?,
            student_id: row.get(1)?,
            time: Time(row.get(2)?),
            confidence: row.get(3)?,
            snapshot_path: row.get(4)?,
        });
    }
    Ok(out)
}

pub(crate) fn insert_student_image(
    conn: &rusqlite::Connection,
    student_id: i32,
    image_path: &str,
    embedding: &[u8],
    when: Time,
) -> Result<i32, Error> {
    let mut stmt = conn.prepare_cached(INSERT_STUDENT_IMAGE_SQL)?;
    stmt.execute(named_params! {
        ":student_id": student_id,
        ":image_path": image_path,
        ":embedding": embedding,
        ":created_90k": when.0,
    })?;
    Ok(conn.last_insert_rowid() as i32)
}

/// Passes every stored (student id, embedding blob) to `f` in insertion
/// order, for rebuilding the vector index.
pub(crate) fn list_embeddings(
    conn: &rusqlite::Connection,
    f: &mut dyn FnMut(i32, &[u8]) -> Result<(), Error>,
) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached(LIST_EMBEDDINGS_SQL)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let student_id: i32 = row.get(0)?;
        let blob = row.get_ref(1)?.as_blob().map_err(rusqlite::Error::from)?;
        f(student_id, blob)?;
    }
    Ok(())
}
