// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Database access logic for the Moonfire Presence SQLite schema.
//!
//! The [`Database`] struct caches the administrative tables (rooms, cameras,
//! students) in RAM, making the assumption that only one process is
//! accessing the database at a time. Queries against the high-churn tables
//! (presence, attendance) go to SQLite each time; they are small and
//! indexed.
//!
//! Note that the database lock is held across presence queries issued from
//! recognition tasks. Those tasks run on the blocking pool, so the lock must
//! never be taken from the streamer threads' hot frame path.

use crate::raw;
use crate::schema;
use base::clock::{self, Clocks};
use base::time::Time;
use base::{bail, err, Error};
use rusqlite::named_params;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};
use url::Url;

pub use crate::raw::{AttendanceRow, PresenceRow, StudentPresenceRow};

/// Maximum number of cameras in one room, enforced at admin CRUD time.
pub const MAX_CAMERAS_PER_ROOM: usize = 10;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Student {
    pub id: i32,
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    pub group_name: Option<String>,
    pub created: Time,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Room {
    pub id: i32,
    pub name: String,
    pub active: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Camera {
    pub id: i32,
    pub room_id: i32,
    pub name: String,
    pub rtsp_url: String,
    pub active: bool,
}

impl Camera {
    /// The camera's RTSP URL with any userinfo password hidden, for logs.
    pub fn redacted_url(&self) -> String {
        match Url::parse(&self.rtsp_url) {
            Ok(mut u) => {
                if u.password().is_some() {
                    let _ = u.set_password(Some("redacted"));
                }
                u.to_string()
            }
            Err(_) => "<unparseable>".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct StudentChange {
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    pub group_name: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct CameraChange {
    pub room_id: i32,
    pub name: String,
    pub rtsp_url: String,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct RoomPresence {
    pub room_id: i32,
    pub room_name: String,
    pub occupants: Vec<PresenceRow>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PresenceStats {
    pub active_people: usize,
    pub total_rooms: usize,
    pub occupied_rooms: usize,
}

fn validate_rtsp_url(url: &str) -> Result<(), Error> {
    let parsed =
        Url::parse(url).map_err(|e| err!(InvalidArgument, msg("invalid RTSP URL"), source(e)))?;
    if parsed.scheme() != "rtsp" && parsed.scheme() != "rtsps" {
        bail!(
            InvalidArgument,
            msg("invalid RTSP URL: scheme must be rtsp or rtsps, not {:?}", parsed.scheme())
        );
    }
    Ok(())
}

pub struct LockedDatabase {
    conn: rusqlite::Connection,
    rooms_by_id: BTreeMap<i32, Room>,
    cameras_by_id: BTreeMap<i32, Camera>,
    students_by_id: BTreeMap<i32, Student>,
    students_by_number: BTreeMap<String, i32>,
}

impl LockedDatabase {
    fn new(conn: rusqlite::Connection) -> Result<Self, Error> {
        let mut db = LockedDatabase {
            conn,
            rooms_by_id: BTreeMap::new(),
            cameras_by_id: BTreeMap::new(),
            students_by_id: BTreeMap::new(),
            students_by_number: BTreeMap::new(),
        };
        db.init_rooms()?;
        db.init_cameras()?;
        db.init_students()?;
        Ok(db)
    }

    fn init_rooms(&mut self) -> Result<(), Error> {
        let mut stmt = self
            .conn
            .prepare("select id, name, active from room")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i32 = row.get(0)?;
            self.rooms_by_id.insert(
                id,
                Room {
                    id,
                    name: row.get(1)?,
                    active: row.get(2)?,
                },
            );
        }
        drop(rows);
        drop(stmt);
        tracing::info!("loaded {} rooms", self.rooms_by_id.len());
        Ok(())
    }

    fn init_cameras(&mut self) -> Result<(), Error> {
        let mut stmt = self
            .conn
            .prepare("select id, room_id, name, rtsp_url, active from camera")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i32 = row.get(0)?;
            self.cameras_by_id.insert(
                id,
                Camera {
                    id,
                    room_id: row.get(1)?,
                    name: row.get(2)?,
                    rtsp_url: row.get(3)?,
                    active: row.get(4)?,
                },
            );
        }
        drop(rows);
        drop(stmt);
        tracing::info!("loaded {} cameras", self.cameras_by_id.len());
        Ok(())
    }

    fn init_students(&mut self) -> Result<(), Error> {
        let mut stmt = self.conn.prepare(
            "select id, student_number, first_name, last_name, group_name, created_90k
             from student",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i32 = row.get(0)?;
            let s = Student {
                id,
                student_number: row.get(1)?,
                first_name: row.get(2)?,
                last_name: row.get(3)?,
                group_name: row.get(4)?,
                created: Time(row.get(5)?),
            };
            self.students_by_number.insert(s.student_number.clone(), id);
            self.students_by_id.insert(id, s);
        }
        drop(rows);
        drop(stmt);
        tracing::info!("loaded {} students", self.students_by_id.len());
        Ok(())
    }

    pub fn rooms_by_id(&self) -> &BTreeMap<i32, Room> {
        &self.rooms_by_id
    }

    pub fn cameras_by_id(&self) -> &BTreeMap<i32, Camera> {
        &self.cameras_by_id
    }

    pub fn students_by_id(&self) -> &BTreeMap<i32, Student> {
        &self.students_by_id
    }

    pub fn get_student_by_number(&self, number: &str) -> Option<&Student> {
        self.students_by_number
            .get(number)
            .and_then(|id| self.students_by_id.get(id))
    }

    /// The cameras of one room, in id order.
    pub fn room_cameras(&self, room_id: i32) -> Vec<&Camera> {
        self.cameras_by_id
            .values()
            .filter(|c| c.room_id == room_id)
            .collect()
    }

    pub fn add_room(&mut self, name: &str, active: bool) -> Result<i32, Error> {
        if name.is_empty() {
            bail!(InvalidArgument, msg("room name must not be empty"));
        }
        if self.rooms_by_id.values().any(|r| r.name == name) {
            bail!(AlreadyExists, msg("room {name:?} already exists"));
        }
        self.conn.execute(
            "insert into room (name, active) values (:name, :active)",
            named_params! {":name": name, ":active": active},
        )?;
        let id = self.conn.last_insert_rowid() as i32;
        self.rooms_by_id.insert(
            id,
            Room {
                id,
                name: name.to_owned(),
                active,
            },
        );
        Ok(id)
    }

    pub fn update_room(
        &mut self,
        id: i32,
        name: Option<&str>,
        active: Option<bool>,
    ) -> Result<(), Error> {
        let room = self
            .rooms_by_id
            .get(&id)
            .ok_or_else(|| err!(NotFound, msg("no such room {id}")))?;
        let new_name = name.unwrap_or(&room.name).to_owned();
        let new_active = active.unwrap_or(room.active);
        if new_name != room.name && self.rooms_by_id.values().any(|r| r.name == new_name) {
            bail!(AlreadyExists, msg("room {new_name:?} already exists"));
        }
        self.conn.execute(
            "update room set name = :name, active = :active where id = :id",
            named_params! {":name": &new_name, ":active": new_active, ":id": id},
        )?;
        let room = self.rooms_by_id.get_mut(&id).expect("just fetched");
        room.name = new_name;
        room.active = new_active;
        Ok(())
    }

    /// Deletes a room, its cameras (schema cascade), and its presence rows.
    /// The caller is responsible for stopping the room's stream workers
    /// first.
    pub fn delete_room(&mut self, id: i32) -> Result<(), Error> {
        if !self.rooms_by_id.contains_key(&id) {
            bail!(NotFound, msg("no such room {id}"));
        }
        raw::delete_room_presence(&self.conn, id)?;
        self.conn
            .execute("delete from room where id = :id", named_params! {":id": id})?;
        self.rooms_by_id.remove(&id);
        self.cameras_by_id.retain(|_, c| c.room_id != id);
        Ok(())
    }

    pub fn add_camera(&mut self, change: CameraChange) -> Result<i32, Error> {
        if !self.rooms_by_id.contains_key(&change.room_id) {
            bail!(NotFound, msg("no such room {}", change.room_id));
        }
        if change.name.is_empty() {
            bail!(InvalidArgument, msg("camera name must not be empty"));
        }
        validate_rtsp_url(&change.rtsp_url)?;
        let in_room = self
            .cameras_by_id
            .values()
            .filter(|c| c.room_id == change.room_id)
            .count();
        if in_room >= MAX_CAMERAS_PER_ROOM {
            bail!(
                ResourceExhausted,
                msg("room {} already has {MAX_CAMERAS_PER_ROOM} cameras", change.room_id)
            );
        }
        self.conn.execute(
            "insert into camera (room_id, name, rtsp_url, active)
             values (:room_id, :name, :rtsp_url, :active)",
            named_params! {
                ":room_id": change.room_id,
                ":name": &change.name,
                ":rtsp_url": &change.rtsp_url,
                ":active": change.active,
            },
        )?;
        let id = self.conn.last_insert_rowid() as i32;
        self.cameras_by_id.insert(
            id,
            Camera {
                id,
                room_id: change.room_id,
                name: change.name,
                rtsp_url: change.rtsp_url,
                active: change.active,
            },
        );
        Ok(id)
    }

    pub fn update_camera(&mut self, id: i32, change: CameraChange) -> Result<(), Error> {
        if !self.cameras_by_id.contains_key(&id) {
            bail!(NotFound, msg("no such camera {id}"));
        }
        if !self.rooms_by_id.contains_key(&change.room_id) {
            bail!(NotFound, msg("no such room {}", change.room_id));
        }
        validate_rtsp_url(&change.rtsp_url)?;
        self.conn.execute(
            "update camera set room_id = :room_id, name = :name, rtsp_url = :rtsp_url,
             active = :active where id = :id",
            named_params! {
                ":room_id": change.room_id,
                ":name": &change.name,
                ":rtsp_url": &change.rtsp_url,
                ":active": change.active,
                ":id": id,
            },
        )?;
        let camera = self.cameras_by_id.get_mut(&id).expect("just checked");
        camera.room_id = change.room_id;
        camera.name = change.name;
        camera.rtsp_url = change.rtsp_url;
        camera.active = change.active;
        Ok(())
    }

    pub fn delete_camera(&mut self, id: i32) -> Result<(), Error> {
        if !self.cameras_by_id.contains_key(&id) {
            bail!(NotFound, msg("no such camera {id}"));
        }
        self.conn.execute(
            "delete from camera where id = :id",
            named_params! {":id": id},
        )?;
        self.cameras_by_id.remove(&id);
        Ok(())
    }

    pub fn add_student(&mut self, change: StudentChange, now: Time) -> Result<i32, Error> {
        if change.student_number.is_empty() {
            bail!(InvalidArgument, msg("student number must not be empty"));
        }
        if self.students_by_number.contains_key(&change.student_number) {
            bail!(
                AlreadyExists,
                msg("student number {:?} already exists", change.student_number)
            );
        }
        self.conn.execute(
            "insert into student (student_number, first_name, last_name, group_name, created_90k)
             values (:student_number, :first_name, :last_name, :group_name, :created_90k)",
            named_params! {
                ":student_number": &change.student_number,
                ":first_name": &change.first_name,
                ":last_name": &change.last_name,
                ":group_name": &change.group_name,
                ":created_90k": now.0,
            },
        )?;
        let id = self.conn.last_insert_rowid() as i32;
        self.students_by_number
            .insert(change.student_number.clone(), id);
        self.students_by_id.insert(
            id,
            Student {
                id,
                student_number: change.student_number,
                first_name: change.first_name,
                last_name: change.last_name,
                group_name: change.group_name,
                created: now,
            },
        );
        Ok(id)
    }

    /// Deletes a student; images, presence and attendance rows cascade. The
    /// caller must separately remove the student from the vector index.
    pub fn delete_student(&mut self, id: i32) -> Result<(), Error> {
        let s = match self.students_by_id.remove(&id) {
            None => bail!(NotFound, msg("no such student {id}")),
            Some(s) => s,
        };
        self.students_by_number.remove(&s.student_number);
        self.conn.execute(
            "delete from student where id = :id",
            named_params! {":id": id},
        )?;
        Ok(())
    }

    pub fn add_student_image(
        &mut self,
        student_id: i32,
        image_path: &str,
        embedding: &[f32],
        now: Time,
    ) -> Result<i32, Error> {
        if !self.students_by_id.contains_key(&student_id) {
            bail!(NotFound, msg("no such student {student_id}"));
        }
        let mut blob = Vec::with_capacity(embedding.len() * 4);
        for &v in embedding {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        raw::insert_student_image(&self.conn, student_id, image_path, &blob, now)
    }

    /// Passes every stored (student id, embedding) to `f` in insertion
    /// order. Used to rebuild the vector index from scratch.
    pub fn list_embeddings(
        &self,
        f: &mut dyn FnMut(i32, Vec<f32>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        raw::list_embeddings(&self.conn, &mut |student_id, blob| {
            if blob.len() % 4 != 0 {
                bail!(DataLoss, msg("embedding blob of student {student_id} is truncated"));
            }
            let v = blob
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            f(student_id, v)
        })
    }

    pub fn upsert_presence(
        &mut self,
        student_id: i32,
        room_id: i32,
        camera_id: Option<i32>,
        when: Time,
        confidence: f32,
    ) -> Result<(), Error> {
        if !self.students_by_id.contains_key(&student_id) {
            bail!(NotFound, msg("no such student {student_id}"));
        }
        raw::upsert_presence(&self.conn, student_id, room_id, camera_id, when, confidence)
    }

    /// The active occupants of a room, most recently seen first. Rows with
    /// `last_seen >= cutoff` are active; pass `Time::MIN` to include stale
    /// rows.
    pub fn list_room_presence(
        &self,
        room_id: i32,
        cutoff: Time,
    ) -> Result<Vec<PresenceRow>, Error> {
        raw::list_room_presence(&self.conn, room_id, cutoff)
    }

    /// Per-active-room presence, rooms ordered by name.
    pub fn list_all_presence(&self, cutoff: Time) -> Result<Vec<RoomPresence>, Error> {
        let mut rooms: Vec<&Room> = self.rooms_by_id.values().filter(|r| r.active).collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out = Vec::with_capacity(rooms.len());
        for r in rooms {
            out.push(RoomPresence {
                room_id: r.id,
                room_name: r.name.clone(),
                occupants: raw::list_room_presence(&self.conn, r.id, cutoff)?,
            });
        }
        Ok(out)
    }

    pub fn get_student_presence(
        &self,
        student_id: i32,
        cutoff: Time,
    ) -> Result<Option<StudentPresenceRow>, Error> {
        raw::get_student_presence(&self.conn, student_id, cutoff)
    }

    /// Removes rows strictly older than `cutoff`, returning the count.
    pub fn cleanup_stale_presence(&mut self, cutoff: Time) -> Result<usize, Error> {
        raw::delete_stale_presence(&self.conn, cutoff)
    }

    pub fn clear_room_presence(&mut self, room_id: i32) -> Result<usize, Error> {
        raw::delete_room_presence(&self.conn, room_id)
    }

    pub fn presence_stats(&self, cutoff: Time) -> Result<PresenceStats, Error> {
        let (active_people, occupied_rooms) = raw::count_active_presence(&self.conn, cutoff)?;
        Ok(PresenceStats {
            active_people,
            total_rooms: self.rooms_by_id.values().filter(|r| r.active).count(),
            occupied_rooms,
        })
    }

    pub fn get_attendance(
        &self,
        student_id: i32,
        date: &str,
    ) -> Result<Option<AttendanceRow>, Error> {
        raw::get_attendance(&self.conn, student_id, date)
    }

    pub fn insert_attendance(
        &mut self,
        student_id: i32,
        date: &str,
        when: Time,
        confidence: f32,
        snapshot_path: Option<&str>,
    ) -> Result<i32, Error> {
        if !self.students_by_id.contains_key(&student_id) {
            bail!(NotFound, msg("no such student {student_id}"));
        }
        raw::insert_attendance(&self.conn, student_id, date, when, confidence, snapshot_path)
    }

    pub fn list_attendance(&self, date: &str) -> Result<Vec<AttendanceRow>, Error> {
        raw::list_attendance(&self.conn, date)
    }
}

/// The recognition pipeline's database handle. Opens the database in
/// read/write mode, checks the schema version, and serializes access.
pub struct Database<C: Clocks + Clone = clock::RealClocks> {
    db: Mutex<LockedDatabase>,
    clocks: C,
}

impl<C: Clocks + Clone> Database<C> {
    pub fn new(clocks: C, conn: rusqlite::Connection) -> Result<Self, Error> {
        schema::set_pragmas(&conn)?;
        match schema::get_schema_version(&conn)? {
            None => bail!(
                FailedPrecondition,
                msg("no such table: version.\n\nIf you have created an empty database, run `moonfire-presence init`.")
            ),
            Some(v) if v != schema::EXPECTED_SCHEMA_VERSION => bail!(
                FailedPrecondition,
                msg(
                    "database schema version {v} does not match expected version {}",
                    schema::EXPECTED_SCHEMA_VERSION
                )
            ),
            Some(_) => {}
        }
        Ok(Database {
            db: Mutex::new(LockedDatabase::new(conn)?),
            clocks,
        })
    }

    #[inline(always)]
    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }

    /// Acquires a lock on the database; timed with a [`TimerGuard`] so slow
    /// acquisitions (hinting at a lock-ordering problem) get logged.
    pub fn lock(&self) -> DatabaseGuard<'_> {
        let timer = clock::TimerGuard::new(&self.clocks, acquisition);
        let db = self.db.lock().unwrap();
        drop(timer);
        DatabaseGuard(db)
    }
}

fn acquisition() -> &'static str {
    "database lock acquisition"
}

pub struct DatabaseGuard<'db>(MutexGuard<'db, LockedDatabase>);

impl Deref for DatabaseGuard<'_> {
    type Target = LockedDatabase;
    fn deref(&self) -> &LockedDatabase {
        &self.0
    }
}

impl DerefMut for DatabaseGuard<'_> {
    fn deref_mut(&mut self) -> &mut LockedDatabase {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, TestDb};
    use base::clock::SimulatedClocks;
    use base::time::Duration;

    const PRESENCE_TIMEOUT: Duration = Duration(30 * base::time::TIME_UNITS_PER_SEC);

    fn boot() -> Time {
        Time::from_unix(1706745600, 0)
    }

    #[test]
    fn version_checks() {
        testutil::init();
        let c = SimulatedClocks::new(boot());

        // Missing version table.
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let e = Database::new(c.clone(), conn).unwrap_err();
        assert!(e.to_string().contains("no such table"), "got: {e}");

        // Wrong version.
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table version (id integer primary key, unix_time integer not null, notes text);
             insert into version values (2, 0, null);",
        )
        .unwrap();
        let e = Database::new(c, conn).unwrap_err();
        assert!(e.to_string().contains("version 2"), "got: {e}");
    }

    #[test]
    fn room_and_camera_crud() {
        testutil::init();
        let tdb = TestDb::new(SimulatedClocks::new(boot()));
        let mut l = tdb.db.lock();

        let e = l.add_room("test room", true).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);

        let r2 = l.add_room("overflow", true).unwrap();
        for i in 0..MAX_CAMERAS_PER_ROOM {
            l.add_camera(CameraChange {
                room_id: r2,
                name: format!("cam {i}"),
                rtsp_url: format!("rtsp://host/cam{i}"),
                active: true,
            })
            .unwrap();
        }
        let e = l
            .add_camera(CameraChange {
                room_id: r2,
                name: "one too many".to_owned(),
                rtsp_url: "rtsp://host/last".to_owned(),
                active: true,
            })
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::ResourceExhausted);

        let e = l
            .add_camera(CameraChange {
                room_id: testutil::TEST_ROOM_ID,
                name: "bad scheme".to_owned(),
                rtsp_url: "http://host/stream".to_owned(),
                active: true,
            })
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);

        // Deleting a room removes its cameras and presence rows.
        l.upsert_presence(testutil::TEST_STUDENT_ID, r2, None, boot(), 0.9)
            .unwrap();
        l.delete_room(r2).unwrap();
        assert!(l.room_cameras(r2).is_empty());
        assert_eq!(
            l.list_room_presence(r2, Time::MIN).unwrap().len(),
            0
        );
    }

    #[test]
    fn presence_single_row_last_writer_wins() {
        testutil::init();
        let tdb = TestDb::new(SimulatedClocks::new(boot()));
        let mut l = tdb.db.lock();
        let sid = testutil::TEST_STUDENT_ID;
        let r1 = testutil::TEST_ROOM_ID;
        let r2 = l.add_room("second", true).unwrap();

        let t0 = boot();
        let t1 = t0 + Duration::seconds(5);
        l.upsert_presence(sid, r1, Some(testutil::TEST_CAMERA_ID), t0, 0.8)
            .unwrap();
        l.upsert_presence(sid, r2, None, t1, 0.9).unwrap();

        // Exactly one row, in the most recent room, with the latest seen
        // time.
        assert_eq!(l.list_room_presence(r1, Time::MIN).unwrap().len(), 0);
        let rows = l.list_room_presence(r2, Time::MIN).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_seen, t1);
        assert_eq!(rows[0].student_number, testutil::TEST_STUDENT_NUMBER);
    }

    #[test]
    fn presence_staleness_boundary_is_inclusive() {
        testutil::init();
        let tdb = TestDb::new(SimulatedClocks::new(boot()));
        let mut l = tdb.db.lock();
        let t0 = boot();
        l.upsert_presence(testutil::TEST_STUDENT_ID, testutil::TEST_ROOM_ID, None, t0, 0.8)
            .unwrap();

        // A row exactly at now - timeout is active.
        let now = t0 + PRESENCE_TIMEOUT;
        assert_eq!(
            l.list_room_presence(testutil::TEST_ROOM_ID, now - PRESENCE_TIMEOUT)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(l.cleanup_stale_presence(now - PRESENCE_TIMEOUT).unwrap(), 0);

        // One unit older is stale.
        let now = now + Duration(1);
        assert_eq!(
            l.list_room_presence(testutil::TEST_ROOM_ID, now - PRESENCE_TIMEOUT)
                .unwrap()
                .len(),
            0
        );
        assert_eq!(l.cleanup_stale_presence(now - PRESENCE_TIMEOUT).unwrap(), 1);

        // Back-to-back cleanup removes nothing further.
        assert_eq!(l.cleanup_stale_presence(now - PRESENCE_TIMEOUT).unwrap(), 0);
    }

    #[test]
    fn stats() {
        testutil::init();
        let tdb = TestDb::new(SimulatedClocks::new(boot()));
        let mut l = tdb.db.lock();
        let t0 = boot();
        assert_eq!(
            l.presence_stats(t0 - PRESENCE_TIMEOUT).unwrap(),
            PresenceStats {
                active_people: 0,
                total_rooms: 1,
                occupied_rooms: 0
            }
        );
        l.upsert_presence(testutil::TEST_STUDENT_ID, testutil::TEST_ROOM_ID, None, t0, 0.8)
            .unwrap();
        assert_eq!(
            l.presence_stats(t0 - PRESENCE_TIMEOUT).unwrap(),
            PresenceStats {
                active_people: 1,
                total_rooms: 1,
                occupied_rooms: 1
            }
        );
    }

    #[test]
    fn attendance_unique_per_day() {
        testutil::init();
        let tdb = TestDb::new(SimulatedClocks::new(boot()));
        let mut l = tdb.db.lock();
        let sid = testutil::TEST_STUDENT_ID;
        let t0 = boot();
        assert!(l.get_attendance(sid, "2024-02-01").unwrap().is_none());
        l.insert_attendance(sid, "2024-02-01", t0, 0.9, None).unwrap();
        let prior = l.get_attendance(sid, "2024-02-01").unwrap().unwrap();
        assert_eq!(prior.time, t0);

        // The second insert for the same day violates the unique constraint.
        let e = l
            .insert_attendance(sid, "2024-02-01", t0 + Duration::seconds(60), 0.9, None)
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);

        // A different day is fine.
        l.insert_attendance(sid, "2024-02-02", t0, 0.9, None).unwrap();
    }

    #[test]
    fn student_cascade() {
        testutil::init();
        let tdb = TestDb::new(SimulatedClocks::new(boot()));
        let mut l = tdb.db.lock();
        let sid = testutil::TEST_STUDENT_ID;
        let t0 = boot();
        l.add_student_image(sid, "images/S1/0.jpg", &[0.25; 4], t0).unwrap();
        l.upsert_presence(sid, testutil::TEST_ROOM_ID, None, t0, 0.8).unwrap();
        l.insert_attendance(sid, "2024-02-01", t0, 0.9, None).unwrap();
        l.delete_student(sid).unwrap();

        let mut n = 0;
        l.list_embeddings(&mut |_, _| {
            n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 0);
        assert_eq!(l.list_room_presence(testutil::TEST_ROOM_ID, Time::MIN).unwrap().len(), 0);
        assert!(l.get_attendance(sid, "2024-02-01").unwrap().is_none());
    }

    #[test]
    fn embedding_round_trip() {
        testutil::init();
        let tdb = TestDb::new(SimulatedClocks::new(boot()));
        let mut l = tdb.db.lock();
        let sid = testutil::TEST_STUDENT_ID;
        l.add_student_image(sid, "images/S1/0.jpg", &[0.5, -0.5, 0.25], boot())
            .unwrap();
        let mut got = Vec::new();
        l.list_embeddings(&mut |id, v| {
            got.push((id, v));
            Ok(())
        })
        .unwrap();
        assert_eq!(got, vec![(sid, vec![0.5, -0.5, 0.25])]);
    }
}
