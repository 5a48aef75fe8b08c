// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving Moonfire Presence's
//! persistence library. Used for tests of both the `moonfire_db` crate
//! itself and the `moonfire_presence` crate.

use crate::db;
use base::clock::Clocks;
use std::sync::Arc;

static INIT: std::sync::Once = std::sync::Once::new();

/// ids of the entities created by `TestDb::new` below.
pub const TEST_ROOM_ID: i32 = 1;
pub const TEST_CAMERA_ID: i32 = 1;
pub const TEST_STUDENT_ID: i32 = 1;

pub const TEST_ROOM_NAME: &str = "test room";
pub const TEST_STUDENT_NUMBER: &str = "S2024-0001";
pub const TEST_CAMERA_URL: &str = "rtsp://test-camera/main";

/// Performs global initialization for tests.
///    * set up logging. (Note the output can be confusing unless
///      `RUST_TEST_THREADS=1` is set in the program's environment prior to
///      running.)
///    * set time zone `America/Los_Angeles` so that tests that care about
///      calendar time get the expected results regardless of machine setup.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
        base::time::testutil::init_zone();
    });
}

pub struct TestDb<C: Clocks + Clone> {
    pub db: Arc<db::Database<C>>,
    pub shutdown_tx: base::shutdown::Sender,
    pub shutdown_rx: base::shutdown::Receiver,
}

impl<C: Clocks + Clone> TestDb<C> {
    /// Creates an in-memory test database with one room, one camera, and
    /// one enrolled (but embedding-less) student.
    pub fn new(clocks: C) -> Self {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::schema::init(&mut conn).unwrap();
        let now = clocks.realtime();
        let db = Arc::new(db::Database::new(clocks, conn).unwrap());
        {
            let mut l = db.lock();
            assert_eq!(TEST_ROOM_ID, l.add_room(TEST_ROOM_NAME, true).unwrap());
            assert_eq!(
                TEST_CAMERA_ID,
                l.add_camera(db::CameraChange {
                    room_id: TEST_ROOM_ID,
                    name: "test camera".to_owned(),
                    rtsp_url: TEST_CAMERA_URL.to_owned(),
                    active: true,
                })
                .unwrap()
            );
            assert_eq!(
                TEST_STUDENT_ID,
                l.add_student(
                    db::StudentChange {
                        student_number: TEST_STUDENT_NUMBER.to_owned(),
                        first_name: "Ada".to_owned(),
                        last_name: "Lovelace".to_owned(),
                        group_name: Some("CS-101".to_owned()),
                    },
                    now,
                )
                .unwrap()
            );
        }
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        TestDb {
            db,
            shutdown_tx,
            shutdown_rx,
        }
    }
}
