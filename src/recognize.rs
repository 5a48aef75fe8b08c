// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recognition dispatcher: decides which frames to recognize and runs
//! recognition off the streamer threads.
//!
//! The frame callback (running on a streamer thread) is constant-time apart
//! from the optional JPEG encode for stream subscribers: it drops frames
//! when too many recognition tasks are in flight, applies the frame-skip
//! and interval gates, and hands accepted frames to the blocking pool.
//! Recognition itself queries the vector index, partitions faces into
//! known/guest, writes presence under the per-room cooldown, and publishes
//! `presence_update` / `face_detection` events.
//!
//! Per camera, frames are recognized in arrival order (one worker thread
//! per camera, FIFO submission). No order is promised across cameras.

use crate::facedet::{self, Detector};
use crate::hub::{Channel, Hub};
use crate::json;
use crate::stream::Frame;
use crate::streamer::FrameCallback;
use crate::track::{spatial_key, CooldownTable, GuestTracker};
use base::clock::Clocks;
use base::time::{Duration, Time};
use base::{Error, FastHashMap};
use db::vector::VectorIndex;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{trace, warn};

/// How often the tracking maps get swept, opportunistically from the frame
/// callback.
const HOUSEKEEPING_INTERVAL: Duration = Duration(60 * base::time::TIME_UNITS_PER_SEC);

/// Past this many cooldown entries, recognition tasks sweep eagerly.
const COOLDOWN_SWEEP_LEN: usize = 100;

#[derive(Clone, Debug)]
pub struct Config {
    pub confidence_threshold: f32,
    pub max_faces_per_frame: usize,
    pub recognition_interval: Duration,
    pub cooldown: Duration,
    pub min_face_size: f32,
    pub frame_skip: u64,
    pub presence_timeout: Duration,
    pub max_pending_tasks: usize,
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            confidence_threshold: 0.6,
            max_faces_per_frame: 10,
            recognition_interval: Duration::milliseconds(300),
            cooldown: Duration::seconds(10),
            min_face_size: 60.0,
            frame_skip: 2,
            presence_timeout: Duration::seconds(30),
            max_pending_tasks: 50,
            jpeg_quality: 85,
        }
    }
}

#[derive(Default)]
struct CameraState {
    frame_counter: u64,
    last_recognition: Option<Duration>,
}

struct DispatchState {
    per_camera: FastHashMap<i32, CameraState>,
    cooldowns: CooldownTable,
    guests: GuestTracker,
    last_housekeeping: Duration,
}

pub struct Dispatcher<C: Clocks + Clone = base::clock::RealClocks> {
    db: Arc<db::Database<C>>,
    index: Arc<VectorIndex>,
    detector: Arc<dyn Detector>,
    hub: Arc<Hub>,
    cfg: Config,
    rt: tokio::runtime::Handle,
    pending: Arc<Semaphore>,
    state: Mutex<DispatchState>,
}

impl<C: Clocks + Clone> Dispatcher<C> {
    pub fn new(
        db: Arc<db::Database<C>>,
        index: Arc<VectorIndex>,
        detector: Arc<dyn Detector>,
        hub: Arc<Hub>,
        cfg: Config,
        rt: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let pending = Arc::new(Semaphore::new(cfg.max_pending_tasks));
        let state = Mutex::new(DispatchState {
            per_camera: FastHashMap::default(),
            cooldowns: CooldownTable::new(cfg.cooldown),
            guests: GuestTracker::new(cfg.presence_timeout),
            last_housekeeping: db.clocks().monotonic(),
        });
        Arc::new(Dispatcher {
            db,
            index,
            detector,
            hub,
            cfg,
            rt,
            pending,
            state,
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The frame callback to hand to stream workers.
    pub fn frame_callback(self: &Arc<Self>) -> FrameCallback {
        let this = self.clone();
        Arc::new(move |frame, when, room_id, camera_id| {
            this.handle_frame(frame, when, room_id, camera_id)
        })
    }

    /// Active guest cells in the room right now; used when composing
    /// presence messages outside a recognition task (reaper, WS snapshot).
    pub fn guest_count(&self, room_id: i32) -> usize {
        let now = self.db.clocks().monotonic();
        self.state.lock().unwrap().guests.active_count(room_id, now)
    }

    /// Drops a stopped camera's gating state.
    pub fn forget_camera(&self, camera_id: i32) {
        self.state.lock().unwrap().per_camera.remove(&camera_id);
    }

    /// Runs on the streamer thread for every frame; must hand off or drop.
    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        when: Time,
        room_id: i32,
        camera_id: i32,
    ) -> Result<(), Error> {
        // Backpressure: drop the whole frame when recognition is saturated.
        if self.pending.available_permits() == 0 {
            trace!("camera {camera_id}: dropping frame, recognition saturated");
            return Ok(());
        }

        let now = self.db.clocks().monotonic();
        {
            let mut l = self.state.lock().unwrap();
            if now - l.last_housekeeping >= HOUSEKEEPING_INTERVAL {
                l.cooldowns.sweep(now);
                l.guests.sweep(now);
                l.last_housekeeping = now;
            }
        }

        // Mirror the frame to stream subscribers, paying for the encode
        // only if someone is watching.
        if self.hub.has_camera_subscribers(camera_id) {
            let jpeg = frame.to_jpeg(self.cfg.jpeg_quality)?;
            self.hub.publish_binary(camera_id, jpeg.into());
        }

        {
            let mut l = self.state.lock().unwrap();
            let cam = l.per_camera.entry(camera_id).or_default();
            cam.frame_counter += 1;
            if cam.frame_counter % self.cfg.frame_skip != 0 {
                return Ok(());
            }
            match cam.last_recognition {
                Some(last) if now - last < self.cfg.recognition_interval => return Ok(()),
                _ => cam.last_recognition = Some(now),
            }
        }

        let permit = match self.pending.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return Ok(()), // raced with other cameras; drop.
        };
        let this = self.clone();
        self.rt.spawn_blocking(move || {
            let _permit = permit;
            if let Err(err) = this.recognize(frame, when, room_id, camera_id) {
                warn!(
                    "camera {camera_id}: recognition failed: {}",
                    err.chain()
                );
            }
        });
        Ok(())
    }

    /// One recognition pass over a frame. Runs on the blocking pool.
    fn recognize(&self, frame: Frame, when: Time, room_id: i32, camera_id: i32) -> Result<(), Error> {
        let faces = self.detector.detect_and_embed(&frame)?;
        let mut faces: Vec<facedet::Detection> = faces
            .into_iter()
            .filter(|f| {
                f.size() >= self.cfg.min_face_size && f.score >= facedet::MIN_DETECTION_SCORE
            })
            .collect();
        faces.sort_by(|a, b| b.size().total_cmp(&a.size()));
        faces.truncate(self.cfg.max_faces_per_frame);

        let now = self.db.clocks().monotonic();
        let mut overlay = Vec::with_capacity(faces.len());
        let mut new_recognitions: Vec<json::Occupant> = Vec::new();

        for face in &faces {
            let matched = self
                .index
                .search_with_threshold(&face.embedding, self.cfg.confidence_threshold)?;
            let (student_id, score) = match matched {
                None => {
                    self.track_guest(room_id, face, now, &mut overlay);
                    continue;
                }
                Some(m) => m,
            };

            // Resolve the student; an id in the index but not the database
            // (deleted mid-flight) counts as a guest.
            let student = {
                let l = self.db.lock();
                l.students_by_id().get(&student_id).cloned()
            };
            let student = match student {
                None => {
                    self.track_guest(room_id, face, now, &mut overlay);
                    continue;
                }
                Some(s) => s,
            };
            overlay.push(json::FaceOverlay {
                r#type: "student",
                label: format!("{} {}", student.first_name, student.last_name),
                student_id: Some(student.student_number.clone()),
                bbox: face.bbox,
                confidence: score,
            });

            let hot = {
                let l = self.state.lock().unwrap();
                l.cooldowns.is_hot(room_id, student_id, now)
            };
            if hot {
                continue;
            }
            self.db
                .lock()
                .upsert_presence(student_id, room_id, Some(camera_id), when, score)?;
            self.state
                .lock()
                .unwrap()
                .cooldowns
                .mark(room_id, student_id, now);
            new_recognitions.push(json::Occupant {
                student_id,
                student_number: student.student_number,
                first_name: student.first_name,
                last_name: student.last_name,
                group_name: student.group_name,
                last_seen_at: when.iso8601(),
                confidence: score,
                camera_id: Some(camera_id),
            });
        }

        if !new_recognitions.is_empty() {
            let (room_name, occupants) = {
                let l = self.db.lock();
                let name = l
                    .rooms_by_id()
                    .get(&room_id)
                    .map(|r| r.name.clone())
                    .unwrap_or_else(|| format!("room {room_id}"));
                let cutoff = self.db.clocks().realtime() - self.cfg.presence_timeout;
                let occupants = l
                    .list_room_presence(room_id, cutoff)?
                    .iter()
                    .map(json::Occupant::from_row)
                    .collect();
                (name, occupants)
            };
            let guest_count = {
                let l = self.state.lock().unwrap();
                l.guests.active_count(room_id, now)
            };
            let msg = json::PresenceMessage::new(
                "presence_update",
                room_id,
                room_name,
                occupants,
                Some(new_recognitions),
                guest_count,
                when,
            );
            self.hub.publish_json(Channel::Room(room_id), &msg);
            self.hub.publish_json(Channel::Global, &msg);
        }

        // Always report the overlay, even with zero faces; clients clear
        // their boxes from it.
        let total_faces = overlay.len();
        self.hub.publish_json(
            Channel::Camera(camera_id),
            &json::FaceDetectionMessage {
                r#type: "face_detection",
                camera_id,
                faces: overlay,
                total_faces,
                timestamp: when.iso8601(),
            },
        );

        let mut l = self.state.lock().unwrap();
        if l.cooldowns.len() > COOLDOWN_SWEEP_LEN {
            l.cooldowns.sweep(now);
        }
        Ok(())
    }

    fn track_guest(
        &self,
        room_id: i32,
        face: &facedet::Detection,
        now: Duration,
        overlay: &mut Vec<json::FaceOverlay>,
    ) {
        let key = spatial_key(&face.bbox);
        self.state
            .lock()
            .unwrap()
            .guests
            .update(room_id, key, now);
        overlay.push(json::FaceOverlay {
            r#type: "guest",
            label: "Guest".to_owned(),
            student_id: None,
            bbox: face.bbox,
            confidence: 0.0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facedet::testutil::{detection, FakeDetector};
    use crate::hub::testutil::{collect, json_messages};
    use crate::stream::testutil::solid_frame;
    use base::clock::SimulatedClocks;
    use db::testutil::{self, TestDb};
    use std::time::Duration as StdDuration;

    const DIM: usize = 8;

    /// The test student's (unnormalized) enrollment vector.
    fn student_embedding() -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[0] = 1.0;
        v
    }

    fn stranger_embedding() -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[1] = 1.0;
        v
    }

    struct Fixture {
        tdb: TestDb<SimulatedClocks>,
        clocks: SimulatedClocks,
        detector: Arc<FakeDetector>,
        dispatcher: Arc<Dispatcher<SimulatedClocks>>,
    }

    fn fixture(cfg: Config, rt: tokio::runtime::Handle) -> Fixture {
        testutil::init();
        let clocks = SimulatedClocks::new(Time::from_unix(1706745600, 0));
        let tdb = TestDb::new(clocks.clone());
        let index = Arc::new(VectorIndex::empty(DIM));
        for _ in 0..5 {
            index
                .add(student_embedding(), testutil::TEST_STUDENT_ID)
                .unwrap();
        }
        let detector = Arc::new(FakeDetector::new());
        let dispatcher = Dispatcher::new(
            tdb.db.clone(),
            index,
            detector.clone() as Arc<dyn Detector>,
            Arc::new(Hub::new()),
            cfg,
            rt,
        );
        Fixture {
            tdb,
            clocks,
            detector,
            dispatcher,
        }
    }

    fn face_at(bbox: [f32; 4], embedding: Vec<f32>) -> facedet::Detection {
        detection(bbox, 0.9, embedding)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_camera_recognition() {
        let f = fixture(
            Config {
                frame_skip: 1,
                recognition_interval: Duration(0),
                ..Config::default()
            },
            tokio::runtime::Handle::current(),
        );
        let room_rx = collect(f.dispatcher.hub(), Channel::Room(testutil::TEST_ROOM_ID));
        let global_rx = collect(f.dispatcher.hub(), Channel::Global);
        let cam_rx = collect(f.dispatcher.hub(), Channel::Camera(testutil::TEST_CAMERA_ID));

        f.detector.put(
            320,
            vec![face_at([100.0, 100.0, 220.0, 240.0], student_embedding())],
        );
        f.dispatcher
            .recognize(
                solid_frame(320, 240),
                f.clocks.realtime(),
                testutil::TEST_ROOM_ID,
                testutil::TEST_CAMERA_ID,
            )
            .unwrap();

        // Presence row exists.
        let rows = f
            .tdb
            .db
            .lock()
            .list_room_presence(testutil::TEST_ROOM_ID, Time::MIN)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].student_id, testutil::TEST_STUDENT_ID);
        assert_eq!(rows[0].camera_id, Some(testutil::TEST_CAMERA_ID));
        assert!(rows[0].confidence >= 0.99);

        // presence_update on the room and global channels.
        for rx in [&room_rx, &global_rx] {
            let msgs = json_messages(rx);
            assert_eq!(msgs.len(), 1);
            let m = &msgs[0];
            assert_eq!(m["type"], "presence_update");
            assert_eq!(m["room_name"], testutil::TEST_ROOM_NAME);
            assert_eq!(m["total_count"], 1);
            assert_eq!(m["guest_count"], 0);
            assert_eq!(m["total_people"], 1);
            assert_eq!(m["new_recognitions"].as_array().unwrap().len(), 1);
            assert_eq!(
                m["new_recognitions"][0]["student_number"],
                testutil::TEST_STUDENT_NUMBER
            );
        }

        // face_detection on the camera channel with one student entry.
        let msgs = json_messages(&cam_rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "face_detection");
        assert_eq!(msgs[0]["total_faces"], 1);
        assert_eq!(msgs[0]["faces"][0]["type"], "student");
        assert_eq!(
            msgs[0]["faces"][0]["student_id"],
            testutil::TEST_STUDENT_NUMBER
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cooldown_suppresses_second_upsert() {
        let f = fixture(Config::default(), tokio::runtime::Handle::current());
        let room_rx = collect(f.dispatcher.hub(), Channel::Room(testutil::TEST_ROOM_ID));
        let cam_rx = collect(f.dispatcher.hub(), Channel::Camera(testutil::TEST_CAMERA_ID));
        f.detector.put(
            320,
            vec![face_at([100.0, 100.0, 220.0, 240.0], student_embedding())],
        );

        let t0 = f.clocks.realtime();
        f.dispatcher
            .recognize(solid_frame(320, 240), t0, testutil::TEST_ROOM_ID, testutil::TEST_CAMERA_ID)
            .unwrap();
        assert_eq!(json_messages(&room_rx).len(), 1);

        // Two seconds later (within the 10 s cooldown): no new upsert, no
        // presence_update, but face_detection still reports the student.
        f.clocks.sleep(Duration::seconds(2));
        let t1 = f.clocks.realtime();
        f.dispatcher
            .recognize(solid_frame(320, 240), t1, testutil::TEST_ROOM_ID, testutil::TEST_CAMERA_ID)
            .unwrap();

        let rows = f
            .tdb
            .db
            .lock()
            .list_room_presence(testutil::TEST_ROOM_ID, Time::MIN)
            .unwrap();
        assert_eq!(rows[0].last_seen, t0, "second upsert should be suppressed");
        assert_eq!(json_messages(&room_rx).len(), 0);
        assert_eq!(json_messages(&cam_rx).len(), 2);

        // Past the cooldown the upsert happens again.
        f.clocks.sleep(Duration::seconds(9));
        let t2 = f.clocks.realtime();
        f.dispatcher
            .recognize(solid_frame(320, 240), t2, testutil::TEST_ROOM_ID, testutil::TEST_CAMERA_ID)
            .unwrap();
        let rows = f
            .tdb
            .db
            .lock()
            .list_room_presence(testutil::TEST_ROOM_ID, Time::MIN)
            .unwrap();
        assert_eq!(rows[0].last_seen, t2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn guests_conflate_by_cell() {
        let f = fixture(Config::default(), tokio::runtime::Handle::current());
        f.detector.put(
            320,
            vec![face_at([100.0, 100.0, 200.0, 200.0], stranger_embedding())],
        );
        f.detector.put(
            321,
            vec![face_at([105.0, 102.0, 201.0, 198.0], stranger_embedding())],
        );

        f.dispatcher
            .recognize(
                solid_frame(320, 240),
                f.clocks.realtime(),
                testutil::TEST_ROOM_ID,
                testutil::TEST_CAMERA_ID,
            )
            .unwrap();
        f.clocks.sleep(Duration::seconds(1));
        f.dispatcher
            .recognize(
                solid_frame(321, 240),
                f.clocks.realtime(),
                testutil::TEST_ROOM_ID,
                testutil::TEST_CAMERA_ID,
            )
            .unwrap();

        // The same quantized cell: one guest, and no presence rows.
        assert_eq!(f.dispatcher.guest_count(testutil::TEST_ROOM_ID), 1);
        assert_eq!(
            f.tdb
                .db
                .lock()
                .list_room_presence(testutil::TEST_ROOM_ID, Time::MIN)
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn small_faces_filtered() {
        let f = fixture(Config::default(), tokio::runtime::Handle::current());
        let cam_rx = collect(f.dispatcher.hub(), Channel::Camera(testutil::TEST_CAMERA_ID));
        // 40 px face, below the 60 px floor.
        f.detector.put(
            320,
            vec![face_at([0.0, 0.0, 40.0, 40.0], student_embedding())],
        );
        f.dispatcher
            .recognize(
                solid_frame(320, 240),
                f.clocks.realtime(),
                testutil::TEST_ROOM_ID,
                testutil::TEST_CAMERA_ID,
            )
            .unwrap();
        let msgs = json_messages(&cam_rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["total_faces"], 0);
        assert_eq!(msgs[0]["faces"].as_array().unwrap().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_encode_without_subscribers() {
        let f = fixture(
            Config {
                frame_skip: 1,
                recognition_interval: Duration(0),
                ..Config::default()
            },
            tokio::runtime::Handle::current(),
        );

        // Without a subscriber, nothing lands on the camera channel when a
        // frame flows through the callback path. (The encode is gated on
        // the same check, so this also covers "no JPEG encoding occurs".)
        f.dispatcher
            .clone()
            .handle_frame(
                solid_frame(16, 16),
                f.clocks.realtime(),
                testutil::TEST_ROOM_ID,
                testutil::TEST_CAMERA_ID,
            )
            .unwrap();

        let cam_rx = collect(f.dispatcher.hub(), Channel::Camera(testutil::TEST_CAMERA_ID));
        f.dispatcher
            .clone()
            .handle_frame(
                solid_frame(16, 16),
                f.clocks.realtime(),
                testutil::TEST_ROOM_ID,
                testutil::TEST_CAMERA_ID,
            )
            .unwrap();
        // A face_detection event from the first frame's (unwatched)
        // recognition may arrive too; wait specifically for the JPEG.
        let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
        loop {
            match cam_rx
                .recv_timeout(deadline.saturating_duration_since(std::time::Instant::now()))
            {
                Ok(crate::hub::Message::Binary(_)) => break,
                Ok(_) => {}
                Err(e) => panic!("no JPEG frame broadcast: {e}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backpressure_drops_frames() {
        let f = fixture(
            Config {
                frame_skip: 1,
                recognition_interval: Duration(0),
                max_pending_tasks: 1,
                ..Config::default()
            },
            tokio::runtime::Handle::current(),
        );
        let cam_rx = collect(f.dispatcher.hub(), Channel::Camera(testutil::TEST_CAMERA_ID));

        // No detections registered for this tag: recognition completes
        // quickly, but the single permit means at most one task in flight.
        // Saturate by grabbing the only permit ourselves.
        let permit = f.dispatcher.pending.clone().try_acquire_owned().unwrap();
        for _ in 0..10 {
            f.dispatcher
                .clone()
                .handle_frame(
                    solid_frame(320, 240),
                    f.clocks.realtime(),
                    testutil::TEST_ROOM_ID,
                    testutil::TEST_CAMERA_ID,
                )
                .unwrap();
        }
        // All 10 frames were dropped at step one: no face_detection events.
        assert!(cam_rx.recv_timeout(StdDuration::from_millis(100)).is_err());

        drop(permit);
        f.dispatcher
            .clone()
            .handle_frame(
                solid_frame(320, 240),
                f.clocks.realtime(),
                testutil::TEST_ROOM_ID,
                testutil::TEST_CAMERA_ID,
            )
            .unwrap();
        // With the permit released, the frame flows through to recognition.
        cam_rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn frame_skip_gate() {
        let f = fixture(
            Config {
                frame_skip: 3,
                recognition_interval: Duration(0),
                ..Config::default()
            },
            tokio::runtime::Handle::current(),
        );
        let cam_rx = collect(f.dispatcher.hub(), Channel::Camera(testutil::TEST_CAMERA_ID));
        for _ in 0..6 {
            f.dispatcher
                .clone()
                .handle_frame(
                    solid_frame(320, 240),
                    f.clocks.realtime(),
                    testutil::TEST_ROOM_ID,
                    testutil::TEST_CAMERA_ID,
                )
                .unwrap();
        }
        // Frames 3 and 6 pass the gate, each producing a face_detection
        // event. (Every frame also produces a binary JPEG for the
        // subscriber; only the JSON events count recognitions.)
        let mut json_n = 0;
        let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
        while json_n < 2 && std::time::Instant::now() < deadline {
            if let Ok(crate::hub::Message::Json(_)) =
                cam_rx.recv_timeout(StdDuration::from_millis(50))
            {
                json_n += 1;
            }
        }
        assert_eq!(json_n, 2);

        // And no third recognition follows.
        std::thread::sleep(StdDuration::from_millis(100));
        while let Ok(m) = cam_rx.try_recv() {
            assert!(
                !matches!(m, crate::hub::Message::Json(_)),
                "unexpected extra recognition"
            );
        }
    }
}
