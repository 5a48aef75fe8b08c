// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Registry of active stream workers, bounded by a global cap.
//!
//! `start_camera` connects synchronously (it's expected to be called from a
//! blocking context such as `tokio::task::spawn_blocking`) and then leaves
//! the worker running on its own named thread. `stop_camera` signals the
//! worker and waits a bounded time for a clean exit; a worker stuck in a
//! decoder read is detached and cleans up when the read times out.

use crate::stream;
use crate::streamer::{self, Status, Streamer};
use base::clock::Clocks;
use base::{bail, err, Error};
use base::FastHashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

/// Default global cap on simultaneously active camera streams.
pub const MAX_SIMULTANEOUS_STREAMS: usize = 20;

/// How long `stop_camera` waits for a worker to exit before detaching it.
const STOP_WAIT: StdDuration = StdDuration::from_secs(2);

struct Handle {
    room_id: i32,
    short_name: String,
    shared: Arc<streamer::Shared>,
    join: thread::JoinHandle<()>,
}

pub struct StreamManager<C: Clocks + Clone = base::clock::RealClocks> {
    clocks: C,
    opener: Arc<dyn stream::Opener>,
    shutdown_rx: base::shutdown::Receiver,
    rt: tokio::runtime::Handle,
    max_streams: usize,
    streams: Mutex<FastHashMap<i32, Handle>>,
}

impl<C: Clocks + Clone> StreamManager<C> {
    pub fn new(
        clocks: C,
        opener: Arc<dyn stream::Opener>,
        shutdown_rx: base::shutdown::Receiver,
        rt: tokio::runtime::Handle,
        max_streams: usize,
    ) -> Self {
        StreamManager {
            clocks,
            opener,
            shutdown_rx,
            rt,
            max_streams,
            streams: Mutex::new(FastHashMap::default()),
        }
    }

    /// Starts a worker for the camera, blocking through connect. Idempotent
    /// if the camera is already streaming. Fails with `ResourceExhausted`
    /// when the global cap is reached, without opening a decoder.
    pub fn start_camera(
        &self,
        camera: &db::Camera,
        frame_callback: streamer::FrameCallback,
        status_callback: streamer::StatusCallback,
        connect_timeout: StdDuration,
    ) -> Result<(), Error> {
        let mut l = self.streams.lock().unwrap();
        if let Some(h) = l.get(&camera.id) {
            if !h.join.is_finished() {
                info!("camera {} already streaming", camera.id);
                return Ok(());
            }
            l.remove(&camera.id);
        }
        if l.len() >= self.max_streams {
            bail!(
                ResourceExhausted,
                msg("max simultaneous streams ({}) reached", self.max_streams)
            );
        }

        let env = streamer::Environment {
            clocks: &self.clocks,
            opener: self.opener.clone(),
            shutdown_rx: &self.shutdown_rx,
        };
        let mut streamer = Streamer::new(
            &env,
            camera,
            frame_callback,
            status_callback,
            connect_timeout,
        )?;
        let shared = streamer.shared();
        let short_name = streamer.short_name().to_owned();
        let rt = self.rt.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let join = thread::Builder::new()
            .name(format!("s-{short_name}"))
            .spawn(move || {
                let _enter = rt.enter();
                match streamer.connect() {
                    Ok(stream) => {
                        if tx.send(Ok(())).is_err() {
                            return;
                        }
                        streamer.run(stream);
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| err!(Internal, msg("can't create streamer thread"), source(e)))?;

        match rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "camera {} started; {} active streams",
                    camera.id,
                    l.len() + 1
                );
                l.insert(
                    camera.id,
                    Handle {
                        room_id: camera.room_id,
                        short_name,
                        shared,
                        join,
                    },
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                // The thread died before reporting; surface its panic.
                let _ = join.join();
                Err(err!(Internal, msg("streamer thread exited without connecting")))
            }
        }
    }

    /// Signals the worker to stop and waits up to [`STOP_WAIT`] for a clean
    /// exit.
    pub fn stop_camera(&self, camera_id: i32) -> Result<(), Error> {
        let h = match self.streams.lock().unwrap().remove(&camera_id) {
            None => bail!(NotFound, msg("camera {camera_id} is not streaming")),
            Some(h) => h,
        };
        Self::stop_handle(h);
        Ok(())
    }

    fn stop_handle(h: Handle) {
        h.shared.request_stop();
        let deadline = std::time::Instant::now() + STOP_WAIT;
        while !h.join.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(StdDuration::from_millis(10));
        }
        if h.join.is_finished() {
            if h.join.join().is_err() {
                warn!("{}: worker thread panicked", h.short_name);
            }
            info!("{}: stopped", h.short_name);
        } else {
            // Likely stuck in a decoder read; it will notice the stop flag
            // when the read times out and release the decoder on its own.
            warn!("{}: did not exit within {STOP_WAIT:?}; detaching", h.short_name);
        }
    }

    /// Stops every worker in the room, returning the count stopped.
    pub fn stop_room_cameras(&self, room_id: i32) -> usize {
        let to_stop: Vec<Handle> = {
            let mut l = self.streams.lock().unwrap();
            let ids: Vec<i32> = l
                .iter()
                .filter(|(_, h)| h.room_id == room_id)
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter().filter_map(|id| l.remove(&id)).collect()
        };
        let n = to_stop.len();
        for h in to_stop {
            Self::stop_handle(h);
        }
        n
    }

    /// Stops everything; used at shutdown.
    pub fn stop_all(&self) {
        let to_stop: Vec<Handle> = {
            let mut l = self.streams.lock().unwrap();
            l.drain().map(|(_, h)| h).collect()
        };
        for h in to_stop {
            Self::stop_handle(h);
        }
        info!("all streams stopped");
    }

    pub fn is_camera_active(&self, camera_id: i32) -> bool {
        self.streams
            .lock()
            .unwrap()
            .get(&camera_id)
            .map(|h| !h.join.is_finished())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn status(&self, camera_id: i32) -> Option<Status> {
        let l = self.streams.lock().unwrap();
        l.get(&camera_id).map(|h| Self::snapshot(camera_id, h))
    }

    pub fn all_statuses(&self) -> Vec<Status> {
        let l = self.streams.lock().unwrap();
        let mut v: Vec<Status> = l
            .iter()
            .map(|(&id, h)| Self::snapshot(id, h))
            .collect();
        v.sort_by_key(|s| s.camera_id);
        v
    }

    pub fn room_statuses(&self, room_id: i32) -> Vec<Status> {
        let l = self.streams.lock().unwrap();
        let mut v: Vec<Status> = l
            .iter()
            .filter(|(_, h)| h.room_id == room_id)
            .map(|(&id, h)| Self::snapshot(id, h))
            .collect();
        v.sort_by_key(|s| s.camera_id);
        v
    }

    /// The latest frame of an active camera, as a defensive copy.
    pub fn latest_frame(&self, camera_id: i32) -> Option<stream::Frame> {
        let l = self.streams.lock().unwrap();
        l.get(&camera_id).and_then(|h| h.shared.latest_frame())
    }

    fn snapshot(camera_id: i32, h: &Handle) -> Status {
        Status {
            camera_id,
            room_id: h.room_id,
            state: h.shared.state(),
            fps: h.shared.fps(),
            redacted_url: String::new(), // filled in by the web layer from the db.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::solid_frame;
    use base::clock::RealClocks;
    use db::testutil;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// A stream which produces frames forever, slowly.
    struct SlowStream;

    impl stream::Stream for SlowStream {
        fn next(&mut self) -> Result<crate::stream::Frame, Error> {
            std::thread::sleep(StdDuration::from_millis(5));
            Ok(solid_frame(8, 8))
        }
    }

    struct CountingOpener {
        opens: AtomicU32,
    }

    impl stream::Opener for CountingOpener {
        fn open(
            &self,
            _label: String,
            _url: url::Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, Error> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SlowStream))
        }
    }

    fn camera(id: i32) -> db::Camera {
        db::Camera {
            id,
            room_id: testutil::TEST_ROOM_ID,
            name: format!("cam {id}"),
            rtsp_url: testutil::TEST_CAMERA_URL.to_owned(),
            active: true,
        }
    }

    fn null_callbacks() -> (streamer::FrameCallback, streamer::StatusCallback) {
        (Arc::new(|_, _, _, _| Ok(())), Arc::new(|_, _, _| {}))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cap_and_idempotency() {
        testutil::init();
        let (_shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let opener = Arc::new(CountingOpener {
            opens: AtomicU32::new(0),
        });
        let mgr = Arc::new(StreamManager::new(
            RealClocks {},
            opener.clone() as Arc<dyn stream::Opener>,
            shutdown_rx,
            tokio::runtime::Handle::current(),
            2,
        ));

        let mgr2 = mgr.clone();
        let opener2 = opener.clone();
        tokio::task::spawn_blocking(move || {
            let (fcb, scb) = null_callbacks();
            mgr2.start_camera(&camera(1), fcb.clone(), scb.clone(), StdDuration::from_secs(1))
                .unwrap();
            mgr2.start_camera(&camera(2), fcb.clone(), scb.clone(), StdDuration::from_secs(1))
                .unwrap();
            assert_eq!(mgr2.active_count(), 2);

            // Starting an already-running camera is a no-op success.
            mgr2.start_camera(&camera(1), fcb.clone(), scb.clone(), StdDuration::from_secs(1))
                .unwrap();
            assert_eq!(opener2.opens.load(Ordering::SeqCst), 2);

            // The cap rejects the next camera without opening a decoder.
            let e = mgr2
                .start_camera(&camera(3), fcb, scb, StdDuration::from_secs(1))
                .unwrap_err();
            assert_eq!(e.kind(), base::ErrorKind::ResourceExhausted);
            assert_eq!(opener2.opens.load(Ordering::SeqCst), 2);

            assert!(mgr2.is_camera_active(1));
            assert_eq!(mgr2.all_statuses().len(), 2);
            assert_eq!(mgr2.room_statuses(testutil::TEST_ROOM_ID).len(), 2);

            // Give the worker a moment to pull its first frame.
            std::thread::sleep(StdDuration::from_millis(100));
            assert!(mgr2.latest_frame(1).is_some());

            assert_eq!(mgr2.stop_room_cameras(testutil::TEST_ROOM_ID), 2);
            assert_eq!(mgr2.active_count(), 0);
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_unknown_camera() {
        testutil::init();
        let (_shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let opener = Arc::new(CountingOpener {
            opens: AtomicU32::new(0),
        });
        let mgr = StreamManager::new(
            RealClocks {},
            opener as Arc<dyn stream::Opener>,
            shutdown_rx,
            tokio::runtime::Handle::current(),
            2,
        );
        let e = mgr.stop_camera(42).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
    }
}
