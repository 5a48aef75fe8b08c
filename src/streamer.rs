// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-camera stream worker.
//!
//! Each active camera gets one `Streamer` running on its own thread. The
//! worker owns the camera's decoder (via the `stream::Stream` it holds),
//! keeps a latest-frame slot and an FPS counter for observers, and hands
//! every decoded frame to the recognition dispatcher's callback. The
//! callback must hand off or drop; it never blocks on application logic.
//!
//! Lifecycle: `Idle → Connecting → Running ⇄ Reconnecting → Terminated`.
//! A read failure increments a consecutive-failure count; at
//! [`MAX_CONSECUTIVE_FAILURES`] the worker tears down the decoder, pauses
//! briefly, and reopens with shorter timeouts, up to
//! [`MAX_RECONNECT_ATTEMPTS`] times. The decoder is released on every exit
//! path (including panics) because the stream is owned by `run`.

use crate::stream;
use base::clock::Clocks;
use base::err;
use base::time::{Duration, Time};
use base::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};
use url::Url;

/// Default bound on the initial connect, through the first frame.
pub const CONNECT_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Per-frame read timeout.
const READ_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Shorter connect bound used on reconnect.
const RECONNECT_CONNECT_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Pause between tearing down a failed decoder and reopening.
const RECONNECT_PAUSE: Duration = Duration(base::time::TIME_UNITS_PER_SEC / 2);

/// Read failures in a row before entering `Reconnecting`.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Sleep after each frame; caps the loop at roughly 30 Hz.
const FRAME_INTERVAL: Duration = Duration(base::time::TIME_UNITS_PER_SEC / 30);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Connecting,
    Running,
    Reconnecting,
    Terminated,
}

/// Value-copied status tuple for observational reads.
#[derive(Clone, Debug)]
pub struct Status {
    pub camera_id: i32,
    pub room_id: i32,
    pub state: State,
    pub fps: u32,
    pub redacted_url: String,
}

impl Status {
    pub fn connected(&self) -> bool {
        self.state == State::Running
    }

    pub fn running(&self) -> bool {
        matches!(
            self.state,
            State::Connecting | State::Running | State::Reconnecting
        )
    }
}

/// State shared between the worker thread and observers.
pub struct Shared {
    state: Mutex<(State, u32)>,
    latest_frame: Mutex<Option<stream::Frame>>,
    stop: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Shared {
            state: Mutex::new((State::Idle, 0)),
            latest_frame: Mutex::new(None),
            stop: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> State {
        self.state.lock().unwrap().0
    }

    pub fn fps(&self) -> u32 {
        self.state.lock().unwrap().1
    }

    /// A defensive copy of the most recent frame (cheap; pixels are
    /// reference-counted).
    pub fn latest_frame(&self) -> Option<stream::Frame> {
        self.latest_frame.lock().unwrap().clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Called with `(frame, wall time, room id, camera id)` for every decoded
/// frame. Errors are logged and do not stop the worker.
pub type FrameCallback = Arc<dyn Fn(stream::Frame, Time, i32, i32) -> Result<(), Error> + Send + Sync>;

/// Called on state transitions with `(camera id, state, fps)`.
pub type StatusCallback = Arc<dyn Fn(i32, State, u32) + Send + Sync>;

/// Common state that can be used by multiple `Streamer` instances.
pub struct Environment<'a, C: Clocks + Clone> {
    pub clocks: &'a C,
    pub opener: Arc<dyn stream::Opener>,
    pub shutdown_rx: &'a base::shutdown::Receiver,
}

pub struct Streamer<C: Clocks + Clone> {
    clocks: C,
    opener: Arc<dyn stream::Opener>,
    shutdown_rx: base::shutdown::Receiver,
    camera_id: i32,
    room_id: i32,
    short_name: String,
    url: Url,
    redacted_url: String,
    connect_timeout: StdDuration,
    shared: Arc<Shared>,
    frame_callback: FrameCallback,
    status_callback: StatusCallback,
}

impl<C: Clocks + Clone> Streamer<C> {
    pub fn new(
        env: &Environment<'_, C>,
        camera: &db::Camera,
        frame_callback: FrameCallback,
        status_callback: StatusCallback,
        connect_timeout: StdDuration,
    ) -> Result<Self, Error> {
        let url = Url::parse(&camera.rtsp_url)
            .map_err(|e| err!(InvalidArgument, msg("unparseable RTSP URL"), source(e)))?;
        Ok(Streamer {
            clocks: env.clocks.clone(),
            opener: env.opener.clone(),
            shutdown_rx: env.shutdown_rx.clone(),
            camera_id: camera.id,
            room_id: camera.room_id,
            short_name: format!("{}-{}", camera.id, camera.name),
            url,
            redacted_url: camera.redacted_url(),
            connect_timeout,
            shared: Arc::new(Shared::new()),
            frame_callback,
            status_callback,
        })
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    fn should_stop(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst) || self.shutdown_rx.check().is_err()
    }

    fn set_state(&self, state: State) {
        let fps = {
            let mut l = self.shared.state.lock().unwrap();
            if l.0 == state {
                return;
            }
            l.0 = state;
            l.1
        };
        (self.status_callback)(self.camera_id, state, fps);
    }

    fn set_fps(&self, fps: u32) {
        self.shared.state.lock().unwrap().1 = fps;
    }

    /// Opens the stream, blocking through the first frame or the connect
    /// timeout. On failure the worker is `Terminated` and the latest-frame
    /// slot stays empty.
    pub fn connect(&mut self) -> Result<Box<dyn stream::Stream>, Error> {
        info!("{}: opening input: {}", self.short_name, self.redacted_url);
        self.set_state(State::Connecting);
        match self.opener.open(
            self.short_name.clone(),
            self.url.clone(),
            stream::Options {
                connect_timeout: self.connect_timeout,
                read_timeout: READ_TIMEOUT,
            },
        ) {
            Ok(s) => Ok(s),
            Err(err) => {
                warn!(
                    "{}: connect failed: {}",
                    self.short_name,
                    err.chain()
                );
                self.set_state(State::Terminated);
                Err(err)
            }
        }
    }

    /// The worker thread body. Consumes the stream returned by `connect`.
    pub fn run(&mut self, stream: Box<dyn stream::Stream>) {
        // `stream` is moved into the loop and dropped on every way out of
        // this function, so the decoder handle is released even on panic.
        // The guard clears the latest-frame slot and publishes the final
        // state for the same reason.
        struct FinishGuard<'a, C: Clocks + Clone>(&'a Streamer<C>);
        impl<C: Clocks + Clone> Drop for FinishGuard<'_, C> {
            fn drop(&mut self) {
                *self.0.shared.latest_frame.lock().unwrap() = None;
                self.0.set_fps(0);
                self.0.set_state(State::Terminated);
                info!("{}: shutting down", self.0.short_name);
            }
        }
        let guard = FinishGuard(self);
        guard.0.run_inner(stream);
    }

    fn run_inner(&self, mut stream: Box<dyn stream::Stream>) {
        let mut consecutive_failures = 0u32;
        let mut reconnect_attempts = 0u32;
        let mut fps_frames = 0u32;
        let mut fps_mark = self.clocks.monotonic();

        while !self.should_stop() {
            match stream.next() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    reconnect_attempts = 0;
                    self.set_state(State::Running);
                    *self.shared.latest_frame.lock().unwrap() = Some(frame.clone());

                    fps_frames += 1;
                    let now = self.clocks.monotonic();
                    if now - fps_mark >= Duration::seconds(1) {
                        self.set_fps(fps_frames);
                        fps_frames = 0;
                        fps_mark = now;
                    }

                    let when = self.clocks.realtime();
                    if let Err(err) =
                        (self.frame_callback)(frame, when, self.room_id, self.camera_id)
                    {
                        warn!("{}: frame callback: {}", self.short_name, err.chain());
                    }
                    self.clocks.sleep(FRAME_INTERVAL);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    debug!(
                        "{}: read failure {consecutive_failures}: {}",
                        self.short_name,
                        err.chain()
                    );
                    if consecutive_failures < MAX_CONSECUTIVE_FAILURES {
                        continue;
                    }

                    // Tear down the decoder and reopen with shorter
                    // timeouts. No frame callbacks happen until a fresh
                    // stream delivers.
                    self.set_state(State::Reconnecting);
                    drop(stream);
                    loop {
                        reconnect_attempts += 1;
                        if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                            warn!(
                                "{}: giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts",
                                self.short_name
                            );
                            return;
                        }
                        self.clocks.sleep(RECONNECT_PAUSE);
                        if self.should_stop() {
                            return;
                        }
                        warn!(
                            "{}: reconnect attempt {reconnect_attempts}/{MAX_RECONNECT_ATTEMPTS}",
                            self.short_name
                        );
                        match self.opener.open(
                            self.short_name.clone(),
                            self.url.clone(),
                            stream::Options {
                                connect_timeout: RECONNECT_CONNECT_TIMEOUT,
                                read_timeout: READ_TIMEOUT,
                            },
                        ) {
                            Ok(s) => {
                                stream = s;
                                consecutive_failures = 0;
                                break;
                            }
                            Err(err) => {
                                debug!(
                                    "{}: reconnect failed: {}",
                                    self.short_name,
                                    err.chain()
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}
