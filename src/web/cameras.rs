// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Camera CRUD, per-camera stream control, and the camera stream
//! WebSocket.

use super::{bad_req, extract_json_body, not_found, parse_body, require_method, serve_json, ws_loop, Service};
use crate::hub::Channel;
use crate::json;
use crate::streamer;
use base::{err, Error};
use http::{Method, Request};
use hyper::Body;
use std::sync::Arc;

impl Service {
    pub(super) async fn cameras(self: Arc<Self>, req: &mut Request<Body>) -> super::ResponseResult {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let l = self.db.lock();
                let cameras: Vec<json::Camera> =
                    l.cameras_by_id().values().map(json::Camera::wrap).collect();
                serve_json(&cameras)
            }
            Method::POST => {
                let body = extract_json_body(req).await?;
                let create: json::CameraCreate = parse_body(&body)?;
                let mut l = self.db.lock();
                let id = l.add_camera(db::CameraChange {
                    room_id: create.room_id,
                    name: create.name,
                    rtsp_url: create.rtsp_url,
                    active: create.active,
                })?;
                let camera = l.cameras_by_id().get(&id).expect("just inserted");
                serve_json(&json::Camera::wrap(camera))
            }
            _ => Err(bad_req("GET, POST, or HEAD expected")),
        }
    }

    pub(super) async fn camera(self: Arc<Self>, req: &mut Request<Body>, id: i32) -> super::ResponseResult {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let l = self.db.lock();
                let camera = l
                    .cameras_by_id()
                    .get(&id)
                    .ok_or_else(|| not_found(format!("no such camera {id}")))?;
                serve_json(&json::Camera::wrap(camera))
            }
            Method::POST => {
                if self.manager.is_camera_active(id) {
                    return Err(bad_req("stop the camera before changing it"));
                }
                let body = extract_json_body(req).await?;
                let create: json::CameraCreate = parse_body(&body)?;
                let mut l = self.db.lock();
                l.update_camera(
                    id,
                    db::CameraChange {
                        room_id: create.room_id,
                        name: create.name,
                        rtsp_url: create.rtsp_url,
                        active: create.active,
                    },
                )?;
                let camera = l.cameras_by_id().get(&id).expect("update succeeded");
                serve_json(&json::Camera::wrap(camera))
            }
            Method::DELETE => {
                if self.manager.is_camera_active(id) {
                    let _ = self.manager.stop_camera(id);
                    self.dispatcher.forget_camera(id);
                }
                self.db.lock().delete_camera(id)?;
                serve_json(&serde_json::json!({"deleted": id}))
            }
            _ => Err(bad_req("GET, POST, DELETE, or HEAD expected")),
        }
    }

    pub(super) fn camera_status(&self, req: &Request<Body>, id: i32) -> super::ResponseResult {
        require_method(req, Method::GET)?;
        if let Some(s) = self.manager.status(id) {
            return serve_json(&json::CameraStatus::wrap(&s));
        }
        // Not streaming: report it disconnected if it at least exists.
        let l = self.db.lock();
        let camera = l
            .cameras_by_id()
            .get(&id)
            .ok_or_else(|| not_found(format!("no such camera {id}")))?;
        serve_json(&json::CameraStatus {
            camera_id: id,
            room_id: camera.room_id,
            connected: false,
            running: false,
            fps: 0,
        })
    }

    pub(super) async fn camera_start(self: Arc<Self>, req: Request<Body>, id: i32) -> super::ResponseResult {
        require_method(&req, Method::POST)?;
        let camera = {
            let l = self.db.lock();
            l.cameras_by_id()
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found(format!("no such camera {id}")))?
        };
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.start_camera_worker(&camera))
            .await
            .map_err(super::internal_server_err)??;
        serve_json(&serde_json::json!({"started": id}))
    }

    pub(super) fn camera_stop(&self, req: &Request<Body>, id: i32) -> super::ResponseResult {
        require_method(req, Method::POST)?;
        self.manager.stop_camera(id)?;
        self.dispatcher.forget_camera(id);
        serve_json(&serde_json::json!({"stopped": id}))
    }

    /// Connects a camera's worker, wiring the dispatcher's frame callback
    /// and a status callback that mirrors worker state onto the camera's
    /// stream channel. Blocking; call from the blocking pool.
    pub(super) fn start_camera_worker(&self, camera: &db::Camera) -> Result<(), Error> {
        if !camera.active {
            return Err(err!(
                FailedPrecondition,
                msg("camera {} is marked inactive", camera.id)
            ));
        }
        let hub = self.hub.clone();
        let status_cb: streamer::StatusCallback = Arc::new(move |camera_id, state, fps| {
            hub.publish_json(
                Channel::Camera(camera_id),
                &json::StatusMessage {
                    r#type: "status",
                    camera_id,
                    connected: state == streamer::State::Running,
                    running: matches!(
                        state,
                        streamer::State::Connecting
                            | streamer::State::Running
                            | streamer::State::Reconnecting
                    ),
                    fps,
                },
            );
        });
        self.manager.start_camera(
            camera,
            self.dispatcher.frame_callback(),
            status_cb,
            self.connect_timeout,
        )
    }

    pub(super) fn camera_stream_ws(self: Arc<Self>, req: Request<Body>, id: i32) -> super::ResponseResult {
        let status = {
            let l = self.db.lock();
            let camera = l
                .cameras_by_id()
                .get(&id)
                .ok_or_else(|| not_found(format!("no such camera {id}")))?;
            match self.manager.status(id) {
                Some(s) => json::CameraStatus::wrap(&s),
                None => json::CameraStatus {
                    camera_id: id,
                    room_id: camera.room_id,
                    connected: false,
                    running: false,
                    fps: 0,
                },
            }
        };
        super::websocket::upgrade(req, move |ws| {
            Box::pin(async move {
                let initial = serde_json::to_string(&json::StatusMessage {
                    r#type: "status",
                    camera_id: status.camera_id,
                    connected: status.connected,
                    running: status.running,
                    fps: status.fps,
                })
                .expect("message should serialize");
                let rx = self.subscribe(Channel::Camera(id));
                ws_loop(ws, Some(initial), rx).await;
            })
        })
    }
}
