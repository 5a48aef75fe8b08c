// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Room CRUD, room presence reads, per-room stream control, and the room /
//! dashboard presence WebSockets.

use super::{
    bad_req, extract_json_body, not_found, parse_body, query_params, require_method, serve_json,
    ws_loop, Service,
};
use crate::hub::Channel;
use crate::json;
use base::clock::Clocks;
use http::{Method, Request};
use hyper::Body;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct RoomDetail<'a> {
    room: json::Room<'a>,
    cameras: Vec<json::Camera<'a>>,
}

#[derive(Serialize)]
struct StartStop {
    started: usize,
    failed: usize,
}

impl Service {
    pub(super) async fn rooms(self: Arc<Self>, req: &mut Request<Body>) -> super::ResponseResult {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let l = self.db.lock();
                let rooms: Vec<json::Room> = l.rooms_by_id().values().map(json::Room::wrap).collect();
                serve_json(&rooms)
            }
            Method::POST => {
                let body = extract_json_body(req).await?;
                let create: json::RoomCreate = parse_body(&body)?;
                let mut l = self.db.lock();
                let id = l.add_room(&create.name, create.active)?;
                let room = l.rooms_by_id().get(&id).expect("just inserted");
                serve_json(&json::Room::wrap(room))
            }
            _ => Err(bad_req("GET, POST, or HEAD expected")),
        }
    }

    pub(super) async fn room(self: Arc<Self>, req: &mut Request<Body>, id: i32) -> super::ResponseResult {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let l = self.db.lock();
                let room = l
                    .rooms_by_id()
                    .get(&id)
                    .ok_or_else(|| not_found(format!("no such room {id}")))?;
                serve_json(&RoomDetail {
                    room: json::Room::wrap(room),
                    cameras: l.room_cameras(id).into_iter().map(json::Camera::wrap).collect(),
                })
            }
            Method::POST => {
                let body = extract_json_body(req).await?;
                let update: json::RoomUpdate = parse_body(&body)?;
                let mut l = self.db.lock();
                l.update_room(id, update.name.as_deref(), update.active)?;
                let room = l.rooms_by_id().get(&id).expect("update succeeded");
                serve_json(&json::Room::wrap(room))
            }
            Method::DELETE => {
                // Stop the room's workers before dropping its rows.
                let stopped = self.manager.stop_room_cameras(id);
                let camera_ids: Vec<i32> = {
                    let l = self.db.lock();
                    l.room_cameras(id).iter().map(|c| c.id).collect()
                };
                for cid in camera_ids {
                    self.dispatcher.forget_camera(cid);
                }
                self.db.lock().delete_room(id)?;
                serve_json(&serde_json::json!({"deleted": id, "stopped_cameras": stopped}))
            }
            _ => Err(bad_req("GET, POST, DELETE, or HEAD expected")),
        }
    }

    pub(super) fn room_presence(&self, req: &Request<Body>, id: i32) -> super::ResponseResult {
        require_method(req, Method::GET)?;
        let include_stale = query_params(req)
            .get("include_stale")
            .map(|v| v == "true")
            .unwrap_or(false);
        let msg = self.room_presence_message("presence", id, include_stale)?;
        serve_json(&msg)
    }

    pub(super) fn room_presence_clear(&self, req: &Request<Body>, id: i32) -> super::ResponseResult {
        require_method(req, Method::POST)?;
        let cleared = {
            let mut l = self.db.lock();
            if !l.rooms_by_id().contains_key(&id) {
                return Err(not_found(format!("no such room {id}")));
            }
            l.clear_room_presence(id)?
        };
        serve_json(&serde_json::json!({"cleared": cleared}))
    }

    /// Starts every active camera in the room, reporting how many came up.
    pub(super) async fn room_start(self: Arc<Self>, req: Request<Body>, id: i32) -> super::ResponseResult {
        require_method(&req, Method::POST)?;
        let cameras: Vec<db::Camera> = {
            let l = self.db.lock();
            if !l.rooms_by_id().contains_key(&id) {
                return Err(not_found(format!("no such room {id}")));
            }
            l.room_cameras(id).into_iter().filter(|c| c.active).cloned().collect()
        };
        let this = self.clone();
        let counts = tokio::task::spawn_blocking(move || {
            let mut started = 0;
            let mut failed = 0;
            for c in &cameras {
                match this.start_camera_worker(c) {
                    Ok(()) => started += 1,
                    Err(err) => {
                        tracing::warn!(
                            "camera {} failed to start: {}",
                            c.id,
                            err.chain()
                        );
                        failed += 1;
                    }
                }
            }
            StartStop { started, failed }
        })
        .await
        .map_err(super::internal_server_err)?;
        serve_json(&counts)
    }

    pub(super) fn room_stop(&self, req: &Request<Body>, id: i32) -> super::ResponseResult {
        require_method(req, Method::POST)?;
        let stopped = self.manager.stop_room_cameras(id);
        let camera_ids: Vec<i32> = {
            let l = self.db.lock();
            l.room_cameras(id).iter().map(|c| c.id).collect()
        };
        for cid in camera_ids {
            self.dispatcher.forget_camera(cid);
        }
        serve_json(&serde_json::json!({"stopped": stopped}))
    }

    pub(super) fn room_presence_ws(self: Arc<Self>, req: Request<Body>, id: i32) -> super::ResponseResult {
        if !self.db.lock().rooms_by_id().contains_key(&id) {
            return Err(not_found(format!("no such room {id}")));
        }
        super::websocket::upgrade(req, move |ws| {
            Box::pin(async move {
                let initial = match self.room_presence_message("initial_presence", id, false) {
                    Ok(m) => serde_json::to_string(&m).expect("message should serialize"),
                    Err(err) => {
                        tracing::warn!(err = %err.chain(), "unable to build initial presence");
                        return;
                    }
                };
                let rx = self.subscribe(Channel::Room(id));
                ws_loop(ws, Some(initial), rx).await;
            })
        })
    }

    pub(super) fn all_presence_ws(self: Arc<Self>, req: Request<Body>) -> super::ResponseResult {
        super::websocket::upgrade(req, move |ws| {
            Box::pin(async move {
                let initial = match self.all_presence_message() {
                    Ok(m) => serde_json::to_string(&m).expect("message should serialize"),
                    Err(err) => {
                        tracing::warn!(err = %err.chain(), "unable to build initial presence");
                        return;
                    }
                };
                let rx = self.subscribe(Channel::Global);
                ws_loop(ws, Some(initial), rx).await;
            })
        })
    }

    fn all_presence_message(&self) -> Result<json::AllPresenceMessage, base::Error> {
        let now = self.db.clocks().realtime();
        let cutoff = now - self.presence_timeout;
        let rooms = self.db.lock().list_all_presence(cutoff)?;
        let rooms = rooms
            .into_iter()
            .map(|r| {
                let guest_count = self.dispatcher.guest_count(r.room_id);
                let occupants = r.occupants.iter().map(json::Occupant::from_row).collect();
                json::PresenceMessage::new(
                    "presence",
                    r.room_id,
                    r.room_name,
                    occupants,
                    None,
                    guest_count,
                    now,
                )
            })
            .collect();
        Ok(json::AllPresenceMessage {
            r#type: "initial_all_presence",
            rooms,
            timestamp: now.iso8601(),
        })
    }
}
