// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Broadcast hub: subscription registries for room presence, camera
//! streams, and the global presence dashboard.
//!
//! A sink is a `FnMut(Message) -> bool` box; returning false unsubscribes
//! it (typically because the receiving end of its channel is gone). Fan-out
//! is best-effort and never blocks a producer: WebSocket handlers subscribe
//! with an unbounded channel send, so a slow client backs up its own
//! channel, not the recognition pipeline. Keys with no remaining sinks are
//! removed so the maps stay bounded by actual subscribers.

use base::FastHashMap;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// A broadcast payload. Cloning is cheap; both variants are
/// reference-counted.
#[derive(Clone)]
pub enum Message {
    /// A JSON-serialized event (`presence_update`, `face_detection`, ...).
    Json(Arc<str>),

    /// A JPEG-encoded frame for a camera stream channel.
    Binary(Bytes),
}

/// Where to publish or subscribe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Channel {
    /// Presence updates for one room.
    Room(i32),

    /// Frames + face detections + status for one camera.
    Camera(i32),

    /// Presence updates for all rooms (dashboard).
    Global,
}

pub type Sink = Box<dyn FnMut(Message) -> bool + Send>;

#[derive(Default)]
struct Inner {
    rooms: FastHashMap<i32, Vec<Sink>>,
    cameras: FastHashMap<i32, Vec<Sink>>,
    global: Vec<Sink>,
}

impl Inner {
    fn sinks_mut(&mut self, channel: Channel) -> Option<&mut Vec<Sink>> {
        match channel {
            Channel::Room(id) => self.rooms.get_mut(&id),
            Channel::Camera(id) => self.cameras.get_mut(&id),
            Channel::Global => Some(&mut self.global),
        }
    }
}

#[derive(Default)]
pub struct Hub(Mutex<Inner>);

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    pub fn subscribe(&self, channel: Channel, sink: Sink) {
        let mut l = self.0.lock().unwrap();
        match channel {
            Channel::Room(id) => l.rooms.entry(id).or_default().push(sink),
            Channel::Camera(id) => l.cameras.entry(id).or_default().push(sink),
            Channel::Global => l.global.push(sink),
        }
    }

    /// Whether a camera's stream channel has any subscribers. The
    /// dispatcher checks this before paying for a JPEG encode.
    pub fn has_camera_subscribers(&self, camera_id: i32) -> bool {
        let l = self.0.lock().unwrap();
        l.cameras.get(&camera_id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Serializes `msg` once and fans it out to the channel's sinks,
    /// pruning any that report failure.
    pub fn publish_json<T: serde::Serialize>(&self, channel: Channel, msg: &T) {
        let serialized: Arc<str> = match serde_json::to_string(msg) {
            Ok(s) => s.into(),
            Err(err) => {
                warn!(%err, "unable to serialize broadcast message");
                return;
            }
        };
        self.publish(channel, Message::Json(serialized));
    }

    pub fn publish_binary(&self, camera_id: i32, data: Bytes) {
        self.publish(Channel::Camera(camera_id), Message::Binary(data));
    }

    fn publish(&self, channel: Channel, msg: Message) {
        let mut l = self.0.lock().unwrap();
        let sinks = match l.sinks_mut(channel) {
            None => return,
            Some(s) => s,
        };
        sinks.retain_mut(|s| s(msg.clone()));

        // Drop emptied keys so the maps don't grow with dead channels.
        match channel {
            Channel::Room(id) => {
                if l.rooms.get(&id).map(Vec::is_empty).unwrap_or(false) {
                    l.rooms.remove(&id);
                }
            }
            Channel::Camera(id) => {
                if l.cameras.get(&id).map(Vec::is_empty).unwrap_or(false) {
                    l.cameras.remove(&id);
                }
            }
            Channel::Global => {}
        }
    }

    /// Drops every subscription; used at shutdown.
    pub fn clear(&self) {
        let mut l = self.0.lock().unwrap();
        l.rooms.clear();
        l.cameras.clear();
        l.global.clear();
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::sync::mpsc;

    /// Subscribes a collector to the channel, returning the receiving end.
    pub fn collect(hub: &Hub, channel: Channel) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel();
        hub.subscribe(channel, Box::new(move |m| tx.send(m).is_ok()));
        rx
    }

    /// Drains the receiver into the JSON payloads received so far.
    pub fn json_messages(rx: &mpsc::Receiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            if let Message::Json(s) = m {
                out.push(serde_json::from_str(&s).unwrap());
            }
        }
        out
    }
}
