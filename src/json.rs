// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Serde types for the web API and the WebSocket message schemas.
//!
//! Field names are snake_case on the wire; timestamps are ISO-8601 strings
//! in the server's zone.

use base::time::Time;
use db::PresenceRow;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub struct TopLevel {
    pub server_version: &'static str,
    pub stats: Stats,
}

#[derive(Serialize)]
pub struct Stats {
    pub total_people_tracked: usize,
    pub total_rooms: usize,
    pub occupied_rooms: usize,
    pub presence_timeout_seconds: u32,
    pub active_streams: usize,
    pub indexed_vectors: usize,
    pub indexed_students: usize,
}

#[derive(Serialize)]
pub struct Room<'a> {
    pub id: i32,
    pub name: &'a str,
    pub active: bool,
}

impl<'a> Room<'a> {
    pub fn wrap(r: &'a db::Room) -> Self {
        Room {
            id: r.id,
            name: &r.name,
            active: r.active,
        }
    }
}

#[derive(Deserialize)]
pub struct RoomCreate {
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Deserialize)]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub active: Option<bool>,
}

#[derive(Serialize)]
pub struct Camera<'a> {
    pub id: i32,
    pub room_id: i32,
    pub name: &'a str,
    pub rtsp_url: &'a str,
    pub active: bool,
}

impl<'a> Camera<'a> {
    pub fn wrap(c: &'a db::Camera) -> Self {
        Camera {
            id: c.id,
            room_id: c.room_id,
            name: &c.name,
            rtsp_url: &c.rtsp_url,
            active: c.active,
        }
    }
}

#[derive(Deserialize)]
pub struct CameraCreate {
    pub room_id: i32,
    pub name: String,
    pub rtsp_url: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Serialize)]
pub struct CameraStatus {
    pub camera_id: i32,
    pub room_id: i32,
    pub connected: bool,
    pub running: bool,
    pub fps: u32,
}

impl CameraStatus {
    pub fn wrap(s: &crate::streamer::Status) -> Self {
        CameraStatus {
            camera_id: s.camera_id,
            room_id: s.room_id,
            connected: s.connected(),
            running: s.running(),
            fps: s.fps,
        }
    }
}

#[derive(Serialize)]
pub struct Student<'a> {
    pub id: i32,
    pub student_number: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub group_name: Option<&'a str>,
    pub created_at: String,
}

impl<'a> Student<'a> {
    pub fn wrap(s: &'a db::Student) -> Self {
        Student {
            id: s.id,
            student_number: &s.student_number,
            first_name: &s.first_name,
            last_name: &s.last_name,
            group_name: s.group_name.as_deref(),
            created_at: s.created.iso8601(),
        }
    }
}

#[derive(Deserialize)]
pub struct StudentRegister {
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub group_name: Option<String>,

    /// Base64-encoded enrollment images, 5 to 10 of them.
    pub images: Vec<String>,
}

#[derive(Deserialize)]
pub struct CheckInRequest {
    /// Base64-encoded image, with or without a data-URL prefix.
    pub image: String,
}

#[derive(Serialize)]
pub struct CheckInResponse<'a> {
    /// `success`, `already_attended`, `no_face`, `not_found`.
    pub status: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<Student<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_id: Option<i32>,
}

#[derive(Serialize)]
pub struct Attendance<'a> {
    pub id: i32,
    pub student: Option<Student<'a>>,
    pub check_in_time: String,
    pub confidence: f32,
    pub snapshot_path: Option<&'a str>,
}

#[derive(Serialize)]
pub struct StudentLocation<'a> {
    pub room_id: Option<i32>,
    pub room_name: Option<&'a str>,
    pub camera_id: Option<i32>,
    pub last_seen_at: String,
    pub confidence: f32,
}

/// One student in a room's occupant list.
#[derive(Serialize)]
pub struct Occupant {
    pub student_id: i32,
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    pub group_name: Option<String>,
    pub last_seen_at: String,
    pub confidence: f32,
    pub camera_id: Option<i32>,
}

impl Occupant {
    pub fn from_row(r: &PresenceRow) -> Self {
        Occupant {
            student_id: r.student_id,
            student_number: r.student_number.clone(),
            first_name: r.first_name.clone(),
            last_name: r.last_name.clone(),
            group_name: r.group_name.clone(),
            last_seen_at: r.last_seen.iso8601(),
            confidence: r.confidence,
            camera_id: r.camera_id,
        }
    }
}

/// `initial_presence` / `presence_update` for one room. Sent on the room
/// channel and the global channel.
#[derive(Serialize)]
pub struct PresenceMessage {
    /// `initial_presence` or `presence_update`.
    pub r#type: &'static str,
    pub room_id: i32,
    pub room_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_recognitions: Option<Vec<Occupant>>,
    pub occupants: Vec<Occupant>,
    pub total_count: usize,
    pub guest_count: usize,
    pub total_people: usize,
    pub timestamp: String,
}

impl PresenceMessage {
    pub fn new(
        r#type: &'static str,
        room_id: i32,
        room_name: String,
        occupants: Vec<Occupant>,
        new_recognitions: Option<Vec<Occupant>>,
        guest_count: usize,
        when: Time,
    ) -> Self {
        let total_count = occupants.len();
        PresenceMessage {
            r#type,
            room_id,
            room_name,
            new_recognitions,
            occupants,
            total_count,
            guest_count,
            total_people: total_count + guest_count,
            timestamp: when.iso8601(),
        }
    }
}

/// `initial_all_presence`: the dashboard's starting snapshot.
#[derive(Serialize)]
pub struct AllPresenceMessage {
    pub r#type: &'static str,
    pub rooms: Vec<PresenceMessage>,
    pub timestamp: String,
}

/// One face in a `face_detection` event.
#[derive(Serialize)]
pub struct FaceOverlay {
    /// `student` or `guest`.
    pub r#type: &'static str,

    /// Display name, or "Guest".
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// `face_detection`: per-frame overlay boxes on a camera channel.
#[derive(Serialize)]
pub struct FaceDetectionMessage {
    pub r#type: &'static str,
    pub camera_id: i32,
    pub faces: Vec<FaceOverlay>,
    pub total_faces: usize,
    pub timestamp: String,
}

/// `status`: camera worker state on a camera channel.
#[derive(Serialize)]
pub struct StatusMessage {
    pub r#type: &'static str,
    pub camera_id: i32,
    pub connected: bool,
    pub running: bool,
    pub fps: u32,
}

fn default_true() -> bool {
    true
}
