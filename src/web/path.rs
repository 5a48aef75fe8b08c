// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Decodes request paths.

#[derive(Debug, Eq, PartialEq)]
pub enum Path {
    TopLevel,                // "/api/"
    Rooms,                   // "/api/rooms"
    Room(i32),               // "/api/rooms/<id>"
    RoomPresence(i32),       // "/api/rooms/<id>/presence"
    RoomPresenceClear(i32),  // "/api/rooms/<id>/presence/clear"
    RoomStart(i32),          // "/api/rooms/<id>/start"
    RoomStop(i32),           // "/api/rooms/<id>/stop"
    Cameras,                 // "/api/cameras"
    Camera(i32),             // "/api/cameras/<id>"
    CameraStatus(i32),       // "/api/cameras/<id>/status"
    CameraStart(i32),        // "/api/cameras/<id>/start"
    CameraStop(i32),         // "/api/cameras/<id>/stop"
    Students,                // "/api/students"
    Student(i32),            // "/api/students/<id>"
    StudentLocation(i32),    // "/api/students/<id>/location"
    Attendance,              // "/api/attendance"
    AttendanceCheckIn,       // "/api/attendance/check-in"
    Stats,                   // "/api/stats"
    AllPresenceWs,           // "/api/ws/rooms/all/presence"
    RoomPresenceWs(i32),     // "/api/ws/rooms/<id>/presence"
    CameraStreamWs(i32),     // "/api/ws/cameras/<id>/stream"
    NotFound,
}

impl Path {
    pub fn decode(path: &str) -> Self {
        let path = match path.strip_prefix("/api") {
            None => return Path::NotFound,
            Some(p) => p,
        };
        if path == "/" {
            return Path::TopLevel;
        }
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["rooms"] => Path::Rooms,
            ["rooms", id] => id_path(id, Path::Room),
            ["rooms", id, "presence"] => id_path(id, Path::RoomPresence),
            ["rooms", id, "presence", "clear"] => id_path(id, Path::RoomPresenceClear),
            ["rooms", id, "start"] => id_path(id, Path::RoomStart),
            ["rooms", id, "stop"] => id_path(id, Path::RoomStop),
            ["cameras"] => Path::Cameras,
            ["cameras", id] => id_path(id, Path::Camera),
            ["cameras", id, "status"] => id_path(id, Path::CameraStatus),
            ["cameras", id, "start"] => id_path(id, Path::CameraStart),
            ["cameras", id, "stop"] => id_path(id, Path::CameraStop),
            ["students"] => Path::Students,
            ["students", id] => id_path(id, Path::Student),
            ["students", id, "location"] => id_path(id, Path::StudentLocation),
            ["attendance"] => Path::Attendance,
            ["attendance", "check-in"] => Path::AttendanceCheckIn,
            ["stats"] => Path::Stats,
            ["ws", "rooms", "all", "presence"] => Path::AllPresenceWs,
            ["ws", "rooms", id, "presence"] => id_path(id, Path::RoomPresenceWs),
            ["ws", "cameras", id, "stream"] => id_path(id, Path::CameraStreamWs),
            _ => Path::NotFound,
        }
    }
}

fn id_path(id: &str, f: impl FnOnce(i32) -> Path) -> Path {
    match id.parse() {
        Ok(id) => f(id),
        Err(_) => Path::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::Path;

    #[test]
    fn decode() {
        assert_eq!(Path::decode("/api/"), Path::TopLevel);
        assert_eq!(Path::decode("/api/rooms"), Path::Rooms);
        assert_eq!(Path::decode("/api/rooms/3"), Path::Room(3));
        assert_eq!(Path::decode("/api/rooms/3/presence"), Path::RoomPresence(3));
        assert_eq!(
            Path::decode("/api/rooms/3/presence/clear"),
            Path::RoomPresenceClear(3)
        );
        assert_eq!(Path::decode("/api/rooms/3/start"), Path::RoomStart(3));
        assert_eq!(Path::decode("/api/cameras/12/status"), Path::CameraStatus(12));
        assert_eq!(Path::decode("/api/students/7/location"), Path::StudentLocation(7));
        assert_eq!(Path::decode("/api/attendance/check-in"), Path::AttendanceCheckIn);
        assert_eq!(Path::decode("/api/ws/rooms/all/presence"), Path::AllPresenceWs);
        assert_eq!(Path::decode("/api/ws/rooms/4/presence"), Path::RoomPresenceWs(4));
        assert_eq!(Path::decode("/api/ws/cameras/4/stream"), Path::CameraStreamWs(4));
        assert_eq!(Path::decode("/api/rooms/x"), Path::NotFound);
        assert_eq!(Path::decode("/other"), Path::NotFound);
        assert_eq!(Path::decode("/api/rooms/3/unknown"), Path::NotFound);
    }
}
