// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The daily check-in path: a single-frame recognition against the same
//! vector index, with at most one attendance row per student per day.
//!
//! Recognition misses (`no_face`, `not_found`) are outcomes, not errors:
//! they come back as HTTP 200 with a status field so kiosks can show the
//! message to the person standing there.

use super::{extract_json_body, parse_body, query_params, require_method, serve_json, students, Service};
use crate::json;
use crate::stream::Frame;
use base::clock::Clocks;
use base::Error;
use http::{Method, Request};
use hyper::Body;
use std::sync::Arc;

enum Outcome {
    Success {
        student: db::Student,
        confidence: f32,
        check_in_time: String,
        attendance_id: i32,
    },
    AlreadyAttended {
        student: db::Student,
        confidence: f32,
        check_in_time: String,
    },
    NoFace,
    NotFound,
}

impl Service {
    pub(super) async fn check_in(self: Arc<Self>, mut req: Request<Body>) -> super::ResponseResult {
        let body = extract_json_body(&mut req).await?;
        let r: json::CheckInRequest = parse_body(&body)?;
        let this = self.clone();
        let outcome = tokio::task::spawn_blocking(move || this.check_in_blocking(&r.image))
            .await
            .map_err(super::internal_server_err)??;
        let resp = match &outcome {
            Outcome::Success {
                student,
                confidence,
                check_in_time,
                attendance_id,
            } => json::CheckInResponse {
                status: "success",
                message: "attendance recorded",
                student: Some(json::Student::wrap(student)),
                confidence: Some(*confidence),
                check_in_time: Some(check_in_time.clone()),
                attendance_id: Some(*attendance_id),
            },
            Outcome::AlreadyAttended {
                student,
                confidence,
                check_in_time,
            } => json::CheckInResponse {
                status: "already_attended",
                message: "attendance was already recorded today",
                student: Some(json::Student::wrap(student)),
                confidence: Some(*confidence),
                check_in_time: Some(check_in_time.clone()),
                attendance_id: None,
            },
            Outcome::NoFace => json::CheckInResponse {
                status: "no_face",
                message: "no face detected, try again",
                student: None,
                confidence: None,
                check_in_time: None,
                attendance_id: None,
            },
            Outcome::NotFound => json::CheckInResponse {
                status: "not_found",
                message: "no matching student",
                student: None,
                confidence: None,
                check_in_time: None,
                attendance_id: None,
            },
        };
        serve_json(&resp)
    }

    fn check_in_blocking(&self, image: &str) -> Result<Outcome, Error> {
        let raw = students::decode_base64_image(image)?;
        let frame = Frame::from_jpeg(&raw)?;

        let embedding = match self.detector.embed_single(&frame)? {
            None => return Ok(Outcome::NoFace),
            Some(e) => e,
        };
        let (student_id, confidence) = match self
            .index
            .search_with_threshold(&embedding, self.dispatcher.config().confidence_threshold)?
        {
            None => return Ok(Outcome::NotFound),
            Some(m) => m,
        };
        let student = match self.db.lock().students_by_id().get(&student_id).cloned() {
            None => return Ok(Outcome::NotFound),
            Some(s) => s,
        };

        let now = self.db.clocks().realtime();
        let today = now.day_key();
        if let Some(prior) = self.db.lock().get_attendance(student_id, &today)? {
            return Ok(Outcome::AlreadyAttended {
                student,
                confidence,
                check_in_time: prior.time.iso8601(),
            });
        }

        // Keep the submitted frame as evidence next to the record.
        let dir = self.images_dir.join("attendance");
        std::fs::create_dir_all(&dir)?;
        let snapshot = dir.join(format!(
            "{}_{}.jpg",
            student.student_number,
            now.filename_stamp()
        ));
        std::fs::write(&snapshot, &raw)?;

        let attendance_id = self.db.lock().insert_attendance(
            student_id,
            &today,
            now,
            confidence,
            Some(&snapshot.to_string_lossy()),
        )?;
        tracing::info!(
            "attendance recorded for {} on {today}",
            student.student_number
        );
        Ok(Outcome::Success {
            student,
            confidence,
            check_in_time: now.iso8601(),
            attendance_id,
        })
    }

    /// Lists a day's check-ins; defaults to today.
    pub(super) fn attendance(&self, req: &Request<Body>) -> super::ResponseResult {
        require_method(req, Method::GET)?;
        let params = query_params(req);
        let date = match params.get("date") {
            Some(d) => d.clone(),
            None => self.db.clocks().realtime().day_key(),
        };
        let l = self.db.lock();
        let rows = l.list_attendance(&date)?;
        let out: Vec<json::Attendance> = rows
            .iter()
            .map(|r| json::Attendance {
                id: r.id,
                student: l.students_by_id().get(&r.student_id).map(json::Student::wrap),
                check_in_time: r.time.iso8601(),
                confidence: r.confidence,
                snapshot_path: r.snapshot_path.as_deref(),
            })
            .collect();
        serve_json(&out)
    }
}
