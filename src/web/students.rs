// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Student enrollment and lookup.
//!
//! Registration takes the student's fields plus 5–10 base64 images. Every
//! image must pass the quality gate and produce an embedding; then the
//! student row, image rows (with embedding blobs), image files, and vector
//! index entries are all written, and the index is persisted.

use super::{bad_req, extract_json_body, not_found, parse_body, require_method, serve_json, Service};
use crate::facedet::{MAX_ENROLL_IMAGES, MIN_ENROLL_IMAGES};
use crate::json;
use crate::stream::Frame;
use base::clock::Clocks;
use base::{err, Error};
use http::{Method, Request};
use hyper::Body;
use std::sync::Arc;

/// Upper bound on one decoded enrollment/check-in upload.
pub(super) const MAX_IMAGE_BYTES: usize = 5 << 20;

/// Decodes a base64 image (with or without a `data:...;base64,` prefix)
/// into its raw JPEG bytes.
pub(super) fn decode_base64_image(data: &str) -> Result<Vec<u8>, Error> {
    let data = match data.split_once(',') {
        Some((_prefix, rest)) => rest,
        None => data,
    };
    let bytes = base64::decode(data.trim())
        .map_err(|e| err!(InvalidArgument, msg("invalid base64 image"), source(e)))?;
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(err!(
            InvalidArgument,
            msg("image too large ({} bytes > {MAX_IMAGE_BYTES})", bytes.len())
        ));
    }
    Ok(bytes)
}

impl Service {
    pub(super) async fn students(self: Arc<Self>, mut req: Request<Body>) -> super::ResponseResult {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let l = self.db.lock();
                let students: Vec<json::Student> =
                    l.students_by_id().values().map(json::Student::wrap).collect();
                serve_json(&students)
            }
            Method::POST => {
                let body = extract_json_body(&mut req).await?;
                let register: json::StudentRegister = parse_body(&body)?;
                let this = self.clone();
                let id = tokio::task::spawn_blocking(move || this.register_student(register))
                    .await
                    .map_err(super::internal_server_err)??;
                let l = self.db.lock();
                let student = l.students_by_id().get(&id).expect("just inserted");
                serve_json(&json::Student::wrap(student))
            }
            _ => Err(bad_req("GET, POST, or HEAD expected")),
        }
    }

    /// Blocking enrollment: validates and embeds every image before
    /// touching the database or the index.
    fn register_student(&self, register: json::StudentRegister) -> Result<i32, Error> {
        if register.images.len() < MIN_ENROLL_IMAGES {
            return Err(err!(
                InvalidArgument,
                msg("please upload at least {MIN_ENROLL_IMAGES} images")
            ));
        }
        if register.images.len() > MAX_ENROLL_IMAGES {
            return Err(err!(
                InvalidArgument,
                msg("maximum {MAX_ENROLL_IMAGES} images allowed")
            ));
        }

        let mut decoded = Vec::with_capacity(register.images.len());
        let mut embeddings = Vec::with_capacity(register.images.len());
        for (i, image) in register.images.iter().enumerate() {
            let n = i + 1;
            let raw = decode_base64_image(image)
                .map_err(|e| err!(InvalidArgument, msg("image {n}: {}", e.chain())))?;
            let frame = Frame::from_jpeg(&raw)
                .map_err(|e| err!(InvalidArgument, msg("image {n}: {}", e.chain())))?;
            self.detector
                .validate_image_quality(&frame)
                .map_err(|e| err!(InvalidArgument, msg("image {n}: {}", e.chain())))?;
            let embedding = self
                .detector
                .embed_single(&frame)?
                .ok_or_else(|| err!(InvalidArgument, msg("image {n}: no face detected")))?;
            decoded.push(raw);
            embeddings.push(embedding);
        }

        let now = self.db.clocks().realtime();
        let dir = self.images_dir.join(&register.student_number);
        std::fs::create_dir_all(&dir)?;

        let id = {
            let mut l = self.db.lock();
            let id = l.add_student(
                db::StudentChange {
                    student_number: register.student_number.clone(),
                    first_name: register.first_name,
                    last_name: register.last_name,
                    group_name: register.group_name,
                },
                now,
            )?;
            for (i, (raw, embedding)) in decoded.iter().zip(&embeddings).enumerate() {
                let path = dir.join(format!("{}_{i}.jpg", now.filename_stamp()));
                std::fs::write(&path, raw)?;
                l.add_student_image(id, &path.to_string_lossy(), embedding, now)?;
            }
            id
        };

        // The batch add persists the index opportunistically.
        let ids = vec![id; embeddings.len()];
        self.index.add_batch(embeddings, &ids)?;
        tracing::info!(
            "enrolled student {} ({} images)",
            register.student_number,
            decoded.len()
        );
        Ok(id)
    }

    pub(super) async fn student(self: Arc<Self>, req: Request<Body>, id: i32) -> super::ResponseResult {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let l = self.db.lock();
                let student = l
                    .students_by_id()
                    .get(&id)
                    .ok_or_else(|| not_found(format!("no such student {id}")))?;
                serve_json(&json::Student::wrap(student))
            }
            Method::DELETE => {
                let this = self.clone();
                tokio::task::spawn_blocking(move || -> Result<(), Error> {
                    // Index rebuild is O(n·d); keep it off the reactor.
                    this.db.lock().delete_student(id)?;
                    this.index.remove_student(id)?;
                    Ok(())
                })
                .await
                .map_err(super::internal_server_err)??;
                serve_json(&serde_json::json!({"deleted": id}))
            }
            _ => Err(bad_req("GET, DELETE, or HEAD expected")),
        }
    }

    pub(super) fn student_location(&self, req: &Request<Body>, id: i32) -> super::ResponseResult {
        require_method(req, Method::GET)?;
        let cutoff = self.db.clocks().realtime() - self.presence_timeout;
        let l = self.db.lock();
        if !l.students_by_id().contains_key(&id) {
            return Err(not_found(format!("no such student {id}")));
        }
        let row = l
            .get_student_presence(id, cutoff)?
            .ok_or_else(|| not_found("student is not currently present"))?;
        let room_name = row
            .room_id
            .and_then(|rid| l.rooms_by_id().get(&rid))
            .map(|r| r.name.as_str());
        serve_json(&json::StudentLocation {
            room_id: row.room_id,
            room_name,
            camera_id: row.camera_id,
            last_seen_at: row.last_seen.iso8601(),
            confidence: row.confidence,
        })
    }
}
