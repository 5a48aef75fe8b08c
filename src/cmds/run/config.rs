// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration file (`moonfire-presence.toml`).

use base::time::Duration;
use serde::Deserialize;
use std::net::{SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

fn default_db_dir() -> PathBuf {
    crate::DEFAULT_DB_DIR.into()
}

fn default_images_dir() -> PathBuf {
    "images".into()
}

fn default_vectors_dir() -> PathBuf {
    "vectors".into()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub binds: Vec<BindConfig>,

    /// Directory holding the SQLite3 index database.
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,

    /// Directory for enrollment images and attendance snapshots.
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    /// Directory for the persisted vector index.
    #[serde(default = "default_vectors_dir")]
    pub vectors_dir: PathBuf,

    /// Number of worker threads for the tokio runtime; defaults to the
    /// number of CPUs.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    #[serde(default)]
    pub recognition: RecognitionConfig,

    #[serde(default)]
    pub streams: StreamsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindConfig {
    #[serde(flatten)]
    pub address: AddressConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressConfig {
    /// IPv4 address such as `0.0.0.0:8080`.
    Ipv4(SocketAddrV4),

    /// IPv6 address such as `[::]:8080`.
    Ipv6(SocketAddrV6),
}

/// All the recognition pipeline's named knobs; defaults match a small
/// deployment.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RecognitionConfig {
    /// Minimum cosine similarity to accept a match.
    pub confidence_threshold: f32,

    /// Embedding vector size; must match the model's output.
    pub embedding_dim: usize,

    /// Upper bound on faces recognized per frame after filtering.
    pub max_faces_per_frame: usize,

    /// Minimum gap between recognition passes per camera.
    pub recognition_interval_ms: u32,

    /// Per-room per-student presence write suppression window.
    pub cooldown_seconds: u32,

    /// Pixel floor on both face dimensions.
    pub min_face_size: u32,

    /// Recognize every Nth eligible frame.
    pub frame_skip: u32,

    /// Window defining "active" presence.
    pub presence_timeout_seconds: u32,

    /// Reaper period.
    pub presence_cleanup_interval_seconds: u32,

    /// Recognition tasks in flight before frames are dropped.
    pub max_pending_tasks: usize,

    /// Abort startup when no face model backend is available.
    pub require_model: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        RecognitionConfig {
            confidence_threshold: 0.6,
            embedding_dim: 512,
            max_faces_per_frame: 10,
            recognition_interval_ms: 300,
            cooldown_seconds: 10,
            min_face_size: 60,
            frame_skip: 2,
            presence_timeout_seconds: 30,
            presence_cleanup_interval_seconds: 10,
            max_pending_tasks: 50,
            require_model: false,
        }
    }
}

impl RecognitionConfig {
    pub fn dispatcher_config(&self) -> crate::recognize::Config {
        crate::recognize::Config {
            confidence_threshold: self.confidence_threshold,
            max_faces_per_frame: self.max_faces_per_frame,
            recognition_interval: Duration::milliseconds(self.recognition_interval_ms.into()),
            cooldown: Duration::seconds(self.cooldown_seconds.into()),
            min_face_size: self.min_face_size as f32,
            frame_skip: self.frame_skip.into(),
            presence_timeout: Duration::seconds(self.presence_timeout_seconds.into()),
            max_pending_tasks: self.max_pending_tasks,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StreamsConfig {
    /// Global cap on simultaneously active camera streams.
    pub max_simultaneous: usize,

    /// Connect timeout on camera start, in seconds.
    pub connect_timeout_seconds: u32,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        StreamsConfig {
            max_simultaneous: crate::manager::MAX_SIMULTANEOUS_STREAMS,
            connect_timeout_seconds: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal() {
        let c: ConfigFile = toml::from_str(
            r#"
            [[binds]]
            ipv4 = "0.0.0.0:8080"
            "#,
        )
        .unwrap();
        assert_eq!(c.recognition.confidence_threshold, 0.6);
        assert_eq!(c.recognition.frame_skip, 2);
        assert_eq!(c.streams.max_simultaneous, 20);
        assert_eq!(c.db_dir, PathBuf::from(crate::DEFAULT_DB_DIR));
    }

    #[test]
    fn full() {
        let c: ConfigFile = toml::from_str(
            r#"
            db_dir = "/var/lib/moonfire-presence/db"
            images_dir = "/var/lib/moonfire-presence/images"
            vectors_dir = "/var/lib/moonfire-presence/vectors"
            worker_threads = 4

            [[binds]]
            ipv6 = "[::]:8080"

            [recognition]
            confidence_threshold = 0.7
            embedding_dim = 512
            max_faces_per_frame = 20
            recognition_interval_ms = 500
            cooldown_seconds = 15
            min_face_size = 80
            frame_skip = 3
            presence_timeout_seconds = 45
            presence_cleanup_interval_seconds = 5
            max_pending_tasks = 25
            require_model = true

            [streams]
            max_simultaneous = 8
            connect_timeout_seconds = 10
            "#,
        )
        .unwrap();
        assert_eq!(c.recognition.cooldown_seconds, 15);
        assert!(c.recognition.require_model);
        assert_eq!(c.streams.max_simultaneous, 8);
        assert_eq!(c.worker_threads, Some(4));
    }

    #[test]
    fn unknown_field_rejected() {
        toml::from_str::<ConfigFile>(
            r#"
            typo_field = true
            [[binds]]
            ipv4 = "0.0.0.0:8080"
            "#,
        )
        .unwrap_err();
    }
}
