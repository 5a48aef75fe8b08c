// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Face detection and embedding extraction.
//!
//! The model is an external capability behind the [`Detector`] trait: any
//! backend producing unit vectors in R^512, `[x1, y1, x2, y2]` boxes, and
//! detection scores in [0, 1] is acceptable. The TensorFlow Lite backend is
//! only compiled with `--features=tflite`; without it, [`build`] returns a
//! [`NullDetector`] which detects nothing, and startup fails if the config
//! sets `require_model = true`.

use crate::stream::Frame;
use base::{bail, Error};
use tracing::warn;

/// Detections below this score are discarded regardless of configuration.
pub const MIN_DETECTION_SCORE: f32 = 0.5;

/// Enrollment requires between this many images...
pub const MIN_ENROLL_IMAGES: usize = 5;

/// ...and this many.
pub const MAX_ENROLL_IMAGES: usize = 10;

/// One detected face with its embedding.
#[derive(Clone, Debug)]
pub struct Detection {
    /// `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [f32; 4],

    /// Detection confidence in [0, 1]; distinct from recognition score.
    pub score: f32,

    /// Unit vector produced by the model.
    pub embedding: Vec<f32>,
}

impl Detection {
    /// The smaller of the box's two dimensions, in pixels.
    pub fn size(&self) -> f32 {
        f32::min(self.bbox[2] - self.bbox[0], self.bbox[3] - self.bbox[1])
    }
}

pub trait Detector: Send + Sync {
    /// Detects all faces in the frame and extracts their embeddings.
    fn detect_and_embed(&self, frame: &Frame) -> Result<Vec<Detection>, Error>;

    /// Extracts a single embedding for enrollment/check-in: the largest
    /// face, or `None` if the frame has no face.
    fn embed_single(&self, frame: &Frame) -> Result<Option<Vec<f32>>, Error> {
        let mut faces = self.detect_and_embed(frame)?;
        faces.sort_by(|a, b| b.size().total_cmp(&a.size()));
        Ok(faces.into_iter().next().map(|d| d.embedding))
    }

    /// Checks an enrollment image: reasonable dimensions, exactly one face,
    /// big enough, confidently detected. Errors are `InvalidArgument` with
    /// a message fit to show the caller.
    fn validate_image_quality(&self, frame: &Frame) -> Result<(), Error> {
        if frame.width < 100 || frame.height < 100 {
            bail!(InvalidArgument, msg("image too small (minimum 100x100 pixels)"));
        }
        if frame.width > 4000 || frame.height > 4000 {
            bail!(InvalidArgument, msg("image too large (maximum 4000x4000 pixels)"));
        }
        let faces = self.detect_and_embed(frame)?;
        if faces.is_empty() {
            bail!(InvalidArgument, msg("no face detected in image"));
        }
        if faces.len() > 1 {
            bail!(
                InvalidArgument,
                msg("multiple faces detected ({}); one face per image", faces.len())
            );
        }
        let face = &faces[0];
        if face.size() < 80.0 {
            bail!(InvalidArgument, msg("face too small (minimum 80x80 pixels)"));
        }
        if face.score < MIN_DETECTION_SCORE {
            bail!(
                InvalidArgument,
                msg("low face detection confidence ({:.2})", face.score)
            );
        }
        Ok(())
    }

    /// Whether this backend can actually recognize anything.
    fn is_null(&self) -> bool {
        false
    }
}

/// Stand-in used when no model backend is compiled in. Streams and
/// broadcasts still work; recognition finds nothing.
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect_and_embed(&self, _frame: &Frame) -> Result<Vec<Detection>, Error> {
        Ok(Vec::new())
    }

    fn is_null(&self) -> bool {
        true
    }
}

/// Constructs the configured detector backend.
pub fn build(require_model: bool) -> Result<Box<dyn Detector>, Error> {
    #[cfg(feature = "tflite")]
    {
        return Ok(Box::new(tflite::TfliteDetector::new()?));
    }
    #[allow(unreachable_code)]
    {
        if require_model {
            bail!(
                FailedPrecondition,
                msg("require_model is set but this build has no face model backend; \
                     rebuild with --features=tflite")
            );
        }
        warn!("no face model backend compiled in; recognition is disabled");
        Ok(Box::new(NullDetector))
    }
}

#[cfg(feature = "tflite")]
pub mod tflite {
    //! TensorFlow Lite backend: a face detection SSD head plus an embedding
    //! model, run on the CPU or an Edge TPU when present.

    use super::*;
    use std::sync::Mutex;

    static DETECT_MODEL: &[u8] = include_bytes!("facedet.tflite");
    static EMBED_MODEL: &[u8] = include_bytes!("faceembed.tflite");

    const DETECT_INPUT: (u32, u32) = (320, 320);
    const EMBED_INPUT: (u32, u32) = (112, 112);
    const EMBED_DIM: usize = 512;

    pub struct TfliteDetector {
        detect: Mutex<moonfire_tflite::Interpreter<'static>>,
        embed: Mutex<moonfire_tflite::Interpreter<'static>>,
    }

    impl TfliteDetector {
        pub fn new() -> Result<Self, Error> {
            let build = |model: &'static [u8]| -> Result<moonfire_tflite::Interpreter<'static>, Error> {
                let m = moonfire_tflite::Model::from_static(model)
                    .map_err(|()| base::err!(Internal, msg("TFLite model initialization failed")))?;
                let mut builder = moonfire_tflite::Interpreter::builder();
                let devices = moonfire_tflite::edgetpu::Devices::list();
                if let Some(device) = devices.first() {
                    if let Ok(d) = device.create_delegate() {
                        builder.add_owned_delegate(d);
                    }
                }
                builder
                    .build(&m)
                    .map_err(|()| base::err!(Internal, msg("TFLite interpreter initialization failed")))
            };
            Ok(TfliteDetector {
                detect: Mutex::new(build(DETECT_MODEL)?),
                embed: Mutex::new(build(EMBED_MODEL)?),
            })
        }

        /// Nearest-neighbor scale of an RGB24 frame region into `out`.
        fn scale_into(frame: &Frame, bbox: Option<[f32; 4]>, w: u32, h: u32, out: &mut [u8]) {
            let (x0, y0, bw, bh) = match bbox {
                None => (0.0, 0.0, frame.width as f32, frame.height as f32),
                Some(b) => (b[0], b[1], (b[2] - b[0]).max(1.0), (b[3] - b[1]).max(1.0)),
            };
            for y in 0..h {
                for x in 0..w {
                    let sx = (x0 + bw * (x as f32 + 0.5) / w as f32) as u32;
                    let sy = (y0 + bh * (y as f32 + 0.5) / h as f32) as u32;
                    let sx = sx.min(frame.width - 1) as usize;
                    let sy = sy.min(frame.height - 1) as usize;
                    let si = (sy * frame.width as usize + sx) * 3;
                    let di = ((y * w + x) * 3) as usize;
                    out[di..di + 3].copy_from_slice(&frame.data[si..si + 3]);
                }
            }
        }
    }

    impl Detector for TfliteDetector {
        fn detect_and_embed(&self, frame: &Frame) -> Result<Vec<Detection>, Error> {
            let mut boxes = Vec::new();
            {
                let mut interp = self.detect.lock().unwrap();
                let mut input = vec![0u8; (DETECT_INPUT.0 * DETECT_INPUT.1 * 3) as usize];
                Self::scale_into(frame, None, DETECT_INPUT.0, DETECT_INPUT.1, &mut input);
                interp.inputs()[0].bytes_mut().copy_from_slice(&input);
                interp
                    .invoke()
                    .map_err(|()| base::err!(Internal, msg("TFLite detect invocation failed")))?;
                let outputs = interp.outputs();
                let raw_boxes = outputs[0].f32s();
                let scores = outputs[2].f32s();
                for (i, &score) in scores.iter().enumerate() {
                    if score < MIN_DETECTION_SCORE {
                        continue;
                    }
                    // SSD boxes are [ymin, xmin, ymax, xmax], normalized.
                    let b = &raw_boxes[i * 4..i * 4 + 4];
                    boxes.push((
                        [
                            b[1] * frame.width as f32,
                            b[0] * frame.height as f32,
                            b[3] * frame.width as f32,
                            b[2] * frame.height as f32,
                        ],
                        score,
                    ));
                }
            }

            let mut out = Vec::with_capacity(boxes.len());
            let mut interp = self.embed.lock().unwrap();
            let mut input = vec![0u8; (EMBED_INPUT.0 * EMBED_INPUT.1 * 3) as usize];
            for (bbox, score) in boxes {
                Self::scale_into(frame, Some(bbox), EMBED_INPUT.0, EMBED_INPUT.1, &mut input);
                interp.inputs()[0].bytes_mut().copy_from_slice(&input);
                interp
                    .invoke()
                    .map_err(|()| base::err!(Internal, msg("TFLite embed invocation failed")))?;
                let raw = interp.outputs()[0].f32s();
                let mut embedding = raw[..EMBED_DIM].to_vec();
                let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > f32::EPSILON {
                    for x in &mut embedding {
                        *x /= norm;
                    }
                }
                out.push(Detection {
                    bbox,
                    score,
                    embedding,
                });
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
pub mod testutil {
    //! A scriptable detector for pipeline tests: yields a fixed set of
    //! detections per frame, keyed by the frame's width tag.

    use super::*;
    use base::FastHashMap;
    use std::sync::Mutex;

    pub struct FakeDetector {
        by_tag: Mutex<FastHashMap<u32, Vec<Detection>>>,
    }

    impl FakeDetector {
        pub fn new() -> Self {
            FakeDetector {
                by_tag: Mutex::new(FastHashMap::default()),
            }
        }

        pub fn put(&self, tag: u32, detections: Vec<Detection>) {
            self.by_tag.lock().unwrap().insert(tag, detections);
        }
    }

    impl Detector for FakeDetector {
        fn detect_and_embed(&self, frame: &Frame) -> Result<Vec<Detection>, Error> {
            Ok(self
                .by_tag
                .lock()
                .unwrap()
                .get(&frame.width)
                .cloned()
                .unwrap_or_default())
        }
    }

    pub fn detection(bbox: [f32; 4], score: f32, embedding: Vec<f32>) -> Detection {
        Detection {
            bbox,
            score,
            embedding,
        }
    }
}
