// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Opens RTSP streams and decodes them to RGB frames.
//!
//! The `Opener`/`Stream` traits exist for test injection; production code
//! uses [`RealOpener`], which drives a Retina RTSP session and decodes
//! motion-JPEG frames with the `image` crate. The streamer threads call the
//! blocking interface; internally each call hops onto the tokio runtime.

use base::{bail, err, Error};
use bytes::Bytes;
use futures::StreamExt;
use retina::client::Demuxed;
use retina::codec::CodecItem;
use std::pin::Pin;
use std::time::Duration as StdDuration;
use tracing::Instrument;
use url::Url;

/// One decoded video frame, RGB24 row-major.
///
/// `data` is reference-counted, so cloning a frame (e.g. the latest-frame
/// slot's defensive copy) does not copy pixels.
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn from_jpeg(data: &[u8]) -> Result<Self, Error> {
        let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
            .map_err(|e| err!(InvalidArgument, msg("unable to decode JPEG frame"), source(e)))?;
        let rgb = img.into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Frame {
            width,
            height,
            data: Bytes::from(rgb.into_raw()),
        })
    }

    /// Re-encodes as JPEG at the given quality, for the broadcast path.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(&self.data, self.width, self.height, image::ColorType::Rgb8)
            .map_err(|e| err!(Internal, msg("unable to encode JPEG frame"), source(e)))?;
        Ok(out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame {{ {}x{} }}", self.width, self.height)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Options {
    /// Bound on session setup through the first frame.
    pub connect_timeout: StdDuration,

    /// Bound on each subsequent frame.
    pub read_timeout: StdDuration,
}

/// Opens a RTSP stream. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given RTSP URL, blocking through the first decoded frame.
    ///
    /// Note: despite the blocking interface, this expects to be called from
    /// a thread with a current multithreaded tokio runtime with IO and time
    /// enabled.
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error>;
}

pub trait Stream: Send {
    fn next(&mut self) -> Result<Frame, Error>;
}

pub struct RealOpener;

pub const OPENER: RealOpener = RealOpener;

impl Opener for RealOpener {
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error> {
        let session_options = retina::client::SessionOptions::default()
            .user_agent(format!("Moonfire Presence {}", env!("CARGO_PKG_VERSION")));
        let rt_handle = tokio::runtime::Handle::current();
        let (inner, first_frame) = rt_handle
            .block_on(
                rt_handle.spawn(
                    tokio::time::timeout(
                        options.connect_timeout,
                        RetinaStreamInner::play(label, url, session_options),
                    )
                    .in_current_span(),
                ),
            )
            .expect("RetinaStream::play task panicked, see earlier error")
            .map_err(|e| {
                err!(
                    DeadlineExceeded,
                    msg("unable to play stream and get first frame within timeout"),
                    source(e),
                )
            })??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            read_timeout: options.read_timeout,
            first_frame: Some(first_frame),
        }))
    }
}

/// Real stream, implemented with the Retina library.
///
/// Retina is asynchronous and tokio-based where the streamer threads expect
/// a synchronous interface, so this blocks on the tokio operations.
///
/// Experimentally, it appears faster to have one thread hand-off per frame
/// via `handle.block_on(handle.spawn(...))` rather than the same without the
/// `handle.spawn(...)`.
struct RetinaStream {
    /// The actual stream details used from within the tokio reactor.
    ///
    /// Spawned tokio tasks must be `'static`, so ownership is passed to the
    /// task, and then returned when it completes.
    inner: Option<Box<RetinaStreamInner>>,

    rt_handle: tokio::runtime::Handle,
    read_timeout: StdDuration,

    /// The first frame, if not yet returned from `next`.
    ///
    /// This frame is special because it is fetched as part of setup, to
    /// confirm the camera actually produces decodable frames.
    first_frame: Option<Frame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
}

impl RetinaStreamInner {
    /// Plays to the first frame. No timeout; that's the caller's
    /// responsibility.
    async fn play(
        label: String,
        url: Url,
        options: retina::client::SessionOptions,
    ) -> Result<(Box<Self>, Frame), Error> {
        let mut session = retina::client::Session::describe(url, options)
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        tracing::debug!("connected to {:?}, tool {:?}", &label, session.tool());

        // Only motion JPEG is supported: it is the one encoding Retina hands
        // over as self-contained images the `image` crate can decode.
        let video_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && s.encoding_name() == "jpeg")
            .ok_or_else(|| {
                err!(
                    FailedPrecondition,
                    msg("couldn't find a motion JPEG video stream")
                )
            })?;
        session
            .setup(video_i, retina::client::SetupOptions::default())
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        let mut session = session.demuxed().map_err(|e| err!(Unknown, source(e)))?;

        // First frame.
        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => bail!(Unavailable, msg("stream closed before first frame")),
                Some(Err(e)) => bail!(Unknown, msg("unable to get first frame"), source(e)),
                Some(Ok(CodecItem::VideoFrame(v))) => break Frame::from_jpeg(v.data())?,
                Some(Ok(_)) => {}
            }
        };
        let self_ = Box::new(Self { label, session });
        Ok((self_, first_frame))
    }

    /// Fetches and decodes a non-initial frame.
    async fn fetch_next_frame(mut self: Box<Self>) -> Result<(Box<Self>, Frame), Error> {
        loop {
            match Pin::new(&mut self.session)
                .next()
                .await
                .transpose()
                .map_err(|e| err!(Unknown, source(e)))?
            {
                None => bail!(Unavailable, msg("end of stream")),
                Some(CodecItem::VideoFrame(v)) => {
                    if v.loss() > 0 {
                        tracing::warn!(
                            "{}: lost {} RTP packets @ {}",
                            &self.label,
                            v.loss(),
                            v.start_ctx()
                        );
                    }
                    let frame = Frame::from_jpeg(v.data())?;
                    return Ok((self, frame));
                }
                Some(_) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn next(&mut self) -> Result<Frame, Error> {
        if let Some(f) = self.first_frame.take() {
            return Ok(f);
        }
        let inner = self.inner.take().unwrap();
        let read_timeout = self.read_timeout;
        let (inner, frame) = self
            .rt_handle
            .block_on(
                self.rt_handle.spawn(
                    tokio::time::timeout(read_timeout, inner.fetch_next_frame())
                        .in_current_span(),
                ),
            )
            .expect("fetch_next_frame task panicked, see earlier error")
            .map_err(|e| {
                err!(
                    DeadlineExceeded,
                    msg("unable to get next frame within {read_timeout:?}"),
                    source(e)
                )
            })??;
        self.inner = Some(inner);
        Ok(frame)
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::collections::VecDeque;

    /// A synthetic gray frame of the given dimensions.
    pub fn solid_frame(width: u32, height: u32) -> Frame {
        Frame {
            width,
            height,
            data: Bytes::from(vec![0x80u8; (width * height * 3) as usize]),
        }
    }

    /// A `Stream` which replays a script of frames and errors, then fails
    /// with `Unavailable`.
    pub struct ScriptedStream {
        items: VecDeque<Result<Frame, Error>>,
    }

    impl ScriptedStream {
        pub fn new(items: Vec<Result<Frame, Error>>) -> Self {
            ScriptedStream {
                items: items.into(),
            }
        }
    }

    impl Stream for ScriptedStream {
        fn next(&mut self) -> Result<Frame, Error> {
            self.items
                .pop_front()
                .unwrap_or_else(|| Err(err!(Unavailable, msg("end of script"))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_round_trip() {
        let f = testutil::solid_frame(64, 48);
        let jpeg = f.to_jpeg(85).unwrap();
        let f2 = Frame::from_jpeg(&jpeg).unwrap();
        assert_eq!((f2.width, f2.height), (64, 48));
    }

    #[test]
    fn bad_jpeg() {
        Frame::from_jpeg(b"not a jpeg").unwrap_err();
    }
}
