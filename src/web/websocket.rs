// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Common code for the presence and camera stream WebSockets.

use std::pin::Pin;

use base::bail;
use futures::Future;
use http::{header, Request, Response};
use hyper::Body;
use tokio_tungstenite::tungstenite;
use tracing::Instrument;

use super::{bad_req, ResponseResult};

pub(super) type WebSocketStream =
    tokio_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>;

/// Upgrades to WebSocket and runs the supplied stream handler in a separate
/// tokio task. The handler owns the stream and is responsible for closing
/// it.
///
/// Fails on `Origin` mismatch with an HTTP-level error.
pub(super) fn upgrade<H>(req: Request<Body>, handler: H) -> ResponseResult
where
    H: FnOnce(WebSocketStream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static,
{
    // An `Origin` mismatch should be a HTTP-level error; this is likely a
    // cross-site attack, and using HTTP-level errors avoids giving any
    // information to the Javascript running in the browser.
    check_origin(req.headers())?;

    // Otherwise, upgrade and handle the rest in a separate task.
    let response = tungstenite::handshake::server::create_response_with_body(&req, Body::empty)
        .map_err(|e| bad_req(e.to_string()))?;
    let (parts, _) = response.into_parts();
    let span = tracing::info_span!("websocket");
    tokio::spawn(
        async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(u) => u,
                Err(err) => {
                    tracing::error!(%err, "upgrade failed");
                    return;
                }
            };
            let ws = tokio_tungstenite::WebSocketStream::from_raw_socket(
                upgraded,
                tungstenite::protocol::Role::Server,
                None,
            )
            .await;
            handler(ws).await;
            tracing::info!("closed");
        }
        .instrument(span),
    );
    Ok(Response::from_parts(parts, Body::empty()))
}

/// Checks the `Host` and `Origin` headers match, if the latter is supplied.
///
/// Web browsers must supply origin, according to [RFC 6455 section
/// 4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-4.1).
/// It's not required for non-browser HTTP clients.
fn check_origin(headers: &header::HeaderMap) -> Result<(), super::HttpError> {
    let origin_hdr = match headers.get(http::header::ORIGIN) {
        None => return Ok(()),
        Some(o) => o,
    };
    let host_hdr = headers
        .get(header::HOST)
        .ok_or_else(|| bad_req("missing Host header"))?;
    let host_str = host_hdr.to_str().map_err(|_| bad_req("bad Host header"))?;

    // This ignores the port number. This is easiest and matches the
    // browser's rules for when it sends a cookie, so it probably doesn't
    // cause great security problems.
    let host = match host_str.split_once(':') {
        Some((host, _port)) => host,
        None => host_str,
    };
    let origin_url = origin_hdr
        .to_str()
        .ok()
        .and_then(|o| url::Url::parse(o).ok())
        .ok_or_else(|| bad_req("bad Origin header"))?;
    let origin_host = origin_url
        .host_str()
        .ok_or_else(|| bad_req("bad Origin header"))?;
    if host != origin_host {
        bail!(
            PermissionDenied,
            msg(
                "cross-origin request forbidden (request host {:?}, origin {:?})",
                host_hdr,
                origin_hdr
            )
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn origin_port_8080_okay() {
        let mut hdrs = header::HeaderMap::new();
        hdrs.insert(header::HOST, "tracker:8080".try_into().unwrap());
        hdrs.insert(header::ORIGIN, "http://tracker:8080/".try_into().unwrap());
        assert!(check_origin(&hdrs).is_ok());
    }

    #[test]
    fn origin_missing_okay() {
        let mut hdrs = header::HeaderMap::new();
        hdrs.insert(header::HOST, "tracker".try_into().unwrap());
        assert!(check_origin(&hdrs).is_ok());
    }

    #[test]
    fn origin_mismatch_fails() {
        let mut hdrs = header::HeaderMap::new();
        hdrs.insert(header::HOST, "tracker".try_into().unwrap());
        hdrs.insert(header::ORIGIN, "http://evil/".try_into().unwrap());
        assert!(check_origin(&hdrs).is_err());
    }
}
