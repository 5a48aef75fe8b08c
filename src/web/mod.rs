// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP/WebSocket interface: admin CRUD, presence reads, stream
//! control, check-in, and the three subscription namespaces.

mod attendance;
mod cameras;
mod path;
mod rooms;
mod students;
mod websocket;

use self::path::Path;
use crate::facedet::Detector;
use crate::hub::{Channel, Hub, Message};
use crate::json;
use crate::manager::StreamManager;
use crate::recognize::Dispatcher;
use base::clock::Clocks;
use base::time::Duration;
use base::{ErrorKind, FastHashMap};
use db::vector::VectorIndex;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use http::header::{self, HeaderValue};
use http::method::Method;
use http::{status::StatusCode, Request, Response};
use hyper::body::Bytes;
use hyper::Body;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_tungstenite::tungstenite;
use tracing::debug;
use url::form_urlencoded;

/// Interval at which to send keepalives if there is no traffic.
///
/// Chrome appears to time out WebSockets after 60 seconds of inactivity; an
/// idle room's presence channel can easily go quiet for longer.
const KEEPALIVE_AFTER_IDLE: StdDuration = StdDuration::from_secs(30);

/// An HTTP error response.
///
/// This is a thin wrapper over the hyper response type; its purpose is to
/// allow automatic conversion from `base::Error`. Rust's orphan rule
/// prevents this crate from defining a direct conversion from `base::Error`
/// to `hyper::Response`.
pub(crate) struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<base::Error> for HttpError {
    fn from(err: base::Error) -> Self {
        HttpError(from_base_error(err))
    }
}

fn plain_response<B: Into<Body>>(status: StatusCode, body: B) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(body.into())
        .expect("hardcoded head should be valid")
}

fn not_found<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::NOT_FOUND, body))
}

fn bad_req<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::BAD_REQUEST, body))
}

fn internal_server_err<E: std::fmt::Display>(err: E) -> HttpError {
    HttpError(plain_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        err.to_string(),
    ))
}

fn from_base_error(err: base::Error) -> Response<Body> {
    use ErrorKind::*;
    let status_code = match err.kind() {
        Unauthenticated => StatusCode::UNAUTHORIZED,
        PermissionDenied => StatusCode::FORBIDDEN,
        InvalidArgument | FailedPrecondition | ResourceExhausted | AlreadyExists => {
            StatusCode::BAD_REQUEST
        }
        NotFound => StatusCode::NOT_FOUND,
        OutOfRange => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    plain_response(status_code, err.chain().to_string())
}

pub(crate) type ResponseResult = Result<Response<Body>, HttpError>;

fn serve_json<T: serde::ser::Serialize>(out: &T) -> ResponseResult {
    let body = serde_json::to_vec(out).map_err(internal_server_err)?;
    Ok(Response::builder()
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .body(body.into())
        .expect("hardcoded head should be valid"))
}

fn require_method(req: &Request<Body>, method: Method) -> Result<(), HttpError> {
    if *req.method() != method {
        return Err(plain_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{method} expected"),
        )
        .into());
    }
    Ok(())
}

/// Extracts an `application/json` POST body from a request.
async fn extract_json_body(req: &mut Request<Body>) -> Result<Bytes, HttpError> {
    require_method(req, Method::POST)?;
    let correct_mime_type = match req.headers().get(header::CONTENT_TYPE) {
        Some(t) if t == "application/json" => true,
        Some(t) if t == "application/json; charset=UTF-8" => true,
        _ => false,
    };
    if !correct_mime_type {
        return Err(bad_req("expected application/json request body"));
    }
    let b = std::mem::replace(req.body_mut(), Body::empty());
    hyper::body::to_bytes(b)
        .await
        .map_err(|e| internal_server_err(format!("unable to read request body: {e}")))
}

fn parse_body<'a, T: serde::Deserialize<'a>>(body: &'a Bytes) -> Result<T, HttpError> {
    serde_json::from_slice(body).map_err(|e| bad_req(e.to_string()))
}

pub struct Config {
    pub db: Arc<db::Database>,
    pub index: Arc<VectorIndex>,
    pub detector: Arc<dyn Detector>,
    pub manager: Arc<StreamManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub hub: Arc<Hub>,
    pub images_dir: PathBuf,
    pub presence_timeout: Duration,
    pub connect_timeout: StdDuration,
}

pub struct Service {
    pub(crate) db: Arc<db::Database>,
    pub(crate) index: Arc<VectorIndex>,
    pub(crate) detector: Arc<dyn Detector>,
    pub(crate) manager: Arc<StreamManager>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) hub: Arc<Hub>,
    pub(crate) images_dir: PathBuf,
    pub(crate) presence_timeout: Duration,
    pub(crate) connect_timeout: StdDuration,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Service {
            db: config.db,
            index: config.index,
            detector: config.detector,
            manager: config.manager,
            dispatcher: config.dispatcher,
            hub: config.hub,
            images_dir: config.images_dir,
            presence_timeout: config.presence_timeout,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Serves an HTTP request.
    ///
    /// An error return from this method causes hyper to abruptly drop the
    /// HTTP connection rather than respond. That's not terribly useful, so
    /// this method always returns `Ok`. It delegates to `serve_inner`,
    /// which is allowed to generate `Err` results with the `?` operator.
    pub async fn serve(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let p = Path::decode(req.uri().path());
        debug!("request on: {}: {:?}", req.uri(), p);
        let mut response = self
            .serve_inner(req, p)
            .await
            .unwrap_or_else(|e| e.0);
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("private, no-cache"),
        );
        Ok(response)
    }

    async fn serve_inner(self: Arc<Self>, mut req: Request<Body>, p: Path) -> ResponseResult {
        match p {
            Path::TopLevel => self.top_level(&req),
            Path::Rooms => self.rooms(&mut req).await,
            Path::Room(id) => self.room(&mut req, id).await,
            Path::RoomPresence(id) => self.room_presence(&req, id),
            Path::RoomPresenceClear(id) => self.room_presence_clear(&req, id),
            Path::RoomStart(id) => self.room_start(req, id).await,
            Path::RoomStop(id) => self.room_stop(&req, id),
            Path::Cameras => self.cameras(&mut req).await,
            Path::Camera(id) => self.camera(&mut req, id).await,
            Path::CameraStatus(id) => self.camera_status(&req, id),
            Path::CameraStart(id) => self.camera_start(req, id).await,
            Path::CameraStop(id) => self.camera_stop(&req, id),
            Path::Students => self.students(req).await,
            Path::Student(id) => self.student(req, id).await,
            Path::StudentLocation(id) => self.student_location(&req, id),
            Path::Attendance => self.attendance(&req),
            Path::AttendanceCheckIn => self.check_in(req).await,
            Path::Stats => self.stats_json(&req),
            Path::AllPresenceWs => self.all_presence_ws(req),
            Path::RoomPresenceWs(id) => self.room_presence_ws(req, id),
            Path::CameraStreamWs(id) => self.camera_stream_ws(req, id),
            Path::NotFound => Err(not_found("path not understood")),
        }
    }

    fn top_level(&self, req: &Request<Body>) -> ResponseResult {
        require_method(req, Method::GET)?;
        serve_json(&json::TopLevel {
            server_version: env!("CARGO_PKG_VERSION"),
            stats: self.stats()?,
        })
    }

    fn stats_json(&self, req: &Request<Body>) -> ResponseResult {
        require_method(req, Method::GET)?;
        serve_json(&self.stats()?)
    }

    fn stats(&self) -> Result<json::Stats, base::Error> {
        let cutoff = self.db.clocks().realtime() - self.presence_timeout;
        let s = self.db.lock().presence_stats(cutoff)?;
        Ok(json::Stats {
            total_people_tracked: s.active_people,
            total_rooms: s.total_rooms,
            occupied_rooms: s.occupied_rooms,
            presence_timeout_seconds: (self.presence_timeout.0
                / base::time::TIME_UNITS_PER_SEC) as u32,
            active_streams: self.manager.active_count(),
            indexed_vectors: self.index.len(),
            indexed_students: self.index.student_count(),
        })
    }

    /// Builds the presence message for one room, with the guest count
    /// attached from the dispatcher's tracker.
    pub(crate) fn room_presence_message(
        &self,
        r#type: &'static str,
        room_id: i32,
        include_stale: bool,
    ) -> Result<json::PresenceMessage, base::Error> {
        let now = self.db.clocks().realtime();
        let cutoff = if include_stale {
            base::time::Time::MIN
        } else {
            now - self.presence_timeout
        };
        let (room_name, occupants) = {
            let l = self.db.lock();
            let room = l
                .rooms_by_id()
                .get(&room_id)
                .ok_or_else(|| base::err!(NotFound, msg("no such room {room_id}")))?;
            let occupants = l
                .list_room_presence(room_id, cutoff)?
                .iter()
                .map(json::Occupant::from_row)
                .collect();
            (room.name.clone(), occupants)
        };
        Ok(json::PresenceMessage::new(
            r#type,
            room_id,
            room_name,
            occupants,
            None,
            self.dispatcher.guest_count(room_id),
            now,
        ))
    }

    /// Subscribes a WebSocket-backed sink to the channel and returns the
    /// receiving end. The sink unsubscribes itself once the receiver drops.
    pub(crate) fn subscribe(&self, channel: Channel) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded();
        self.hub
            .subscribe(channel, Box::new(move |m| tx.unbounded_send(m).is_ok()));
        rx
    }
}

/// Pumps hub messages to the client until either side goes away.
///
/// Answers a client's JSON `ping` with `pong` and protocol pings with
/// pongs, and sends its own keepalive pings when idle.
pub(crate) async fn ws_loop(
    ws: websocket::WebSocketStream,
    initial: Option<String>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let (mut tx, mut incoming) = ws.split();
    if let Some(s) = initial {
        if tx.send(tungstenite::Message::Text(s)).await.is_err() {
            return;
        }
    }
    let mut keepalive = tokio::time::interval(KEEPALIVE_AFTER_IDLE);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            m = rx.next() => {
                let m = match m {
                    None => break, // hub cleared (shutdown).
                    Some(m) => m,
                };
                let sent = match m {
                    Message::Json(s) => {
                        tx.send(tungstenite::Message::Text(s.to_string())).await
                    }
                    Message::Binary(b) => {
                        tx.send(tungstenite::Message::Binary(b.to_vec())).await
                    }
                };
                if sent.is_err() {
                    return;
                }
            }
            m = incoming.next() => {
                match m {
                    None | Some(Err(_)) => return,
                    Some(Ok(tungstenite::Message::Close(_))) => break,
                    Some(Ok(tungstenite::Message::Text(t))) if t == "ping" => {
                        if tx
                            .send(tungstenite::Message::Text("pong".to_owned()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(p))) => {
                        let _ = tx.send(tungstenite::Message::Pong(p)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = keepalive.tick() => {
                if tx.send(tungstenite::Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = tx.close().await;
}

/// Parses the query string into a map; repeated keys keep the last value.
fn query_params(req: &Request<Body>) -> FastHashMap<String, String> {
    let mut m = FastHashMap::default();
    if let Some(q) = req.uri().query() {
        for (k, v) in form_urlencoded::parse(q.as_bytes()) {
            m.insert(k.into_owned(), v.into_owned());
        }
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facedet::testutil::{detection, FakeDetector};
    use crate::stream::testutil::solid_frame;
    use base::clock::RealClocks;
    use db::testutil::{self, TestDb};
    use serde_json::json;

    const DIM: usize = 8;

    struct FailingOpener;

    impl crate::stream::Opener for FailingOpener {
        fn open(
            &self,
            _label: String,
            _url: url::Url,
            _options: crate::stream::Options,
        ) -> Result<Box<dyn crate::stream::Stream>, base::Error> {
            Err(base::err!(Unavailable, msg("no camera in tests")))
        }
    }

    struct Server {
        _tdb: TestDb<RealClocks>,
        detector: Arc<FakeDetector>,
        index: Arc<VectorIndex>,
        db: Arc<db::Database>,
        _tmpdir: tempfile::TempDir,
        base_url: String,
        shutdown_tx: Option<futures::channel::oneshot::Sender<()>>,
        handle: Option<std::thread::JoinHandle<()>>,
    }

    impl Server {
        fn new() -> Self {
            testutil::init();
            let tdb = TestDb::new(RealClocks {});
            let tmpdir = tempfile::Builder::new()
                .prefix("moonfire-presence-web")
                .tempdir()
                .unwrap();
            let index = Arc::new(VectorIndex::empty(DIM));
            let detector = Arc::new(FakeDetector::new());
            let hub = Arc::new(Hub::new());
            let (shutdown_tx, shutdown_rx) = futures::channel::oneshot::channel::<()>();
            let (tx, rx) = std::sync::mpsc::channel();

            let db = tdb.db.clone();
            let index2 = index.clone();
            let detector2 = detector.clone();
            let worker_shutdown = tdb.shutdown_rx.clone();
            let handle = std::thread::spawn(move || {
                let rt = tokio::runtime::Runtime::new().unwrap();
                let _guard = rt.enter();
                let dispatcher = Dispatcher::new(
                    db.clone(),
                    index2.clone(),
                    detector2.clone() as Arc<dyn Detector>,
                    hub.clone(),
                    crate::recognize::Config::default(),
                    rt.handle().clone(),
                );
                let manager = Arc::new(StreamManager::new(
                    RealClocks {},
                    Arc::new(FailingOpener) as Arc<dyn crate::stream::Opener>,
                    worker_shutdown,
                    rt.handle().clone(),
                    crate::manager::MAX_SIMULTANEOUS_STREAMS,
                ));
                let svc = Arc::new(Service::new(Config {
                    db,
                    index: index2,
                    detector: detector2 as Arc<dyn Detector>,
                    manager,
                    dispatcher,
                    hub,
                    images_dir: tmpdir.path().to_owned(),
                    presence_timeout: Duration::seconds(30),
                    connect_timeout: StdDuration::from_secs(1),
                }));
                let make_svc = hyper::service::make_service_fn(move |_conn| {
                    futures::future::ok::<_, std::convert::Infallible>(
                        hyper::service::service_fn({
                            let svc = Arc::clone(&svc);
                            move |req| Arc::clone(&svc).serve(req)
                        }),
                    )
                });
                let srv = {
                    let addr = ([127, 0, 0, 1], 0).into();
                    hyper::server::Server::bind(&addr)
                        .tcp_nodelay(true)
                        .serve(make_svc)
                };
                tx.send((srv.local_addr(), tmpdir)).unwrap();
                rt.block_on(srv.with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                }))
                .unwrap();
            });
            let (addr, tmpdir) = rx.recv().unwrap();
            Server {
                db: tdb.db.clone(),
                _tdb: tdb,
                detector,
                index,
                _tmpdir: tmpdir,
                base_url: format!("http://{}:{}", addr.ip(), addr.port()),
                shutdown_tx: Some(shutdown_tx),
                handle: Some(handle),
            }
        }
    }

    impl Drop for Server {
        fn drop(&mut self) {
            let _ = self.shutdown_tx.take().unwrap().send(());
            self.handle.take().unwrap().join().unwrap();
        }
    }

    /// A base64 data URL of a JPEG whose decoded width tags it for the fake
    /// detector.
    fn test_image(width: u32) -> String {
        let jpeg = solid_frame(width, 240).to_jpeg(85).unwrap();
        format!("data:image/jpeg;base64,{}", base64::encode(jpeg))
    }

    fn student_embedding() -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[0] = 1.0;
        v
    }

    #[tokio::test]
    async fn rooms_crud() {
        let s = Server::new();
        let cli = reqwest::Client::new();
        let rooms_url = format!("{}/api/rooms", s.base_url);

        // Create.
        let resp = cli
            .post(&rooms_url)
            .json(&json!({"name": "physics lab"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let created: serde_json::Value = resp.json().await.unwrap();
        let id = created["id"].as_i64().unwrap();
        assert_eq!(created["name"], "physics lab");

        // Duplicate name.
        let resp = cli
            .post(&rooms_url)
            .json(&json!({"name": "physics lab"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        // List includes it.
        let list: serde_json::Value = cli.get(&rooms_url).send().await.unwrap().json().await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 2); // the test room + ours.

        // Update.
        let resp = cli
            .post(format!("{}/{}", rooms_url, id))
            .json(&json!({"name": "chem lab"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let got: serde_json::Value = cli
            .get(format!("{}/{}", rooms_url, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(got["room"]["name"], "chem lab");

        // Delete; list shrinks.
        let resp = cli
            .delete(format!("{}/{}", rooms_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let list: serde_json::Value = cli.get(&rooms_url).send().await.unwrap().json().await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cameras_crud_and_validation() {
        let s = Server::new();
        let cli = reqwest::Client::new();
        let cameras_url = format!("{}/api/cameras", s.base_url);

        // Bad scheme rejected.
        let resp = cli
            .post(&cameras_url)
            .json(&json!({
                "room_id": testutil::TEST_ROOM_ID,
                "name": "door cam",
                "rtsp_url": "http://host/stream",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        // Good one created.
        let resp = cli
            .post(&cameras_url)
            .json(&json!({
                "room_id": testutil::TEST_ROOM_ID,
                "name": "door cam",
                "rtsp_url": "rtsp://host/stream",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let created: serde_json::Value = resp.json().await.unwrap();
        let id = created["id"].as_i64().unwrap();

        // Status of an inactive stream reads as disconnected.
        let status: serde_json::Value = cli
            .get(format!("{}/{}/status", cameras_url, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["connected"], false);
        assert_eq!(status["running"], false);

        // Starting it fails: the test opener has no cameras.
        let resp = cli
            .post(format!("{}/{}/start", cameras_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

        let resp = cli
            .delete(format!("{}/{}", cameras_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn register_and_check_in() {
        let s = Server::new();
        s.detector.put(
            320,
            vec![detection([0.0, 0.0, 120.0, 130.0], 0.9, student_embedding())],
        );
        let cli = reqwest::Client::new();

        // Too few images.
        let resp = cli
            .post(format!("{}/api/students", s.base_url))
            .json(&json!({
                "student_number": "S2024-0002",
                "first_name": "Grace",
                "last_name": "Hopper",
                "images": vec![test_image(320); 3],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        // Registration with five valid images.
        let resp = cli
            .post(format!("{}/api/students", s.base_url))
            .json(&json!({
                "student_number": "S2024-0002",
                "first_name": "Grace",
                "last_name": "Hopper",
                "group_name": "CS-102",
                "images": vec![test_image(320); 5],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let student: serde_json::Value = resp.json().await.unwrap();
        let student_id = student["id"].as_i64().unwrap() as i32;
        assert_eq!(s.index.len(), 5);

        // First check-in succeeds.
        let checkin_url = format!("{}/api/attendance/check-in", s.base_url);
        let resp: serde_json::Value = cli
            .post(&checkin_url)
            .json(&json!({"image": test_image(320)}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["status"], "success", "got {resp}");
        assert_eq!(resp["student"]["student_number"], "S2024-0002");
        let first_time = resp["check_in_time"].as_str().unwrap().to_owned();

        // Second check-in the same day reports the original time.
        let resp: serde_json::Value = cli
            .post(&checkin_url)
            .json(&json!({"image": test_image(320)}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["status"], "already_attended");
        assert_eq!(resp["check_in_time"], first_time.as_str());

        // Exactly one attendance row for today.
        let today = s.db.clocks().realtime().day_key();
        assert_eq!(s.db.lock().list_attendance(&today).unwrap().len(), 1);

        // Deleting the student empties the index.
        let resp = cli
            .delete(format!("{}/api/students/{}", s.base_url, student_id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(s.index.len(), 0);
    }

    #[tokio::test]
    async fn check_in_outcomes() {
        let s = Server::new();
        let cli = reqwest::Client::new();
        let checkin_url = format!("{}/api/attendance/check-in", s.base_url);

        // Garbage base64.
        let resp = cli
            .post(&checkin_url)
            .json(&json!({"image": "@@not-base64@@"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        // Valid image, no face.
        let resp: serde_json::Value = cli
            .post(&checkin_url)
            .json(&json!({"image": test_image(128)}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["status"], "no_face");

        // A face that matches nobody.
        s.detector.put(
            160,
            vec![detection([0.0, 0.0, 120.0, 130.0], 0.9, student_embedding())],
        );
        let resp: serde_json::Value = cli
            .post(&checkin_url)
            .json(&json!({"image": test_image(160)}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["status"], "not_found");
    }

    #[tokio::test]
    async fn presence_reads_and_stats() {
        let s = Server::new();
        let cli = reqwest::Client::new();
        let now = s.db.clocks().realtime();
        s.db.lock()
            .upsert_presence(
                testutil::TEST_STUDENT_ID,
                testutil::TEST_ROOM_ID,
                Some(testutil::TEST_CAMERA_ID),
                now,
                0.91,
            )
            .unwrap();

        let presence: serde_json::Value = cli
            .get(format!(
                "{}/api/rooms/{}/presence",
                s.base_url,
                testutil::TEST_ROOM_ID
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(presence["total_count"], 1);
        assert_eq!(
            presence["occupants"][0]["student_number"],
            testutil::TEST_STUDENT_NUMBER
        );

        let loc: serde_json::Value = cli
            .get(format!(
                "{}/api/students/{}/location",
                s.base_url,
                testutil::TEST_STUDENT_ID
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(loc["room_name"], testutil::TEST_ROOM_NAME);

        let stats: serde_json::Value = cli
            .get(format!("{}/api/stats", s.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["total_people_tracked"], 1);
        assert_eq!(stats["occupied_rooms"], 1);

        // Clearing the room empties it.
        let resp: serde_json::Value = cli
            .post(format!(
                "{}/api/rooms/{}/presence/clear",
                s.base_url,
                testutil::TEST_ROOM_ID
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["cleared"], 1);
    }
}
