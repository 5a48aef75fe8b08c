// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run the server: ingest, recognition, reaper, and the web
//! interface.

use crate::facedet;
use crate::hub::Hub;
use crate::manager::StreamManager;
use crate::recognize::Dispatcher;
use crate::reaper::Reaper;
use crate::stream;
use crate::web;
use base::clock;
use base::time::Duration;
use base::{bail, err, Error};
use bpaf::Bpaf;
use db::vector::VectorIndex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use self::config::ConfigFile;

mod config;

/// Runs the server.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the config file.
    #[bpaf(argument("PATH"), fallback("/etc/moonfire-presence.toml".into()))]
    config: PathBuf,
}

fn read_config(path: &std::path::Path) -> Result<ConfigFile, Error> {
    let config = std::fs::read_to_string(path)?;
    let config = toml::from_str(&config)
        .map_err(|e| err!(InvalidArgument, msg("unable to parse config"), source(e)))?;
    Ok(config)
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)
        .map_err(|e| err!(InvalidArgument, msg("unable to read {}", args.config.display()), source(e)))?;

    base::time::init_zone(jiff::tz::TimeZone::system);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder.build().map_err(Error::from)?;
    let r = rt.block_on(async_run(&config));

    // tokio normally waits for all spawned tasks to complete, but:
    // * in the graceful shutdown path, we wait for specific tasks with
    //   logging.
    // * in the immediate shutdown path, we don't want to wait.
    rt.shutdown_background();

    r
}

async fn async_run(config: &ConfigFile) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    tokio::pin! {
        let int = signal(SignalKind::interrupt()).map_err(Error::from)?;
        let term = signal(SignalKind::terminate()).map_err(Error::from)?;
        let inner = inner(config, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(config: &ConfigFile, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    let clocks = clock::RealClocks {};
    let (_db_dir, conn) = super::open_conn(&config.db_dir, super::OpenMode::ReadWrite)?;
    let db = Arc::new(db::Database::new(clocks, conn)?);
    info!("database is loaded");

    // The vector index: load or start empty, then reconcile against the
    // enrollment records so a lost index heals itself.
    let index = Arc::new(VectorIndex::open(
        config.recognition.embedding_dim,
        &config.vectors_dir,
    ));
    if index.is_empty() {
        let mut vectors = Vec::new();
        let mut ids = Vec::new();
        db.lock().list_embeddings(&mut |student_id, v| {
            vectors.push(v);
            ids.push(student_id);
            Ok(())
        })?;
        if !ids.is_empty() {
            info!("rebuilding vector index from {} stored embeddings", ids.len());
            index.add_batch(vectors, &ids)?;
        }
    }
    info!(
        "vector index ready: {} vectors, {} students",
        index.len(),
        index.student_count()
    );

    let detector: Arc<dyn facedet::Detector> =
        facedet::build(config.recognition.require_model)?.into();

    let hub = Arc::new(Hub::new());
    let rt_handle = tokio::runtime::Handle::current();
    let dispatcher = Dispatcher::new(
        db.clone(),
        index.clone(),
        detector.clone(),
        hub.clone(),
        config.recognition.dispatcher_config(),
        rt_handle.clone(),
    );
    let manager = Arc::new(StreamManager::new(
        clocks,
        Arc::new(stream::RealOpener) as Arc<dyn stream::Opener>,
        shutdown_rx.clone(),
        rt_handle,
        config.streams.max_simultaneous,
    ));

    let reaper = Reaper::new(
        db.clone(),
        hub.clone(),
        dispatcher.clone(),
        Duration::seconds(config.recognition.presence_timeout_seconds.into()),
        StdDuration::from_secs(config.recognition.presence_cleanup_interval_seconds.into()),
    );
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx.clone()));

    let svc = Arc::new(web::Service::new(web::Config {
        db: db.clone(),
        index: index.clone(),
        detector,
        manager: manager.clone(),
        dispatcher,
        hub: hub.clone(),
        images_dir: config.images_dir.clone(),
        presence_timeout: Duration::seconds(config.recognition.presence_timeout_seconds.into()),
        connect_timeout: StdDuration::from_secs(config.streams.connect_timeout_seconds.into()),
    }));
    let web_handles: Result<Vec<_>, Error> = config
        .binds
        .iter()
        .map(|b| {
            let svc = svc.clone();
            let make_svc = hyper::service::make_service_fn(move |_conn| {
                futures::future::ok::<_, std::convert::Infallible>(hyper::service::service_fn({
                    let svc = Arc::clone(&svc);
                    move |req| Arc::clone(&svc).serve(req)
                }))
            });
            let socket_addr = match b.address {
                config::AddressConfig::Ipv4(a) => a.into(),
                config::AddressConfig::Ipv6(a) => a.into(),
            };
            let server = hyper::Server::try_bind(&socket_addr)
                .map_err(|e| err!(Unavailable, msg("unable to bind to {socket_addr}"), source(e)))?
                .tcp_nodelay(true)
                .serve(make_svc);
            let server = server.with_graceful_shutdown(shutdown_rx.future());
            Ok(tokio::spawn(server))
        })
        .collect();
    let web_handles = web_handles?;

    info!("ready to serve HTTP requests");
    let _ = shutdown_rx.as_future().await;

    info!("shutting down streams");
    tokio::task::spawn_blocking({
        let manager = manager.clone();
        move || manager.stop_all()
    })
    .await
    .map_err(|e| err!(Internal, msg("stop_all panicked"), source(e)))?;

    // Save failures shouldn't block the rest of shutdown.
    if let Err(err) = tokio::task::spawn_blocking(move || index.save())
        .await
        .map_err(|e| err!(Internal, msg("index save panicked"), source(e)))?
    {
        error!(err = %err.chain(), "unable to save vector index");
    }

    hub.clear();

    info!("waiting for HTTP requests to finish");
    for h in web_handles {
        h.await
            .map_err(|e| err!(Internal, msg("web server panicked"), source(e)))?
            .map_err(|e| err!(Unknown, source(e)))?;
    }
    if let Err(err) = reaper_handle.await {
        warn!(%err, "reaper task panicked");
    }

    info!("exiting");
    Ok(0)
}
