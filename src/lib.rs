//! A small api for tracking parcel deliveries: agents log in, are assigned
//! packages, and record each delivery with a gps position and a photo

#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    deprecated
)]

#[macro_use]
extern crate diesel;

pub mod config;
pub mod db;
pub mod endpoints;
pub mod error;
#[allow(missing_docs)]
pub mod models;
pub mod password;
#[cfg(not(tarpaulin_include))]
pub mod schema;
pub mod storage;

use actix_cors::Cors;
use actix_files::Files;
use actix_web::{middleware::Logger, web::Data, App, HttpServer};
use config::Config;
use db::Database;
use log::info;
use storage::{EvidenceStore, UPLOAD_URL_PREFIX};

/// Process wide information, shared by every worker
#[derive(Debug)]
pub struct State {
    /// The instant that the server started
    pub start_time: std::time::Instant,
}

#[doc(hidden)]
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let database = Database::new(config.db_url.clone()).await?;
    database.init().await?;
    let database = Data::new(database);

    let store = EvidenceStore::new(config.upload_dir.clone());
    store.init().await?;
    let store = Data::new(store);

    let listener = config.listener.try_clone()?;
    info!(
        "listening on {}, storing evidence in {:?}, reassign policy `{}`",
        listener.local_addr()?,
        store.dir(),
        config.reassign_policy
    );

    let config = Data::new(config);
    let state = Data::new(State {
        start_time: std::time::Instant::now(),
    });

    // begin listening for connections
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(database.clone())
            .app_data(store.clone())
            .app_data(config.clone())
            .configure(endpoints::configure)
            .service(Files::new(UPLOAD_URL_PREFIX, store.dir()))
            .wrap(Cors::permissive())
            .wrap(Logger::default())
    })
    .listen(listener)?
    .run();

    let handle = server.handle();
    let mut server = Box::pin(server);

    tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            handle.stop(true).await;
        }

        res = &mut server => {
            info!("Server task has exited, shutting down");
            res?;
        }
    }

    Ok(())
}
