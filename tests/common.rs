#![cfg(not(tarpaulin_include))]
#![allow(dead_code)]

use std::{path::PathBuf, sync::Once, thread::JoinHandle};

use actix_cors::Cors;
use actix_files::Files;
use actix_web::{middleware::Logger, web::Data, App, HttpServer};
use tokio::sync::oneshot;

use parcel_tracker_lib::{
    config::{Config, ReassignPolicy},
    db::Database,
    endpoints,
    storage::{EvidenceStore, UPLOAD_URL_PREFIX},
    State,
};

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        pretty_env_logger::init();
    });
}

pub fn find_open_port() -> std::net::TcpListener {
    for port in 1025..65535 {
        if let Ok(l) = std::net::TcpListener::bind(("127.0.0.1", port)) {
            return l;
        }
    }
    panic!("no open ports found");
}

/// A running server, with the files it created removed by [`TestServer::cleanup`]
pub struct TestServer {
    pub address: String,
    pub db_path: String,
    pub upload_dir: PathBuf,
    handle: JoinHandle<()>,
    tx: oneshot::Sender<()>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub fn cleanup(self) {
        let _ = self.tx.send(());
        self.handle.join().unwrap();
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_dir_all(&self.upload_dir);
    }
}

pub async fn create_server(name: &str, reassign_policy: ReassignPolicy) -> TestServer {
    let db_path = format!("./test-db-{}.db", name);
    let upload_dir = std::env::temp_dir().join(format!("parcel-tracker-uploads-{}", name));
    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_dir_all(&upload_dir);

    let port = find_open_port();
    let address = format!("127.0.0.1:{}", port.local_addr().unwrap().port());

    let db = Database::new(db_path.clone())
        .await
        .expect("a valid database connection");
    db.init().await.expect("migrations to apply");

    let store = EvidenceStore::new(upload_dir.clone());
    store.init().await.expect("an upload directory");

    let config = Config {
        listener: port.try_clone().unwrap(),
        db_url: db_path.clone(),
        upload_dir: upload_dir.clone(),
        max_upload_bytes: 64 * 1024,
        reassign_policy,
    };

    let db = Data::new(db);
    let store = Data::new(store);
    let config = Data::new(config);
    let state = Data::new(State {
        start_time: std::time::Instant::now(),
    });

    let (tx, mut rx) = oneshot::channel::<()>();
    let handle = std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .app_data(db.clone())
                .app_data(store.clone())
                .app_data(config.clone())
                .configure(endpoints::configure)
                .service(Files::new(UPLOAD_URL_PREFIX, store.dir()))
                .wrap(Cors::permissive())
                .wrap(Logger::default())
        })
        .listen(port)
        .unwrap()
        .run();
        rt.block_on(async move {
            tokio::select! {
                biased;
                _ = &mut rx => {}
                _ = &mut server => {}
            }
        });
    });

    TestServer {
        address,
        db_path,
        upload_dir,
        handle,
        tx,
    }
}
