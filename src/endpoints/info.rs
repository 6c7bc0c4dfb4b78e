//! Liveness information about the api

use actix_web::{
    get,
    web::{self, Data},
};
use serde::Serialize;

use crate::State;

#[derive(Debug, Serialize)]
struct InfoResp<'r> {
    status: &'r str,
    api: &'r str,
    version: &'r str,
    uptime: u64,
}

/// endpoint which returns information about the api (GET /)
#[get("/")]
pub async fn health(state: Data<State>) -> impl actix_web::Responder {
    web::Json(InfoResp {
        status: "active",
        api: "parcel delivery tracking",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.start_time.elapsed().as_secs(),
    })
}
