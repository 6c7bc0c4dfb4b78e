//! All endpoints that the API can handle

pub mod auth;
pub mod delivery;
pub mod info;
pub mod packages;

use actix_web::web;

use crate::error::HttpError;

/// configure every api endpoint, along with the json extractor error format
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _| HttpError::BadRequest(err.to_string()).into()),
    )
    .service(info::health)
    .service(auth::register)
    .service(auth::login)
    .service(packages::assigned_packages)
    .service(packages::insert_package)
    .service(packages::assign_package)
    .service(delivery::register_delivery);
}
