//! Handles registration of deliveries, with a gps position and a photo as proof

use actix_multipart::{Field, Multipart};
use actix_web::{post, web::Data, HttpResponse};
use chrono::Utc;
use futures::TryStreamExt;
use log::{info, trace};
use serde::Serialize;

use crate::{
    config::Config,
    db::{Database, DbBackend, DbBackendError},
    error::HttpError,
    models::{to_fixed_point, NewDeliveryRecord, PackageStatus, MAX_COORDINATE_DEGREES},
    storage::EvidenceStore,
};

/// Upper bound for the plain text fields of the form
const TEXT_FIELD_LIMIT: usize = 1024;

/// The fields of a delivery form, with the photo read into memory
#[derive(Debug)]
pub struct DeliveryForm {
    /// Id of the delivered package, exactly as sent
    pub package_id: String,
    /// Latitude in fixed-point form, see [`to_fixed_point`]
    pub latitude_e8: i64,
    /// Longitude in fixed-point form, see [`to_fixed_point`]
    pub longitude_e8: i64,
    /// Name of the photo on the client, only its extension is kept
    pub file_name: String,
    /// Raw bytes of the photo
    pub photo: Vec<u8>,
}

/// Read a field to its end, failing once it grows beyond `limit` bytes
async fn collect_field(field: &mut Field, limit: usize) -> Result<Vec<u8>, HttpError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.try_next().await? {
        bytes.extend_from_slice(&chunk);
        if bytes.len() > limit {
            return Err(HttpError::PayloadTooLarge(format!(
                "form field larger than {} bytes",
                limit
            )));
        }
    }
    Ok(bytes)
}

async fn text_field(field: &mut Field, name: &str) -> Result<String, HttpError> {
    let bytes = collect_field(field, TEXT_FIELD_LIMIT).await?;
    String::from_utf8(bytes)
        .map_err(|_| HttpError::BadRequest(format!("field `{}` must be valid utf-8", name)))
}

/// Parse a coordinate in degrees into its stored fixed-point form
fn parse_coordinate(name: &str, value: &str) -> Result<i64, HttpError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(to_fixed_point)
        .ok_or_else(|| {
            HttpError::BadRequest(format!(
                "field `{}` must be a number between -{max} and {max}",
                name,
                max = MAX_COORDINATE_DEGREES
            ))
        })
}

fn missing(name: &str) -> HttpError {
    HttpError::BadRequest(format!("missing form field `{}`", name))
}

impl DeliveryForm {
    /// Parse the multipart form of `POST /entrega/`, accepting at most
    /// `photo_limit` bytes of photo.
    pub async fn from_multipart(mut payload: Multipart, photo_limit: usize) -> Result<Self, HttpError> {
        let mut package_id = None;
        let mut latitude_e8 = None;
        let mut longitude_e8 = None;
        let mut file = None;

        while let Some(mut field) = payload.try_next().await? {
            let name = field
                .content_disposition()
                .get_name()
                .unwrap_or_default()
                .to_owned();
            match name.as_str() {
                "id_paquete" => package_id = Some(text_field(&mut field, &name).await?),
                "latitud" => {
                    let value = text_field(&mut field, &name).await?;
                    latitude_e8 = Some(parse_coordinate(&name, &value)?);
                }
                "longitud" => {
                    let value = text_field(&mut field, &name).await?;
                    longitude_e8 = Some(parse_coordinate(&name, &value)?);
                }
                "file" => {
                    let file_name = field
                        .content_disposition()
                        .get_filename()
                        .unwrap_or_default()
                        .to_owned();
                    let photo = collect_field(&mut field, photo_limit).await?;
                    file = Some((file_name, photo));
                }
                other => {
                    trace!("ignoring unexpected form field `{}`", other);
                    while field.try_next().await?.is_some() {}
                }
            }
        }

        let (file_name, photo) = file.ok_or_else(|| missing("file"))?;
        Ok(Self {
            package_id: package_id.ok_or_else(|| missing("id_paquete"))?,
            latitude_e8: latitude_e8.ok_or_else(|| missing("latitud"))?,
            longitude_e8: longitude_e8.ok_or_else(|| missing("longitud"))?,
            file_name,
            photo,
        })
    }
}

#[derive(Debug, Serialize)]
struct DeliveryResp {
    msg: &'static str,
    id_registro: i32,
    foto_url: String,
    lat: f64,
    lon: f64,
}

/// Record the delivery of a package.
///
/// The package is checked before anything is written to disk. Once the photo is
/// stored, a failure to record the delivery removes the photo again.
async fn __register_delivery(
    form: DeliveryForm,
    db: &impl DbBackend,
    store: &EvidenceStore,
) -> Result<HttpResponse, HttpError> {
    let package = db
        .get_package(&form.package_id)
        .await
        .map_err(|e| HttpError::internal("failed to look up package", e))?
        .ok_or_else(|| {
            HttpError::NotFound(format!("package with id {} not found", form.package_id))
        })?;
    if package.status == PackageStatus::Delivered {
        return Err(HttpError::AlreadyDelivered(package.id));
    }

    let now = Utc::now();
    let evidence = store
        .save(&package.id, &form.file_name, now, &form.photo)
        .await
        .map_err(|e| HttpError::internal("failed to store delivery evidence", e))?;

    let record = NewDeliveryRecord::new(
        package.id.clone(),
        now.naive_utc(),
        form.latitude_e8,
        form.longitude_e8,
        evidence.url.clone(),
    );
    let saved = match db.record_delivery(record).await {
        Ok(saved) => saved,
        Err(e) => {
            store.discard(&evidence).await;
            return Err(match e {
                DbBackendError::AlreadyDelivered => HttpError::AlreadyDelivered(package.id),
                e => HttpError::internal("failed to record delivery", e),
            });
        }
    };

    info!(
        "package {} delivered, record {} with evidence {}",
        saved.package_id, saved.id, saved.photo_url
    );
    Ok(HttpResponse::Ok().json(DeliveryResp {
        msg: "package delivered, evidence stored",
        id_registro: saved.id,
        lat: saved.latitude(),
        lon: saved.longitude(),
        foto_url: saved.photo_url,
    }))
}

/// Register a delivery from a multipart form (POST /entrega/)
#[post("/entrega/")]
pub async fn register_delivery(
    payload: Multipart,
    db: Data<Database>,
    store: Data<EvidenceStore>,
    config: Data<Config>,
) -> Result<HttpResponse, HttpError> {
    let form = DeliveryForm::from_multipart(payload, config.max_upload_bytes).await?;
    __register_delivery(form, db.get_ref(), store.get_ref()).await
}
