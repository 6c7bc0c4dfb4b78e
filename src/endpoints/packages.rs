//! Handles creating packages, assigning them to agents, and listing an agent's pending work

use actix_web::{
    get, post,
    web::{self, Data, Path},
    HttpResponse,
};
use log::{info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::{Config, ReassignPolicy},
    db::{Database, DbBackend, DbBackendError},
    error::HttpError,
    models::{NewPackage, Package, PackageStatus},
};

/// A package as shown to its agent, without the internal agent linkage
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedPackage {
    /// Package id
    pub id_paquete: String,
    /// Delivery address
    pub direccion_destino: String,
    /// Current status, always `ASSIGNED` in a pending list
    pub estado: PackageStatus,
}

impl From<Package> for AssignedPackage {
    fn from(p: Package) -> Self {
        Self {
            id_paquete: p.id,
            direccion_destino: p.destination,
            estado: p.status,
        }
    }
}

/// Body of `POST /insert_paquete/`
#[derive(Debug, Deserialize)]
pub struct InsertPackageReq {
    /// Id of the new package, chosen by the caller
    pub id_paquete: String,
    /// Delivery address
    pub direccion_destino: String,
    /// Agent to assign right away, if any
    #[serde(default)]
    pub id_agente_asignado: Option<i32>,
}

/// Body of `POST /asignar_paquete/`
#[derive(Debug, Deserialize)]
pub struct AssignPackageReq {
    /// Package to assign
    pub id_paquete: String,
    /// Agent that becomes responsible for it
    pub id_agente: i32,
}

#[derive(Debug, Serialize)]
struct InsertResp {
    msg: String,
    id_paquete: String,
}

#[derive(Debug, Serialize)]
struct MsgResp {
    msg: String,
}

async fn __assigned_packages(agent_id: i32, db: &impl DbBackend) -> Result<HttpResponse, HttpError> {
    let packages = db
        .assigned_packages(agent_id)
        .await
        .map_err(|e| HttpError::internal("failed to list packages", e))?;

    // no pending work is reported as an error rather than an empty list
    if packages.is_empty() {
        return Err(HttpError::NotFound(format!(
            "no ASSIGNED packages for agent {}",
            agent_id
        )));
    }

    trace!("agent {} has {} pending package(s)", agent_id, packages.len());
    Ok(HttpResponse::Ok().json(
        packages
            .into_iter()
            .map(AssignedPackage::from)
            .collect::<Vec<_>>(),
    ))
}

async fn __insert_package(
    body: InsertPackageReq,
    db: &impl DbBackend,
) -> Result<HttpResponse, HttpError> {
    let id = body.id_paquete;
    db.insert_package(NewPackage::new(
        id.clone(),
        body.direccion_destino,
        body.id_agente_asignado,
    ))
    .await
    .map_err(|e| HttpError::internal("failed to insert package", e))?;

    info!("inserted package {}", id);
    Ok(HttpResponse::Ok().json(InsertResp {
        msg: format!("package {} inserted", id),
        id_paquete: id,
    }))
}

/// Assign an existing package to an existing agent, forcing it back to `ASSIGNED`.
/// Whether a delivered package may be assigned again is decided by `policy`.
async fn __assign_package(
    body: AssignPackageReq,
    db: &impl DbBackend,
    policy: ReassignPolicy,
) -> Result<HttpResponse, HttpError> {
    let package = db
        .get_package(&body.id_paquete)
        .await
        .map_err(|e| HttpError::internal("failed to look up package", e))?;
    let agent = db
        .get_agent(body.id_agente)
        .await
        .map_err(|e| HttpError::internal("failed to look up agent", e))?;

    let package = package.ok_or_else(|| {
        HttpError::NotFound(format!("package with id {} not found", body.id_paquete))
    })?;
    let agent = agent
        .ok_or_else(|| HttpError::NotFound(format!("agent with id {} not found", body.id_agente)))?;

    if package.status == PackageStatus::Delivered {
        match policy {
            ReassignPolicy::Reject => return Err(HttpError::AlreadyDelivered(package.id)),
            ReassignPolicy::Allow => warn!(
                "package {} was already delivered, re-assigning to agent {} anyway",
                package.id, agent.id
            ),
        }
    }

    db.assign_package(&package.id, agent.id)
        .await
        .map_err(|e| match e {
            DbBackendError::NotFound => {
                HttpError::NotFound(format!("package with id {} not found", package.id))
            }
            e => HttpError::internal("failed to assign package", e),
        })?;

    info!("assigned package {} to agent {}", package.id, agent.id);
    Ok(HttpResponse::Ok().json(MsgResp {
        msg: format!("package {} assigned to agent {}", package.id, agent.id),
    }))
}

/// List the packages an agent still has to deliver (GET /paquetes/{id_agente})
#[get("/paquetes/{id_agente}")]
pub async fn assigned_packages(
    agent_id: Path<i32>,
    db: Data<Database>,
) -> Result<HttpResponse, HttpError> {
    __assigned_packages(agent_id.into_inner(), db.get_ref()).await
}

/// Create a package (POST /insert_paquete/)
#[post("/insert_paquete/")]
pub async fn insert_package(
    body: web::Json<InsertPackageReq>,
    db: Data<Database>,
) -> Result<HttpResponse, HttpError> {
    __insert_package(body.into_inner(), db.get_ref()).await
}

/// Assign a package to an agent (POST /asignar_paquete/)
#[post("/asignar_paquete/")]
pub async fn assign_package(
    body: web::Json<AssignPackageReq>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, HttpError> {
    __assign_package(body.into_inner(), db.get_ref(), config.reassign_policy).await
}
