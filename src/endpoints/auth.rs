//! Handles registration and login of delivery agents

use actix_web::{
    post,
    web::{self, Data},
    HttpResponse,
};
use log::{error, info, trace};
use serde::{Deserialize, Serialize};

use crate::{
    db::{Database, DbBackend, DbBackendError},
    error::HttpError,
    models::NewAgent,
    password,
};

/// Body of `POST /register/`
#[derive(Debug, Deserialize)]
pub struct RegisterReq {
    /// Login name, unique across agents
    pub username: String,
    /// Plaintext password, only its hash is stored
    pub password: String,
    /// Display name of the agent
    pub nombre: String,
}

/// Body of `POST /login/`
#[derive(Debug, Deserialize)]
pub struct LoginReq {
    /// Login name
    pub username: String,
    /// Plaintext password
    pub password: String,
}

#[derive(Debug, Serialize)]
struct AgentResp<'r> {
    msg: &'r str,
    id_agente: i32,
}

/// Argon2 runs on the blocking pool, off the async workers
async fn hash(password: String) -> Result<String, HttpError> {
    web::block(move || password::hash_password(&password))
        .await
        .map_err(|e| HttpError::internal("failed to hash password", e))?
        .map_err(|e| HttpError::internal("failed to hash password", e))
}

async fn verify(password: String, hash: String) -> Result<bool, HttpError> {
    web::block(move || password::verify_password(&password, &hash))
        .await
        .map_err(|e| HttpError::internal("failed to verify password", e))?
        .or_else(|e| {
            error!("stored password hash is malformed: {}", e);
            Ok(false)
        })
}

/// Create a new agent, refusing usernames that are already taken
async fn __register(body: RegisterReq, db: &impl DbBackend) -> Result<HttpResponse, HttpError> {
    let password_hash = hash(body.password).await?;
    let username = body.username;

    let id = match db
        .create_agent(NewAgent {
            name: body.nombre,
            username: username.clone(),
            password_hash,
        })
        .await
    {
        Ok(id) => id,
        Err(DbBackendError::AlreadyExist) => {
            trace!("registration rejected, username `{}` is taken", username);
            return Err(HttpError::Conflict(format!(
                "username {} already exists",
                username
            )));
        }
        Err(e) => return Err(HttpError::internal("failed to register agent", e)),
    };

    info!("registered agent `{}` with id {}", username, id);
    Ok(HttpResponse::Ok().json(AgentResp {
        msg: "agent registered, packages must be assigned separately",
        id_agente: id,
    }))
}

/// Check an agent's credentials. Unknown usernames and wrong passwords produce
/// the same response, so the endpoint cannot be used to discover usernames.
async fn __login(body: LoginReq, db: &impl DbBackend) -> Result<HttpResponse, HttpError> {
    let LoginReq { username, password: plaintext } = body;
    let agent = db
        .find_agent_by_username(&username)
        .await
        .map_err(|e| HttpError::internal("failed to look up agent", e))?;

    let agent = match agent {
        Some(agent) => agent,
        None => {
            trace!("login attempt for unknown username `{}`", username);
            // same argon2 cost as a wrong password
            let _ = web::block(move || password::verify_dummy(&plaintext)).await;
            return Err(HttpError::Unauthorized);
        }
    };

    if !verify(plaintext, agent.password_hash).await? {
        trace!("login attempt with a wrong password for agent {}", agent.id);
        return Err(HttpError::Unauthorized);
    }

    Ok(HttpResponse::Ok().json(AgentResp {
        msg: "login successful",
        id_agente: agent.id,
    }))
}

/// Endpoint for registering a new agent (POST /register/)
#[post("/register/")]
pub async fn register(
    body: web::Json<RegisterReq>,
    db: Data<Database>,
) -> Result<HttpResponse, HttpError> {
    __register(body.into_inner(), db.get_ref()).await
}

/// Endpoint for agent login (POST /login/)
#[post("/login/")]
pub async fn login(body: web::Json<LoginReq>, db: Data<Database>) -> Result<HttpResponse, HttpError> {
    __login(body.into_inner(), db.get_ref()).await
}
