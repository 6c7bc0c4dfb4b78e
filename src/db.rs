//! Database access. Handlers only see the [`DbBackend`] trait, so they can run
//! against the sqlite backed [`Database`] or an in-memory mock in tests.

use std::time::Duration;

use actix_web::web;
use async_trait::async_trait;
use diesel::{
    connection::SimpleConnection,
    prelude::*,
    r2d2::{self, ConnectionManager, CustomizeConnection},
    result::{DatabaseErrorKind, Error as DieselError},
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};

use crate::{
    models::{Agent, DeliveryRecord, NewAgent, NewDeliveryRecord, NewPackage, Package, PackageStatus},
    schema::{agents, delivery_records, packages},
};

/// Migrations compiled into the binary, applied by [`Database::init`]
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const DB_POOL_MAX_SIZE: u32 = 8;
const DB_POOL_TIMEOUT_SECONDS: u64 = 15;
const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

/// Errors raised by a [`DbBackend`]
#[derive(Debug, thiserror::Error)]
pub enum DbBackendError {
    /// A unique constraint was violated
    #[error("a record with this key already exists")]
    AlreadyExist,
    /// The package already has a delivery record
    #[error("package has already been delivered")]
    AlreadyDelivered,
    /// The row to read or update does not exist
    #[error("record not found")]
    NotFound,
    /// No pooled connection became available in time
    #[error("unable to acquire a database connection: {0}")]
    Pool(#[from] r2d2::PoolError),
    /// Any other diesel failure
    #[error("database query failed: {0}")]
    Query(DieselError),
    /// The embedded migrations could not be applied
    #[error("failed to run migrations: {0}")]
    Migration(String),
    /// The blocking task was cancelled or panicked
    #[error("database task failed: {0}")]
    Blocking(String),
}

impl From<DieselError> for DbBackendError {
    fn from(e: DieselError) -> Self {
        match e {
            DieselError::NotFound => DbBackendError::NotFound,
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                debug!("unique constraint violated: {}", info.message());
                DbBackendError::AlreadyExist
            }
            e => DbBackendError::Query(e),
        }
    }
}

/// The storage operations required by the api
#[async_trait]
pub trait DbBackend: Send + Sync {
    /// Insert a new agent, returning its generated id
    async fn create_agent(&self, agent: NewAgent) -> Result<i32, DbBackendError>;

    /// Look up an agent by login name
    async fn find_agent_by_username(&self, username: &str)
        -> Result<Option<Agent>, DbBackendError>;

    /// Look up an agent by id
    async fn get_agent(&self, id: i32) -> Result<Option<Agent>, DbBackendError>;

    /// Insert a package. Fails with [`DbBackendError::AlreadyExist`] on a taken id.
    async fn insert_package(&self, package: NewPackage) -> Result<(), DbBackendError>;

    /// Look up a package by id
    async fn get_package(&self, id: &str) -> Result<Option<Package>, DbBackendError>;

    /// Packages assigned to `agent_id` which are still waiting for delivery
    async fn assigned_packages(&self, agent_id: i32) -> Result<Vec<Package>, DbBackendError>;

    /// Point the package at `agent_id` and force its status back to `ASSIGNED`
    async fn assign_package(&self, package_id: &str, agent_id: i32)
        -> Result<(), DbBackendError>;

    /// Atomically store the delivery record and mark its package as delivered
    async fn record_delivery(
        &self,
        record: NewDeliveryRecord,
    ) -> Result<DeliveryRecord, DbBackendError>;
}

/// Applied to every connection as it is checked out of the pool
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        ))
        .map_err(r2d2::Error::QueryError)
    }
}

/// Sqlite database, accessed through a connection pool
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Connect to the sqlite database at `db_url`, creating the file if needed
    pub async fn new(db_url: String) -> Result<Self, DbBackendError> {
        let manager = ConnectionManager::<SqliteConnection>::new(db_url);
        let pool = r2d2::Pool::builder()
            .max_size(DB_POOL_MAX_SIZE)
            .connection_timeout(Duration::from_secs(DB_POOL_TIMEOUT_SECONDS))
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout: DB_BUSY_TIMEOUT,
            }))
            .build(manager)?;
        Ok(Self { pool })
    }

    /// Apply any pending migrations
    pub async fn init(&self) -> Result<(), DbBackendError> {
        let applied = self
            .run(|conn| {
                conn.run_pending_migrations(MIGRATIONS)
                    .map(|versions| versions.len())
                    .map_err(|e| DbBackendError::Migration(e.to_string()))
            })
            .await?;
        info!("database ready, applied {} migration(s)", applied);
        Ok(())
    }

    /// Run `f` on the blocking thread pool with a connection checked out for its duration.
    /// The connection returns to the pool when `f` finishes, whatever the outcome.
    async fn run<F, R>(&self, f: F) -> Result<R, DbBackendError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<R, DbBackendError> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();
        web::block(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| DbBackendError::Blocking(e.to_string()))?
    }
}

#[async_trait]
impl DbBackend for Database {
    async fn create_agent(&self, agent: NewAgent) -> Result<i32, DbBackendError> {
        self.run(move |conn| {
            diesel::insert_into(agents::table)
                .values(&agent)
                .returning(agents::id)
                .get_result::<i32>(conn)
                .map_err(Into::into)
        })
        .await
    }

    async fn find_agent_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Agent>, DbBackendError> {
        let username = username.to_owned();
        self.run(move |conn| {
            agents::table
                .filter(agents::username.eq(username))
                .first::<Agent>(conn)
                .optional()
                .map_err(Into::into)
        })
        .await
    }

    async fn get_agent(&self, id: i32) -> Result<Option<Agent>, DbBackendError> {
        self.run(move |conn| {
            agents::table
                .find(id)
                .first::<Agent>(conn)
                .optional()
                .map_err(Into::into)
        })
        .await
    }

    async fn insert_package(&self, package: NewPackage) -> Result<(), DbBackendError> {
        self.run(move |conn| {
            diesel::insert_into(packages::table)
                .values(&package)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_package(&self, id: &str) -> Result<Option<Package>, DbBackendError> {
        let id = id.to_owned();
        self.run(move |conn| {
            packages::table
                .find(id)
                .first::<Package>(conn)
                .optional()
                .map_err(Into::into)
        })
        .await
    }

    async fn assigned_packages(&self, agent_id: i32) -> Result<Vec<Package>, DbBackendError> {
        self.run(move |conn| {
            packages::table
                .filter(packages::agent_id.eq(agent_id))
                .filter(packages::status.eq(PackageStatus::Assigned))
                .order(packages::id.asc())
                .load::<Package>(conn)
                .map_err(Into::into)
        })
        .await
    }

    async fn assign_package(&self, package_id: &str, agent_id: i32) -> Result<(), DbBackendError> {
        let package_id = package_id.to_owned();
        self.run(move |conn| {
            let updated = diesel::update(packages::table.find(package_id))
                .set((
                    packages::agent_id.eq(Some(agent_id)),
                    packages::status.eq(PackageStatus::Assigned),
                ))
                .execute(conn)?;
            match updated {
                0 => Err(DbBackendError::NotFound),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn record_delivery(
        &self,
        record: NewDeliveryRecord,
    ) -> Result<DeliveryRecord, DbBackendError> {
        self.run(move |conn| {
            conn.transaction::<_, DbBackendError, _>(|conn| {
                let status: PackageStatus = packages::table
                    .find(record.package_id.as_str())
                    .select(packages::status)
                    .first(conn)?;
                if status == PackageStatus::Delivered {
                    return Err(DbBackendError::AlreadyDelivered);
                }

                let saved = diesel::insert_into(delivery_records::table)
                    .values(&record)
                    .get_result::<DeliveryRecord>(conn)
                    .map_err(|e| match DbBackendError::from(e) {
                        DbBackendError::AlreadyExist => DbBackendError::AlreadyDelivered,
                        other => other,
                    })?;

                diesel::update(packages::table.find(record.package_id.as_str()))
                    .set(packages::status.eq(PackageStatus::Delivered))
                    .execute(conn)?;

                Ok(saved)
            })
        })
        .await
    }
}

#[cfg(test)]
#[cfg(not(tarpaulin_include))]
pub mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use chrono::Utc;
    use diesel::prelude::*;
    use tokio::sync::RwLock;

    use super::{Database, DbBackend, DbBackendError};
    use crate::{
        models::{
            Agent, DeliveryRecord, NewAgent, NewDeliveryRecord, NewPackage, Package,
            PackageStatus,
        },
        schema::{delivery_records, packages},
    };

    #[derive(Debug, Default)]
    struct Tables {
        agents: Vec<Agent>,
        packages: BTreeMap<String, Package>,
        records: Vec<DeliveryRecord>,
    }

    /// An in-memory backend with the same constraints as the real schema
    #[derive(Debug, Default)]
    pub struct MockDb {
        tables: RwLock<Tables>,
    }

    impl MockDb {
        /// An empty database
        pub fn new() -> Self {
            Self::default()
        }

        /// Every delivery record stored so far
        pub async fn delivery_records(&self) -> Vec<DeliveryRecord> {
            self.tables.read().await.records.clone()
        }

        /// Force the status of a package, bypassing the delivery flow
        pub async fn set_status(&self, package_id: &str, status: PackageStatus) {
            if let Some(p) = self.tables.write().await.packages.get_mut(package_id) {
                p.status = status;
            }
        }
    }

    #[async_trait]
    impl DbBackend for MockDb {
        async fn create_agent(&self, agent: NewAgent) -> Result<i32, DbBackendError> {
            let mut tables = self.tables.write().await;
            if tables.agents.iter().any(|a| a.username == agent.username) {
                return Err(DbBackendError::AlreadyExist);
            }
            let id = tables.agents.len() as i32 + 1;
            tables.agents.push(Agent {
                id,
                name: agent.name,
                username: agent.username,
                password_hash: agent.password_hash,
            });
            Ok(id)
        }

        async fn find_agent_by_username(
            &self,
            username: &str,
        ) -> Result<Option<Agent>, DbBackendError> {
            let tables = self.tables.read().await;
            Ok(tables.agents.iter().find(|a| a.username == username).cloned())
        }

        async fn get_agent(&self, id: i32) -> Result<Option<Agent>, DbBackendError> {
            let tables = self.tables.read().await;
            Ok(tables.agents.iter().find(|a| a.id == id).cloned())
        }

        async fn insert_package(&self, package: NewPackage) -> Result<(), DbBackendError> {
            let mut tables = self.tables.write().await;
            if tables.packages.contains_key(&package.id) {
                return Err(DbBackendError::AlreadyExist);
            }
            if let Some(agent_id) = package.agent_id {
                if !tables.agents.iter().any(|a| a.id == agent_id) {
                    return Err(DbBackendError::NotFound);
                }
            }
            tables.packages.insert(
                package.id.clone(),
                Package {
                    id: package.id,
                    destination: package.destination,
                    agent_id: package.agent_id,
                    status: package.status,
                },
            );
            Ok(())
        }

        async fn get_package(&self, id: &str) -> Result<Option<Package>, DbBackendError> {
            Ok(self.tables.read().await.packages.get(id).cloned())
        }

        async fn assigned_packages(
            &self,
            agent_id: i32,
        ) -> Result<Vec<Package>, DbBackendError> {
            let tables = self.tables.read().await;
            Ok(tables
                .packages
                .values()
                .filter(|p| p.agent_id == Some(agent_id) && p.status == PackageStatus::Assigned)
                .cloned()
                .collect())
        }

        async fn assign_package(
            &self,
            package_id: &str,
            agent_id: i32,
        ) -> Result<(), DbBackendError> {
            let mut tables = self.tables.write().await;
            let package = tables
                .packages
                .get_mut(package_id)
                .ok_or(DbBackendError::NotFound)?;
            package.agent_id = Some(agent_id);
            package.status = PackageStatus::Assigned;
            Ok(())
        }

        async fn record_delivery(
            &self,
            record: NewDeliveryRecord,
        ) -> Result<DeliveryRecord, DbBackendError> {
            let mut tables = self.tables.write().await;
            let status = tables
                .packages
                .get(&record.package_id)
                .ok_or(DbBackendError::NotFound)?
                .status;
            if status == PackageStatus::Delivered
                || tables.records.iter().any(|r| r.package_id == record.package_id)
            {
                return Err(DbBackendError::AlreadyDelivered);
            }

            let saved = DeliveryRecord {
                id: tables.records.len() as i32 + 1,
                package_id: record.package_id,
                delivered_at: record.delivered_at,
                latitude_e8: record.latitude_e8,
                longitude_e8: record.longitude_e8,
                photo_url: record.photo_url,
            };
            tables.records.push(saved.clone());
            if let Some(p) = tables.packages.get_mut(&saved.package_id) {
                p.status = PackageStatus::Delivered;
            }
            Ok(saved)
        }
    }

    /// A throwaway sqlite file, removed again when dropped
    pub struct TestDb {
        /// The backend under test
        pub db: Database,
        path: String,
    }

    impl TestDb {
        /// Create a migrated database file named after `name`
        pub async fn new(name: &str) -> Self {
            let path = format!("./test-db-{}.db", name);
            let _ = std::fs::remove_file(&path);
            let db = Database::new(path.clone()).await.expect("a valid database");
            db.init().await.expect("migrations to apply");
            Self { db, path }
        }

        /// Force the status of a package, bypassing the delivery flow
        pub fn set_status(&self, package_id: &str, status: PackageStatus) {
            let mut conn = self.db.pool.get().unwrap();
            diesel::update(packages::table.find(package_id))
                .set(packages::status.eq(status))
                .execute(&mut conn)
                .unwrap();
        }

        /// Number of delivery records stored for `package_id`
        pub fn delivery_count(&self, package_id: &str) -> i64 {
            let mut conn = self.db.pool.get().unwrap();
            delivery_records::table
                .filter(delivery_records::package_id.eq(package_id))
                .count()
                .get_result(&mut conn)
                .unwrap()
        }
    }

    impl Drop for TestDb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn new_agent(username: &str) -> NewAgent {
        NewAgent {
            name: format!("{} test", username),
            username: username.into(),
            password_hash: "$argon2id$stub".into(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_username_real_db() {
        let test_db = TestDb::new("duplicate-username").await;
        let db = &test_db.db;

        let id = db.create_agent(new_agent("alice")).await.unwrap();
        assert_eq!(id, 1);
        assert!(matches!(
            db.create_agent(new_agent("alice")).await,
            Err(DbBackendError::AlreadyExist)
        ));

        // no second row was written
        assert_eq!(db.create_agent(new_agent("bob")).await.unwrap(), 2);
        let alice = db.find_agent_by_username("alice").await.unwrap().unwrap();
        assert_eq!(alice.id, 1);
        assert!(db.find_agent_by_username("carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_assigned_packages_real_db() {
        let test_db = TestDb::new("assigned-packages").await;
        let db = &test_db.db;
        let alice = db.create_agent(new_agent("alice")).await.unwrap();
        let bob = db.create_agent(new_agent("bob")).await.unwrap();

        for (id, agent) in [("A1", Some(alice)), ("A2", Some(alice)), ("B1", Some(bob)), ("U1", None)] {
            db.insert_package(NewPackage::new(id.into(), format!("{} street", id), agent))
                .await
                .unwrap();
        }
        test_db.set_status("A2", PackageStatus::Failed);

        let pending = db.assigned_packages(alice).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "A1");
        assert_eq!(pending[0].status, PackageStatus::Assigned);

        // re-assigning a failed package puts it back into the active pool
        db.assign_package("A2", alice).await.unwrap();
        assert_eq!(db.assigned_packages(alice).await.unwrap().len(), 2);

        db.assign_package("U1", bob).await.unwrap();
        assert_eq!(db.assigned_packages(bob).await.unwrap().len(), 2);

        assert!(matches!(
            db.assign_package("missing", bob).await,
            Err(DbBackendError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_package_constraints_real_db() {
        let test_db = TestDb::new("package-constraints").await;
        let db = &test_db.db;

        db.insert_package(NewPackage::new("P1".into(), "Main St 1".into(), None))
            .await
            .unwrap();
        assert!(matches!(
            db.insert_package(NewPackage::new("P1".into(), "elsewhere".into(), None))
                .await,
            Err(DbBackendError::AlreadyExist)
        ));

        // foreign keys are enforced on every pooled connection
        assert!(db
            .insert_package(NewPackage::new("P2".into(), "Main St 2".into(), Some(42)))
            .await
            .is_err());
        assert!(db.get_package("P2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_delivery_real_db() {
        let test_db = TestDb::new("record-delivery").await;
        let db = &test_db.db;
        db.insert_package(NewPackage::new("PKG1".into(), "Main St 1".into(), None))
            .await
            .unwrap();

        let record = NewDeliveryRecord::new(
            "PKG1".into(),
            Utc::now().naive_utc(),
            1_012_345_678,
            -2_087_654_321,
            "/uploads/PKG1_evidence.jpg".into(),
        );
        let saved = db.record_delivery(record.clone()).await.unwrap();
        assert_eq!(saved.package_id, "PKG1");
        assert_eq!(saved.latitude_e8, 1_012_345_678);
        assert_eq!(saved.longitude_e8, -2_087_654_321);

        let package = db.get_package("PKG1").await.unwrap().unwrap();
        assert_eq!(package.status, PackageStatus::Delivered);

        assert!(matches!(
            db.record_delivery(record).await,
            Err(DbBackendError::AlreadyDelivered)
        ));

        let missing = NewDeliveryRecord::new(
            "nope".into(),
            Utc::now().naive_utc(),
            0,
            0,
            "/uploads/nope.jpg".into(),
        );
        assert!(matches!(
            db.record_delivery(missing).await,
            Err(DbBackendError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delivery_rolls_back_on_failure_real_db() {
        let test_db = TestDb::new("delivery-rollback").await;
        let db = &test_db.db;
        db.insert_package(NewPackage::new("PKG1".into(), "Main St 1".into(), None))
            .await
            .unwrap();
        db.insert_package(NewPackage::new("PKG2".into(), "Main St 2".into(), None))
            .await
            .unwrap();

        let at = Utc::now().naive_utc();
        db.record_delivery(NewDeliveryRecord::new("PKG1".into(), at, 0, 0, "/a".into()))
            .await
            .unwrap();

        // a stale record for PKG1 must not be accepted under a reset status either
        test_db.set_status("PKG1", PackageStatus::Assigned);
        assert!(matches!(
            db.record_delivery(NewDeliveryRecord::new("PKG1".into(), at, 0, 0, "/b".into()))
                .await,
            Err(DbBackendError::AlreadyDelivered)
        ));
        let package = db.get_package("PKG1").await.unwrap().unwrap();
        assert_eq!(package.status, PackageStatus::Assigned);
    }

    #[tokio::test]
    async fn test_reassigned_delivered_package_stays_pending_real_db() {
        let test_db = TestDb::new("reassign-delivered").await;
        let db = &test_db.db;
        let alice = db.create_agent(new_agent("alice")).await.unwrap();
        db.insert_package(NewPackage::new("PKG1".into(), "Main St 1".into(), Some(alice)))
            .await
            .unwrap();

        let at = Utc::now().naive_utc();
        db.record_delivery(NewDeliveryRecord::new("PKG1".into(), at, 0, 0, "/a".into()))
            .await
            .unwrap();
        assert!(db.assigned_packages(alice).await.unwrap().is_empty());

        // assign_package itself does not look at the status
        db.assign_package("PKG1", alice).await.unwrap();
        let pending = db.assigned_packages(alice).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, PackageStatus::Assigned);

        // but its existing record blocks any further delivery
        assert!(matches!(
            db.record_delivery(NewDeliveryRecord::new("PKG1".into(), at, 0, 0, "/b".into()))
                .await,
            Err(DbBackendError::AlreadyDelivered)
        ));
        assert_eq!(test_db.delivery_count("PKG1"), 1);
        let package = db.get_package("PKG1").await.unwrap().unwrap();
        assert_eq!(package.status, PackageStatus::Assigned);
    }
}
