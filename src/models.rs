//! Rows stored in the database, and the types used to insert them

use std::{fmt, str::FromStr};

use chrono::NaiveDateTime;
use diesel::{
    backend::Backend,
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    prelude::*,
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Text,
    sqlite::Sqlite,
};
use serde::{Deserialize, Serialize};

use crate::schema::*;

/// Coordinates are persisted as integers with exactly 8 fractional digits
pub const COORDINATE_SCALE: f64 = 100_000_000.0;

/// Largest magnitude, in degrees, a stored coordinate may have
pub const MAX_COORDINATE_DEGREES: f64 = 180.0;

/// Convert degrees into the fixed-point representation stored in the database.
/// Returns `None` for values that are not finite or lie outside
/// `±MAX_COORDINATE_DEGREES`.
pub fn to_fixed_point(degrees: f64) -> Option<i64> {
    if !degrees.is_finite() || degrees.abs() > MAX_COORDINATE_DEGREES {
        return None;
    }
    Some((degrees * COORDINATE_SCALE).round() as i64)
}

/// Convert a stored fixed-point coordinate back into degrees
pub fn from_fixed_point(value: i64) -> f64 {
    value as f64 / COORDINATE_SCALE
}

/// The delivery state of a package
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsExpression, FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageStatus {
    /// Waiting to be delivered by the responsible agent
    Assigned,
    /// Delivered, with a delivery record as proof
    Delivered,
    /// A delivery attempt failed
    Failed,
}

impl PackageStatus {
    /// The textual form used both in the database and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Assigned => "ASSIGNED",
            PackageStatus::Delivered => "DELIVERED",
            PackageStatus::Failed => "FAILED",
        }
    }
}

impl Default for PackageStatus {
    fn default() -> Self {
        PackageStatus::Assigned
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ASSIGNED" => Ok(PackageStatus::Assigned),
            "DELIVERED" => Ok(PackageStatus::Delivered),
            "FAILED" => Ok(PackageStatus::Failed),
            other => Err(format!("unknown package status `{}`", other)),
        }
    }
}

impl ToSql<Text, Sqlite> for PackageStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for PackageStatus {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let value = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        Ok(value.parse()?)
    }
}

/// A courier who can be assigned packages
#[derive(Debug, Clone, PartialEq, Eq, Queryable)]
pub struct Agent {
    pub id: i32,
    pub name: String,
    pub username: String,
    /// Argon2 PHC string, salt and parameters included
    pub password_hash: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = agents)]
pub struct NewAgent {
    pub name: String,
    pub username: String,
    pub password_hash: String,
}

/// A deliverable item, identified by a caller-chosen tracking code
#[derive(Debug, Clone, PartialEq, Eq, Queryable)]
pub struct Package {
    pub id: String,
    pub destination: String,
    pub agent_id: Option<i32>,
    pub status: PackageStatus,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = packages)]
pub struct NewPackage {
    pub id: String,
    pub destination: String,
    pub agent_id: Option<i32>,
    pub status: PackageStatus,
}

impl NewPackage {
    /// A new package, which always starts out as [`PackageStatus::Assigned`]
    pub fn new(id: String, destination: String, agent_id: Option<i32>) -> Self {
        Self {
            id,
            destination,
            agent_id,
            status: PackageStatus::default(),
        }
    }
}

/// Proof that a package was delivered, at most one per package
#[derive(Debug, Clone, PartialEq, Queryable)]
pub struct DeliveryRecord {
    pub id: i32,
    pub package_id: String,
    pub delivered_at: NaiveDateTime,
    pub latitude_e8: i64,
    pub longitude_e8: i64,
    pub photo_url: String,
}

impl DeliveryRecord {
    pub fn latitude(&self) -> f64 {
        from_fixed_point(self.latitude_e8)
    }

    pub fn longitude(&self) -> f64 {
        from_fixed_point(self.longitude_e8)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = delivery_records)]
pub struct NewDeliveryRecord {
    pub package_id: String,
    pub delivered_at: NaiveDateTime,
    pub latitude_e8: i64,
    pub longitude_e8: i64,
    pub photo_url: String,
}

impl NewDeliveryRecord {
    /// Build a record from coordinates already in fixed-point form
    pub fn new(
        package_id: String,
        delivered_at: NaiveDateTime,
        latitude_e8: i64,
        longitude_e8: i64,
        photo_url: String,
    ) -> Self {
        Self {
            package_id,
            delivered_at,
            latitude_e8,
            longitude_e8,
            photo_url,
        }
    }
}
