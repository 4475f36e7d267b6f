use mandi_core::{CoreError, ValidationError};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

/// Maps driver errors onto the engine taxonomy. Unique-key violations
/// become conflicts so duplicate inserts read the same as in memory.
pub(crate) fn storage_error(entity: &'static str, id: impl ToString, err: sqlx::Error) -> CoreError {
    let id = id.to_string();
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return CoreError::conflict(entity, id);
        }
    }
    error!("Database error on {} {}: {}", entity, id, err);
    CoreError::Storage(err.to_string())
}

/// Reads a status column back into its enum.
pub(crate) fn parse_column<T>(value: &str) -> Result<T, CoreError>
where
    T: std::str::FromStr<Err = ValidationError>,
{
    value.parse::<T>().map_err(|e| CoreError::Storage(e.to_string()))
}

pub(crate) fn to_quantity(value: i32, column: &str) -> Result<u32, CoreError> {
    u32::try_from(value).map_err(|_| CoreError::Storage(format!("negative {}: {}", column, value)))
}

/// Quantities above the INTEGER column range are refused rather than clamped.
pub(crate) fn from_quantity(value: u32, column: &str) -> Result<i32, sqlx::Error> {
    i32::try_from(value).map_err(|_| sqlx::Error::Encode(format!("{} out of range: {}", column, value).into()))
}
