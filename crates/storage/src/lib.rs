mod certificates;
mod flags;
mod learners;
mod outlines;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;

pub use certificates::{
    AllowlistRepository, CertificateRepository, CertificateStoreError, InvalidationRepository,
};
pub use flags::{FeatureFlagRepository, OverrideChoice};
pub use learners::{
    Enrollment, EnrollmentRepository, GradeRepository, NewUser, User, UserError, UserProfile,
    UserRepository,
};
pub use outlines::{OutlineRepository, OutlineStoreError};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the read-optimized outline store.
    pub fn outlines(&self) -> OutlineRepository {
        OutlineRepository::new(self.pool.clone())
    }

    /// Returns a handle for generated certificates.
    pub fn certificates(&self) -> CertificateRepository {
        CertificateRepository::new(self.pool.clone())
    }

    /// Returns a handle for the certificate allowlist.
    pub fn allowlist(&self) -> AllowlistRepository {
        AllowlistRepository::new(self.pool.clone())
    }

    /// Returns a handle for certificate invalidations.
    pub fn invalidations(&self) -> InvalidationRepository {
        InvalidationRepository::new(self.pool.clone())
    }

    /// Returns a handle for switches, flags and per-course flag overrides.
    pub fn flags(&self) -> FeatureFlagRepository {
        FeatureFlagRepository::new(self.pool.clone())
    }

    /// Returns a handle for users, profiles and preferences.
    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    pub fn enrollments(&self) -> EnrollmentRepository {
        EnrollmentRepository::new(self.pool.clone())
    }

    pub fn grades(&self) -> GradeRepository {
        GradeRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Connection settings applied once the pool is open.
const PRAGMAS: &[&str] = &[
    "PRAGMA foreign_keys = ON",
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    for pragma in PRAGMAS {
        // journal_mode answers with a row, so results are fetched and dropped
        sqlx::query(pragma)
            .fetch_all(pool)
            .await
            .map_err(StorageError::Pragma)?;
    }
    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply() {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 14, "expected core tables to be created");
    }

    #[test]
    fn timestamps_roundtrip_through_text() {
        let now = Utc::now();
        let text = to_rfc3339(now);
        let parsed = parse_rfc3339(&text).expect("parse");
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
        assert!(parse_rfc3339("yesterday").is_none());
    }
}
