use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use courseware_core::CourseKey;

use crate::to_rfc3339;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserProfile {
    pub user_id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
}

/// Active or historical enrollment of a learner in a course run.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Enrollment {
    pub mode: String,
    pub is_active: bool,
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user {0} not found")]
    NotFound(i64),
    #[error("user {0} has no profile")]
    ProfileNotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Accounts, profiles and preferences.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, user_id: i64) -> Result<User, UserError> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, email, is_active FROM auth_users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(UserError::NotFound(user_id))
    }

    /// Loads the profile; a missing profile is an error, not a blank name.
    pub async fn profile(&self, user_id: i64) -> Result<UserProfile, UserError> {
        sqlx::query_as::<_, UserProfile>("SELECT user_id, name FROM user_profiles WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::ProfileNotFound(user_id))
    }

    pub async fn preference(&self, user_id: i64, key: &str) -> Result<Option<String>, UserError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM user_preferences WHERE user_id = ? AND key = ?")
                .bind(user_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn insert_user(&self, user: NewUser<'_>) -> Result<User, UserError> {
        let id = sqlx::query("INSERT INTO auth_users (username, email, is_active) VALUES (?, ?, 1)")
            .bind(user.username)
            .bind(user.email)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        self.get(id).await
    }

    pub async fn set_profile(&self, user_id: i64, name: &str) -> Result<(), UserError> {
        sqlx::query(
            "INSERT INTO user_profiles (user_id, name) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET name = excluded.name",
        )
        .bind(user_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_preference(&self, user_id: i64, key: &str, value: &str) -> Result<(), UserError> {
        sqlx::query(
            "INSERT INTO user_preferences (user_id, key, value) VALUES (?, ?, ?) \
             ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct EnrollmentRepository {
    pool: SqlitePool,
}

impl EnrollmentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mode and activity of the learner's enrollment, if they ever enrolled.
    pub async fn mode_for_user(
        &self,
        user_id: i64,
        course_key: &CourseKey,
    ) -> Result<Option<Enrollment>, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>(
            "SELECT mode, is_active FROM course_enrollments WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id)
        .bind(course_key.without_version().to_string())
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn enroll(
        &self,
        user_id: i64,
        course_key: &CourseKey,
        mode: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO course_enrollments (user_id, course_id, mode, is_active, created_at) \
             VALUES (?, ?, ?, 1, ?) \
             ON CONFLICT(user_id, course_id) DO UPDATE SET mode = excluded.mode, is_active = 1",
        )
        .bind(user_id)
        .bind(course_key.without_version().to_string())
        .bind(mode)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn unenroll(&self, user_id: i64, course_key: &CourseKey) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE course_enrollments SET is_active = 0 WHERE user_id = ? AND course_id = ?")
            .bind(user_id)
            .bind(course_key.without_version().to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Persisted course grades.
#[derive(Clone)]
pub struct GradeRepository {
    pool: SqlitePool,
}

impl GradeRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Grade fraction in `[0, 1]`; a learner with no grade reads as `0.0`.
    pub async fn read_percent(&self, user_id: i64, course_key: &CourseKey) -> Result<f64, sqlx::Error> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT percent FROM course_grades WHERE user_id = ? AND course_id = ?")
                .bind(user_id)
                .bind(course_key.without_version().to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(percent,)| percent).unwrap_or(0.0))
    }

    pub async fn upsert(
        &self,
        user_id: i64,
        course_key: &CourseKey,
        percent: f64,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO course_grades (user_id, course_id, percent, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id, course_id) DO UPDATE SET percent = excluded.percent, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(course_key.without_version().to_string())
        .bind(percent)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
