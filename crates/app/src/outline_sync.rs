//! Keeps the read-optimized outline store in step with published course content.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, instrument, Span};

use courseware_core::authoring::AuthoringCourse;
use courseware_core::outline::{CourseOutline, OutlineError};
use courseware_core::projector::OutlineProjector;
use courseware_core::CourseKey;
use courseware_remote::{ModuleStoreClient, ModuleStoreError};
use courseware_storage::{Database, OutlineStoreError};

use crate::problem::{internal_error, parse_course_key, ProblemResponse};
use crate::router::AppState;
use crate::tasks::Task;

/// Course, sections and sequences.
pub const OUTLINE_DEPTH: u32 = 2;

/// Read access to the published branch of the authoring store.
#[async_trait]
pub trait CourseTreeSource: Send + Sync {
    async fn published_course(
        &self,
        course_key: &CourseKey,
        depth: u32,
    ) -> Result<AuthoringCourse, ModuleStoreError>;
}

#[async_trait]
impl CourseTreeSource for ModuleStoreClient {
    async fn published_course(
        &self,
        course_key: &CourseKey,
        depth: u32,
    ) -> Result<AuthoringCourse, ModuleStoreError> {
        self.get_course(course_key, depth).await
    }
}

#[derive(Clone)]
pub struct OutlineSync {
    source: Arc<dyn CourseTreeSource>,
    storage: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl OutlineSync {
    pub fn new(
        source: Arc<dyn CourseTreeSource>,
        storage: Database,
        clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            source,
            storage,
            clock,
        }
    }

    /// Reads the published course tree and projects it into an outline.
    pub async fn get_outline_from_authoring(
        &self,
        course_key: &CourseKey,
    ) -> Result<CourseOutline, OutlineSyncError> {
        let course = self
            .source
            .published_course(course_key, OUTLINE_DEPTH)
            .await?;
        Ok(OutlineProjector::project(course_key, &course)?)
    }

    /// Replaces the stored outline with the current published content.
    #[instrument(
        name = "update_outline_from_authoring",
        skip_all,
        fields(course_id = %course_key, num_sequences = tracing::field::Empty)
    )]
    pub async fn update_outline_from_authoring(
        &self,
        course_key: &CourseKey,
    ) -> Result<usize, OutlineSyncError> {
        let outline = match self.get_outline_from_authoring(course_key).await {
            Ok(outline) => outline,
            Err(err) => {
                counter!("outline_updates_total", "result" => "error").increment(1);
                return Err(err);
            }
        };
        let num_sequences = outline.num_sequences();
        Span::current().record("num_sequences", num_sequences);

        if let Err(err) = self
            .storage
            .outlines()
            .replace(&outline, (self.clock)())
            .await
        {
            counter!("outline_updates_total", "result" => "error").increment(1);
            return Err(err.into());
        }

        counter!("outline_updates_total", "result" => "ok").increment(1);
        info!(
            stage = "outline",
            course_id = %outline.course_key,
            sections = outline.sections.len(),
            num_sequences,
            "course outline replaced"
        );
        Ok(num_sequences)
    }

    pub async fn stored_outline(
        &self,
        course_key: &CourseKey,
    ) -> Result<CourseOutline, OutlineStoreError> {
        self.storage.outlines().get(course_key).await
    }
}

#[derive(Debug, Error)]
pub enum OutlineSyncError {
    #[error("failed to read published course: {0}")]
    Source(#[from] ModuleStoreError),
    #[error("published course does not form a valid outline: {0}")]
    Projection(#[from] OutlineError),
    #[error("failed to store outline: {0}")]
    Store(#[from] OutlineStoreError),
}

/// Publish signal from the authoring side; queues an outline refresh.
pub async fn course_published(
    State(state): State<AppState>,
    Path(course_key): Path<String>,
) -> Result<(StatusCode, Json<Value>), ProblemResponse> {
    let course_key = parse_course_key(&course_key)?;
    info!(stage = "outline", course_id = %course_key, "course published, queueing outline update");

    state
        .tasks()
        .apply_async(
            Task::UpdateCourseOutline {
                course_key: course_key.clone(),
            },
            Duration::ZERO,
        )
        .map_err(|err| {
            error!(stage = "outline", course_id = %course_key, error = %err, "failed to queue outline update");
            internal_error("failed to queue outline update")
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "queued": "update_course_outline", "course_key": course_key })),
    ))
}

pub async fn get_outline(
    State(state): State<AppState>,
    Path(course_key): Path<String>,
) -> Result<Json<CourseOutline>, ProblemResponse> {
    let course_key = parse_course_key(&course_key)?;
    match state.outline_sync().stored_outline(&course_key).await {
        Ok(outline) => Ok(Json(outline)),
        Err(OutlineStoreError::NotFound) => Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "outline_not_found",
            format!("no outline stored for {course_key}"),
        )),
        Err(err) => {
            error!(stage = "outline", course_id = %course_key, error = %err, "failed to load outline");
            Err(internal_error("failed to load course outline"))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory authoring store keyed by the bare course key.
    #[derive(Default)]
    pub struct FakeCourseTree {
        courses: Mutex<HashMap<String, AuthoringCourse>>,
        pub reads: Mutex<Vec<(String, u32)>>,
    }

    impl FakeCourseTree {
        pub fn with_course(self, course: AuthoringCourse) -> Self {
            let key = course.location.course_key().without_version().to_string();
            self.courses.lock().unwrap().insert(key, course);
            self
        }
    }

    #[async_trait]
    impl CourseTreeSource for FakeCourseTree {
        async fn published_course(
            &self,
            course_key: &CourseKey,
            depth: u32,
        ) -> Result<AuthoringCourse, ModuleStoreError> {
            let key = course_key.without_version().to_string();
            self.reads.lock().unwrap().push((key.clone(), depth));
            self.courses
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .ok_or(ModuleStoreError::CourseNotFound(key))
        }
    }

    /// Published tree with one section of two sequences, carrying version info.
    pub fn authoring_course(course_key: &CourseKey) -> AuthoringCourse {
        let versioned = course_key.with_version("5fa1c0ffee");
        let block = |block_type: &str, id: &str| versioned.make_usage_key(block_type, id).unwrap();
        serde_json::from_value(json!({
            "location": block("course", "course"),
            "display_name": "Demo Course",
            "subtree_edited_on": "2021-01-22T12:30:00+09:00",
            "course_version": "5fa1c0ffee",
            "self_paced": false,
            "course_visibility": "public_outline",
            "days_early_for_beta": 3.0,
            "children": [
                {
                    "location": block("chapter", "week1"),
                    "display_name": "Week 1",
                    "children": [
                        {
                            "location": block("sequential", "intro"),
                            "display_name": "Introduction"
                        },
                        {
                            "location": block("sequential", "quiz"),
                            "display_name": "Quiz",
                            "hide_after_due": true,
                            "is_timed_exam": true,
                            "is_proctored_enabled": true
                        }
                    ]
                }
            ]
        }))
        .expect("authoring course")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{authoring_course, FakeCourseTree};
    use super::*;

    fn course_key() -> CourseKey {
        "course-v1:TNL+7733+2021-01-22".parse().unwrap()
    }

    async fn database() -> Database {
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn sync(source: FakeCourseTree, db: &Database) -> OutlineSync {
        OutlineSync::new(Arc::new(source), db.clone(), Arc::new(Utc::now))
    }

    #[tokio::test]
    async fn update_stores_projected_outline() {
        let db = database().await;
        let sync = sync(
            FakeCourseTree::default().with_course(authoring_course(&course_key())),
            &db,
        );

        let count = sync
            .update_outline_from_authoring(&course_key())
            .await
            .expect("update");
        assert_eq!(count, 2);

        let stored = sync.stored_outline(&course_key()).await.expect("stored");
        assert_eq!(stored.course_key, course_key());
        assert_eq!(stored.published_version, "5fa1c0ffee");
        assert_eq!(stored.sections[0].title, "Week 1");
        let quiz = &stored.sections[0].sequences[1];
        assert!(quiz.inaccessible_after_due);
        assert!(quiz.exam.is_time_limited);
        assert!(quiz.usage_key.course_key().version().is_none());
    }

    #[tokio::test]
    async fn reads_published_tree_at_outline_depth() {
        let db = database().await;
        let source = Arc::new(FakeCourseTree::default().with_course(authoring_course(&course_key())));
        let sync = OutlineSync::new(source.clone(), db, Arc::new(Utc::now));

        sync.get_outline_from_authoring(&course_key())
            .await
            .expect("outline");
        assert_eq!(
            source.reads.lock().unwrap().as_slice(),
            [(course_key().to_string(), OUTLINE_DEPTH)]
        );
    }

    #[tokio::test]
    async fn empty_course_replaces_previous_outline() {
        let db = database().await;
        let source = FakeCourseTree::default().with_course(authoring_course(&course_key()));
        sync(source, &db)
            .update_outline_from_authoring(&course_key())
            .await
            .expect("first update");

        let mut emptied: AuthoringCourse = authoring_course(&course_key());
        emptied.children.clear();
        let count = sync(FakeCourseTree::default().with_course(emptied), &db)
            .update_outline_from_authoring(&course_key())
            .await
            .expect("second update");
        assert_eq!(count, 0);

        let stored = db.outlines().get(&course_key()).await.expect("stored");
        assert!(stored.sections.is_empty());
        assert_eq!(stored.sequences().count(), 0);
    }

    #[tokio::test]
    async fn missing_course_leaves_store_untouched() {
        let db = database().await;
        let err = sync(FakeCourseTree::default(), &db)
            .update_outline_from_authoring(&course_key())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OutlineSyncError::Source(ModuleStoreError::CourseNotFound(_))
        ));
        assert!(!db.outlines().exists(&course_key()).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_visibility_is_rejected() {
        let db = database().await;
        let mut course = authoring_course(&course_key());
        course.course_visibility = "secret".into();
        let err = sync(FakeCourseTree::default().with_course(course), &db)
            .update_outline_from_authoring(&course_key())
            .await
            .unwrap_err();
        assert!(matches!(err, OutlineSyncError::Projection(_)));
    }
}
