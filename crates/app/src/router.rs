use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio_stream::Stream;

use courseware_storage::Database;
use courseware_util::{AppConfig, SiteConfig};

use crate::certificates::{self, CertificateGate, CertificateService};
use crate::emails::{self, EnrollmentMailer, MessageTransport};
use crate::outline_sync::{self, CourseTreeSource, OutlineSync};
use crate::problem::internal_error;
use crate::tasks::TaskQueue;
use crate::telemetry;
use crate::tracker::{tracker_keep_alive, tracker_stream, Tracker};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Service settings taken from the runtime configuration.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub auto_certificate_generation: bool,
    pub certificate_delay: Duration,
    pub site: SiteConfig,
}

impl From<&AppConfig> for ServiceSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            auto_certificate_generation: config.auto_certificate_generation,
            certificate_delay: config.certificate_delay,
            site: config.site.clone(),
        }
    }
}

/// Outbound services the application depends on.
#[derive(Clone)]
pub struct Integrations {
    pub courses: Arc<dyn CourseTreeSource>,
    pub transport: Arc<dyn MessageTransport>,
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tracker: Tracker,
    storage: Database,
    tasks: TaskQueue,
    outline_sync: OutlineSync,
    certificates: CertificateService,
    mailer: EnrollmentMailer,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        tracker: Tracker,
        storage: Database,
        tasks: TaskQueue,
        integrations: Integrations,
        settings: ServiceSettings,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let outline_sync = OutlineSync::new(
            integrations.courses.clone(),
            storage.clone(),
            clock.clone(),
        );
        let certificates = CertificateService::new(
            CertificateGate::new(storage.clone(), settings.auto_certificate_generation),
            storage.clone(),
            integrations.courses,
            tasks.clone(),
            tracker.clone(),
            settings.certificate_delay,
            clock,
        );
        let mailer = EnrollmentMailer::new(storage.clone(), integrations.transport, settings.site);
        Self {
            metrics,
            tracker,
            storage,
            tasks,
            outline_sync,
            certificates,
            mailer,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn outline_sync(&self) -> &OutlineSync {
        &self.outline_sync
    }

    pub fn certificates(&self) -> &CertificateService {
        &self.certificates
    }

    pub fn mailer(&self) -> &EnrollmentMailer {
        &self.mailer
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/events", get(debug_events))
        .route(
            "/studio/courses/:course_key/published",
            post(outline_sync::course_published),
        )
        .route(
            "/api/courses/:course_key/outline",
            get(outline_sync::get_outline),
        )
        .route(
            "/api/certificates/allowlist/eligibility",
            get(certificates::allowlist_eligibility),
        )
        .route(
            "/api/certificates/allowlist/generate",
            post(certificates::generate_allowlist),
        )
        .route(
            "/api/enrollments/proctoring-requirements-email",
            post(emails::proctoring_requirements_email),
        )
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|_| internal_error("failed to render metrics").into_response())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    prefix: Option<String>,
}

async fn debug_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>> {
    let prefix = query.prefix.filter(|prefix| !prefix.is_empty());
    Sse::new(tracker_stream(state.tracker().clone(), prefix)).keep_alive(tracker_keep_alive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{self, Duration};
    use tower::ServiceExt;

    use courseware_core::CourseKey;
    use courseware_storage::{NewUser, OverrideChoice};

    use crate::certificates::USE_ALLOWLIST_FLAG;
    use crate::emails::test_support::RecordingTransport;
    use crate::outline_sync::test_support::{authoring_course, FakeCourseTree};
    use crate::tasks::{Task, TaskWorker};
    use crate::tracker::TrackerEvent;

    const COURSE: &str = "course-v1:edX+DemoX+Demo_Course";

    fn course_key() -> CourseKey {
        COURSE.parse().unwrap()
    }

    struct TestApp {
        state: AppState,
        receiver: UnboundedReceiver<Task>,
        transport: Arc<RecordingTransport>,
    }

    async fn setup_app() -> TestApp {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let (tasks, receiver) = TaskQueue::channel();
        let transport = Arc::new(RecordingTransport::default());
        let integrations = Integrations {
            courses: Arc::new(FakeCourseTree::default().with_course(authoring_course(&course_key()))),
            transport: transport.clone(),
        };
        let settings = ServiceSettings {
            auto_certificate_generation: true,
            certificate_delay: Duration::ZERO,
            site: SiteConfig::default(),
        };
        let state = AppState::new(metrics, Tracker::new(), database, tasks, integrations, settings);
        TestApp {
            state,
            receiver,
            transport,
        }
    }

    fn worker(app: &AppState) -> TaskWorker {
        let (_, idle) = TaskQueue::channel();
        TaskWorker::new(idle, app.outline_sync().clone(), app.certificates().clone())
    }

    async fn add_learner(state: &AppState) -> i64 {
        let users = state.storage().users();
        let user = users
            .insert_user(NewUser {
                username: "ada",
                email: "ada@example.org",
            })
            .await
            .expect("user");
        users.set_profile(user.id, "Ada Lovelace").await.unwrap();
        state
            .storage()
            .enrollments()
            .enroll(user.id, &course_key(), "honor", Utc::now())
            .await
            .unwrap();
        user.id
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.expect("handler should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = setup_app().await;
        let (status, _) = send(app_router(app.state), get_request("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = setup_app().await;
        let response = app_router(app.state)
            .oneshot(get_request("/metrics"))
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn publish_signal_queues_outline_update_and_outline_is_served() {
        let mut app = setup_app().await;
        let router = app_router(app.state.clone());

        let (status, _) = send(
            router.clone(),
            get_request(&format!("/api/courses/{COURSE}/outline")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            router.clone(),
            json_request("POST", &format!("/studio/courses/{COURSE}/published"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["queued"], "update_course_outline");

        let task = app.receiver.try_recv().expect("queued task");
        assert_eq!(
            task,
            Task::UpdateCourseOutline {
                course_key: course_key()
            }
        );
        worker(&app.state).run_task(task).await.expect("task runs");

        let (status, body) = send(router, get_request(&format!("/api/courses/{COURSE}/outline"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["course_key"], COURSE);
        assert_eq!(body["sections"][0]["sequences"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_course_key_is_a_problem_document() {
        let app = setup_app().await;
        let response = app_router(app.state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/studio/courses/not-a-key/published")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn eligibility_and_generation_routes() {
        let mut app = setup_app().await;
        let user_id = add_learner(&app.state).await;
        let router = app_router(app.state.clone());
        let eligibility = format!(
            "/api/certificates/allowlist/eligibility?user_id={user_id}&course_key={COURSE}"
        );

        let (status, body) = send(router.clone(), get_request(&eligibility)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["eligible"], false);
        assert_eq!(body["reason"], "allowlist_disabled");

        let flags = app.state.storage().flags();
        flags
            .set_course_override(USE_ALLOWLIST_FLAG, &course_key(), OverrideChoice::On, Utc::now())
            .await
            .unwrap();
        app.state
            .storage()
            .allowlist()
            .upsert(user_id, &course_key(), true, None, Utc::now())
            .await
            .unwrap();

        let (_, body) = send(router.clone(), get_request(&eligibility)).await;
        assert_eq!(body["eligible"], true);
        assert_eq!(body["reason"], "no_certificate");

        let (status, body) = send(
            router.clone(),
            json_request(
                "POST",
                "/api/certificates/allowlist/generate",
                json!({ "user_id": user_id, "course_key": COURSE }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["scheduled"], true);

        let task = app.receiver.try_recv().expect("queued task");
        worker(&app.state).run_task(task).await.expect("task runs");

        let (_, body) = send(router.clone(), get_request(&eligibility)).await;
        assert_eq!(body["eligible"], false);
        assert_eq!(body["reason"], "certificate_downloadable");
        assert_eq!(body["existing_status"], "downloadable");

        let (status, body) = send(
            router,
            json_request(
                "POST",
                "/api/certificates/allowlist/generate",
                json!({ "user_id": user_id, "course_key": COURSE }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheduled"], false);
    }

    #[tokio::test]
    async fn generation_for_unknown_user_is_not_found() {
        let app = setup_app().await;
        let (status, body) = send(
            app_router(app.state),
            json_request(
                "POST",
                "/api/certificates/allowlist/generate",
                json!({ "user_id": 404, "course_key": COURSE }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "user_not_found");
    }

    #[tokio::test]
    async fn proctoring_email_route_reports_delivery() {
        let app = setup_app().await;
        let user_id = add_learner(&app.state).await;
        let router = app_router(app.state.clone());

        let (status, body) = send(
            router.clone(),
            json_request(
                "POST",
                "/api/enrollments/proctoring-requirements-email",
                json!({ "user_id": user_id, "context": { "course_name": "Demo" } }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "sent": true }));
        assert_eq!(app.transport.sent.lock().unwrap().len(), 1);

        let (_, body) = send(
            router,
            json_request(
                "POST",
                "/api/enrollments/proctoring-requirements-email",
                json!({ "user_id": 9999 }),
            ),
        )
        .await;
        assert_eq!(body, json!({ "sent": false }));
    }

    #[tokio::test]
    async fn debug_events_streams_tracker_events() {
        let app = setup_app().await;
        let tracker = app.state.tracker().clone();
        let state = app.state;

        let publish = tokio::spawn(async move {
            time::sleep(Duration::from_millis(25)).await;
            tracker.emit(TrackerEvent {
                ts: Utc::now(),
                name: "edx.certificate.created".into(),
                user_id: Some(1),
                course_id: Some(COURSE.into()),
                data: json!({ "certificate_id": "abc" }),
            });
        });

        let mut response = app_router(state)
            .oneshot(get_request("/_debug/events?prefix=edx.certificate"))
            .await
            .expect("handler should respond");

        let frame = time::timeout(Duration::from_secs(1), response.body_mut().frame())
            .await
            .expect("stream produced chunk")
            .expect("chunk ok")
            .expect("chunk available");

        let data = match frame.into_data() {
            Ok(data) => data,
            Err(_) => panic!("expected data frame"),
        };
        let text = String::from_utf8(data.to_vec()).expect("utf-8");
        assert!(text.contains("event: edx.certificate.created"));
        assert!(text.contains("\"certificate_id\":\"abc\""));

        publish.await.expect("publish task");
    }
}
