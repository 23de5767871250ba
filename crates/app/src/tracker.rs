use std::time::Duration;

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, info};

use courseware_core::CourseKey;

const CERTIFICATE_EVENT_PREFIX: &str = "edx.certificate";

/// Analytics event as handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerEvent {
    pub ts: DateTime<Utc>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    pub data: Value,
}

impl TrackerEvent {
    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let data = serde_json::to_string(&self)?;
        Ok(Event::default().event(self.name).data(data))
    }
}

/// Fan-out of analytics events to every live subscriber.
#[derive(Clone)]
pub struct Tracker {
    sender: broadcast::Sender<TrackerEvent>,
}

impl Tracker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    pub fn emit(&self, event: TrackerEvent) {
        counter!("tracker_events_total", "name" => event.name.clone()).increment(1);
        info!(
            stage = "tracker",
            name = %event.name,
            user_id = ?event.user_id,
            course_id = ?event.course_id,
            "analytics event emitted"
        );
        if self.sender.send(event).is_err() {
            debug!(stage = "tracker", "no tracker subscribers");
        }
    }

    /// Emits `edx.certificate.{event_name}` for the learner in the course run.
    pub fn emit_certificate_event(
        &self,
        event_name: &str,
        user_id: i64,
        course_key: &CourseKey,
        data: Value,
        now: DateTime<Utc>,
    ) {
        self.emit(TrackerEvent {
            ts: now,
            name: format!("{CERTIFICATE_EVENT_PREFIX}.{event_name}"),
            user_id: Some(user_id),
            course_id: Some(course_key.to_string()),
            data,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.sender.subscribe()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

/// SSE stream of tracker events, optionally limited to names starting with `prefix`.
pub fn tracker_stream(
    tracker: Tracker,
    prefix: Option<String>,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(tracker.subscribe()).filter_map(move |result| match result {
        Ok(event) if matches_prefix(prefix.as_deref(), &event.name) => {
            Some(event.into_sse_event())
        }
        _ => None,
    })
}

fn matches_prefix(prefix: Option<&str>, name: &str) -> bool {
    prefix.map_or(true, |prefix| name.starts_with(prefix))
}

pub fn tracker_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}
