use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use courseware_core::CourseKey;

use crate::certificates::{CertificateService, GenerationError};
use crate::outline_sync::{OutlineSync, OutlineSyncError};

/// Work deferred out of the request path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    UpdateCourseOutline {
        course_key: CourseKey,
    },
    GenerateCertificate {
        student: i64,
        course_key: CourseKey,
        allowlist_certificate: bool,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateCourseOutline { .. } => "update_course_outline",
            Self::GenerateCertificate { .. } => "generate_certificate",
        }
    }
}

/// Producer side of the in-process task queue.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Hands `task` to the worker once `countdown` has elapsed.
    ///
    /// A zero countdown enqueues immediately; otherwise the delay runs on a
    /// detached timer and the call returns at once.
    pub fn apply_async(&self, task: Task, countdown: Duration) -> Result<(), TaskQueueError> {
        if self.sender.is_closed() {
            return Err(TaskQueueError::Closed);
        }
        info!(stage = "tasks", task = task.name(), countdown_ms = countdown.as_millis() as u64, "task submitted");

        if countdown.is_zero() {
            return self.sender.send(task).map_err(|_| TaskQueueError::Closed);
        }

        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(countdown).await;
            let name = task.name();
            if sender.send(task).is_err() {
                warn!(stage = "tasks", task = name, "task queue closed before countdown elapsed");
            }
        });
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("task queue is closed")]
    Closed,
}

/// Consumer that executes queued tasks one at a time.
pub struct TaskWorker {
    receiver: mpsc::UnboundedReceiver<Task>,
    outline_sync: OutlineSync,
    certificates: CertificateService,
}

impl TaskWorker {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Task>,
        outline_sync: OutlineSync,
        certificates: CertificateService,
    ) -> Self {
        Self {
            receiver,
            outline_sync,
            certificates,
        }
    }

    /// Runs the worker loop in the background until every queue handle is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(mut self) {
        while let Some(task) = self.receiver.recv().await {
            // failures are logged and counted inside run_task
            let _ = self.run_task(task).await;
        }
        info!(stage = "tasks", "task queue drained, worker stopping");
    }

    /// Executes a single task, recording its outcome.
    pub async fn run_task(&self, task: Task) -> Result<(), TaskError> {
        let name = task.name();
        let started = Instant::now();
        let result = self.dispatch(task).await;
        histogram!("task_duration_seconds", "task" => name).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(()) => {
                counter!("tasks_total", "task" => name, "result" => "ok").increment(1);
                info!(stage = "tasks", task = name, "task completed");
            }
            Err(err) => {
                counter!("tasks_total", "task" => name, "result" => "error").increment(1);
                error!(stage = "tasks", task = name, error = %err, "task failed");
            }
        }
        result
    }

    async fn dispatch(&self, task: Task) -> Result<(), TaskError> {
        match task {
            Task::UpdateCourseOutline { course_key } => {
                self.outline_sync
                    .update_outline_from_authoring(&course_key)
                    .await?;
            }
            Task::GenerateCertificate {
                student,
                course_key,
                allowlist_certificate: true,
            } => {
                self.certificates
                    .generate_allowlist_certificate(student, &course_key)
                    .await?;
            }
            Task::GenerateCertificate {
                student,
                course_key,
                allowlist_certificate: false,
            } => {
                return Err(TaskError::UnsupportedGeneration {
                    student,
                    course_key: course_key.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Outline(#[from] OutlineSyncError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("only allowlist certificates are generated here (student {student}, course {course_key})")]
    UnsupportedGeneration { student: i64, course_key: String },
}
