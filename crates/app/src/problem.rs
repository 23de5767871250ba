use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use courseware_core::{CourseKey, KeyError};

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

/// `application/problem+json` error body.
#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

pub fn internal_error(detail: &str) -> ProblemResponse {
    ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
}

/// Parses a course key taken from a path or query, answering `400` when invalid.
pub fn parse_course_key(raw: &str) -> Result<CourseKey, ProblemResponse> {
    raw.parse().map_err(|err: KeyError| {
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_course_key", err.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_course_key_is_bad_request() {
        let problem = parse_course_key("DemoX").unwrap_err();
        assert_eq!(problem.status(), StatusCode::BAD_REQUEST);

        let response = problem.into_response();
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "application/problem+json"
        );
    }

    #[test]
    fn valid_course_key_parses() {
        let key = parse_course_key("course-v1:edX+DemoX+Demo_Course").expect("valid key");
        assert_eq!(key.org(), "edX");
    }
}
