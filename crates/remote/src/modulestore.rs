use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use courseware_core::authoring::AuthoringCourse;
use courseware_core::CourseKey;

/// Branch name selecting only published content.
pub const PUBLISHED_BRANCH: &str = "published-only";

/// Client for the authoring modulestore's read API.
#[derive(Clone)]
pub struct ModuleStoreClient {
    http: Client,
    base_url: Url,
}

impl ModuleStoreClient {
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    /// Reads the published course tree down to `depth` levels below the root.
    pub async fn get_course(
        &self,
        course_key: &CourseKey,
        depth: u32,
    ) -> Result<AuthoringCourse, ModuleStoreError> {
        let mut url = self.base_url.join(&format!("courses/{course_key}"))?;
        url.query_pairs_mut()
            .append_pair("depth", &depth.to_string())
            .append_pair("branch", PUBLISHED_BRANCH);

        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ModuleStoreError::CourseNotFound(course_key.to_string()));
        }
        parse_json(response).await
    }
}

/// Errors produced by the modulestore client.
#[derive(Debug, Error)]
pub enum ModuleStoreError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("course {0} not found in the published branch")]
    CourseNotFound(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, ModuleStoreError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(ModuleStoreError::Status { status, body });
    }

    Ok(response.json().await?)
}
