use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use courseware_core::messages::Message;

/// Client for the transactional message delivery service.
#[derive(Clone)]
pub struct MailerClient {
    http: Client,
    base_url: Url,
}

impl MailerClient {
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    /// Hands a personalized message to the delivery service.
    pub async fn send(&self, message: &Message) -> Result<(), MailerError> {
        let url = self.base_url.join("messages")?;
        let response = self.http.post(url).json(message).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unavailable>"));
            return Err(MailerError::Status { status, body });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use courseware_core::messages::{MessageType, Recipient, SiteContext, TemplateContext};
    use httpmock::prelude::*;
    use serde_json::{json, Map};

    fn message() -> Message {
        let site = SiteContext {
            domain: "courses.example.org",
            name: "Example",
            platform_name: "Example Learning",
            contact_email: "help@example.org",
        };
        MessageType::proctoring_requirements()
            .with_context(TemplateContext::base(&site))
            .personalize(
                Recipient {
                    username: "ada".into(),
                    email: "ada@example.org".into(),
                },
                Some("en".into()),
                Map::new(),
            )
    }

    fn client(server: &MockServer) -> MailerClient {
        let base = Url::parse(&server.url("/api/")).expect("url");
        MailerClient::new(base, Client::builder().build().expect("client"))
    }

    #[tokio::test]
    async fn send_posts_message_payload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/messages")
                    .json_body_partial(
                        json!({
                            "app_label": "enrollments",
                            "name": "proctoringrequirements",
                            "recipient": { "username": "ada", "email": "ada@example.org" },
                            "language": "en"
                        })
                        .to_string(),
                    );
                then.status(202);
            })
            .await;

        client(&server).send(&message()).await.expect("send");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_message_surfaces_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/messages");
                then.status(422).body("bad recipient");
            })
            .await;

        let err = client(&server).send(&message()).await.expect_err("should error");
        match err {
            MailerError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(body, "bad recipient");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
