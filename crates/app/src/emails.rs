//! Transactional emails sent around course enrollment.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use axum::{extract::State, Json};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{error, info};

use courseware_core::messages::{Message, MessageType, Recipient, SiteContext, TemplateContext};
use courseware_remote::{MailerClient, MailerError};
use courseware_storage::{Database, UserError};
use courseware_util::SiteConfig;

use crate::router::AppState;

/// User preference holding the learner's interface language.
pub const LANGUAGE_KEY: &str = "pref-lang";

/// Delivery seam for personalized messages.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), MailerError>;
}

#[async_trait]
impl MessageTransport for MailerClient {
    async fn send(&self, message: &Message) -> Result<(), MailerError> {
        MailerClient::send(self, message).await
    }
}

/// Site and user a unit of background work acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub site_domain: String,
    pub user_id: i64,
    pub username: String,
}

tokio::task_local! {
    static CURRENT_REQUEST: RequestContext;
}

/// Runs `work` as if it were serving a request from `context`.
pub async fn emulate_http_request<F>(context: RequestContext, work: F) -> F::Output
where
    F: Future,
{
    CURRENT_REQUEST.scope(context, work).await
}

/// The emulated request, when called inside [`emulate_http_request`].
pub fn current_request() -> Option<RequestContext> {
    CURRENT_REQUEST.try_with(Clone::clone).ok()
}

#[derive(Clone)]
pub struct EnrollmentMailer {
    storage: Database,
    transport: Arc<dyn MessageTransport>,
    site: SiteConfig,
}

impl EnrollmentMailer {
    pub fn new(storage: Database, transport: Arc<dyn MessageTransport>, site: SiteConfig) -> Self {
        Self {
            storage,
            transport,
            site,
        }
    }

    /// Sends the proctoring requirements email for a course enrollment.
    ///
    /// Never fails: problems are logged and reported as `false`.
    pub async fn send_proctoring_requirements_email(
        &self,
        user_id: i64,
        context: Map<String, Value>,
    ) -> bool {
        let message_type = MessageType::proctoring_requirements();
        match self.send(message_type.clone(), user_id, context).await {
            Ok(username) => {
                counter!("emails_total", "message" => message_type.name, "result" => "sent").increment(1);
                info!(stage = "email", user_id, username = %username, "proctoring requirements email sent");
                true
            }
            Err(err) => {
                counter!("emails_total", "message" => message_type.name, "result" => "error").increment(1);
                error!(stage = "email", user_id, error = %err, "could not send proctoring requirements email");
                false
            }
        }
    }

    async fn send(
        &self,
        message_type: MessageType,
        user_id: i64,
        context: Map<String, Value>,
    ) -> Result<String, EmailError> {
        let site = SiteContext {
            domain: &self.site.domain,
            name: &self.site.name,
            platform_name: &self.site.platform_name,
            contact_email: &self.site.contact_email,
        };
        let message_context = TemplateContext::base(&site).merge(context);

        let users = self.storage.users();
        let user = users.get(user_id).await?;
        let request = RequestContext {
            site_domain: self.site.domain.clone(),
            user_id: user.id,
            username: user.username.clone(),
        };

        emulate_http_request(request, async {
            let language = users.preference(user.id, LANGUAGE_KEY).await?;
            let profile = users.profile(user.id).await?;
            let mut user_context = Map::new();
            user_context.insert("full_name".to_string(), json!(profile.name));

            let message = message_type.with_context(message_context).personalize(
                Recipient {
                    username: user.username.clone(),
                    email: user.email.clone(),
                },
                language,
                user_context,
            );
            self.transport.send(&message).await?;
            Ok::<_, EmailError>(user.username.clone())
        })
        .await
    }
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error(transparent)]
    User(#[from] UserError),
    #[error("delivery failed: {0}")]
    Delivery(#[from] MailerError),
}

#[derive(Debug, Deserialize)]
pub struct ProctoringEmailRequest {
    user_id: i64,
    #[serde(default)]
    context: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailResponse {
    pub sent: bool,
}

pub async fn proctoring_requirements_email(
    State(state): State<AppState>,
    Json(body): Json<ProctoringEmailRequest>,
) -> Json<EmailResponse> {
    let sent = state
        .mailer()
        .send_proctoring_requirements_email(body.user_id, body.context)
        .await;
    Json(EmailResponse { sent })
}
