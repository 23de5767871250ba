use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Descriptor of a templated message kind understood by the delivery service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageType {
    pub app_label: &'static str,
    pub name: &'static str,
    pub options: Map<String, Value>,
}

impl MessageType {
    /// Proctoring requirements sent after enrolling in a course with proctored exams.
    pub fn proctoring_requirements() -> Self {
        let mut options = Map::new();
        options.insert("transactional".to_string(), Value::Bool(true));
        Self {
            app_label: "enrollments",
            name: "proctoringrequirements",
            options,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.options
            .get("transactional")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Starts a message of this type carrying `context`.
    pub fn with_context(self, context: TemplateContext) -> UnpersonalizedMessage {
        UnpersonalizedMessage {
            message_type: self,
            context,
        }
    }
}

/// Site identity used to render the shared parts of every template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteContext<'a> {
    pub domain: &'a str,
    pub name: &'a str,
    pub platform_name: &'a str,
    pub contact_email: &'a str,
}

/// Template variables as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateContext(Map<String, Value>);

impl TemplateContext {
    /// Variables shared by every message rendered for `site`.
    pub fn base(site: &SiteContext<'_>) -> Self {
        let root = format!("https://{}", site.domain);
        let value = json!({
            "site_name": site.name,
            "platform_name": site.platform_name,
            "contact_email": site.contact_email,
            "lms_root_url": root,
            "dashboard_url": format!("{root}/dashboard"),
            "contact_mailing_address": "",
            "social_media_urls": {},
            "mobile_store_urls": {},
        });
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    /// Merges caller variables over the current ones; caller keys win.
    pub fn merge(mut self, overrides: Map<String, Value>) -> Self {
        self.0.extend(overrides);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub username: String,
    pub email: String,
}

/// Message with its template context but no recipient yet.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpersonalizedMessage {
    message_type: MessageType,
    context: TemplateContext,
}

impl UnpersonalizedMessage {
    /// Addresses the message to one recipient.
    pub fn personalize(
        self,
        recipient: Recipient,
        language: Option<String>,
        user_context: Map<String, Value>,
    ) -> Message {
        Message {
            uuid: Uuid::new_v4(),
            app_label: self.message_type.app_label.to_string(),
            name: self.message_type.name.to_string(),
            options: self.message_type.options,
            context: self.context,
            recipient,
            language,
            user_context,
        }
    }
}

/// Fully personalized message ready to hand to the delivery service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub uuid: Uuid,
    pub app_label: String,
    pub name: String,
    pub options: Map<String, Value>,
    pub context: TemplateContext,
    pub recipient: Recipient,
    pub language: Option<String>,
    pub user_context: Map<String, Value>,
}
