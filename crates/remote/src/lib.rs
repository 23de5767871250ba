//! HTTP clients for the services this platform talks to: the authoring
//! modulestore and the transactional mailer.

pub mod mailer;
pub mod modulestore;

pub use mailer::{MailerClient, MailerError};
pub use modulestore::{ModuleStoreClient, ModuleStoreError, PUBLISHED_BRANCH};
