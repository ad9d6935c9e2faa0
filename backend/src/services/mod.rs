// Collaborator adapters - contact store, email transport and webhook client

pub mod contacts;
pub mod email;
pub mod webhook;

pub use contacts::{ContactSnapshot, ContactStore, ContactStoreError, PgContactStore};
pub use email::{EmailContent, EmailTemplate, EmailTransport, SmtpEmailTransport};
pub use webhook::{HttpWebhookClient, WebhookClient, WebhookRequest, WebhookSigner};

/// Failure of an outbound side effect (email or webhook delivery)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    /// Network error, timeout or a server-side failure; worth retrying
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Bad address, malformed request or rejected content; retrying cannot help
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}
