use crate::config::{SmtpConfig, SmtpSecurity};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, AsyncSmtpTransportBuilder, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info, warn};

use super::DeliveryError;

/// Rendered email body, either a stored template or inline content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmailContent {
    Template {
        template_id: String,
        variables: serde_json::Value,
    },
    Inline {
        subject: String,
        html_body: String,
        text_body: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailTemplate {
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

impl EmailTemplate {
    /// Replace `{{name}}` placeholders with the given variables
    pub fn render(&self, variables: &serde_json::Value) -> EmailTemplate {
        let render = |s: &str| crate::automations::templates::render_str(s, variables);
        EmailTemplate {
            subject: render(&self.subject),
            html_body: render(&self.html_body),
            text_body: self.text_body.as_deref().map(render),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Send one message. `idempotency_key` is stable across retries of the same step visit.
    async fn send(
        &self,
        to: &str,
        content: &EmailContent,
        idempotency_key: &str,
    ) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct SmtpEmailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    pool: PgPool,
    from_email: String,
    from_name: String,
    domain: String,
}

impl SmtpEmailTransport {
    pub fn new(smtp_config: &SmtpConfig, pool: PgPool) -> Result<Self, lettre::transport::smtp::Error> {
        let creds = Credentials::new(
            smtp_config.username.clone(),
            smtp_config.password.clone(),
        );

        let transport = Self::builder(smtp_config)?
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        let domain = smtp_config
            .from_email
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_else(|| "localhost".to_string());

        Ok(SmtpEmailTransport {
            transport,
            pool,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
            domain,
        })
    }

    fn builder(smtp_config: &SmtpConfig) -> Result<AsyncSmtpTransportBuilder, lettre::transport::smtp::Error> {
        match smtp_config.security() {
            SmtpSecurity::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host),
            SmtpSecurity::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp_config.host),
            SmtpSecurity::Plain => {
                warn!("SMTP TLS is disabled; credentials for {} travel in plaintext", smtp_config.host);
                Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host))
            }
        }
    }

    async fn load_template(&self, template_id: &str) -> Result<EmailTemplate, DeliveryError> {
        let template = sqlx::query_as::<_, EmailTemplate>(
            "SELECT subject, html_body, text_body FROM email_templates WHERE id = $1",
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DeliveryError::Transient(format!("template lookup failed: {}", e)))?;

        template.ok_or_else(|| DeliveryError::Permanent(format!("unknown email template '{}'", template_id)))
    }

    fn build_message(
        &self,
        to: &str,
        template: &EmailTemplate,
        idempotency_key: &str,
    ) -> Result<Message, DeliveryError> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| DeliveryError::Permanent(format!("invalid sender: {}", e)))?;
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| DeliveryError::Permanent(format!("invalid recipient '{}': {}", to, e)))?;

        // Retries of one visit reuse the Message-ID
        let message_builder = Message::builder()
            .from(from)
            .to(to)
            .message_id(Some(format!("<{}@{}>", idempotency_key.replace(':', "."), self.domain)))
            .subject(template.subject.clone());

        let message = match &template.text_body {
            Some(text) => message_builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(template.html_body.clone()),
                    ),
            ),
            None => message_builder
                .header(ContentType::TEXT_HTML)
                .body(template.html_body.clone()),
        };

        message.map_err(|e| DeliveryError::Permanent(format!("failed to build message: {}", e)))
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send(
        &self,
        to: &str,
        content: &EmailContent,
        idempotency_key: &str,
    ) -> Result<(), DeliveryError> {
        let template = match content {
            EmailContent::Template { template_id, variables } => {
                self.load_template(template_id).await?.render(variables)
            }
            EmailContent::Inline { subject, html_body, text_body } => EmailTemplate {
                subject: subject.clone(),
                html_body: html_body.clone(),
                text_body: text_body.clone(),
            },
        };

        let message = self.build_message(to, &template, idempotency_key)?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", to);
                Ok(())
            }
            Err(e) if e.is_permanent() => {
                error!("SMTP rejected email to {}: {}", to, e);
                Err(DeliveryError::Permanent(e.to_string()))
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to, e);
                Err(DeliveryError::Transient(e.to_string()))
            }
        }
    }
}
