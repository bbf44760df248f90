//! Contact form submissions
//!
//! Messages are stored first, then handed to the notifier in the background.
//! Delivery is best effort; a successful notification is stamped on the row.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{now_millis, ContactMessage, Database};
use crate::error::{ApiError, ApiResult};

const MAX_NAME_LEN: usize = 100;
const MAX_EMAIL_LEN: usize = 254;
const MAX_MESSAGE_LEN: usize = 5000;

#[derive(Debug, Clone, Deserialize)]
pub struct ContactForm {
    pub name: String,
    pub email: String,
    pub message: String,
}

impl ContactForm {
    /// Trimmed copy, or the first rule it breaks
    pub fn validate(&self) -> ApiResult<ContactForm> {
        let name = self.name.trim();
        let email = self.email.trim();
        let message = self.message.trim();

        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(ApiError::Validation(format!("name must be 1-{} characters", MAX_NAME_LEN)));
        }
        if email.len() > MAX_EMAIL_LEN || !looks_like_email(email) {
            return Err(ApiError::Validation("email address is invalid".to_string()));
        }
        if message.is_empty() || message.chars().count() > MAX_MESSAGE_LEN {
            return Err(ApiError::Validation(format!("message must be 1-{} characters", MAX_MESSAGE_LEN)));
        }

        Ok(ContactForm {
            name: name.to_string(),
            email: email.to_string(),
            message: message.to_string(),
        })
    }
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

/// Out-of-band delivery of a new message to the site owner
#[async_trait]
pub trait ContactNotifier: Send + Sync {
    async fn notify(&self, message: &ContactMessage) -> anyhow::Result<()>;
}

/// Writes the rendered notification to the log
pub struct LogNotifier {
    recipient: String,
}

impl LogNotifier {
    pub fn new(recipient: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
        }
    }
}

#[async_trait]
impl ContactNotifier for LogNotifier {
    async fn notify(&self, message: &ContactMessage) -> anyhow::Result<()> {
        if self.recipient.is_empty() {
            anyhow::bail!("no notification recipient configured");
        }
        info!(
            to = %self.recipient,
            subject = %notification_subject(message),
            body = %render_notification(message),
            "Contact notification"
        );
        Ok(())
    }
}

pub fn notification_subject(message: &ContactMessage) -> String {
    format!("New contact form message: {}", message.name)
}

/// HTML body; all submitted text is escaped
pub fn render_notification(message: &ContactMessage) -> String {
    let body = html_escape::encode_text(&message.message).replace('\n', "<br>");
    format!(
        "<h2>New contact form message</h2>\
         <p><strong>Name:</strong> {}</p>\
         <p><strong>Email:</strong> {}</p>\
         <p><strong>Message:</strong></p><p>{}</p>\
         <p><strong>Received:</strong> {}</p>",
        html_escape::encode_text(&message.name),
        html_escape::encode_text(&message.email),
        body,
        message.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

#[derive(Clone)]
pub struct ContactService {
    db: Database,
    notifier: Arc<dyn ContactNotifier>,
}

impl ContactService {
    pub fn new(db: Database, notifier: Arc<dyn ContactNotifier>) -> Self {
        Self { db, notifier }
    }

    pub async fn submit(&self, form: &ContactForm) -> ApiResult<ContactMessage> {
        let form = form.validate()?;
        let message = ContactMessage {
            id: uuid::Uuid::new_v4().to_string(),
            name: form.name,
            email: form.email,
            message: form.message,
            status: "unread".to_string(),
            created_at: now_millis(),
            notification_sent: false,
            notification_time: None,
        };
        self.db.insert_contact_message(&message).await?;
        info!(id = %message.id, "Contact message stored");

        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let stored = message.clone();
        tokio::spawn(async move {
            deliver(&db, notifier.as_ref(), &stored).await;
        });

        Ok(message)
    }
}

async fn deliver(db: &Database, notifier: &dyn ContactNotifier, message: &ContactMessage) {
    match notifier.notify(message).await {
        Ok(()) => {
            if let Err(e) = db.mark_notification_sent(&message.id, now_millis()).await {
                warn!(id = %message.id, error = %e, "Failed to mark notification sent");
            }
        }
        Err(e) => warn!(id = %message.id, error = %e, "Contact notification failed"),
    }
}
