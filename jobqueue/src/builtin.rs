//! Job types the framework ships with.
//!
//! Each job type has a typed payload, a helper pushing it with a retry ceiling of
//! [`DEFAULT_MAX_RETRY`], and a default handler installed by [`register_defaults`]. The default
//! handlers only validate the payload and log the request; applications are expected to replace
//! them with [`Queue::register_handler`].
//!
//! Payload fields are read leniently: a missing field or a field holding an unexpected JSON type
//! decodes to the field's zero value, so only the checks below can fail a built-in job.
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    handler::{HandlerError, JobHandler},
    job::{Job, JobId, Payload},
    Queue, QueueError,
};

pub const SEND_EMAIL: &str = "send_email";
pub const IMAGE_PROCESS: &str = "image_process";
pub const DATA_EXPORT: &str = "data_export";
pub const WEBHOOK_CALL: &str = "webhook_call";
pub const NOTIFICATION: &str = "notification";

pub const DEFAULT_MAX_RETRY: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendEmail {
    #[serde(deserialize_with = "lenient")]
    pub to: String,
    #[serde(deserialize_with = "lenient")]
    pub subject: String,
    #[serde(deserialize_with = "lenient")]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageProcess {
    #[serde(deserialize_with = "lenient")]
    pub image_path: String,
    #[serde(deserialize_with = "lenient")]
    pub operation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataExport {
    #[serde(deserialize_with = "lenient_id")]
    pub user_id: i64,
    #[serde(deserialize_with = "lenient")]
    pub format: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookCall {
    #[serde(deserialize_with = "lenient")]
    pub url: String,
    #[serde(deserialize_with = "lenient")]
    pub data: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
    #[serde(deserialize_with = "lenient_id")]
    pub user_id: i64,
    #[serde(deserialize_with = "lenient")]
    pub message: String,
    #[serde(deserialize_with = "lenient")]
    pub channel: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuiltinError {
    #[error("missing required email parameters")]
    MissingEmailParameters,
    #[error("image_path is required")]
    MissingImagePath,
    #[error("webhook URL is required")]
    MissingWebhookUrl,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Accepts integral and floating point ids, as JSON producers rarely agree on which to send.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_i64()
        .or_else(|| value.as_f64().map(|id| id as i64))
        .unwrap_or_default())
}

pub fn send_email_async(
    queue: &Queue,
    to: impl Into<String>,
    subject: impl Into<String>,
    body: impl Into<String>,
) -> Result<JobId, QueueError> {
    let email = SendEmail {
        to: to.into(),
        subject: subject.into(),
        body: body.into(),
    };
    queue.push_data(SEND_EMAIL, &email, DEFAULT_MAX_RETRY)
}

pub fn process_image_async(
    queue: &Queue,
    image_path: impl Into<String>,
    operation: impl Into<String>,
) -> Result<JobId, QueueError> {
    let image = ImageProcess {
        image_path: image_path.into(),
        operation: operation.into(),
    };
    queue.push_data(IMAGE_PROCESS, &image, DEFAULT_MAX_RETRY)
}

pub fn export_data_async(
    queue: &Queue,
    user_id: i64,
    format: impl Into<String>,
) -> Result<JobId, QueueError> {
    let export = DataExport {
        user_id,
        format: format.into(),
    };
    queue.push_data(DATA_EXPORT, &export, DEFAULT_MAX_RETRY)
}

pub fn call_webhook_async(
    queue: &Queue,
    url: impl Into<String>,
    data: Payload,
) -> Result<JobId, QueueError> {
    let webhook = WebhookCall {
        url: url.into(),
        data,
    };
    queue.push_data(WEBHOOK_CALL, &webhook, DEFAULT_MAX_RETRY)
}

pub fn send_notification_async(
    queue: &Queue,
    user_id: i64,
    message: impl Into<String>,
    channel: impl Into<String>,
) -> Result<JobId, QueueError> {
    let notification = Notification {
        user_id,
        message: message.into(),
        channel: channel.into(),
    };
    queue.push_data(NOTIFICATION, &notification, DEFAULT_MAX_RETRY)
}

/// Installs the default handler for every built-in job type.
pub fn register_defaults(queue: &Queue) {
    queue.register_handler(SEND_EMAIL, SendEmailHandler);
    queue.register_handler(IMAGE_PROCESS, ImageProcessHandler);
    queue.register_handler(DATA_EXPORT, DataExportHandler);
    queue.register_handler(WEBHOOK_CALL, WebhookCallHandler);
    queue.register_handler(NOTIFICATION, NotificationHandler);
}

pub struct SendEmailHandler;

#[async_trait]
impl JobHandler for SendEmailHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let email: SendEmail = job.payload_as()?;
        if email.to.is_empty() || email.subject.is_empty() {
            return Err(BuiltinError::MissingEmailParameters.into());
        }
        tracing::info!(job_id = %job.id, "Sending email to {}: {}", email.to, email.subject);
        Ok(())
    }
}

pub struct ImageProcessHandler;

#[async_trait]
impl JobHandler for ImageProcessHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let image: ImageProcess = job.payload_as()?;
        if image.image_path.is_empty() {
            return Err(BuiltinError::MissingImagePath.into());
        }
        tracing::info!(
            job_id = %job.id,
            "Processing image {} with operation {}",
            image.image_path,
            image.operation
        );
        Ok(())
    }
}

pub struct DataExportHandler;

#[async_trait]
impl JobHandler for DataExportHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let export: DataExport = job.payload_as()?;
        tracing::info!(
            job_id = %job.id,
            "Exporting data for user {} in format {}",
            export.user_id,
            export.format
        );
        Ok(())
    }
}

pub struct WebhookCallHandler;

#[async_trait]
impl JobHandler for WebhookCallHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let webhook: WebhookCall = job.payload_as()?;
        if webhook.url.is_empty() {
            return Err(BuiltinError::MissingWebhookUrl.into());
        }
        let data = serde_json::to_string(&webhook.data)?;
        tracing::info!(job_id = %job.id, "Calling webhook {} with data: {data}", webhook.url);
        Ok(())
    }
}

pub struct NotificationHandler;

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let notification: Notification = job.payload_as()?;
        tracing::info!(
            job_id = %job.id,
            "Sending {} notification to user {}: {}",
            notification.channel,
            notification.user_id,
            notification.message
        );
        Ok(())
    }
}
