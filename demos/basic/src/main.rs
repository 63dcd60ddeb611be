use std::time::Duration;

use async_trait::async_trait;
use jobqueue::{builtin, prelude::*};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match QueueConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(?err, "Invalid queue configuration: {err}");
            std::process::exit(1);
        }
    };
    if !config.enabled {
        tracing::info!("Queue disabled, nothing to do");
        return;
    }

    let queue = Queue::new(config).expect("config was validated when loaded");
    builtin::register_defaults(&queue);
    queue.register_handler("flaky_report", FlakyReport);
    queue.start().expect("queue is only started once");

    builtin::send_email_async(&queue, "new.user@example.com", "Welcome!", "Thank you for joining us!")
        .unwrap();
    builtin::process_image_async(&queue, "storage/avatar.png", "thumbnail").unwrap();
    builtin::send_notification_async(&queue, 42, "Your export is being prepared", "email").unwrap();
    queue
        .push_default("flaky_report", serde_json::Map::new())
        .unwrap();
    queue.push_delay(
        builtin::DATA_EXPORT,
        serde_json::json!({"user_id": 42, "format": "csv"})
            .as_object()
            .cloned()
            .unwrap_or_default(),
        3,
        Duration::from_secs(1),
    );

    tokio::time::sleep(Duration::from_secs(4)).await;
    queue.stop().await.unwrap();

    let stats = queue.stats();
    println!(
        "processed: {}, failed: {}, retried: {}, active: {}",
        stats.processed, stats.failed, stats.retried, stats.active
    );
}

/// Fails on its first attempt to show a retry in the logs.
struct FlakyReport;

#[async_trait]
impl JobHandler for FlakyReport {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        if job.attempts < 2 {
            return Err("report service unavailable".into());
        }
        println!("{} generated report on attempt {}", job.id, job.attempts);
        Ok(())
    }
}
