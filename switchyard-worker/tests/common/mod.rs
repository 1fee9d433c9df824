/// Common test utilities for queue integration tests
///
/// Every test gets a queue with a unique name so runs never see each other's
/// jobs. Redis URL comes from REDIS_URL:
/// export REDIS_URL="redis://localhost:6379"

use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_shared::redis::{RedisClient, RedisConfig};
use switchyard_shared::report::ErrorReporter;
use switchyard_worker::options::QueueOptions;
use switchyard_worker::queue::{QueueClient, WorkQueue};
use uuid::Uuid;

/// Helper to get Redis URL from environment
pub fn test_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Reporter that keeps every report for assertions
#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<(String, String)>>,
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &anyhow::Error, context: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((context.to_string(), format!("{:#}", error)));
    }
}

/// Test context with a connected client and a recording reporter
pub struct TestContext {
    pub redis: RedisClient,
    pub client: QueueClient,
    pub reporter: Arc<RecordingReporter>,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        let redis = RedisClient::new(RedisConfig::new(test_redis_url())).await?;
        let reporter = Arc::new(RecordingReporter::default());
        let client = QueueClient::new(redis.clone()).with_reporter(reporter.clone());

        Ok(Self {
            redis,
            client,
            reporter,
        })
    }

    /// Options for a uniquely named queue tuned for fast tests
    pub fn options(&self, label: &str) -> QueueOptions {
        let mut options = QueueOptions::new(format!("{}-{}", label, Uuid::new_v4()));
        options.queue.prefix = "test-queue".to_string();
        options.worker.concurrency = 4;
        options.worker.claim_timeout = Duration::from_millis(200);
        options.worker.delayed_poll_interval = Duration::from_millis(100);
        options
    }

    pub async fn queue<T>(&self, options: QueueOptions) -> anyhow::Result<WorkQueue<T>> {
        Ok(self.client.queue(options).await?)
    }

    pub fn report_count(&self) -> usize {
        self.reporter.reports.lock().unwrap().len()
    }
}
