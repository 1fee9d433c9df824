//! Common test utilities for integration tests
//!
//! Tests here need a running Redis instance. Redis URL comes from REDIS_URL:
//! export REDIS_URL="redis://localhost:6379"

#![allow(dead_code)]

use std::sync::Mutex;
use switchyard_shared::redis::{RedisClient, RedisConfig};
use switchyard_shared::report::ErrorReporter;
use uuid::Uuid;

/// Helper to get Redis URL from environment
pub fn test_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

pub fn test_redis_config() -> RedisConfig {
    RedisConfig::new(test_redis_url())
}

pub async fn connect() -> RedisClient {
    RedisClient::new(test_redis_config())
        .await
        .expect("Redis must be running for integration tests")
}

/// Name unique to one test run
pub fn unique(label: &str) -> String {
    format!("test-{}-{}", label, Uuid::new_v4())
}

/// Reporter that keeps every report for assertions
#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &anyhow::Error, context: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((context.to_string(), format!("{:#}", error)));
    }
}
