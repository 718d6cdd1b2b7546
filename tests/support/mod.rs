#![allow(dead_code)]

pub mod server;

use std::sync::Mutex;

use hyperhttp::{AttemptRecord, Observer};

/// Captures the retry audit trail for assertions.
#[derive(Default)]
pub struct Recorder {
    records: Mutex<Vec<AttemptRecord>>,
}

impl Recorder {
    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl Observer for Recorder {
    fn on_attempt(&self, attempt: &AttemptRecord) {
        self.records.lock().unwrap().push(attempt.clone());
    }
}

pub fn init_trace() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
