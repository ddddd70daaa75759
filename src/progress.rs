use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Parse,
    Analyze,
    PatchSync,
    Merge,
    FileMerge,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub percentage: f64,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Rounded percentage of `processed / total`, clamped to `[0, max]`.
pub fn progress_percentage(total: f64, processed: f64, max: f64) -> f64 {
    if total <= 0.0 {
        return max;
    }
    let perc = (processed / total * 100.0 * 100.0).round() / 100.0;
    perc.clamp(0.0, max)
}

struct Counter {
    processed: f64,
    previous: f64,
}

/// Serializes progress updates for one operation. Repeated or lower values are
/// not published, so subscribers always see a non-decreasing sequence.
pub struct ProgressTracker {
    stage: ProgressStage,
    total: f64,
    max: f64,
    callback: Option<ProgressCallback>,
    counter: Mutex<Counter>,
}

impl ProgressTracker {
    pub fn new(
        stage: ProgressStage,
        total: usize,
        max: f64,
        callback: Option<ProgressCallback>,
    ) -> Self {
        ProgressTracker {
            stage,
            total: total as f64,
            max,
            callback,
            counter: Mutex::new(Counter {
                processed: 0.0,
                previous: -1.0,
            }),
        }
    }

    pub fn advance(&self, amount: usize) {
        let Ok(mut counter) = self.counter.lock() else {
            return;
        };
        counter.processed += amount as f64;
        let perc = progress_percentage(self.total, counter.processed, self.max);
        if perc > counter.previous {
            counter.previous = perc;
            self.emit(perc);
        }
    }

    /// Publishes `percentage` unless an equal or higher value was already sent.
    pub fn publish(&self, percentage: f64) {
        let Ok(mut counter) = self.counter.lock() else {
            return;
        };
        if percentage > counter.previous {
            counter.previous = percentage;
            self.emit(percentage);
        }
    }

    pub fn finish(&self) {
        self.publish(100.0);
    }

    fn emit(&self, percentage: f64) {
        if let Some(callback) = &self.callback {
            callback(ProgressEvent {
                stage: self.stage,
                percentage,
            });
        }
    }
}
