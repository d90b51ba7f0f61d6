//! Progress and ETA tracking.
//!
//! Many concurrent conversions report progress; writes are rate-limited so a
//! shared cache is not write-amplified by every percent tick. Absolute
//! progress composes from a subtask window: a collection step that owns 65%
//! of its task reports local progress that maps into `[start, start+65)`.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::ProgressCache;
use crate::models::ExportTaskRecord;

const MODEL_NAME: &str = "ExportTaskRecord";
const PROGRESS_ATTR: &str = "progress";
const ETA_ATTR: &str = "estimated_finish";

/// Exponential-moving-average ETA that refines with each progress update.
#[derive(Debug)]
pub struct EtaEstimator {
    started: Instant,
    alpha: f64,
    estimate_secs: Option<f64>,
    last_percent: f64,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            alpha: 0.3,
            estimate_secs: None,
            last_percent: 0.0,
        }
    }

    /// Feed an absolute percent; returns the smoothed remaining duration
    /// once enough signal exists.
    pub fn update(&mut self, percent: f64) -> Option<Duration> {
        if percent <= 0.0 {
            return None;
        }
        self.last_percent = percent;
        let elapsed = self.started.elapsed().as_secs_f64();
        let raw_remaining = elapsed * (100.0 - percent) / percent;
        let smoothed = match self.estimate_secs {
            Some(previous) => self.alpha * raw_remaining + (1.0 - self.alpha) * previous,
            None => raw_remaining,
        };
        self.estimate_secs = Some(smoothed);
        Some(Duration::from_secs_f64(smoothed.max(0.0)))
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.estimate_secs.map(|s| Duration::from_secs_f64(s.max(0.0)))
    }
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TrackState {
    last_written_percent: i64,
    eta: EtaEstimator,
}

/// Rate-limited writer of progress and ETA into the progress cache.
pub struct ProgressTracker {
    cache: Arc<dyn ProgressCache>,
    ttl: Duration,
    states: DashMap<Uuid, Mutex<TrackState>>,
}

impl ProgressTracker {
    pub fn new(cache: Arc<dyn ProgressCache>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            states: DashMap::new(),
        }
    }

    /// Report progress for a task. `local_percent` is progress within the
    /// subtask window `(subtask_start, subtask_percentage)`; the absolute
    /// value is clamped to `[0, 100]` and only written when the rounded
    /// percent actually moved.
    pub async fn update(
        &self,
        task_id: Uuid,
        local_percent: f64,
        subtask_start: f64,
        subtask_percentage: f64,
        eta_hint: Option<Duration>,
    ) {
        let absolute =
            (subtask_start + subtask_percentage * local_percent / 100.0).clamp(0.0, 100.0);
        let rounded = absolute.round() as i64;

        let (should_write, eta) = {
            let state = self
                .states
                .entry(task_id)
                .or_insert_with(|| Mutex::new(TrackState {
                    last_written_percent: -1,
                    eta: EtaEstimator::new(),
                }));
            let mut state = state.lock();
            let moved = rounded != state.last_written_percent;
            if moved {
                state.last_written_percent = rounded;
            }
            let eta = eta_hint.or_else(|| state.eta.update(absolute));
            (moved, eta)
        };

        if !should_write {
            return;
        }

        self.cache
            .set(MODEL_NAME, task_id, PROGRESS_ATTR, json!(rounded), self.ttl)
            .await;
        if let Some(eta) = eta {
            let finish = chrono::Utc::now() + chrono::Duration::from_std(eta).unwrap_or_default();
            self.cache
                .set(MODEL_NAME, task_id, ETA_ATTR, json!(finish.to_rfc3339()), self.ttl)
                .await;
        }
    }

    /// Mark a task fully complete and drop its tracking state.
    pub async fn complete(&self, task_id: Uuid) {
        self.states.remove(&task_id);
        self.cache
            .set(MODEL_NAME, task_id, PROGRESS_ATTR, json!(100), self.ttl)
            .await;
        self.cache.delete(MODEL_NAME, task_id, ETA_ATTR).await;
    }
}

/// Window-scoped reporter handed to step handlers. The handler reports local
/// progress; the window placement stays with the orchestrator.
#[derive(Clone)]
pub struct ProgressHandle {
    tracker: Arc<ProgressTracker>,
    task_id: Uuid,
    subtask_start: f64,
    subtask_percentage: f64,
}

impl ProgressHandle {
    pub fn new(tracker: Arc<ProgressTracker>, task_id: Uuid) -> Self {
        Self {
            tracker,
            task_id,
            subtask_start: 0.0,
            subtask_percentage: 100.0,
        }
    }

    /// Narrow the reporting window, e.g. a query phase owning 65% of a task.
    pub fn window(&self, subtask_start: f64, subtask_percentage: f64) -> Self {
        Self {
            tracker: Arc::clone(&self.tracker),
            task_id: self.task_id,
            subtask_start,
            subtask_percentage,
        }
    }

    pub async fn report(&self, local_percent: f64) {
        self.tracker
            .update(
                self.task_id,
                local_percent,
                self.subtask_start,
                self.subtask_percentage,
                None,
            )
            .await;
    }

    pub async fn report_with_eta(&self, local_percent: f64, eta: Duration) {
        self.tracker
            .update(
                self.task_id,
                local_percent,
                self.subtask_start,
                self.subtask_percentage,
                Some(eta),
            )
            .await;
    }
}

/// Read side of progress. Finished tasks report 100 without a cache read.
pub struct ProgressReader {
    cache: Arc<dyn ProgressCache>,
}

impl ProgressReader {
    pub fn new(cache: Arc<dyn ProgressCache>) -> Self {
        Self { cache }
    }

    pub async fn progress_of(&self, task: &ExportTaskRecord) -> i64 {
        if task.is_finished() {
            return 100;
        }
        self.cache
            .get(MODEL_NAME, task.id, PROGRESS_ATTR)
            .await
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    pub async fn estimated_finish(&self, task: &ExportTaskRecord) -> Option<String> {
        if task.is_finished() {
            return None;
        }
        self.cache
            .get(MODEL_NAME, task.id, ETA_ATTR)
            .await
            .and_then(|v| v.as_str().map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryProgressCache;
    use crate::models::TaskCategory;

    fn tracker() -> (Arc<MemoryProgressCache>, ProgressTracker) {
        let cache = Arc::new(MemoryProgressCache::new());
        let tracker = ProgressTracker::new(cache.clone(), Duration::from_secs(60));
        (cache, tracker)
    }

    #[tokio::test]
    async fn test_subtask_window_math() {
        let (cache, tracker) = tracker();
        let task_id = Uuid::new_v4();

        // 50% through a window starting at 77 owning 8 points: 77 + 4 = 81.
        tracker.update(task_id, 50.0, 77.0, 8.0, None).await;
        let value = cache.get(MODEL_NAME, task_id, PROGRESS_ATTR).await.unwrap();
        assert_eq!(value, json!(81));
    }

    #[tokio::test]
    async fn test_progress_is_clamped() {
        let (cache, tracker) = tracker();
        let task_id = Uuid::new_v4();
        tracker.update(task_id, 400.0, 90.0, 50.0, None).await;
        let value = cache.get(MODEL_NAME, task_id, PROGRESS_ATTR).await.unwrap();
        assert_eq!(value, json!(100));
    }

    #[tokio::test]
    async fn test_unchanged_percent_not_rewritten() {
        let (cache, tracker) = tracker();
        let task_id = Uuid::new_v4();

        tracker.update(task_id, 50.0, 0.0, 100.0, None).await;
        cache.delete(MODEL_NAME, task_id, PROGRESS_ATTR).await;

        // Same rounded value again: rate limiter swallows the write.
        tracker.update(task_id, 50.2, 0.0, 100.0, None).await;
        assert!(cache.get(MODEL_NAME, task_id, PROGRESS_ATTR).await.is_none());

        // A moved value writes again.
        tracker.update(task_id, 60.0, 0.0, 100.0, None).await;
        assert_eq!(
            cache.get(MODEL_NAME, task_id, PROGRESS_ATTR).await,
            Some(json!(60))
        );
    }

    #[tokio::test]
    async fn test_finished_task_reads_100_without_cache() {
        let cache = Arc::new(MemoryProgressCache::new());
        let reader = ProgressReader::new(cache);
        let mut task =
            ExportTaskRecord::pending(Uuid::new_v4(), "Geopackage (.gpkg)", TaskCategory::Convert);
        task.status = crate::state_machine::TaskState::Success;
        assert_eq!(reader.progress_of(&task).await, 100);
    }

    #[test]
    fn test_eta_refines() {
        let mut eta = EtaEstimator::new();
        assert!(eta.update(0.0).is_none());
        std::thread::sleep(Duration::from_millis(20));
        let first = eta.update(25.0);
        assert!(first.is_some());
        let second = eta.update(50.0);
        assert!(second.is_some());
        // More progress over the same elapsed time shrinks the estimate.
        assert!(second.unwrap() <= first.unwrap());
    }
}
