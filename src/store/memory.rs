//! In-memory state store.
//!
//! Backs unit and scenario tests, and single-process deployments that don't
//! need durability. Guarded updates lock the target entry for the duration
//! of the compare-and-set, giving the same no-double-apply guarantee as the
//! SQL implementation.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::{
    ExportRun, ExportTaskRecord, Job, ProviderTaskRecord, RunZipFile, TaskFailure, TaskResult,
};
use crate::state_machine::TaskState;

use super::{StateStore, StoreError, StoreResult};

/// DashMap-backed [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    jobs: DashMap<Uuid, Job>,
    runs: DashMap<Uuid, ExportRun>,
    provider_tasks: DashMap<Uuid, ProviderTaskRecord>,
    tasks: DashMap<Uuid, ExportTaskRecord>,
    results: DashMap<Uuid, TaskResult>,
    failures: DashMap<Uuid, Vec<TaskFailure>>,
    run_zip_files: DashMap<Uuid, RunZipFile>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(format!("job {}", job.id)));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn insert_run(&self, run: &ExportRun) -> StoreResult<()> {
        if self.runs.contains_key(&run.id) {
            return Err(StoreError::Duplicate(format!("run {}", run.id)));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn run(&self, id: Uuid) -> StoreResult<Option<ExportRun>> {
        Ok(self.runs.get(&id).map(|r| r.clone()))
    }

    async fn runs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<ExportRun>> {
        let mut runs: Vec<ExportRun> = self
            .runs
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .map(|entry| entry.clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn update_run_status(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool> {
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !expected.contains(&run.status) {
            return Ok(false);
        }
        run.status = to;
        Ok(true)
    }

    async fn set_run_worker(&self, id: Uuid, worker: &str) -> StoreResult<()> {
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        run.worker = Some(worker.to_string());
        Ok(())
    }

    async fn set_run_started(&self, id: Uuid) -> StoreResult<()> {
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_run_finished(&self, id: Uuid) -> StoreResult<()> {
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn set_run_notified(&self, id: Uuid) -> StoreResult<bool> {
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if run.notified.is_some() {
            return Ok(false);
        }
        run.notified = Some(Utc::now());
        Ok(true)
    }

    async fn soft_delete_run(&self, id: Uuid, user: Option<&str>) -> StoreResult<()> {
        let mut run = self.runs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        run.deleted = true;
        run.delete_user = user.map(String::from);
        Ok(())
    }

    async fn insert_provider_task(&self, record: &ProviderTaskRecord) -> StoreResult<()> {
        let duplicate = self.provider_tasks.iter().any(|entry| {
            entry.run_id == record.run_id && entry.provider_slug == record.provider_slug
        });
        if duplicate {
            return Err(StoreError::Duplicate(format!(
                "provider task for ({}, {})",
                record.run_id, record.provider_slug
            )));
        }
        self.provider_tasks.insert(record.id, record.clone());
        Ok(())
    }

    async fn provider_task(&self, id: Uuid) -> StoreResult<Option<ProviderTaskRecord>> {
        Ok(self.provider_tasks.get(&id).map(|p| p.clone()))
    }

    async fn provider_tasks_for_run(&self, run_id: Uuid) -> StoreResult<Vec<ProviderTaskRecord>> {
        let mut records: Vec<ProviderTaskRecord> = self
            .provider_tasks
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .map(|entry| entry.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn update_provider_task_status(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool> {
        let mut record = self
            .provider_tasks
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        if !expected.contains(&record.status) {
            return Ok(false);
        }
        if record.started_at.is_none() && to.is_active() {
            record.started_at = Some(Utc::now());
        }
        record.status = to;
        Ok(true)
    }

    async fn set_provider_task_finished(&self, id: Uuid) -> StoreResult<()> {
        let mut record = self
            .provider_tasks
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn insert_task(&self, task: &ExportTaskRecord) -> StoreResult<()> {
        let duplicate = self.tasks.iter().any(|entry| {
            entry.provider_task_id == task.provider_task_id && entry.name == task.name
        });
        if duplicate {
            return Err(StoreError::Duplicate(format!(
                "task '{}' within provider task {}",
                task.name, task.provider_task_id
            )));
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn task(&self, id: Uuid) -> StoreResult<Option<ExportTaskRecord>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn tasks_for_provider(
        &self,
        provider_task_id: Uuid,
    ) -> StoreResult<Vec<ExportTaskRecord>> {
        let mut tasks: Vec<ExportTaskRecord> = self
            .tasks
            .iter()
            .filter(|entry| entry.provider_task_id == provider_task_id)
            .map(|entry| entry.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool> {
        let mut task = self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !expected.contains(&task.status) {
            return Ok(false);
        }
        task.status = to;
        Ok(true)
    }

    async fn set_task_started(&self, id: Uuid, worker: &str, pid: i32) -> StoreResult<()> {
        let mut task = self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        task.worker = Some(worker.to_string());
        task.pid = pid;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    async fn set_task_finished(&self, id: Uuid) -> StoreResult<()> {
        let mut task = self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        task.finished_at = Some(Utc::now());
        task.pid = -1;
        Ok(())
    }

    async fn set_task_cancel_user(&self, id: Uuid, user: &str) -> StoreResult<()> {
        let mut task = self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        task.cancel_user = Some(user.to_string());
        Ok(())
    }

    async fn set_task_result(&self, id: Uuid, result_id: Uuid) -> StoreResult<()> {
        let mut task = self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        task.result = Some(result_id);
        Ok(())
    }

    async fn insert_result(&self, result: &TaskResult) -> StoreResult<()> {
        self.results.insert(result.id, result.clone());
        Ok(())
    }

    async fn result(&self, id: Uuid) -> StoreResult<Option<TaskResult>> {
        Ok(self.results.get(&id).map(|r| r.clone()))
    }

    async fn soft_delete_result(&self, id: Uuid) -> StoreResult<()> {
        let mut result = self.results.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        result.deleted = true;
        Ok(())
    }

    async fn record_task_failure(&self, failure: &TaskFailure) -> StoreResult<()> {
        self.failures
            .entry(failure.task_id)
            .or_default()
            .push(failure.clone());
        Ok(())
    }

    async fn failures_for_task(&self, task_id: Uuid) -> StoreResult<Vec<TaskFailure>> {
        Ok(self
            .failures
            .get(&task_id)
            .map(|f| f.clone())
            .unwrap_or_default())
    }

    async fn insert_run_zip_file(&self, zip: &RunZipFile) -> StoreResult<()> {
        self.run_zip_files.insert(zip.id, zip.clone());
        Ok(())
    }

    async fn update_run_zip_file(&self, zip: &RunZipFile) -> StoreResult<()> {
        if !self.run_zip_files.contains_key(&zip.id) {
            return Err(StoreError::NotFound(zip.id));
        }
        self.run_zip_files.insert(zip.id, zip.clone());
        Ok(())
    }

    async fn run_zip_files_for_run(&self, run_id: Uuid) -> StoreResult<Vec<RunZipFile>> {
        Ok(self
            .run_zip_files
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .map(|entry| entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskCategory;

    #[tokio::test]
    async fn test_guarded_task_transition() {
        let store = MemoryStateStore::new();
        let task = ExportTaskRecord::pending(Uuid::new_v4(), "Geopackage (.gpkg)", TaskCategory::Convert);
        store.insert_task(&task).await.unwrap();

        // Pending -> Running applies once.
        assert!(store
            .transition_task(task.id, &[TaskState::Pending], TaskState::Running)
            .await
            .unwrap());
        // A second writer expecting Pending loses the race.
        assert!(!store
            .transition_task(task.id, &[TaskState::Pending], TaskState::Running)
            .await
            .unwrap());

        let current = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskState::Running);
    }

    #[tokio::test]
    async fn test_unique_task_name_within_provider() {
        let store = MemoryStateStore::new();
        let provider_task_id = Uuid::new_v4();
        let first =
            ExportTaskRecord::pending(provider_task_id, "ESRI Shapefile (.shp)", TaskCategory::Convert);
        let second =
            ExportTaskRecord::pending(provider_task_id, "ESRI Shapefile (.shp)", TaskCategory::Convert);
        store.insert_task(&first).await.unwrap();
        assert!(matches!(
            store.insert_task(&second).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_one_provider_task_per_run_provider_pair() {
        let store = MemoryStateStore::new();
        let run_id = Uuid::new_v4();
        let first = ProviderTaskRecord::pending(run_id, "osm", "OpenStreetMap");
        let second = ProviderTaskRecord::pending(run_id, "osm", "OpenStreetMap");
        store.insert_provider_task(&first).await.unwrap();
        assert!(matches!(
            store.insert_provider_task(&second).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_notified_stamp_is_single_use() {
        let store = MemoryStateStore::new();
        let run = ExportRun::submitted(Uuid::new_v4(), "user", 14);
        store.insert_run(&run).await.unwrap();
        assert!(store.set_run_notified(run.id).await.unwrap());
        assert!(!store.set_run_notified(run.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_runs_for_job_newest_first() {
        let store = MemoryStateStore::new();
        let job_id = Uuid::new_v4();
        for _ in 0..3 {
            let run = ExportRun::submitted(job_id, "user", 14);
            store.insert_run(&run).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let runs = store.runs_for_job(job_id).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs[0].created_at >= runs[1].created_at);
        assert!(runs[1].created_at >= runs[2].created_at);
    }
}
