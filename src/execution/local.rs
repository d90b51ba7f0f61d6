//! # Local Execution Substrate
//!
//! Tokio-backed implementation of the substrate contract for single-host
//! deployments and tests. Honors the concurrency model exactly: within one
//! chain steps run strictly sequentially with an explicit SUCCESS
//! precondition per dependency; across chains everything runs in parallel
//! bounded by a semaphore; the run-wide barrier is the only join point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::ProgressCache;
use crate::config::OrchestratorConfig;
use crate::constants::TaskPriority;
use crate::error::ExportError;
use crate::events::EventPublisher;
use crate::models::{ExportRun, Job, ProviderCatalog, TaskResult};
use crate::orchestration::cancellation::CancellationPropagator;
use crate::orchestration::finalizer::FinalizationBarrier;
use crate::orchestration::progress::{ProgressHandle, ProgressTracker};
use crate::orchestration::task_graph::{ExecutableChain, Step, StepKind};
use crate::state_machine::{TaskStateMachine, TransitionOutcome};
use crate::store::StateStore;

use super::handlers::{download_url, HandlerRegistry, StepContext, StepOutcome};
use super::substrate::{ExecutionSubstrate, SubmitHandle, SubstrateError, TokenRegistry};

/// Executes compiled chains step by step.
pub struct ChainRunner {
    store: Arc<dyn StateStore>,
    cache: Arc<dyn ProgressCache>,
    publisher: EventPublisher,
    registry: Arc<HandlerRegistry>,
    propagator: Arc<CancellationPropagator>,
    barrier: Arc<FinalizationBarrier>,
    tracker: Arc<ProgressTracker>,
    tokens: Arc<TokenRegistry>,
    catalog: Arc<ProviderCatalog>,
    config: OrchestratorConfig,
    worker: String,
}

impl ChainRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn ProgressCache>,
        publisher: EventPublisher,
        registry: Arc<HandlerRegistry>,
        propagator: Arc<CancellationPropagator>,
        barrier: Arc<FinalizationBarrier>,
        tracker: Arc<ProgressTracker>,
        tokens: Arc<TokenRegistry>,
        catalog: Arc<ProviderCatalog>,
        config: OrchestratorConfig,
        worker: String,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            registry,
            propagator,
            barrier,
            tracker,
            tokens,
            catalog,
            config,
            worker,
        }
    }

    /// Run one chain to completion. Never panics the worker: every failure
    /// lands in task state, not in the substrate.
    pub async fn run_chain(&self, chain: ExecutableChain) {
        let context = match self.load_chain_context(&chain).await {
            Ok(context) => context,
            Err(err) => {
                error!(
                    run_id = %chain.run_id,
                    provider = %chain.provider_slug,
                    error = %err,
                    "Failed to load chain context"
                );
                return;
            }
        };
        let (run, job) = context;

        debug!(
            run_id = %chain.run_id,
            provider = %chain.provider_slug,
            steps = chain.steps.len(),
            queue = %chain.queue,
            "Executing chain"
        );

        // Artifacts produced so far, by step name. Presence doubles as the
        // SUCCESS precondition for dependent steps.
        let mut artifacts: HashMap<String, PathBuf> = HashMap::new();
        let sm = TaskStateMachine::new(Arc::clone(&self.store), self.publisher.clone());

        for step in &chain.steps {
            match step.kind {
                StepKind::ProviderFinalize => {
                    self.run_provider_finalize(&sm, &chain, step).await;
                }
                StepKind::RunFinalize => {
                    self.run_barrier(&sm, &chain, step).await;
                }
                _ => {
                    self.run_work_step(&sm, &run, &job, &chain, step, &mut artifacts)
                        .await;
                }
            }
        }
    }

    async fn load_chain_context(
        &self,
        chain: &ExecutableChain,
    ) -> crate::error::Result<(ExportRun, Job)> {
        let run = self
            .store
            .run(chain.run_id)
            .await?
            .ok_or(ExportError::not_found("run", chain.run_id))?;
        let job = self
            .store
            .job(run.job_id)
            .await?
            .ok_or(ExportError::not_found("job", run.job_id))?;
        Ok((run, job))
    }

    async fn run_work_step(
        &self,
        sm: &TaskStateMachine<dyn StateStore>,
        run: &ExportRun,
        job: &Job,
        chain: &ExecutableChain,
        step: &Step,
        artifacts: &mut HashMap<String, PathBuf>,
    ) {
        // Explicit precondition: the dependency must have reached SUCCESS.
        // Queue ordering alone is not enough under retries.
        let input = match &step.depends_on {
            Some(dependency) => match artifacts.get(dependency) {
                Some(path) => Some(path.clone()),
                None => {
                    debug!(
                        task = %step.name,
                        dependency = %dependency,
                        "Dependency did not succeed, skipping step"
                    );
                    let _ = sm.cancel(step.task_id, None).await;
                    return;
                }
            },
            None => None,
        };

        let pid = std::process::id() as i32;
        match sm.start(step.task_id, &self.worker, pid).await {
            Ok(TransitionOutcome::Transitioned(_)) => {}
            Ok(TransitionOutcome::Canceled(signal)) => {
                info!(task = %step.name, "{signal}");
                return;
            }
            Ok(TransitionOutcome::AlreadyTerminal(status)) => {
                debug!(task = %step.name, status = %status, "Step already terminal, skipping");
                return;
            }
            Err(err) => {
                error!(task = %step.name, error = %err, "Failed to start step");
                return;
            }
        }

        let token = self.tokens.register(step.task_id);
        let outcome = {
            let ctx = match self.build_step_context(run, job, chain, step, input, &token).await {
                Ok(ctx) => ctx,
                Err(err) => {
                    let _ = sm.fail(step.task_id, &err.to_string()).await;
                    self.tokens.remove(step.task_id);
                    return;
                }
            };
            // work_handler is total over work kinds; finalize kinds never
            // reach here.
            let handler = self
                .registry
                .work_handler(&step.kind)
                .expect("work step dispatched without a handler");
            tokio::time::timeout(self.config.task_time_limit(), handler.execute(&ctx)).await
        };
        self.tokens.remove(step.task_id);

        match outcome {
            Err(_elapsed) => {
                // Hard time limit: a distinct, user-facing failure reason.
                let reason = ExportError::TimeLimitExceeded {
                    limit_secs: self.config.execution.task_time_limit_secs,
                }
                .to_string();
                warn!(task = %step.name, "{reason}");
                let _ = sm.fail(step.task_id, &reason).await;
                if step.abort_on_error {
                    if let Err(err) = self
                        .propagator
                        .abort_chain(chain.provider_task_id, &step.name)
                        .await
                    {
                        error!(task = %step.name, error = %err, "Chain abort failed");
                    }
                }
            }
            Ok(Ok(StepOutcome::Success { artifact })) => {
                if let Some(path) = &artifact {
                    if let Err(err) = self.record_result(run, chain, step, path).await {
                        error!(task = %step.name, error = %err, "Failed to record task result");
                    }
                    artifacts.insert(step.name.clone(), path.clone());
                }
                self.tracker.complete(step.task_id).await;
                let _ = sm.succeed(step.task_id).await;
            }
            Ok(Ok(StepOutcome::Canceled(signal))) => {
                info!(task = %step.name, "{signal}");
                let _ = sm.cancel(step.task_id, signal.user.as_deref()).await;
            }
            Ok(Err(err)) => {
                warn!(task = %step.name, error = %err, "Step failed");
                let _ = sm.fail(step.task_id, &err.to_string()).await;
                if step.abort_on_error {
                    if let Err(abort_err) = self
                        .propagator
                        .abort_chain(chain.provider_task_id, &step.name)
                        .await
                    {
                        error!(task = %step.name, error = %abort_err, "Chain abort failed");
                    }
                }
            }
        }
    }

    async fn build_step_context(
        &self,
        run: &ExportRun,
        job: &Job,
        chain: &ExecutableChain,
        step: &Step,
        input: Option<PathBuf>,
        token: &super::token::CancellationToken,
    ) -> crate::error::Result<StepContext> {
        let provider_task = self
            .store
            .provider_task(chain.provider_task_id)
            .await?
            .ok_or(ExportError::not_found("provider task", chain.provider_task_id))?;
        let task = self
            .store
            .task(step.task_id)
            .await?
            .ok_or(ExportError::not_found("task", step.task_id))?;
        let stage_dir = self
            .config
            .staging
            .provider_dir(run.id, &chain.provider_slug);

        Ok(StepContext {
            run: run.clone(),
            job: job.clone(),
            provider: self.catalog.get(&chain.provider_slug).cloned(),
            provider_task,
            task,
            step: step.clone(),
            zoom: chain.zoom,
            stage_dir,
            input,
            token: token.clone(),
            progress: ProgressHandle::new(Arc::clone(&self.tracker), step.task_id),
            cache: Arc::clone(&self.cache),
        })
    }

    async fn record_result(
        &self,
        run: &ExportRun,
        chain: &ExecutableChain,
        step: &Step,
        path: &PathBuf,
    ) -> crate::error::Result<()> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| step.name.clone());
        let size_mb = std::fs::metadata(path)
            .map(|m| m.len() as f64 / 1024.0 / 1024.0)
            .unwrap_or(0.0);
        let result = TaskResult::new(
            &filename,
            size_mb,
            download_url(run.id, &chain.provider_slug, &filename),
        );
        self.store.insert_result(&result).await?;
        self.store.set_task_result(step.task_id, result.id).await?;
        Ok(())
    }

    async fn run_provider_finalize(
        &self,
        sm: &TaskStateMachine<dyn StateStore>,
        chain: &ExecutableChain,
        step: &Step,
    ) {
        let pid = std::process::id() as i32;
        match sm.start(step.task_id, &self.worker, pid).await {
            Ok(TransitionOutcome::Transitioned(_)) => {}
            // An upstream cancel already finalized the provider record.
            Ok(_) | Err(_) => return,
        }
        match self.barrier.finalize_provider(chain.provider_task_id).await {
            Ok(status) => {
                debug!(
                    provider_task = %chain.provider_task_id,
                    status = %status,
                    "Provider finalized"
                );
                let _ = sm.succeed(step.task_id).await;
            }
            Err(err) => {
                error!(
                    provider_task = %chain.provider_task_id,
                    error = %err,
                    "Provider finalization failed"
                );
                let _ = sm.fail(step.task_id, &err.to_string()).await;
            }
        }
    }

    async fn run_barrier(
        &self,
        sm: &TaskStateMachine<dyn StateStore>,
        chain: &ExecutableChain,
        step: &Step,
    ) {
        let pid = std::process::id() as i32;
        match sm.start(step.task_id, &self.worker, pid).await {
            Ok(TransitionOutcome::Transitioned(_)) => {}
            Ok(_) | Err(_) => return,
        }
        match self.barrier.wait_for_providers(chain.run_id).await {
            Ok(decision) => {
                info!(run_id = %chain.run_id, decision = ?decision, "Barrier resolved");
                let _ = sm.succeed(step.task_id).await;
            }
            Err(err) => {
                // Errback path: finalization itself failed. The run must not
                // stay RUNNING forever.
                error!(run_id = %chain.run_id, error = %err, "Finalization failed");
                let _ = sm.fail(step.task_id, &err.to_string()).await;
                let _ = self
                    .store
                    .update_run_status(
                        chain.run_id,
                        &[
                            crate::state_machine::TaskState::Submitted,
                            crate::state_machine::TaskState::Pending,
                            crate::state_machine::TaskState::Running,
                        ],
                        crate::state_machine::TaskState::Incomplete,
                    )
                    .await;
                let _ = self.store.set_run_finished(chain.run_id).await;
            }
        }
    }
}

struct Submission {
    task_ids: Vec<Uuid>,
    queue: String,
}

/// In-process [`ExecutionSubstrate`] over a worker pool of tokio tasks.
pub struct LocalSubstrate {
    runner: Arc<ChainRunner>,
    tokens: Arc<TokenRegistry>,
    semaphore: Arc<Semaphore>,
    submissions: DashMap<Uuid, Submission>,
    queue_depths: Arc<DashMap<String, usize>>,
}

impl LocalSubstrate {
    pub fn new(runner: Arc<ChainRunner>, tokens: Arc<TokenRegistry>, max_concurrent: usize) -> Self {
        Self {
            runner,
            tokens,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            submissions: DashMap::new(),
            queue_depths: Arc::new(DashMap::new()),
        }
    }

    fn adjust_depth(depths: &DashMap<String, usize>, queue: &str, delta: isize) {
        let mut entry = depths.entry(queue.to_string()).or_insert(0);
        let value = *entry as isize + delta;
        *entry = value.max(0) as usize;
    }
}

#[async_trait]
impl ExecutionSubstrate for LocalSubstrate {
    async fn submit(
        &self,
        chain: ExecutableChain,
        priority: TaskPriority,
    ) -> Result<SubmitHandle, SubstrateError> {
        let handle = SubmitHandle {
            id: Uuid::new_v4(),
            queue: chain.queue.clone(),
            task_ids: chain.task_ids(),
        };
        self.submissions.insert(
            handle.id,
            Submission {
                task_ids: handle.task_ids.clone(),
                queue: handle.queue.clone(),
            },
        );
        Self::adjust_depth(&self.queue_depths, &chain.queue, 1);

        debug!(
            handle = %handle.id,
            queue = %chain.queue,
            priority = ?priority,
            "Chain submitted"
        );

        let runner = Arc::clone(&self.runner);
        let semaphore = Arc::clone(&self.semaphore);
        let queue = chain.queue.clone();
        // Depth bookkeeping shares the map; the spawned worker owns a clone
        // of the handle id only.
        let depths = self.queue_depths.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("substrate semaphore closed");
            runner.run_chain(chain).await;
            Self::adjust_depth(&depths, &queue, -1);
        });

        Ok(handle)
    }

    async fn cancel(&self, handle_id: Uuid, _pid: i32) -> Result<(), SubstrateError> {
        let submission = self
            .submissions
            .get(&handle_id)
            .ok_or(SubstrateError::UnknownHandle(handle_id))?;
        for task_id in &submission.task_ids {
            self.tokens.cancel(*task_id);
        }
        info!(handle = %handle_id, queue = %submission.queue, "Submission canceled");
        Ok(())
    }

    fn queue_depth(&self, queue: &str) -> usize {
        self.queue_depths.get(queue).map(|d| *d).unwrap_or(0)
    }
}
