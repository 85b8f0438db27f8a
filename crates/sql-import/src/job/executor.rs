//! Job orchestration.
//!
//! `action_start`, `action_cancel` and `action_retry` return as soon as the
//! state change is recorded; the import itself runs on a spawned task. The
//! task reads the source with a keyset cursor (`key > cursor AND key <=
//! upto`), so a resumed job continues after the last written row and never
//! reads rows that appeared after the first start.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Job, JobState, JobStore, LogLevel, MappingLease, MappingLeases};
use crate::connection::ConnectionManager;
use crate::core::{ReadOptions, SourceRow, TargetModel};
use crate::error::{ImportError, Result};
use crate::inspect::resolve_order_key;
use crate::mapping::{Mapping, MappingResolver, MappingSnapshot};
use crate::transform::TransformEngine;

/// Shared job state.
type SharedJob = Arc<Mutex<Job>>;

/// A job plus the lock that orders its saves.
#[derive(Clone)]
struct Handle {
    job: SharedJob,
    saving: Arc<AsyncMutex<()>>,
}

struct Entry {
    handle: Handle,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// What the import task needs, cloned into each spawned run.
#[derive(Clone)]
struct Worker {
    connections: Arc<ConnectionManager>,
    target: Arc<dyn TargetModel>,
    engine: TransformEngine,
    store: Arc<dyn JobStore>,
}

/// How a run ended.
enum Outcome {
    Done,
    Cancelled,
    Failed(ImportError),
}

/// Runs import jobs and enforces their state machine.
pub struct ImportJobExecutor {
    worker: Worker,
    resolver: Arc<MappingResolver>,
    leases: MappingLeases,
    jobs: Mutex<HashMap<String, Entry>>,
}

fn lock(job: &Mutex<Job>) -> MutexGuard<'_, Job> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ImportJobExecutor {
    pub fn new(
        connections: Arc<ConnectionManager>,
        resolver: Arc<MappingResolver>,
        target: Arc<dyn TargetModel>,
        engine: TransformEngine,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            worker: Worker {
                connections,
                target,
                engine,
                store,
            },
            resolver,
            leases: MappingLeases::new(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Create a draft job for a mapping.
    pub async fn create_job(&self, mapping: &Mapping) -> Result<String> {
        let job = Job::new(&mapping.name);
        let id = job.id.clone();
        self.worker.store.save(&job).await?;
        self.register(job);
        debug!("Created job {} for mapping {}", id, mapping.name);
        Ok(id)
    }

    /// Bring a persisted job into the registry.
    ///
    /// A job persisted as running belonged to a process that is gone; it is
    /// moved to error so it can be retried.
    pub async fn load_job(&self, id: &str) -> Result<Job> {
        if let Ok(job) = self.job(id) {
            return Ok(job);
        }
        let mut job = self.worker.store.load(id).await?;
        if job.state == JobState::Running {
            job.state = JobState::Error;
            job.ended_at = Some(Utc::now());
            job.error_message = Some("interrupted while running".to_string());
            job.log(LogLevel::Error, "Import interrupted while running");
            self.worker.store.save(&job).await?;
        }
        self.register(job.clone());
        Ok(job)
    }

    /// Current state of a job.
    pub fn job(&self, id: &str) -> Result<Job> {
        let handle = self.entry(id)?;
        let snapshot = lock(&handle.job).clone();
        Ok(snapshot)
    }

    /// Jobs in the registry, newest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .registry()
            .values()
            .map(|e| lock(&e.handle.job).clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Validate the mapping, snapshot it and start the import.
    ///
    /// Legal only from draft. Fails with `Precondition` when another job on
    /// the same mapping is running and with `Validation` when the mapping
    /// has blocking issues; the job stays in draft in both cases.
    pub async fn action_start(&self, id: &str, mapping: &mut Mapping) -> Result<()> {
        let handle = self.entry(id)?;
        let job = &handle.job;
        {
            let job = lock(job);
            if job.state != JobState::Draft {
                return Err(ImportError::Precondition(format!(
                    "job {} is {}; only a draft job can be started",
                    id, job.state
                )));
            }
            if job.mapping != mapping.name {
                return Err(ImportError::Precondition(format!(
                    "job {} belongs to mapping '{}', not '{}'",
                    id, job.mapping, mapping.name
                )));
            }
        }
        if !mapping.active {
            return Err(ImportError::Precondition(format!(
                "mapping '{}' is inactive",
                mapping.name
            )));
        }

        let lease = self.leases.acquire(&mapping.name)?;
        let warnings = self.resolver.ensure_valid(mapping).await?;

        {
            let mut job = lock(job);
            if job.state != JobState::Draft {
                return Err(ImportError::Precondition(format!(
                    "job {} is {}; only a draft job can be started",
                    id, job.state
                )));
            }
            job.snapshot = Some(mapping.snapshot());
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
            job.ended_at = None;
            job.error_message = None;
            job.log(LogLevel::Info, "Starting import job");
            for warning in &warnings {
                job.log(LogLevel::Warning, warning.to_string());
            }
        }
        self.worker.save(&handle).await?;
        self.spawn(id, lease)
    }

    /// Ask a running job to stop after the row in flight.
    pub fn action_cancel(&self, id: &str) -> Result<()> {
        let registry = self.registry();
        let entry = registry
            .get(id)
            .ok_or_else(|| ImportError::NotFound(format!("job {}", id)))?;
        let mut job = lock(&entry.handle.job);
        if job.state != JobState::Running {
            return Err(ImportError::Precondition(format!(
                "job {} is {}; only a running job can be cancelled",
                id, job.state
            )));
        }
        if !entry.cancel.is_cancelled() {
            job.log(LogLevel::Info, "Cancellation requested");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Resume an errored or cancelled job after its last written row.
    pub async fn action_retry(&self, id: &str) -> Result<()> {
        let handle = self.entry(id)?;
        let job = &handle.job;
        let mapping = {
            let job = lock(job);
            if !job.state.is_retryable() {
                return Err(ImportError::Precondition(format!(
                    "job {} is {}; only an errored or cancelled job can be retried",
                    id, job.state
                )));
            }
            match &job.snapshot {
                Some(snapshot) => snapshot.name.clone(),
                None => {
                    return Err(ImportError::Precondition(format!(
                        "job {} has no mapping snapshot",
                        id
                    )))
                }
            }
        };

        let lease = self.leases.acquire(&mapping)?;
        {
            let mut job = lock(job);
            if !job.state.is_retryable() {
                return Err(ImportError::Precondition(format!(
                    "job {} is {}; only an errored or cancelled job can be retried",
                    id, job.state
                )));
            }
            let requeued = job.requeue_trailing_failures();
            job.state = JobState::Running;
            job.ended_at = None;
            job.error_message = None;
            let from = job
                .cursor
                .as_ref()
                .map(|k| format!("after key {}", k))
                .unwrap_or_else(|| "from the first row".to_string());
            job.log(LogLevel::Info, format!("Retrying import job {}", from));
            if requeued > 0 {
                job.log(
                    LogLevel::Info,
                    format!("Re-queued {} failed rows after the last imported row", requeued),
                );
            }
        }
        self.worker.save(&handle).await?;
        self.spawn(id, lease)
    }

    /// Wait for a job's current run to finish and return its final state.
    pub async fn wait(&self, id: &str) -> Result<Job> {
        let task = {
            let mut registry = self.registry();
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| ImportError::NotFound(format!("job {}", id)))?;
            entry.task.take()
        };
        if let Some(task) = task {
            task.await
                .map_err(|e| ImportError::State(format!("job task failed: {}", e)))?;
        }
        self.job(id)
    }

    fn register(&self, job: Job) {
        let id = job.id.clone();
        self.registry().insert(
            id,
            Entry {
                handle: Handle {
                    job: Arc::new(Mutex::new(job)),
                    saving: Arc::new(AsyncMutex::new(())),
                },
                cancel: CancellationToken::new(),
                task: None,
            },
        );
    }

    fn entry(&self, id: &str) -> Result<Handle> {
        self.registry()
            .get(id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| ImportError::NotFound(format!("job {}", id)))
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, id: &str, lease: MappingLease) -> Result<()> {
        let mut registry = self.registry();
        let entry = registry
            .get_mut(id)
            .ok_or_else(|| ImportError::NotFound(format!("job {}", id)))?;
        entry.cancel = CancellationToken::new();

        let worker = self.worker.clone();
        let handle = entry.handle.clone();
        let cancel = entry.cancel.clone();
        entry.task = Some(tokio::spawn(async move {
            worker.run(handle, cancel, lease).await;
        }));
        Ok(())
    }
}

impl Worker {
    /// Run the import and publish its terminal state.
    ///
    /// The lease is released together with the terminal transition, so a
    /// retry or a new start never sees a finished job's mapping as busy.
    async fn run(&self, handle: Handle, cancel: CancellationToken, lease: MappingLease) {
        let outcome = match self.import(&handle, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e),
        };

        {
            let mut job = lock(&handle.job);
            job.ended_at = Some(Utc::now());
            match outcome {
                Outcome::Done => {
                    let processed = job.processed();
                    let counted = job.total_records;
                    if processed < counted {
                        let message = format!(
                            "{} of the {} rows counted at start were not read; they were deleted \
                             upstream or no longer match the filter",
                            counted - processed,
                            counted
                        );
                        job.log(LogLevel::Warning, message);
                        job.total_records = processed;
                    }
                    job.state = JobState::Done;
                    let message = format!(
                        "Import completed successfully. Imported: {}, Failed: {}",
                        job.imported_records, job.failed_records
                    );
                    job.log(LogLevel::Info, message);
                }
                Outcome::Cancelled => {
                    job.state = JobState::Cancelled;
                    let message = format!(
                        "Import cancelled. Imported: {}, Failed: {}",
                        job.imported_records, job.failed_records
                    );
                    job.log(LogLevel::Warning, message);
                }
                Outcome::Failed(e) => {
                    job.state = JobState::Error;
                    job.error_message = Some(e.summary());
                    job.log(LogLevel::Error, format!("Import failed: {}", e.summary()));
                }
            }
            drop(lease);
        }
        self.persist(&handle).await;
    }

    async fn import(&self, handle: &Handle, cancel: &CancellationToken) -> Result<Outcome> {
        let job = &handle.job;
        let (snapshot, key_column, after_key, upto_key) = {
            let job = lock(job);
            let snapshot = job
                .snapshot
                .clone()
                .ok_or_else(|| ImportError::State("job has no mapping snapshot".into()))?;
            (snapshot, job.key_column.clone(), job.cursor.clone(), job.upto_key.clone())
        };

        let (conn, session) = self
            .connections
            .resolve_for(&snapshot.name, &snapshot.connections)
            .await?;

        let (key_column, upto_key) = match key_column {
            Some(key) => (key, upto_key),
            None => {
                let key = resolve_order_key(
                    session.as_ref(),
                    &snapshot.source_schema,
                    &snapshot.source_table,
                    snapshot.order_key.as_deref(),
                )
                .await?;
                lock(job).log(LogLevel::Info, "Counting source records...");
                let extent = session
                    .extent(
                        &snapshot.source_schema,
                        &snapshot.source_table,
                        &key,
                        snapshot.source_filter.as_deref(),
                    )
                    .await?;

                {
                    let mut job = lock(job);
                    job.key_column = Some(key.clone());
                    job.upto_key = extent.max_key.clone();
                    job.total_records = extent.rows;
                    job.log(
                        LogLevel::Info,
                        format!("Found {} records to import via {}", extent.rows, conn),
                    );
                }
                self.persist(handle).await;
                (key, extent.max_key)
            }
        };

        if upto_key.is_none() {
            return Ok(Outcome::Done);
        }

        let mut rows = session.read_rows(ReadOptions {
            schema: snapshot.source_schema.clone(),
            table: snapshot.source_table.clone(),
            columns: snapshot.source_columns(),
            key_column,
            after_key,
            upto_key,
            filter: snapshot.source_filter.clone(),
            batch_size: snapshot.batch_size,
        });

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                batch = rows.recv() => batch,
            };
            let batch = match batch {
                Some(batch) => batch?,
                None => return Ok(Outcome::Done),
            };

            for row in batch {
                if cancel.is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }
                if let Err(e) = self.import_row(job, &snapshot, row).await {
                    return Ok(Outcome::Failed(e));
                }
            }

            {
                let mut job = lock(job);
                let message = format!(
                    "Processed {}/{} records",
                    job.processed(),
                    job.total_records
                );
                job.log(LogLevel::Info, message);
            }
            self.persist(handle).await;
        }
    }

    /// Transform and write one row, updating the counters.
    ///
    /// Returns an error only when the job must stop.
    async fn import_row(&self, job: &SharedJob, snapshot: &MappingSnapshot, row: SourceRow) -> Result<()> {
        let result = match snapshot.transform_row(&self.engine, &row) {
            Ok(values) => match snapshot.write_key(&values) {
                Ok(key) => self
                    .target
                    .write(&snapshot.target_entity, snapshot.target_mode, key, &values)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let mut job = lock(job);
        match result {
            Ok(()) => {
                job.record_success(row.key);
                Ok(())
            }
            Err(e) if e.is_row_scoped() => {
                job.record_failure();
                job.log(LogLevel::Error, format!("Row {}: {}", row.key, e.summary()));
                if snapshot.skip_errors {
                    Ok(())
                } else {
                    Err(ImportError::row(row.key.to_string(), e))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Save the job's current state.
    ///
    /// Saves of one job are serialized and each writes the state as of
    /// its turn, so the last save always holds the latest state.
    async fn save(&self, handle: &Handle) -> Result<()> {
        let _saving = handle.saving.lock().await;
        let snapshot = lock(&handle.job).clone();
        self.store.save(&snapshot).await
    }

    async fn persist(&self, handle: &Handle) {
        if let Err(e) = self.save(handle).await {
            let id = lock(&handle.job).id.clone();
            warn!("Failed to save job {}: {}", id, e);
        }
    }
}
