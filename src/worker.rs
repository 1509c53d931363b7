//! Worker loop around the upload handler.
//!
//! The loop owns the [`BudgetController`] for its lifetime. Each poll it
//! walks queued uploads oldest first, skips those the budget does not admit,
//! claims the rest up to `worker.concurrency`, charges the budget and runs
//! the handler on a [`JoinSet`] task. When the handler returns, the charge
//! is released and the upload is moved to its terminal state:
//!
//! | Handler result | Upload state |
//! |----------------|--------------|
//! | committed | `completed` |
//! | requeued | `queued` with `process_after` (set by the handler) |
//! | input or infrastructure error | `errored` with the failure message |
//! | cancelled | `queued` again, no failure counted |

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use scip_ingest_core::budget::{BudgetCharge, BudgetController};
use scip_ingest_core::error::ErrorKind;
use scip_ingest_core::handler::{HandleOutcome, ProcessSummary, UploadHandler};
use scip_ingest_core::models::{Upload, UploadState};
use scip_ingest_core::store::SourceControl;

use crate::blobstore::FsBlobStore;
use crate::config::Config;
use crate::db;
use crate::git::GitSourceControl;
use crate::sqlite_store::{SqliteDocumentStore, SqliteUploadStore};

/// How many queued uploads one poll looks at.
const CANDIDATE_WINDOW: i64 = 32;

/// Terminal result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResult {
    Completed(ProcessSummary),
    Requeued {
        not_before: DateTime<Utc>,
        reason: String,
    },
    Errored {
        kind: ErrorKind,
        message: String,
    },
    Cancelled,
}

/// Counts of results over one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: usize,
    pub requeued: usize,
    pub errored: usize,
    pub cancelled: usize,
}

impl WorkerReport {
    fn record(&mut self, result: &UploadResult) {
        match result {
            UploadResult::Completed(_) => self.completed += 1,
            UploadResult::Requeued { .. } => self.requeued += 1,
            UploadResult::Errored { .. } => self.errored += 1,
            UploadResult::Cancelled => self.cancelled += 1,
        }
    }
}

/// The handler wired to SQLite, the blob store and source control.
pub struct Pipeline {
    store: SqliteUploadStore,
    handler: Arc<UploadHandler>,
    budget: BudgetController,
    worker_id: String,
    concurrency: usize,
    poll_interval: Duration,
}

impl Pipeline {
    pub fn new(pool: SqlitePool, config: &Config, source: Arc<dyn SourceControl>) -> Self {
        let store = SqliteUploadStore::new(pool.clone());
        let handler = UploadHandler::new(
            Arc::new(store.clone()),
            Arc::new(
                SqliteDocumentStore::new(pool).with_staging_dir(config.worker.spill_dir.clone()),
            ),
            Arc::new(FsBlobStore::new(&config.blobstore.root)),
            source,
            config.worker.handler_config(),
        );

        Self {
            store,
            handler: Arc::new(handler),
            budget: BudgetController::new(config.worker.budget_bytes),
            worker_id: uuid::Uuid::new_v4().to_string(),
            concurrency: config.worker.concurrency.max(1),
            poll_interval: config.worker.poll_interval(),
        }
    }

    /// Uses git clones under `git.repos_root` as source control.
    pub fn from_config(pool: SqlitePool, config: &Config) -> Self {
        let source = Arc::new(GitSourceControl::new(&config.git.repos_root));
        Self::new(pool, config, source)
    }

    pub fn store(&self) -> &SqliteUploadStore {
        &self.store
    }

    pub fn budget(&self) -> &BudgetController {
        &self.budget
    }

    /// Claims and processes one queued upload, ignoring `process_after`.
    pub async fn process_one(
        &self,
        upload_id: i64,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let upload = match self.store.upload(upload_id).await? {
            Some(upload) => upload,
            None => bail!("Upload not found: {}", upload_id),
        };
        if upload.state != UploadState::Queued {
            bail!(
                "Upload {} is {}, only queued uploads can be processed",
                upload_id,
                upload.state.as_str()
            );
        }
        if !self.store.claim(upload_id, &self.worker_id).await? {
            bail!("Upload {} was claimed by another worker", upload_id);
        }

        let charge = self.budget.charge(upload.upload_size, upload.uncompressed_size);
        finish(&self.handler, &self.store, upload, charge, cancel).await
    }

    /// Processes queued uploads until `cancel` fires. With `once`, returns
    /// as soon as nothing ready is left, attempting each upload at most once.
    pub async fn run(&self, once: bool, cancel: &CancellationToken) -> Result<WorkerReport> {
        let reset = self.store.reset_stalled(&self.worker_id).await?;
        if reset > 0 {
            tracing::warn!(uploads = reset, "requeued uploads left in processing");
        }

        let mut report = WorkerReport::default();
        let mut attempted = HashSet::new();
        let mut tasks: JoinSet<(i64, Result<UploadResult>)> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            while tasks.len() < self.concurrency {
                let Some(upload) = self.claim_next(&attempted).await? else {
                    break;
                };
                if once {
                    attempted.insert(upload.id);
                }
                let charge = self.budget.charge(upload.upload_size, upload.uncompressed_size);
                tracing::info!(
                    upload_id = upload.id,
                    repository_id = upload.repository_id,
                    size = upload.upload_size,
                    "claimed upload"
                );

                let handler = Arc::clone(&self.handler);
                let store = self.store.clone();
                let cancel = cancel.child_token();
                tasks.spawn(async move {
                    let id = upload.id;
                    (id, finish(&handler, &store, upload, charge, &cancel).await)
                });
            }

            if tasks.is_empty() {
                if once {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    if let Some(joined) = joined {
                        record(&mut report, joined)?;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval), if !once => {}
                _ = cancel.cancelled() => break,
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record(&mut report, joined)?;
        }
        Ok(report)
    }

    /// Claims the oldest ready upload the budget admits.
    async fn claim_next(&self, attempted: &HashSet<i64>) -> Result<Option<Upload>> {
        let candidates = self
            .store
            .queued_candidates(Utc::now(), CANDIDATE_WINDOW)
            .await?;

        for upload in candidates {
            if attempted.contains(&upload.id) {
                continue;
            }
            if !self.budget.try_admit(upload.upload_size) {
                tracing::debug!(
                    upload_id = upload.id,
                    size = upload.upload_size,
                    remaining = ?self.budget.remaining(),
                    "budget does not admit upload"
                );
                continue;
            }
            if self.store.claim(upload.id, &self.worker_id).await? {
                return Ok(Some(upload));
            }
        }
        Ok(None)
    }
}

fn record(
    report: &mut WorkerReport,
    joined: Result<(i64, Result<UploadResult>), tokio::task::JoinError>,
) -> Result<()> {
    let (upload_id, result) = joined?;
    match result {
        Ok(result) => report.record(&result),
        Err(err) => {
            tracing::error!(
                upload_id,
                error = %format!("{:#}", err),
                "failed to record upload result"
            );
            report.errored += 1;
        }
    }
    Ok(())
}

/// Runs the handler on a claimed upload and moves it to its terminal state.
async fn finish(
    handler: &UploadHandler,
    store: &SqliteUploadStore,
    upload: Upload,
    charge: BudgetCharge,
    cancel: &CancellationToken,
) -> Result<UploadResult> {
    let outcome = handler.handle(&upload, cancel).await;
    charge.release();

    let result = match outcome {
        Ok(HandleOutcome::Committed(summary)) => {
            store.mark_completed(upload.id).await?;
            UploadResult::Completed(summary)
        }
        Ok(HandleOutcome::Requeued { not_before, reason }) => {
            UploadResult::Requeued { not_before, reason }
        }
        Err(err) if err.kind() == ErrorKind::Cancelled => {
            store.reset_to_queued(upload.id).await?;
            tracing::info!(upload_id = upload.id, "processing cancelled, upload requeued");
            UploadResult::Cancelled
        }
        Err(err) => {
            let kind = err.kind();
            let message = err.to_string();
            store.mark_errored(upload.id, &message).await?;
            tracing::warn!(
                upload_id = upload.id,
                kind = kind.as_str(),
                error = %message,
                "upload processing failed"
            );
            UploadResult::Errored { kind, message }
        }
    };
    Ok(result)
}

fn print_result(upload_id: i64, result: &UploadResult) {
    println!("process upload {}", upload_id);
    match result {
        UploadResult::Completed(summary) => {
            println!("  state: completed");
            println!("  documents written: {}", summary.documents_written);
            println!("  already present: {}", summary.already_present);
            println!("  packages: {}", summary.packages);
            println!("  references: {}", summary.references);
            println!("  ignored paths: {}", summary.ignored_paths);
            println!("  failed merges: {}", summary.failed_merges);
            println!("  buffer: {}", summary.buffer.as_str());
            println!("  default branch: {}", summary.is_default_branch);
            println!("  replaced uploads: {}", summary.overlapping_deleted);
        }
        UploadResult::Requeued { not_before, reason } => {
            println!("  state: queued");
            println!("  not before: {}", not_before.to_rfc3339());
            println!("  reason: {}", reason);
        }
        UploadResult::Errored { kind, message } => {
            println!("  state: errored");
            println!("  error kind: {}", kind);
            println!("  error: {}", message);
        }
        UploadResult::Cancelled => {
            println!("  state: queued");
            println!("  cancelled");
        }
    }
}

/// Installs a Ctrl-C handler that cancels the returned token.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, finishing in-flight uploads");
            trigger.cancel();
        }
    });
    token
}

/// `process <id>`: runs the handler once for a queued upload.
pub async fn run_process(config: &Config, upload_id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let pipeline = Pipeline::from_config(pool.clone(), config);
    let result = pipeline.process_one(upload_id, &shutdown_token()).await?;
    pool.close().await;

    print_result(upload_id, &result);
    if let UploadResult::Errored { message, .. } = &result {
        bail!("Upload {} failed: {}", upload_id, message);
    }
    println!("ok");
    Ok(())
}

/// `worker`: polls for queued uploads until interrupted, or once with `--once`.
pub async fn run_worker(config: &Config, once: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let pipeline = Pipeline::from_config(pool.clone(), config);
    tracing::info!(
        concurrency = config.worker.concurrency,
        budget_bytes = config.worker.budget_bytes,
        once,
        "worker started"
    );

    let report = pipeline.run(once, &shutdown_token()).await?;
    pool.close().await;

    println!("worker");
    println!("  completed: {}", report.completed);
    println!("  requeued: {}", report.requeued);
    println!("  errored: {}", report.errored);
    println!("  cancelled: {}", report.cancelled);
    println!("ok");
    Ok(())
}
