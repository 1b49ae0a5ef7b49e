use moka::future::Cache;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Job, JobStatus};
use crate::orchestrator::{BatchOrchestrator, BulkRequest};
use crate::store::Store;

/// Runs bulk operations as background jobs.
///
/// At most one job per (tenant, campaign, operation) is active at a time;
/// the claim is an atomic insert into `active`.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn Store>,
    orchestrator: Arc<BatchOrchestrator>,
    active: Cache<String, Uuid>,
    cancel_flags: Cache<Uuid, Arc<AtomicBool>>,
}

fn job_key(tenant_id: Uuid, campaign_id: Uuid, operation: &str) -> String {
    format!("{}:{}:{}", tenant_id, campaign_id, operation)
}

impl JobRunner {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<BatchOrchestrator>) -> Self {
        Self {
            store,
            orchestrator,
            active: Cache::builder().max_capacity(100_000).build(),
            cancel_flags: Cache::builder().max_capacity(100_000).build(),
        }
    }

    /// Validate the request, persist a queued job and start it in the background.
    ///
    /// Preflight errors are returned here and no job is created.
    pub async fn submit(&self, request: BulkRequest) -> Result<Job, AppError> {
        let key = job_key(
            request.tenant_id,
            request.campaign_id,
            request.operation.as_str(),
        );
        let job_id = Uuid::new_v4();

        let claim = self.active.entry(key.clone()).or_insert(job_id).await;
        if !claim.is_fresh() {
            return Err(AppError::Conflict(format!(
                "Job {} is already running {} for campaign {}",
                claim.value(),
                request.operation.as_str(),
                request.campaign_id
            )));
        }

        let prepared = match self.orchestrator.prepare(request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.active.invalidate(&key).await;
                return Err(e);
            }
        };

        let mut job = Job::queued(
            prepared.tenant_id,
            prepared.campaign.id,
            prepared.operation,
            prepared.lead_ids.clone(),
            prepared.credentials.as_ref().map(|c| c.fingerprint()),
        );
        job.id = job_id;

        if let Err(e) = self.store.create_job(&job).await {
            self.active.invalidate(&key).await;
            return Err(e);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags.insert(job_id, cancel.clone()).await;

        tracing::info!(
            "Job {} queued: {} on campaign {} ({} leads)",
            job_id,
            job.operation.as_str(),
            job.campaign_id,
            job.lead_ids.len()
        );

        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = runner
                .store
                .update_job_status(job_id, JobStatus::Running, None)
                .await
            {
                tracing::error!("Failed to mark job {} as running: {}", job_id, e);
            }

            let result = runner
                .orchestrator
                .run(&prepared, cancel.as_ref(), Some(job_id))
                .await;

            let finished = match result {
                Ok(summary) => {
                    if let Err(e) = runner.store.update_job_progress(job_id, &summary).await {
                        tracing::error!("Failed to store summary of job {}: {}", job_id, e);
                    }
                    let status = if summary.cancelled {
                        JobStatus::Cancelled
                    } else {
                        JobStatus::Completed
                    };
                    runner.store.update_job_status(job_id, status, None).await
                }
                Err(e) => {
                    tracing::error!("Job {} failed: {}", job_id, e);
                    runner
                        .store
                        .update_job_status(job_id, JobStatus::Failed, Some(&e.to_string()))
                        .await
                }
            };
            if let Err(e) = finished {
                tracing::error!("Failed to record final state of job {}: {}", job_id, e);
            }

            runner.active.invalidate(&key).await;
            runner.cancel_flags.invalidate(&job_id).await;
        });

        Ok(job)
    }

    pub async fn get(&self, tenant_id: Uuid, job_id: Uuid) -> Result<Job, AppError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
        if job.tenant_id != tenant_id {
            return Err(AppError::Ownership(format!(
                "Job {} does not belong to tenant {}",
                job_id, tenant_id
            )));
        }
        Ok(job)
    }

    /// Request cooperative cancellation; the job stops between leads.
    pub async fn cancel(&self, tenant_id: Uuid, job_id: Uuid) -> Result<Job, AppError> {
        let job = self.get(tenant_id, job_id).await?;
        if job.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Job {} already {}",
                job_id,
                job.status.as_str()
            )));
        }

        match self.cancel_flags.get(&job_id).await {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                tracing::info!("Cancellation requested for job {}", job_id);
                Ok(job)
            }
            None => Err(AppError::Conflict(format!(
                "Job {} is not running in this process",
                job_id
            ))),
        }
    }

    /// Mark jobs left queued or running by a previous process as failed.
    /// Their leads can be resumed by submitting the operation again.
    pub async fn recover_interrupted(&self) -> Result<usize, AppError> {
        let stale = self
            .store
            .list_jobs_with_status(&[JobStatus::Queued, JobStatus::Running])
            .await?;

        for job in &stale {
            tracing::warn!(
                "Job {} ({} on campaign {}) was interrupted",
                job.id,
                job.operation.as_str(),
                job.campaign_id
            );
            self.store
                .update_job_status(job.id, JobStatus::Failed, Some("interrupted"))
                .await?;
        }
        Ok(stale.len())
    }
}
