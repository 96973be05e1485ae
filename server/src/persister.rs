//! Transactional batch writes.
//!
//! # Strategies
//!
//! - **Staging + merge**: truncate the staging area and write the batch into
//!   it in one unit of work, then run the merge routine and save the tracking
//!   row in a second one. The merge is idempotent and the staging area is
//!   rebuilt from scratch on every attempt, so replaying either phase is safe.
//! - **Direct upsert**: every row is upserted (or soft-deleted) and the
//!   tracking row saved in a single unit of work.
//!
//! Either way the batch's effects and the advanced tracking row commit
//! together or not at all. Transient database errors are retried a bounded
//! number of times; anything else is handed back to the caller.

use crate::config::{PersistenceStrategy, StagingTarget, UpsertTarget};
use crate::db::{PersistenceBackend, UnitOfWork};
use crate::error::{Result, StorageError, SyncError};
use crate::tracking::ServiceTracking;
use feedsync_engine::{EntityStatus, StagingBatch};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded retry on transient database errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Attempts per batch, including the first one
    pub max_attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Duration::from_millis(500),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Writes batches for one service.
pub struct EntityPersister {
    backend: Arc<dyn PersistenceBackend>,
    strategy: PersistenceStrategy,
    retry: RetryConfig,
}

impl EntityPersister {
    pub fn new(backend: Arc<dyn PersistenceBackend>, strategy: PersistenceStrategy, retry: RetryConfig) -> Self {
        Self {
            backend,
            strategy,
            retry,
        }
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    /// Persist `batch` together with `tracking`.
    ///
    /// `soft_delete_absent` asks the merge routine to flag permanent rows
    /// missing from the batch as Deleted; only Refresh-driven batches set it.
    pub async fn persist(
        &self,
        batch: &StagingBatch,
        soft_delete_absent: bool,
        tracking: &ServiceTracking,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = self.attempt(batch, soft_delete_absent, tracking) => result,
            };

            match result {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::debug!(service = %tracking.service_id, attempt, "Batch persisted after retry");
                    }
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        service = %tracking.service_id,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %err,
                        "Transient database error, retrying batch"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(self.retry.delay) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn attempt(
        &self,
        batch: &StagingBatch,
        soft_delete_absent: bool,
        tracking: &ServiceTracking,
    ) -> std::result::Result<(), StorageError> {
        if batch.is_empty() {
            let mut uow = self.backend.begin().await?;
            let result = uow.save_tracking(tracking).await;
            return finish(uow, result).await;
        }

        match &self.strategy {
            PersistenceStrategy::StagingMerge(target) => {
                self.staging_merge(target, batch, soft_delete_absent, tracking).await
            }
            PersistenceStrategy::DirectUpsert(target) => self.direct_upsert(target, batch, tracking).await,
        }
    }

    async fn staging_merge(
        &self,
        target: &StagingTarget,
        batch: &StagingBatch,
        soft_delete_absent: bool,
        tracking: &ServiceTracking,
    ) -> std::result::Result<(), StorageError> {
        let rows: Vec<serde_json::Value> = batch.rows().iter().map(|r| r.to_row()).collect();

        let mut uow = self.backend.begin().await?;
        let result = async {
            uow.truncate_staging(&target.staging_table).await?;
            uow.write_staging(&target.staging_table, &rows).await
        }
        .await;
        let written = result.as_ref().copied().unwrap_or_default();
        finish(uow, result.map(|_| ())).await?;

        let mut uow = self.backend.begin().await?;
        let result = async {
            uow.merge(&target.merge, soft_delete_absent).await?;
            uow.save_tracking(tracking).await
        }
        .await;
        finish(uow, result).await?;

        let counts = batch.counts();
        tracing::debug!(
            service = %tracking.service_id,
            staged = written,
            inserts = counts.inserts,
            updates = counts.updates,
            deletes = counts.deletes,
            soft_delete_absent,
            "Batch merged"
        );
        Ok(())
    }

    async fn direct_upsert(
        &self,
        target: &UpsertTarget,
        batch: &StagingBatch,
        tracking: &ServiceTracking,
    ) -> std::result::Result<(), StorageError> {
        let mut uow = self.backend.begin().await?;
        let result = async {
            for record in batch.rows() {
                match record.status {
                    EntityStatus::Active => uow.upsert(target, &record.to_row()).await?,
                    EntityStatus::Deleted => {
                        uow.soft_delete(
                            &target.table,
                            &target.key_column,
                            &record.key,
                            record.record_last_changed_utc,
                        )
                        .await?
                    }
                }
            }
            uow.save_tracking(tracking).await
        }
        .await;
        finish(uow, result).await?;

        tracing::debug!(service = %tracking.service_id, rows = batch.len(), "Batch upserted");
        Ok(())
    }
}

/// Commit on success, roll back on failure. A failed rollback is logged and
/// the original error returned.
async fn finish(
    mut uow: Box<dyn UnitOfWork>,
    result: std::result::Result<(), StorageError>,
) -> std::result::Result<(), StorageError> {
    match result {
        Ok(()) => uow.commit().await,
        Err(err) => {
            if let Err(rollback) = uow.rollback().await {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}
