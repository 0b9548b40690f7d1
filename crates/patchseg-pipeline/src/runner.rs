//! Polling worker that drives training runs against a dataset store.
//!
//! Polls for pending records and runs the training core once per record:
//! `pending → training → ready` with the artifact attached, or `failed` when
//! the run aborts. A failed record never stops the loop; the error is logged
//! and the worker moves on to the next record.

use std::sync::Arc;
use std::time::Duration;

use patchseg_core::{
    ClassifierArtifact, DatasetRecord, DatasetStatus, DatasetStore, Result, TrainingReport,
};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::extractor::FeatureExtractor;
use crate::train_classifier;

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll the store for pending records.
    pub poll_interval: Duration,
    /// Maximum records trained per poll.
    pub batch_limit: usize,
    /// File name artifacts are stored under.
    pub artifact_file_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_limit: 10,
            artifact_file_name: "classifier.onnx".to_string(),
        }
    }
}

/// Training worker generic over the store and extractor boundaries.
///
/// Records are trained strictly sequentially within one worker; separate
/// workers share no mutable state and may run concurrently.
pub struct TrainingWorker<S, E> {
    store: Arc<S>,
    extractor: Arc<E>,
    pipeline: PipelineConfig,
    config: WorkerConfig,
}

impl<S: DatasetStore, E: FeatureExtractor> TrainingWorker<S, E> {
    /// Create a worker over the given store and extractor.
    pub fn new(
        store: Arc<S>,
        extractor: Arc<E>,
        pipeline: PipelineConfig,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            pipeline,
            config,
        }
    }

    /// Poll forever, training every pending record each tick.
    ///
    /// Poll failures (store unreachable) are logged and retried on the next
    /// tick; only an invalid configuration aborts the loop.
    pub async fn run(&self) -> Result<()> {
        self.pipeline.validate()?;
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            extractor = self.extractor.name(),
            "training worker started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "poll failed");
            }
        }
    }

    /// Run one poll cycle; returns how many records trained successfully.
    pub async fn poll_once(&self) -> Result<usize> {
        let pending = self.store.list_pending(self.config.batch_limit).await?;
        if pending.is_empty() {
            debug!("no pending datasets");
            return Ok(0);
        }

        let mut trained = 0usize;
        for record in pending {
            match self.train_record(&record).await {
                Ok(report) => {
                    info!(dataset = %record.id, %report, "training run complete");
                    trained += 1;
                }
                Err(e) => {
                    error!(dataset = %record.id, error = %e, "training run failed");
                }
            }
        }
        Ok(trained)
    }

    /// Train one record end to end, updating its status along the way.
    async fn train_record(&self, record: &DatasetRecord) -> Result<TrainingReport> {
        info!(dataset = %record.id, name = %record.name, "starting training run");
        self.store
            .update_status(record.id, DatasetStatus::Training)
            .await?;

        let outcome = match self.store.fetch_images(record.id).await {
            Ok(blobs) => train_classifier(&blobs, self.extractor.as_ref(), &self.pipeline),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                self.store
                    .put_artifact(
                        record.id,
                        ClassifierArtifact {
                            file_name: self.config.artifact_file_name.clone(),
                            bytes: outcome.artifact_bytes,
                        },
                    )
                    .await?;
                self.store
                    .update_status(record.id, DatasetStatus::Ready)
                    .await?;
                Ok(outcome.report)
            }
            Err(e) => {
                // Best effort: the record must not stay stuck in `training`.
                if let Err(status_err) = self
                    .store
                    .update_status(record.id, DatasetStatus::Failed)
                    .await
                {
                    warn!(dataset = %record.id, error = %status_err, "failed to mark record failed");
                }
                Err(e)
            }
        }
    }
}
