//! Core types, traits, and errors for patchseg
//!
//! This crate contains the foundational types shared across all patchseg
//! components: dataset identifiers and status lifecycle, the record/blob/
//! artifact types exchanged with the dataset store, the error taxonomy, and
//! the [`DatasetStore`] boundary behind which all persistence lives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Unique identifier for a dataset record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub Uuid);

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DatasetId {
    /// Create a new random dataset ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DatasetId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Dataset lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of a dataset record.
///
/// A record moves `Pending → Training → Ready` on success, or
/// `Pending → Training → Failed` when a run aborts. The store owns the
/// persisted status; the training worker drives the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    /// Uploaded and waiting for a training run.
    Pending,
    /// A training run is in progress.
    Training,
    /// Training finished; a classifier artifact is attached.
    Ready,
    /// The last training run aborted with a terminal error.
    Failed,
}

impl std::fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Training => write!(f, "training"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "training" => Ok(Self::Training),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown dataset status: {s}")),
        }
    }
}

/// A stored dataset record (image bytes are fetched separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Unique identifier for this record.
    pub id: DatasetId,
    /// Human-readable name for the dataset.
    pub name: String,
    /// Current lifecycle status.
    pub status: DatasetStatus,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An encoded image as fetched from the dataset store.
///
/// The bytes are whatever the uploader stored (PNG, typically); decoding and
/// validation happen inside the training pipeline, which skips images it
/// cannot use rather than failing the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlob {
    /// Original file name, used in logs and skip reports.
    pub file_name: String,
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
}

/// A trained classifier artifact, handed to the store unopened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierArtifact {
    /// File name the artifact should be stored under.
    pub file_name: String,
    /// Serialized inference graph bytes.
    pub bytes: Vec<u8>,
}

/// Summary of one completed training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Images that contributed patches to the training tables.
    pub images_accepted: usize,
    /// Images skipped (non-RGBA, undecodable, degenerate geometry).
    pub images_skipped: usize,
    /// Total patches across all accepted images.
    pub patches_total: usize,
    /// Patches surviving the clean-subset filter.
    pub patches_clean: usize,
    /// Embedding dimension reported by the feature extractor.
    pub feature_dim: usize,
    /// Optimizer epochs actually run before convergence or the cap.
    pub epochs_run: usize,
    /// Final training loss.
    pub final_loss: f64,
}

impl std::fmt::Display for TrainingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "images={}/{} patches={} clean={} dim={} epochs={} loss={:.6}",
            self.images_accepted,
            self.images_accepted + self.images_skipped,
            self.patches_total,
            self.patches_clean,
            self.feature_dim,
            self.epochs_run,
            self.final_loss,
        )
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for all patchseg operations.
///
/// Every variant here is terminal for the training run it occurs in.
/// Recoverable per-image conditions (a non-RGBA upload in an otherwise valid
/// batch) are not errors; the pipeline records them as skips and continues.
#[derive(thiserror::Error, Debug)]
pub enum PatchSegError {
    /// Malformed or zero-size image geometry.
    #[error("Invalid image geometry: {0}")]
    InvalidImageGeometry(String),

    /// No usable images, or the clean subset is empty.
    #[error("Insufficient training data: {0}")]
    InsufficientTrainingData(String),

    /// Classifier fitting failed on degenerate statistics.
    #[error("Classifier fit error: {0}")]
    ClassifierFit(String),

    /// Inference graph serialization failed.
    #[error("Graph export error: {0}")]
    GraphExport(String),

    /// The feature extractor violated its shape contract or failed to run.
    #[error("Feature extractor error: {0}")]
    Extractor(String),

    /// Dataset store error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, PatchSegError>`.
pub type Result<T> = std::result::Result<T, PatchSegError>;

// ---------------------------------------------------------------------------
// Dataset store boundary
// ---------------------------------------------------------------------------

/// Persistence boundary for dataset records, image blobs, and artifacts.
///
/// The training worker is generic over this trait; production deployments
/// back it with a real datastore, tests use [`InMemoryDatasetStore`]. The
/// training core itself never touches the store: blobs go in, artifact bytes
/// come out.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// List records currently in [`DatasetStatus::Pending`], oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<DatasetRecord>>;

    /// Fetch all image blobs attached to a record.
    async fn fetch_images(&self, id: DatasetId) -> Result<Vec<ImageBlob>>;

    /// Update the lifecycle status of a record.
    async fn update_status(&self, id: DatasetId, status: DatasetStatus) -> Result<()>;

    /// Attach a classifier artifact to a record.
    ///
    /// The bytes are stored verbatim; the store never inspects them.
    async fn put_artifact(&self, id: DatasetId, artifact: ClassifierArtifact) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store (testing)
// ---------------------------------------------------------------------------

/// One dataset held by [`InMemoryDatasetStore`].
#[derive(Debug, Clone)]
struct StoredDataset {
    record: DatasetRecord,
    images: Vec<ImageBlob>,
    artifact: Option<ClassifierArtifact>,
}

/// In-memory dataset store for testing.
///
/// Data is lost when the struct is dropped. All methods are `O(n)` linear
/// scans. Not intended for production use.
#[derive(Default)]
pub struct InMemoryDatasetStore {
    datasets: RwLock<HashMap<DatasetId, StoredDataset>>,
}

impl InMemoryDatasetStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending record with the given images, returning its ID.
    pub async fn insert_dataset(&self, name: &str, images: Vec<ImageBlob>) -> DatasetId {
        let id = DatasetId::new();
        let now = Utc::now();
        let record = DatasetRecord {
            id,
            name: name.to_string(),
            status: DatasetStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.datasets.write().await.insert(
            id,
            StoredDataset {
                record,
                images,
                artifact: None,
            },
        );
        id
    }

    /// Current status of a record, if it exists.
    pub async fn status(&self, id: DatasetId) -> Option<DatasetStatus> {
        self.datasets
            .read()
            .await
            .get(&id)
            .map(|d| d.record.status)
    }

    /// The stored artifact for a record, if any.
    pub async fn artifact(&self, id: DatasetId) -> Option<ClassifierArtifact> {
        self.datasets
            .read()
            .await
            .get(&id)
            .and_then(|d| d.artifact.clone())
    }
}

#[async_trait]
impl DatasetStore for InMemoryDatasetStore {
    async fn list_pending(&self, limit: usize) -> Result<Vec<DatasetRecord>> {
        let datasets = self.datasets.read().await;
        let mut pending: Vec<DatasetRecord> = datasets
            .values()
            .filter(|d| d.record.status == DatasetStatus::Pending)
            .map(|d| d.record.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn fetch_images(&self, id: DatasetId) -> Result<Vec<ImageBlob>> {
        let datasets = self.datasets.read().await;
        datasets
            .get(&id)
            .map(|d| d.images.clone())
            .ok_or_else(|| PatchSegError::Storage(format!("dataset not found: {id}")))
    }

    async fn update_status(&self, id: DatasetId, status: DatasetStatus) -> Result<()> {
        let mut datasets = self.datasets.write().await;
        let dataset = datasets
            .get_mut(&id)
            .ok_or_else(|| PatchSegError::Storage(format!("dataset not found: {id}")))?;
        dataset.record.status = status;
        dataset.record.updated_at = Utc::now();
        Ok(())
    }

    async fn put_artifact(&self, id: DatasetId, artifact: ClassifierArtifact) -> Result<()> {
        let mut datasets = self.datasets.write().await;
        let dataset = datasets
            .get_mut(&id)
            .ok_or_else(|| PatchSegError::Storage(format!("dataset not found: {id}")))?;
        dataset.artifact = Some(artifact);
        dataset.record.updated_at = Utc::now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
