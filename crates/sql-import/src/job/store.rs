//! Job persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use super::Job;
use crate::error::{ImportError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Where jobs are kept between runs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job.
    async fn save(&self, job: &Job) -> Result<()>;

    /// Load a job; fails with `NotFound` for an unknown id.
    async fn load(&self, id: &str) -> Result<Job>;

    /// All jobs, newest first.
    async fn list(&self) -> Result<Vec<Job>>;
}

/// Jobs as signed JSON files, one per job.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    /// Use `dir`, creating it when missing.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ImportError::NotFound(format!("job {}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read(path: &Path) -> Result<Job> {
        let content = tokio::fs::read_to_string(path).await?;
        let job: Job = serde_json::from_str(&content)?;
        match &job.hmac {
            Some(stored) if *stored == compute_hmac(&job)? => Ok(job),
            Some(_) => Err(ImportError::State(format!(
                "job file {} failed its integrity check (HMAC mismatch)",
                path.display()
            ))),
            None => Err(ImportError::State(format!(
                "job file {} is not signed",
                path.display()
            ))),
        }
    }
}

/// HMAC-SHA256 over the job without its signature, keyed by the snapshot
/// hash (or the job id before the job has started).
fn compute_hmac(job: &Job) -> Result<String> {
    let mut unsigned = job.clone();
    unsigned.hmac = None;
    let content = serde_json::to_string(&unsigned)?;

    let key = match &job.snapshot {
        Some(snapshot) => snapshot.hash(),
        None => job.id.clone(),
    };
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| ImportError::State(format!("Failed to create HMAC: {}", e)))?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let path = self.path(&job.id)?;
        let mut signed = job.clone();
        signed.hmac = Some(compute_hmac(job)?);
        let content = serde_json::to_string_pretty(&signed)?;

        // Atomic write: temp file, then rename
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        debug!("Saved job {} to {}", job.id, path.display());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Job> {
        let path = self.path(id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(ImportError::NotFound(format!("job {}", id)));
        }
        Self::read(&path).await
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

/// Jobs held in memory only.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ImportError::NotFound(format!("job {}", id)))
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KeyValue;
    use crate::job::{JobState, LogLevel};
    use crate::mapping::{FieldRule, Mapping};

    fn job() -> Job {
        let mapping = Mapping::new("customers", "legacy", "Customers", "res.partner")
            .with_rules(vec![FieldRule::direct("CustomerName", "name")]);
        let mut job = Job::new("customers");
        job.snapshot = Some(mapping.snapshot());
        job.state = JobState::Cancelled;
        job.total_records = 3;
        job.record_success(KeyValue::Int(1));
        job.log(LogLevel::Info, "Starting import job");
        job
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path().join("jobs")).unwrap();
        let job = job();
        store.save(&job).await.unwrap();

        let loaded = store.load(&job.id).await.unwrap();
        assert_eq!(loaded.state, JobState::Cancelled);
        assert_eq!(loaded.cursor, Some(KeyValue::Int(1)));
        assert_eq!(loaded.snapshot, job.snapshot);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        let job = job();
        store.save(&job).await.unwrap();

        let path = dir.path().join(format!("{}.json", job.id));
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(
            &path,
            content.replace("\"imported_records\": 1", "\"imported_records\": 3"),
        )
        .unwrap();

        let err = store.load(&job.id).await.unwrap_err();
        assert!(matches!(err, ImportError::State(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load("0000").await,
            Err(ImportError::NotFound(_))
        ));
        assert!(matches!(
            store.load("../etc/passwd").await,
            Err(ImportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryJobStore::new();
        let job = job();
        store.save(&job).await.unwrap();
        assert_eq!(store.load(&job.id).await.unwrap().imported_records, 1);
        assert!(store.load("missing").await.is_err());
    }
}
