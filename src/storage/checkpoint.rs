use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cli::config::StorageSettings;
use crate::crawler::task::{CrawlState, ErrorRecord, JobId};
use crate::storage::{RedisCheckpointStore, StoreError};

/// Durable job progress plus the shared error log
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the latest snapshot of a job. Readers never see a partial write.
    async fn save(&self, state: &CrawlState) -> Result<(), StoreError>;

    async fn load(&self, job_id: &JobId) -> Result<Option<CrawlState>, StoreError>;

    /// Append to the error log. Records are never rewritten.
    async fn append_error(&self, record: &ErrorRecord) -> Result<(), StoreError>;

    /// Error records in append order, optionally for one job
    async fn errors(&self, job_id: Option<&JobId>) -> Result<Vec<ErrorRecord>, StoreError>;

    /// Ids of every job with a checkpoint
    async fn list(&self) -> Result<Vec<JobId>, StoreError>;
}

/// Factory for creating a checkpoint store from the settings
pub struct CheckpointStoreFactory;

impl CheckpointStoreFactory {
    pub async fn create(settings: &StorageSettings) -> Result<Arc<dyn CheckpointStore>, StoreError> {
        match settings.storage_type.as_str() {
            "memory" => Ok(Arc::new(MemoryCheckpointStore::new())),
            "filesystem" => Ok(Arc::new(FileCheckpointStore::open(&settings.path).await?)),
            "redis" => Ok(Arc::new(
                RedisCheckpointStore::connect(&settings.redis_url, &settings.key_prefix).await?,
            )),
            other => Err(StoreError::Unsupported(other.to_string())),
        }
    }
}

/// In-process store for tests and embedded use
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<JobId, CrawlState>>,
    errors: RwLock<Vec<ErrorRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, state: &CrawlState) -> Result<(), StoreError> {
        self.checkpoints
            .write()
            .await
            .insert(state.job_id().clone(), state.clone());
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> Result<Option<CrawlState>, StoreError> {
        Ok(self.checkpoints.read().await.get(job_id).cloned())
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        self.errors.write().await.push(record.clone());
        Ok(())
    }

    async fn errors(&self, job_id: Option<&JobId>) -> Result<Vec<ErrorRecord>, StoreError> {
        let errors = self.errors.read().await;
        Ok(errors
            .iter()
            .filter(|r| job_id.map_or(true, |id| &r.job_id == id))
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<JobId>, StoreError> {
        let mut ids: Vec<JobId> = self.checkpoints.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Directory-backed store: `checkpoints/<job>.json` and a shared `errors.jsonl`
pub struct FileCheckpointStore {
    checkpoint_dir: PathBuf,
    error_log: PathBuf,
    append_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        let checkpoint_dir = root.join("checkpoints");
        fs::create_dir_all(&checkpoint_dir).await?;
        info!("Checkpoint store at {}", root.display());

        Ok(Self {
            checkpoint_dir,
            error_log: root.join("errors.jsonl"),
            append_lock: Mutex::new(()),
        })
    }

    fn checkpoint_path(&self, job_id: &JobId) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.json", job_id.file_stem()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &CrawlState) -> Result<(), StoreError> {
        let path = self.checkpoint_path(state.job_id());
        let temp = self
            .checkpoint_dir
            .join(format!(".{}.tmp", Uuid::new_v4()));

        let contents = serde_json::to_vec_pretty(state)?;
        fs::write(&temp, contents).await?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!("Saved checkpoint for job {} ({} page(s))", state.job_id(), state.pages().len());
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> Result<Option<CrawlState>, StoreError> {
        let path = self.checkpoint_path(job_id);
        let state: CrawlState = match fs::read(&path).await {
            Ok(contents) => serde_json::from_slice(&contents)?,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if state.job_id() != job_id {
            warn!(
                "Checkpoint {} belongs to job {}, not {}",
                path.display(),
                state.job_id(),
                job_id
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.error_log)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn errors(&self, job_id: Option<&JobId>) -> Result<Vec<ErrorRecord>, StoreError> {
        let contents = match fs::read_to_string(&self.error_log).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let record: ErrorRecord = serde_json::from_str(line)?;
            if job_id.map_or(true, |id| &record.job_id == id) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn list(&self) -> Result<Vec<JobId>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.checkpoint_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match fs::read(&path).await.map(|c| serde_json::from_slice::<CrawlState>(&c)) {
                Ok(Ok(state)) => ids.push(state.job_id().clone()),
                Ok(Err(e)) => warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
                Err(e) => warn!("Skipping checkpoint {}: {}", path.display(), e),
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{CrawlJob, JobStatus};
    use crate::error::{CrawlError, ErrorKind};
    use std::collections::BTreeMap;

    fn state(id: &str) -> CrawlState {
        let mut state = CrawlState::new(CrawlJob::new("https://example.com/list?p=1").with_id(id));
        state.set_status(JobStatus::Running);
        state.record_page("https://example.com/list?p=1", BTreeMap::new(), Vec::new(), "first".to_string());
        state
    }

    fn record(id: &str) -> ErrorRecord {
        ErrorRecord::new(&JobId::from(id), "https://example.com/list?p=2", &CrawlError::Timeout(60))
    }

    async fn exercise(store: &dyn CheckpointStore) {
        assert!(store.load(&JobId::from("a")).await.unwrap().is_none());

        let mut a = state("a");
        store.save(&a).await.unwrap();
        store.save(&state("b")).await.unwrap();

        a.advance_to("https://example.com/list?p=2".to_string());
        store.save(&a).await.unwrap();
        let loaded = store.load(&JobId::from("a")).await.unwrap().unwrap();
        assert_eq!(loaded, a);

        store.append_error(&record("a")).await.unwrap();
        store.append_error(&record("b")).await.unwrap();
        store.append_error(&record("a")).await.unwrap();

        assert_eq!(store.errors(None).await.unwrap().len(), 3);
        let for_a = store.errors(Some(&JobId::from("a"))).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|r| r.kind == ErrorKind::Timeout));

        assert_eq!(store.list().await.unwrap(), vec![JobId::from("a"), JobId::from("b")]);
    }

    #[tokio::test]
    async fn memory_store_behaves_like_a_checkpoint_store() {
        exercise(&MemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_behaves_like_a_checkpoint_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        exercise(&store).await;

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("checkpoints"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn file_store_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            store.save(&state("job/with:odd chars")).await.unwrap();
            store.append_error(&record("job/with:odd chars")).await.unwrap();
        }

        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        let id = JobId::from("job/with:odd chars");
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.pages().len(), 1);
        assert_eq!(store.errors(Some(&id)).await.unwrap().len(), 1);
        assert_eq!(store.list().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn ids_differing_only_in_special_characters_keep_separate_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();

        let mut slashed = state("job/a");
        slashed.advance_to("https://example.com/list?p=7".to_string());
        store.save(&slashed).await.unwrap();
        store.save(&state("job_a")).await.unwrap();

        let loaded = store.load(&JobId::from("job/a")).await.unwrap().unwrap();
        assert_eq!(loaded.job_id(), &JobId::from("job/a"));
        assert_eq!(loaded.current_url(), "https://example.com/list?p=7");
        let loaded = store.load(&JobId::from("job_a")).await.unwrap().unwrap();
        assert_eq!(loaded.job_id(), &JobId::from("job_a"));
        assert_eq!(store.list().await.unwrap().len(), 2);

        let escaped = store.load(&JobId::from("../errors")).await.unwrap();
        assert!(escaped.is_none());
    }

    #[tokio::test]
    async fn checkpoints_of_another_job_are_not_returned() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.save(&state("b")).await.unwrap();

        let checkpoints = dir.path().join("checkpoints");
        std::fs::copy(checkpoints.join("b.json"), checkpoints.join("a.json")).unwrap();
        assert!(store.load(&JobId::from("a")).await.unwrap().is_none());
        assert!(store.load(&JobId::from("b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_appends_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.append_error(&record(&format!("job-{}", i))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.errors(None).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn factory_rejects_unknown_backends() {
        let settings = StorageSettings {
            storage_type: "mongodb".to_string(),
            ..StorageSettings::default()
        };
        let err = CheckpointStoreFactory::create(&settings).await.err().unwrap();
        assert!(matches!(err, StoreError::Unsupported(_)));

        let settings = StorageSettings {
            storage_type: "memory".to_string(),
            ..StorageSettings::default()
        };
        assert!(CheckpointStoreFactory::create(&settings).await.is_ok());
    }
}
