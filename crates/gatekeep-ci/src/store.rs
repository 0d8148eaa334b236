//! Run persistence.
//!
//! A suspended run survives the process that created it: the service saves
//! after every transition and reloads on a clearance decision. Every load
//! re-checks the stored graph against its recorded digest.
//!
//! Updates to an existing run go through [`RunStore::lock`] and
//! [`RunStore::save_if_unchanged`]: the lock serializes writers across tasks
//! and processes, and the version check refuses a write whose base was
//! replaced underneath it.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use gatekeep_core::PipelineRun;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::{ExecutionError, ExecutionResult};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run: &PipelineRun) -> ExecutionResult<()>;

    /// # Errors
    ///
    /// [`ExecutionError::RunNotFound`] if nothing was saved under `run_id`;
    /// a configuration error if the stored run fails its integrity check.
    async fn load(&self, run_id: Uuid) -> ExecutionResult<PipelineRun>;

    async fn list(&self) -> ExecutionResult<Vec<Uuid>>;

    /// Take the exclusive update lock for one run. Waits while another
    /// holder has it.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::RunNotFound`] if nothing was saved under `run_id`.
    async fn lock(&self, run_id: Uuid) -> ExecutionResult<RunLock>;

    /// Save `run` only if the stored copy still has `expected_events` events.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Conflict`] when another writer got there first.
    async fn save_if_unchanged(
        &self,
        run: &PipelineRun,
        expected_events: usize,
    ) -> ExecutionResult<()>;
}

/// Exclusive hold on one run, released on drop.
pub struct RunLock {
    _held: Box<dyn Send + Sync>,
}

impl RunLock {
    fn new(held: impl Send + Sync + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").finish_non_exhaustive()
    }
}

fn decode(run_id: Uuid, json: &str) -> ExecutionResult<PipelineRun> {
    let run: PipelineRun = serde_json::from_str(json)?;
    if run.run_id() != run_id {
        return Err(ExecutionError::RunNotFound(run_id));
    }
    run.verify_integrity()?;
    Ok(run)
}

fn check_version(run_id: Uuid, stored: &str, expected: usize) -> ExecutionResult<()> {
    let found = serde_json::from_str::<PipelineRun>(stored)?.events().len();
    if found != expected {
        return Err(ExecutionError::Conflict {
            run_id,
            expected,
            found,
        });
    }
    Ok(())
}

fn write_atomic(dir: &Path, path: &Path, json: &[u8]) -> ExecutionResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// One JSON document per run under a directory: `<dir>/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct FsRunStore {
    dir: PathBuf,
}

impl FsRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> ExecutionResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn lock_path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.lock"))
    }
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn save(&self, run: &PipelineRun) -> ExecutionResult<()> {
        let json = serde_json::to_vec_pretty(run)?;
        let dir = self.dir.clone();
        let path = self.path_for(run.run_id());

        // Write to a temp file in the same directory, then rename.
        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &json))
            .await
            .map_err(|e| ExecutionError::Task(e.to_string()))?
    }

    async fn load(&self, run_id: Uuid) -> ExecutionResult<PipelineRun> {
        let json = match tokio::fs::read_to_string(self.path_for(run_id)).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecutionError::RunNotFound(run_id));
            }
            Err(e) => return Err(e.into()),
        };
        decode(run_id, &json)
    }

    async fn list(&self) -> ExecutionResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn lock(&self, run_id: Uuid) -> ExecutionResult<RunLock> {
        if !tokio::fs::try_exists(self.path_for(run_id)).await? {
            return Err(ExecutionError::RunNotFound(run_id));
        }
        let lock_path = self.lock_path_for(run_id);
        let file = tokio::task::spawn_blocking(move || -> ExecutionResult<File> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(|e| ExecutionError::Task(e.to_string()))??;
        Ok(RunLock::new(file))
    }

    async fn save_if_unchanged(
        &self,
        run: &PipelineRun,
        expected_events: usize,
    ) -> ExecutionResult<()> {
        let run_id = run.run_id();
        let json = serde_json::to_vec_pretty(run)?;
        let dir = self.dir.clone();
        let path = self.path_for(run_id);

        tokio::task::spawn_blocking(move || -> ExecutionResult<()> {
            let stored = match std::fs::read_to_string(&path) {
                Ok(stored) => stored,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ExecutionError::RunNotFound(run_id));
                }
                Err(e) => return Err(e.into()),
            };
            check_version(run_id, &stored, expected_events)?;
            write_atomic(&dir, &path, &json)
        })
        .await
        .map_err(|e| ExecutionError::Task(e.to_string()))?
    }
}

/// In-memory store. Runs are kept serialized so loads exercise the same
/// decode path as the filesystem store.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<BTreeMap<Uuid, String>>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, BTreeMap<Uuid, String>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, run: &PipelineRun) -> ExecutionResult<()> {
        let json = serde_json::to_string(run)?;
        self.runs().insert(run.run_id(), json);
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> ExecutionResult<PipelineRun> {
        let json = self
            .runs()
            .get(&run_id)
            .cloned()
            .ok_or(ExecutionError::RunNotFound(run_id))?;
        decode(run_id, &json)
    }

    async fn list(&self) -> ExecutionResult<Vec<Uuid>> {
        Ok(self.runs().keys().copied().collect())
    }

    async fn lock(&self, run_id: Uuid) -> ExecutionResult<RunLock> {
        if !self.runs().contains_key(&run_id) {
            return Err(ExecutionError::RunNotFound(run_id));
        }
        let slot = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(run_id).or_default())
        };
        Ok(RunLock::new(slot.lock_owned().await))
    }

    async fn save_if_unchanged(
        &self,
        run: &PipelineRun,
        expected_events: usize,
    ) -> ExecutionResult<()> {
        let run_id = run.run_id();
        let json = serde_json::to_string(run)?;
        let mut runs = self.runs();
        let stored = runs
            .get(&run_id)
            .ok_or(ExecutionError::RunNotFound(run_id))?;
        check_version(run_id, stored, expected_events)?;
        runs.insert(run_id, json);
        Ok(())
    }
}
