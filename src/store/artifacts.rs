// Durable index of backup artifacts: run folders with a `backup_info.json`
// manifest each, plus standalone single-database dumps with a JSON sidecar.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{MemoryRepository, Repository};
use crate::errors::{AppError, Result};
use crate::models::{
    ArtifactOwner, BackupArtifact, BatchBackupRun, DatabaseResult, Initiator, RunKind, RunStatus,
};
use crate::utils::format_size;

pub const MANIFEST_FILE: &str = "backup_info.json";
pub const STANDALONE_DIR: &str = "standalone";
pub const ARTIFACT_EXTENSION: &str = "bak";

/// On-disk summary of a batch run; the source of truth after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub databases: Vec<String>,
    pub total_size: String,
    #[serde(default)]
    pub total_size_bytes: u64,
    pub status: RunStatus,
    pub initiator: Initiator,
    #[serde(default = "default_kind")]
    pub kind: RunKind,
    #[serde(default)]
    pub configuration_id: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Vec<DatabaseResult>,
    #[serde(default)]
    pub artifacts: Vec<ManifestArtifact>,
    #[serde(default)]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestArtifact {
    pub id: String,
    pub database: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub owner: Option<ArtifactOwner>,
}

fn default_kind() -> RunKind {
    RunKind::Manual
}

impl RunManifest {
    pub fn from_run(run: &BatchBackupRun) -> Self {
        Self {
            id: Some(run.id.clone()),
            timestamp: run.started_at,
            databases: run.databases.clone(),
            total_size: format_size(run.total_size_bytes),
            total_size_bytes: run.total_size_bytes,
            status: run.status,
            initiator: run.initiator.clone(),
            kind: run.kind,
            configuration_id: run.configuration_id.clone(),
            finished_at: run.finished_at,
            results: run.results.clone(),
            artifacts: run
                .artifacts
                .iter()
                .map(|a| ManifestArtifact {
                    id: a.id.clone(),
                    database: a.database.clone(),
                    file_name: a.file_name.clone(),
                    size_bytes: a.size_bytes,
                    created_at: a.created_at,
                    owner: a.owner.clone(),
                })
                .collect(),
            failure: run.failure.clone(),
        }
    }

    /// Rebuilds the run record. Artifacts whose file has disappeared are dropped.
    /// Manifests written before ids were recorded fall back to the folder name.
    fn run_id(&self, folder: &Path) -> String {
        self.id.clone().unwrap_or_else(|| {
            folder
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }

    fn into_run(self, folder: &Path) -> BatchBackupRun {
        let id = self.run_id(folder);
        let kind = self.kind;
        let artifacts = self
            .artifacts
            .into_iter()
            .filter_map(|a| {
                let path = folder.join(&a.file_name);
                if !path.is_file() {
                    warn!(run_id = %id, file = %path.display(), "Artifact listed in manifest is missing on disk");
                    return None;
                }
                Some(BackupArtifact {
                    id: a.id,
                    run_id: Some(id.clone()),
                    database: a.database,
                    file_name: a.file_name,
                    path,
                    size_bytes: a.size_bytes,
                    created_at: a.created_at,
                    origin: kind,
                    owner: a.owner,
                })
            })
            .collect();

        let (status, failure) = if self.status == RunStatus::InProgress {
            (
                RunStatus::Failed,
                Some("interrupted before completion".to_string()),
            )
        } else {
            (self.status, self.failure)
        };

        BatchBackupRun {
            id,
            kind,
            configuration_id: self.configuration_id,
            started_at: self.timestamp,
            finished_at: self.finished_at,
            databases: self.databases,
            status,
            total_size_bytes: self.total_size_bytes,
            folder: folder.to_path_buf(),
            artifacts,
            results: self.results,
            initiator: self.initiator,
            failure,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub runs: usize,
    pub artifacts: usize,
    pub skipped: Vec<PathBuf>,
}

pub struct ArtifactStore {
    root: PathBuf,
    runs: Arc<dyn Repository<BatchBackupRun>>,
    artifacts: Arc<dyn Repository<BackupArtifact>>,
}

impl ArtifactStore {
    pub fn new(
        root: PathBuf,
        runs: Arc<dyn Repository<BatchBackupRun>>,
        artifacts: Arc<dyn Repository<BackupArtifact>>,
    ) -> Self {
        Self {
            root,
            runs,
            artifacts,
        }
    }

    pub fn in_memory(root: PathBuf) -> Self {
        Self::new(
            root,
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn standalone_dir(&self) -> PathBuf {
        self.root.join(STANDALONE_DIR)
    }

    /// Creates the dedicated folder for a run. Fails if it already exists.
    pub async fn create_run_folder(&self, run_id: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| AppError::file_system(&self.root, e))?;
        let folder = self.root.join(run_id);
        tokio::fs::create_dir(&folder)
            .await
            .map_err(|e| AppError::file_system(&folder, e))?;
        debug!(folder = %folder.display(), "Created run folder");
        Ok(folder)
    }

    pub async fn ensure_standalone_dir(&self) -> Result<PathBuf> {
        let dir = self.standalone_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::file_system(&dir, e))?;
        Ok(dir)
    }

    /// Stores the run and every artifact it lists.
    pub fn record_run(&self, run: &BatchBackupRun) {
        for artifact in &run.artifacts {
            self.artifacts.upsert(artifact.clone());
        }
        self.runs.upsert(run.clone());
    }

    pub fn update_run(
        &self,
        id: &str,
        mut f: impl FnMut(&mut BatchBackupRun),
    ) -> Option<BatchBackupRun> {
        self.runs.update(id, &mut f)
    }

    pub fn run(&self, id: &str) -> Option<BatchBackupRun> {
        self.runs.get(id)
    }

    /// Newest first.
    pub fn runs(&self) -> Vec<BatchBackupRun> {
        let mut runs = self.runs.list();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs
    }

    pub fn record_artifact(&self, artifact: BackupArtifact) {
        self.artifacts.upsert(artifact);
    }

    pub fn artifact(&self, id: &str) -> Option<BackupArtifact> {
        self.artifacts.get(id)
    }

    /// Newest first.
    pub fn artifacts(&self) -> Vec<BackupArtifact> {
        let mut artifacts = self.artifacts.list();
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        artifacts
    }

    pub async fn write_manifest(&self, run: &BatchBackupRun) -> Result<()> {
        let manifest = RunManifest::from_run(run);
        let body = serde_json::to_vec_pretty(&manifest)?;
        let target = run.folder.join(MANIFEST_FILE);
        let staging = run.folder.join(format!("{}.tmp", MANIFEST_FILE));
        tokio::fs::write(&staging, body)
            .await
            .map_err(|e| AppError::file_system(&staging, e))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| AppError::file_system(&target, e))?;
        Ok(())
    }

    /// Writes the JSON sidecar that lets a standalone artifact survive a restart.
    pub async fn write_sidecar(&self, artifact: &BackupArtifact) -> Result<()> {
        let path = artifact.path.with_extension("json");
        let body = serde_json::to_vec_pretty(artifact)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| AppError::file_system(&path, e))
    }

    /// Deletes one artifact's file and its record. A file that is already gone is not an error.
    pub async fn delete_artifact(&self, id: &str) -> Result<BackupArtifact> {
        let artifact = self
            .artifacts
            .get(id)
            .ok_or_else(|| AppError::not_found("artifact", id))?;
        remove_path(&artifact.path)
            .await
            .map_err(|e| AppError::file_system(&artifact.path, e))?;
        if artifact.run_id.is_none() {
            let sidecar = artifact.path.with_extension("json");
            remove_path(&sidecar)
                .await
                .map_err(|e| AppError::file_system(&sidecar, e))?;
        }
        self.artifacts.remove(id);
        if let Some(run_id) = &artifact.run_id {
            self.runs.update(run_id, &mut |run| {
                run.artifacts.retain(|a| a.id != artifact.id);
            });
        }
        info!(artifact_id = %id, path = %artifact.path.display(), "Deleted backup artifact");
        Ok(artifact)
    }

    /// Deletes a finished run's folder, its record and the records of its artifacts.
    pub async fn delete_run(&self, id: &str) -> Result<BatchBackupRun> {
        let run = self
            .runs
            .get(id)
            .ok_or_else(|| AppError::not_found("backup run", id))?;
        if !run.status.is_terminal() {
            return Err(AppError::Conflict(format!("backup run '{}' is still in progress", id)));
        }
        remove_path(&run.folder)
            .await
            .map_err(|e| AppError::file_system(&run.folder, e))?;
        self.forget_run(&run);
        info!(run_id = %id, folder = %run.folder.display(), "Deleted backup run");
        Ok(run)
    }

    pub(crate) fn forget_run(&self, run: &BatchBackupRun) {
        for artifact in &run.artifacts {
            self.artifacts.remove(&artifact.id);
        }
        self.runs.remove(&run.id);
    }

    pub(crate) fn forget_artifact(&self, id: &str) {
        self.artifacts.remove(id);
    }

    /// Rebuilds run and artifact records from the backup root.
    ///
    /// Folders without a readable manifest and sidecars that fail to parse are
    /// skipped with a warning. Runs already held in memory are left alone, so a
    /// live run is never mistaken for an interrupted one.
    ///
    /// Blocking: walks the directory with `std::fs`.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if !self.root.exists() {
            info!(root = %self.root.display(), "Backup root does not exist yet, nothing to reconcile");
            return Ok(report);
        }

        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Failed to read entry under backup root");
                    continue;
                }
            };
            if !entry.file_type().is_dir() || entry.file_name() == STANDALONE_DIR {
                continue;
            }
            let folder = entry.path();
            let manifest_path = folder.join(MANIFEST_FILE);
            match read_manifest(&manifest_path) {
                Ok(manifest) if self.runs.get(&manifest.run_id(folder)).is_some() => {
                    debug!(folder = %folder.display(), "Run already known, keeping the in-memory record");
                }
                Ok(manifest) => {
                    let run = manifest.into_run(folder);
                    report.artifacts += run.artifacts.len();
                    report.runs += 1;
                    self.record_run(&run);
                }
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "Skipping run folder with unreadable manifest");
                    report.skipped.push(manifest_path);
                }
            }
        }

        let standalone = self.standalone_dir();
        if standalone.is_dir() {
            for entry in WalkDir::new(&standalone).min_depth(1).max_depth(1) {
                let Ok(entry) = entry else { continue };
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_sidecar(path) {
                    Ok(artifact) if artifact.path.is_file() => {
                        self.artifacts.upsert(artifact);
                        report.artifacts += 1;
                    }
                    Ok(artifact) => {
                        warn!(path = %artifact.path.display(), "Standalone artifact file is missing, ignoring its sidecar");
                        report.skipped.push(path.to_path_buf());
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable artifact sidecar");
                        report.skipped.push(path.to_path_buf());
                    }
                }
            }
        }

        info!(
            runs = report.runs,
            artifacts = report.artifacts,
            skipped = report.skipped.len(),
            "Reconciled backup root {}",
            self.root.display()
        );
        Ok(report)
    }
}

fn read_manifest(path: &Path) -> Result<RunManifest> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

fn read_sidecar(path: &Path) -> Result<BackupArtifact> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

/// Removes a file or directory tree. Returns `Ok(false)` if nothing was there.
pub(crate) async fn remove_path(path: &Path) -> std::io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
