// Test doubles for the engine-facing seams.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::backup::runner::{BackupRunner, Outcome};
use crate::catalog::DatabaseCatalog;
use crate::errors::{AppError, Result};
use crate::models::Credential;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Backup { database: String, as_user: String },
    Restore { database: String, as_user: String },
}

/// Runner that writes `size` bytes per successful backup and fails on demand.
#[derive(Default)]
pub struct FakeRunner {
    sizes: HashMap<String, usize>,
    failing_backups: HashSet<String>,
    failing_restores: HashSet<String>,
    panicking_restores: HashSet<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, database: &str, size: usize) -> Self {
        self.sizes.insert(database.to_string(), size);
        self
    }

    pub fn failing_backup(mut self, database: &str) -> Self {
        self.failing_backups.insert(database.to_string());
        self
    }

    pub fn failing_restore(mut self, database: &str) -> Self {
        self.failing_restores.insert(database.to_string());
        self
    }

    pub fn panicking_restore(mut self, database: &str) -> Self {
        self.panicking_restores.insert(database.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BackupRunner for FakeRunner {
    async fn backup(&self, database: &str, destination: &Path, credential: &Credential) -> Outcome {
        self.calls.lock().push(Call::Backup {
            database: database.to_string(),
            as_user: credential.username.clone(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_backups.contains(database) {
            return Outcome::failure(format!("pg_dump of {} exited with exit status: 1", database));
        }
        let size = self.sizes.get(database).copied().unwrap_or(16);
        match tokio::fs::write(destination, vec![b'x'; size]).await {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::failure(e.to_string()),
        }
    }

    async fn restore(&self, database: &str, _source: &Path, credential: &Credential) -> Outcome {
        self.calls.lock().push(Call::Restore {
            database: database.to_string(),
            as_user: credential.username.clone(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panicking_restores.contains(database) {
            panic!("restore of {} blew up", database);
        }
        if self.failing_restores.contains(database) {
            return Outcome::failure(format!("pg_restore of {} exited with exit status: 1", database));
        }
        Outcome::Success
    }
}

/// Catalog backed by a map of database name to owner login.
#[derive(Default)]
pub struct FakeCatalog {
    databases: Mutex<BTreeMap<String, Option<String>>>,
    unreachable: AtomicBool,
}

impl FakeCatalog {
    pub fn new(databases: &[&str]) -> Self {
        Self {
            databases: Mutex::new(databases.iter().map(|d| (d.to_string(), None)).collect()),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn databases(&self) -> Vec<String> {
        self.databases.lock().keys().cloned().collect()
    }

    pub fn owner_of(&self, database: &str) -> Option<String> {
        self.databases.lock().get(database).cloned().flatten()
    }
}

#[async_trait]
impl DatabaseCatalog for FakeCatalog {
    async fn list_databases(&self) -> Result<Vec<String>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::Config("engine unreachable".to_string()));
        }
        Ok(self.databases())
    }

    async fn ensure_database(&self, name: &str, owner: Option<&str>) -> Result<bool> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::Config("engine unreachable".to_string()));
        }
        let mut dbs = self.databases.lock();
        if dbs.contains_key(name) {
            return Ok(false);
        }
        dbs.insert(name.to_string(), owner.map(str::to_string));
        Ok(true)
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.databases.lock().remove(name);
        Ok(())
    }
}
