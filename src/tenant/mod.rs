//! Tenant ownership of databases, consumed by the orchestrator for
//! permission checks and for running engine commands as the tenant's login.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::DatabaseCatalog;
use crate::errors::{AppError, Result};
use crate::models::{ArtifactOwner, Credential, DatabaseOwnershipRecord};
use crate::utils::clock::Clock;
use crate::utils::identifier::validate_database_name;

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn owns_database(&self, tenant_id: &str, database: &str) -> bool;

    /// Databases owned by the tenant, sorted by name.
    async fn list_owned(&self, tenant_id: &str) -> Vec<String>;

    async fn credentials_for(&self, tenant_id: &str) -> Result<Credential>;

    /// Owner metadata recorded on artifacts. `Ok(None)` for unowned databases.
    async fn owner_of(&self, database: &str) -> Result<Option<ArtifactOwner>>;
}

#[derive(Debug, Clone)]
struct TenantAccount {
    label: String,
    credential: Credential,
    quota_mb: u64,
}

#[derive(Default)]
struct DirectoryState {
    tenants: HashMap<String, TenantAccount>,
    /// database name -> record
    ownership: HashMap<String, DatabaseOwnershipRecord>,
}

impl DirectoryState {
    fn used_quota(&self, tenant_id: &str) -> u64 {
        self.ownership
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.quota_mb)
            .sum()
    }
}

pub struct InMemoryTenantDirectory {
    state: RwLock<DirectoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTenantDirectory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            clock,
        }
    }

    /// Registers a tenant with a total storage quota across all its databases.
    pub fn register_tenant(&self, tenant_id: &str, label: &str, credential: Credential, quota_mb: u64) {
        self.state.write().tenants.insert(
            tenant_id.to_string(),
            TenantAccount {
                label: label.to_string(),
                credential,
                quota_mb,
            },
        );
    }

    pub fn ownership_records(&self, tenant_id: &str) -> Vec<DatabaseOwnershipRecord> {
        let state = self.state.read();
        let mut records: Vec<_> = state
            .ownership
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.database.cmp(&b.database));
        records
    }

    /// Checks that `extra_mb` more quota fits, ignoring `replacing` (the record being resized).
    fn check_quota(
        state: &DirectoryState,
        tenant_id: &str,
        extra_mb: u64,
        replacing: Option<&str>,
    ) -> Result<()> {
        let account = state
            .tenants
            .get(tenant_id)
            .ok_or_else(|| AppError::not_found("tenant", tenant_id))?;
        let mut used = state.used_quota(tenant_id);
        if let Some(db) = replacing.and_then(|db| state.ownership.get(db)) {
            used -= db.quota_mb;
        }
        if used + extra_mb > account.quota_mb {
            return Err(AppError::QuotaExceeded(format!(
                "tenant '{}' would use {} MB of its {} MB quota",
                tenant_id,
                used + extra_mb,
                account.quota_mb
            )));
        }
        Ok(())
    }

    /// Creates the engine database, then its ownership record.
    ///
    /// If the record cannot be stored afterwards the database is dropped again.
    pub async fn provision_database(
        &self,
        catalog: &dyn DatabaseCatalog,
        tenant_id: &str,
        database: &str,
        quota_mb: u64,
    ) -> Result<DatabaseOwnershipRecord> {
        validate_database_name(database)?;
        let owner_login = {
            let state = self.state.read();
            if let Some(existing) = state.ownership.get(database) {
                return Err(AppError::Conflict(format!(
                    "database '{}' is already owned by tenant '{}'",
                    database, existing.tenant_id
                )));
            }
            Self::check_quota(&state, tenant_id, quota_mb, None)?;
            state.tenants[tenant_id].credential.username.clone()
        };

        let created = catalog.ensure_database(database, Some(&owner_login)).await?;

        let now = self.clock.now();
        let stored = {
            let mut state = self.state.write();
            let check = if state.ownership.contains_key(database) {
                Err(AppError::Conflict(format!(
                    "database '{}' was claimed concurrently",
                    database
                )))
            } else {
                Self::check_quota(&state, tenant_id, quota_mb, None)
            };
            check.map(|_| {
                let record = DatabaseOwnershipRecord {
                    tenant_id: tenant_id.to_string(),
                    database: database.to_string(),
                    quota_mb,
                    created_at: now,
                    updated_at: now,
                };
                state.ownership.insert(database.to_string(), record.clone());
                record
            })
        };

        match stored {
            Ok(record) => {
                info!(tenant_id, database, quota_mb, "Provisioned tenant database");
                Ok(record)
            }
            Err(e) => {
                if created {
                    if let Err(drop_err) = catalog.drop_database(database).await {
                        warn!(database, error = %drop_err, "Failed to roll back database after provisioning error");
                    }
                }
                Err(e)
            }
        }
    }

    pub fn resize_database(&self, tenant_id: &str, database: &str, quota_mb: u64) -> Result<DatabaseOwnershipRecord> {
        let now = self.clock.now();
        let mut state = self.state.write();
        match state.ownership.get(database) {
            Some(record) if record.tenant_id == tenant_id => {}
            Some(_) => {
                return Err(AppError::PermissionDenied(format!(
                    "tenant '{}' does not own database '{}'",
                    tenant_id, database
                )));
            }
            None => return Err(AppError::not_found("database", database)),
        }
        Self::check_quota(&state, tenant_id, quota_mb, Some(database))?;
        let record = state
            .ownership
            .get_mut(database)
            .ok_or_else(|| AppError::not_found("database", database))?;
        record.quota_mb = quota_mb;
        record.updated_at = now;
        Ok(record.clone())
    }

    /// Drops the engine database, then forgets its ownership record.
    pub async fn deprovision_database(
        &self,
        catalog: &dyn DatabaseCatalog,
        tenant_id: &str,
        database: &str,
    ) -> Result<()> {
        {
            let state = self.state.read();
            match state.ownership.get(database) {
                Some(record) if record.tenant_id == tenant_id => {}
                Some(_) => {
                    return Err(AppError::PermissionDenied(format!(
                        "tenant '{}' does not own database '{}'",
                        tenant_id, database
                    )));
                }
                None => return Err(AppError::not_found("database", database)),
            }
        }
        catalog.drop_database(database).await?;
        self.state.write().ownership.remove(database);
        info!(tenant_id, database, "Deprovisioned tenant database");
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn owns_database(&self, tenant_id: &str, database: &str) -> bool {
        self.state
            .read()
            .ownership
            .get(database)
            .is_some_and(|r| r.tenant_id == tenant_id)
    }

    async fn list_owned(&self, tenant_id: &str) -> Vec<String> {
        self.ownership_records(tenant_id)
            .into_iter()
            .map(|r| r.database)
            .collect()
    }

    async fn credentials_for(&self, tenant_id: &str) -> Result<Credential> {
        self.state
            .read()
            .tenants
            .get(tenant_id)
            .map(|t| t.credential.clone())
            .ok_or_else(|| AppError::not_found("tenant", tenant_id))
    }

    async fn owner_of(&self, database: &str) -> Result<Option<ArtifactOwner>> {
        let state = self.state.read();
        let Some(record) = state.ownership.get(database) else {
            return Ok(None);
        };
        let account = state.tenants.get(&record.tenant_id).ok_or_else(|| {
            AppError::NotFound(format!(
                "tenant '{}' owning '{}' is not registered",
                record.tenant_id, database
            ))
        })?;
        Ok(Some(ArtifactOwner {
            tenant_id: record.tenant_id.clone(),
            label: account.label.clone(),
        }))
    }
}
