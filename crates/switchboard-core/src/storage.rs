//! Tenant persistence and webhook configuration contracts.
//!
//! The gateway reads tenants only to restore sessions on boot and records
//! the latest connection state so the next boot knows which tenants to
//! reconnect. Webhook configs are read per dispatch and never mutated here.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::{CoreError, Result},
    models::{ConnectionState, Tenant, TenantId, WebhookConfig},
};

/// Persistent tenant records.
#[async_trait::async_trait]
pub trait TenantStore: Send + Sync + std::fmt::Debug {
    /// Returns every provisioned tenant.
    async fn get_all(&self) -> Result<Vec<Tenant>>;

    /// Returns one tenant, if provisioned.
    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Tenant>>;

    /// Records the latest connection state and, when known, phone number.
    async fn update_status(
        &self,
        tenant_id: &TenantId,
        status: ConnectionState,
        phone: Option<String>,
    ) -> Result<()>;
}

/// Read access to per-tenant webhook configuration.
#[async_trait::async_trait]
pub trait WebhookConfigProvider: Send + Sync + std::fmt::Debug {
    /// Returns the tenant's webhook config, or `None` if it has none.
    async fn get_by_tenant(&self, tenant_id: &TenantId) -> Result<Option<WebhookConfig>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Records {
    #[serde(default)]
    tenants: Vec<Tenant>,
    #[serde(default)]
    webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Default)]
struct Tables {
    tenants: HashMap<TenantId, Tenant>,
    webhooks: HashMap<TenantId, WebhookConfig>,
}

impl Tables {
    fn from_records(records: Records) -> Self {
        Self {
            tenants: records.tenants.into_iter().map(|t| (t.id.clone(), t)).collect(),
            webhooks: records.webhooks.into_iter().map(|w| (w.tenant_id.clone(), w)).collect(),
        }
    }

    fn to_records(&self) -> Records {
        let mut tenants: Vec<Tenant> = self.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        let mut webhooks: Vec<WebhookConfig> = self.webhooks.values().cloned().collect();
        webhooks.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Records { tenants, webhooks }
    }

    fn sorted_tenants(&self) -> Vec<Tenant> {
        self.to_records().tenants
    }

    /// Records the status and returns the tenant as it was before.
    fn apply_status(
        &mut self,
        tenant_id: &TenantId,
        status: ConnectionState,
        phone: Option<String>,
    ) -> Result<Tenant> {
        let tenant = self.tenants.get_mut(tenant_id).ok_or_else(|| CoreError::not_found(tenant_id))?;
        let previous = tenant.clone();
        tenant.status = status;
        if phone.is_some() {
            tenant.phone = phone;
        }
        Ok(previous)
    }
}

/// In-memory store, used by tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a tenant.
    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.tables.write().await.tenants.insert(tenant.id.clone(), tenant);
    }

    /// Inserts or replaces a tenant's webhook config.
    pub async fn insert_webhook(&self, config: WebhookConfig) {
        self.tables.write().await.webhooks.insert(config.tenant_id.clone(), config);
    }
}

#[async_trait::async_trait]
impl TenantStore for MemoryStore {
    async fn get_all(&self) -> Result<Vec<Tenant>> {
        Ok(self.tables.read().await.sorted_tenants())
    }

    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Tenant>> {
        Ok(self.tables.read().await.tenants.get(tenant_id).cloned())
    }

    async fn update_status(
        &self,
        tenant_id: &TenantId,
        status: ConnectionState,
        phone: Option<String>,
    ) -> Result<()> {
        self.tables.write().await.apply_status(tenant_id, status, phone).map(|_| ())
    }
}

#[async_trait::async_trait]
impl WebhookConfigProvider for MemoryStore {
    async fn get_by_tenant(&self, tenant_id: &TenantId) -> Result<Option<WebhookConfig>> {
        Ok(self.tables.read().await.webhooks.get(tenant_id).cloned())
    }
}

/// JSON file backed store.
///
/// The file holds `{"tenants": [...], "webhooks": [...]}`. It is read once on
/// open and rewritten atomically (temp file plus rename) on every status
/// update. A missing file opens as an empty store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
}

impl FileStore {
    /// Opens the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Records>(&bytes).map_err(|e| {
                CoreError::storage(format!("failed to parse {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "tenant file missing, starting empty");
                Records::default()
            },
            Err(e) => {
                return Err(CoreError::storage(format!("failed to read {}: {e}", path.display())));
            },
        };

        Ok(Self { path, tables: RwLock::new(Tables::from_records(records)) })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&tables.to_records())
            .map_err(|e| CoreError::storage(format!("failed to encode tenants: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CoreError::storage(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            CoreError::storage(format!("failed to replace {}: {e}", self.path.display()))
        })
    }
}

#[async_trait::async_trait]
impl TenantStore for FileStore {
    async fn get_all(&self) -> Result<Vec<Tenant>> {
        Ok(self.tables.read().await.sorted_tenants())
    }

    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Tenant>> {
        Ok(self.tables.read().await.tenants.get(tenant_id).cloned())
    }

    async fn update_status(
        &self,
        tenant_id: &TenantId,
        status: ConnectionState,
        phone: Option<String>,
    ) -> Result<()> {
        // Hold the write lock across the rewrite so concurrent updates land in order.
        let mut tables = self.tables.write().await;
        let previous = tables.apply_status(tenant_id, status, phone)?;
        if let Err(error) = self.persist(&tables).await {
            // Memory never runs ahead of the file.
            tables.tenants.insert(tenant_id.clone(), previous);
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl WebhookConfigProvider for FileStore {
    async fn get_by_tenant(&self, tenant_id: &TenantId) -> Result<Option<WebhookConfig>> {
        Ok(self.tables.read().await.webhooks.get(tenant_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("switchboard-{name}-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn memory_store_records_status() {
        let store = MemoryStore::new();
        store.insert_tenant(Tenant::new("acme", "Acme")).await;

        store
            .update_status(&"acme".into(), ConnectionState::Connected, Some("5511".into()))
            .await
            .unwrap();

        let tenant = store.find(&"acme".into()).await.unwrap().unwrap();
        assert_eq!(tenant.status, ConnectionState::Connected);
        assert_eq!(tenant.phone.as_deref(), Some("5511"));
    }

    #[tokio::test]
    async fn update_status_keeps_phone_when_not_given() {
        let store = MemoryStore::new();
        store.insert_tenant(Tenant::new("acme", "Acme")).await;
        let id = TenantId::from("acme");

        store.update_status(&id, ConnectionState::Connected, Some("5511".into())).await.unwrap();
        store.update_status(&id, ConnectionState::Disconnected, None).await.unwrap();

        let tenant = store.find(&id).await.unwrap().unwrap();
        assert_eq!(tenant.status, ConnectionState::Disconnected);
        assert_eq!(tenant.phone.as_deref(), Some("5511"));
    }

    #[tokio::test]
    async fn update_status_for_unknown_tenant_is_not_found() {
        let store = MemoryStore::new();
        let result = store.update_status(&"ghost".into(), ConnectionState::Connected, None).await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let store = FileStore::open(temp_path("missing")).await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_status_across_reopen() {
        let path = temp_path("reopen");
        let records = serde_json::json!({
            "tenants": [{"id": "acme", "name": "Acme"}, {"id": "beta", "name": "Beta"}],
            "webhooks": [{"tenant_id": "acme", "url": "http://hooks.local/acme"}]
        });
        tokio::fs::write(&path, serde_json::to_vec(&records).unwrap()).await.unwrap();

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 2);
        assert!(store.get_by_tenant(&"acme".into()).await.unwrap().is_some());
        assert!(store.get_by_tenant(&"beta".into()).await.unwrap().is_none());

        store
            .update_status(&"beta".into(), ConnectionState::Connected, Some("5599".into()))
            .await
            .unwrap();
        drop(store);

        let reopened = FileStore::open(&path).await.unwrap();
        let beta = reopened.find(&"beta".into()).await.unwrap().unwrap();
        assert_eq!(beta.status, ConnectionState::Connected);
        assert_eq!(beta.phone.as_deref(), Some("5599"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn failed_write_leaves_status_unchanged() {
        let dir = std::env::temp_dir().join(format!("switchboard-gone-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir(&dir).await.unwrap();
        let path = dir.join("tenants.json");
        let records = serde_json::json!({ "tenants": [{"id": "acme", "name": "Acme"}] });
        tokio::fs::write(&path, serde_json::to_vec(&records).unwrap()).await.unwrap();
        let store = FileStore::open(&path).await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.unwrap();

        let result =
            store.update_status(&"acme".into(), ConnectionState::Connected, Some("5511".into())).await;

        assert!(matches!(result, Err(CoreError::Storage { .. })));
        let acme = store.find(&"acme".into()).await.unwrap().unwrap();
        assert_eq!(acme.status, ConnectionState::Disconnected);
        assert_eq!(acme.phone, None);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_storage_error() {
        let path = temp_path("corrupt");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let result = FileStore::open(&path).await;
        assert!(matches!(result, Err(CoreError::Storage { .. })));

        let _ = tokio::fs::remove_file(&path).await;
    }
}
