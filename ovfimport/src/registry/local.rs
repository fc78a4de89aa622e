//! SQLite-backed machine registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use ovfimport_shared::errors::{ImportError, ImportResult};

use super::{
    AttachmentSlot, ControllerSpec, DeviceSettings, MachineId, MachineRegistry, MachineSettings,
    MachineSpec, MediumAttachment,
};
use crate::db::{Database, MachineRecord, MachineStore};

/// Settings file written into every machine folder.
pub const SETTINGS_FILE: &str = "settings.json";

/// Persistent machine registry.
///
/// Machines live in an in-memory cache backed by the `machines` table. Every
/// mutation is written to the database before the cache changes. Attach,
/// detach and unregister of one machine are serialized by a per-machine lock.
#[derive(Clone)]
pub struct LocalRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    machine_locks: Arc<parking_lot::Mutex<HashMap<MachineId, Arc<tokio::sync::Mutex<()>>>>>,
}

struct RegistryInner {
    machines: HashMap<MachineId, MachineRecord>,
    store: MachineStore,
}

impl std::fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegistry").finish()
    }
}

impl LocalRegistry {
    /// Open the registry database at `db_path`, loading existing machines.
    pub fn open(db_path: &Path) -> ImportResult<Self> {
        let db = Database::open(db_path).map_err(|e| {
            ImportError::Database(format!(
                "failed to open registry at {}: {}",
                db_path.display(),
                e
            ))
        })?;
        Self::with_store(MachineStore::new(db))
    }

    pub fn in_memory() -> ImportResult<Self> {
        Self::with_store(MachineStore::new(Database::open_in_memory()?))
    }

    fn with_store(store: MachineStore) -> ImportResult<Self> {
        let machines: HashMap<MachineId, MachineRecord> = store
            .list()?
            .into_iter()
            .map(|record| (record.id, record))
            .collect();

        tracing::debug!(machines = machines.len(), "Loaded machine registry");

        Ok(Self {
            inner: Arc::new(RwLock::new(RegistryInner { machines, store })),
            machine_locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        })
    }

    pub fn get(&self, id: &MachineId) -> ImportResult<Option<MachineRecord>> {
        let inner = self.read()?;
        Ok(inner.machines.get(id).cloned())
    }

    pub fn list(&self) -> ImportResult<Vec<MachineRecord>> {
        let inner = self.read()?;
        let mut records: Vec<MachineRecord> = inner.machines.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    pub fn registered(&self) -> ImportResult<Vec<MachineId>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.registered)
            .map(|r| r.id)
            .collect())
    }

    fn read(&self) -> ImportResult<std::sync::RwLockReadGuard<'_, RegistryInner>> {
        self.inner
            .read()
            .map_err(|e| ImportError::Internal(format!("registry lock poisoned: {}", e)))
    }

    fn write(&self) -> ImportResult<std::sync::RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|e| ImportError::Internal(format!("registry lock poisoned: {}", e)))
    }

    fn machine_lock(&self, id: &MachineId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.machine_locks.lock();
        Arc::clone(locks.entry(*id).or_default())
    }

    /// Apply `change` to a copy of the record, persist it, then publish it.
    fn update<F>(&self, id: &MachineId, change: F) -> ImportResult<MachineRecord>
    where
        F: FnOnce(&mut MachineRecord) -> ImportResult<()>,
    {
        let mut inner = self.write()?;
        let mut record = inner
            .machines
            .get(id)
            .cloned()
            .ok_or_else(|| ImportError::NotFound(format!("machine {}", id)))?;

        change(&mut record)?;

        // Database-first
        inner.store.update(&record)?;
        inner.machines.insert(*id, record.clone());
        Ok(record)
    }

    async fn write_settings_file(record: &MachineRecord) -> ImportResult<()> {
        let path = record.settings.spec.settings_dir.join(SETTINGS_FILE);
        let json = serde_json::to_vec_pretty(&record.settings)
            .map_err(|e| ImportError::Internal(format!("failed to serialize settings: {}", e)))?;
        tokio::fs::write(&path, json).await.map_err(|e| {
            ImportError::storage_with_code(
                format!("failed to write {}: {}", path.display(), e),
                e.raw_os_error().unwrap_or(-1),
            )
        })
    }

    /// Remove a folder left by a failed `create_machine`.
    async fn discard_folder(dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(folder = %dir.display(), error = %e, "Failed to remove machine folder");
        }
    }

    fn check_unique_name(inner: &RegistryInner, name: &str, except: Option<&MachineId>) -> ImportResult<()> {
        let clash = inner
            .machines
            .values()
            .any(|m| m.registered && m.name() == name && Some(&m.id) != except);
        if clash {
            return Err(ImportError::registration_with_code(
                format!("a machine named '{}' is already registered", name),
                error_codes::DUPLICATE_NAME,
            ));
        }
        Ok(())
    }
}

/// Result codes reported by the local registry.
pub mod error_codes {
    pub const DUPLICATE_NAME: i32 = 1;
    pub const FOLDER_EXISTS: i32 = 2;
    pub const NO_SUCH_CONTROLLER: i32 = 3;
    pub const SLOT_OUT_OF_RANGE: i32 = 4;
    pub const SLOT_BUSY: i32 = 5;
    pub const DUPLICATE_CONTROLLER: i32 = 6;
}

#[async_trait]
impl MachineRegistry for LocalRegistry {
    async fn create_machine(&self, spec: &MachineSpec) -> ImportResult<MachineId> {
        if spec.name.trim().is_empty() {
            return Err(ImportError::InvalidArgument("machine name is empty".into()));
        }
        {
            let inner = self.read()?;
            Self::check_unique_name(&inner, &spec.name, None)?;
        }

        let dir: PathBuf = spec.settings_dir.clone();
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(ImportError::registration_with_code(
                format!("machine folder {} already exists", dir.display()),
                error_codes::FOLDER_EXISTS,
            ));
        }
        tokio::fs::create_dir_all(&dir).await?;

        let record = MachineRecord {
            id: MachineId::new(),
            registered: false,
            settings: MachineSettings::new(spec.clone()),
            created_at: Utc::now(),
        };

        // The folder is complete before the machine becomes visible.
        if let Err(e) = Self::write_settings_file(&record).await {
            Self::discard_folder(&dir).await;
            return Err(e);
        }

        let inserted = {
            let mut inner = self.write()?;
            // Database-first
            let result = inner.store.insert(&record);
            if result.is_ok() {
                inner.machines.insert(record.id, record.clone());
            }
            result
        };
        if let Err(e) = inserted {
            Self::discard_folder(&dir).await;
            return Err(e);
        }

        tracing::info!(
            machine_id = %record.id,
            name = %spec.name,
            folder = %dir.display(),
            "Created machine"
        );
        Ok(record.id)
    }

    async fn add_storage_controller(
        &self,
        machine: &MachineId,
        controller: &ControllerSpec,
    ) -> ImportResult<()> {
        let record = self.update(machine, |record| {
            if record.settings.controller(&controller.name).is_some() {
                return Err(ImportError::registration_with_code(
                    format!("controller '{}' already exists", controller.name),
                    error_codes::DUPLICATE_CONTROLLER,
                ));
            }
            record.settings.controllers.push(controller.clone());
            Ok(())
        })?;
        Self::write_settings_file(&record).await?;

        tracing::debug!(
            machine_id = %machine,
            controller = %controller.name,
            bus = ?controller.bus,
            "Added storage controller"
        );
        Ok(())
    }

    async fn configure_devices(
        &self,
        machine: &MachineId,
        devices: &DeviceSettings,
    ) -> ImportResult<()> {
        let record = self.update(machine, |record| {
            record.settings.devices = devices.clone();
            Ok(())
        })?;
        Self::write_settings_file(&record).await
    }

    async fn attach_medium(
        &self,
        machine: &MachineId,
        attachment: &MediumAttachment,
    ) -> ImportResult<()> {
        let lock = self.machine_lock(machine);
        let _guard = lock.lock().await;

        if let Some(location) = &attachment.location
            && !tokio::fs::try_exists(location).await.unwrap_or(false)
        {
            return Err(ImportError::registration(format!(
                "medium {} does not exist",
                location.display()
            )));
        }

        let record = self.update(machine, |record| {
            let slot = &attachment.slot;
            let controller = record.settings.controller(&slot.controller).ok_or_else(|| {
                ImportError::registration_with_code(
                    format!("no controller named '{}'", slot.controller),
                    error_codes::NO_SUCH_CONTROLLER,
                )
            })?;
            if slot.port >= controller.bus.port_count()
                || slot.device >= controller.bus.devices_per_port()
            {
                return Err(ImportError::registration_with_code(
                    format!("slot {} is out of range for a {:?} controller", slot, controller.bus),
                    error_codes::SLOT_OUT_OF_RANGE,
                ));
            }
            if record.settings.attachments.iter().any(|a| &a.slot == slot) {
                return Err(ImportError::registration_with_code(
                    format!("slot {} is already in use", slot),
                    error_codes::SLOT_BUSY,
                ));
            }
            record.settings.attachments.push(attachment.clone());
            Ok(())
        })?;
        Self::write_settings_file(&record).await?;

        tracing::debug!(
            machine_id = %machine,
            slot = %attachment.slot,
            kind = ?attachment.kind,
            "Attached medium"
        );
        Ok(())
    }

    async fn detach_medium(&self, machine: &MachineId, slot: &AttachmentSlot) -> ImportResult<()> {
        let lock = self.machine_lock(machine);
        let _guard = lock.lock().await;

        let record = self.update(machine, |record| {
            let before = record.settings.attachments.len();
            record.settings.attachments.retain(|a| &a.slot != slot);
            if record.settings.attachments.len() == before {
                return Err(ImportError::NotFound(format!("no medium attached at {}", slot)));
            }
            Ok(())
        })?;
        Self::write_settings_file(&record).await?;

        tracing::debug!(machine_id = %machine, slot = %slot, "Detached medium");
        Ok(())
    }

    async fn register_machine(&self, machine: &MachineId) -> ImportResult<()> {
        {
            let inner = self.read()?;
            let record = inner
                .machines
                .get(machine)
                .ok_or_else(|| ImportError::NotFound(format!("machine {}", machine)))?;
            Self::check_unique_name(&inner, record.name(), Some(machine))?;
        }

        self.update(machine, |record| {
            if record.registered {
                return Err(ImportError::InvalidState(format!(
                    "machine {} is already registered",
                    record.id
                )));
            }
            record.registered = true;
            Ok(())
        })?;

        tracing::info!(machine_id = %machine, "Registered machine");
        Ok(())
    }

    async fn unregister_machine(&self, machine: &MachineId) -> ImportResult<()> {
        let lock = self.machine_lock(machine);
        let _guard = lock.lock().await;

        self.update(machine, |record| {
            if !record.registered {
                return Err(ImportError::InvalidState(format!(
                    "machine {} is not registered",
                    record.id
                )));
            }
            record.registered = false;
            Ok(())
        })?;

        tracing::info!(machine_id = %machine, "Unregistered machine");
        Ok(())
    }

    async fn delete_machine_settings(&self, machine: &MachineId) -> ImportResult<()> {
        let dir = {
            let mut inner = self.write()?;
            let record = inner
                .machines
                .get(machine)
                .ok_or_else(|| ImportError::NotFound(format!("machine {}", machine)))?;
            if record.registered {
                return Err(ImportError::InvalidState(format!(
                    "machine {} must be unregistered before its settings are deleted",
                    machine
                )));
            }
            let dir = record.settings.spec.settings_dir.clone();

            // Database-first
            inner.store.delete(machine)?;
            inner.machines.remove(machine);
            dir
        };
        self.machine_locks.lock().remove(machine);

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ImportError::storage_with_code(
                    format!("failed to remove machine folder {}: {}", dir.display(), e),
                    e.raw_os_error().unwrap_or(-1),
                ));
            }
        }

        tracing::info!(machine_id = %machine, folder = %dir.display(), "Deleted machine settings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MediumKind, StorageBus};
    use std::collections::BTreeMap;

    fn spec(root: &Path, name: &str) -> MachineSpec {
        MachineSpec {
            name: name.to_string(),
            os_type: "Ubuntu".into(),
            cpu_count: 2,
            memory_mb: 1024,
            description: None,
            metadata: BTreeMap::new(),
            settings_dir: root.join(name),
        }
    }

    fn sata() -> ControllerSpec {
        ControllerSpec {
            name: "SATA Controller".into(),
            bus: StorageBus::Sata,
            model: "AHCI".into(),
        }
    }

    fn disk_at(location: &Path, port: u32) -> MediumAttachment {
        MediumAttachment {
            slot: AttachmentSlot {
                controller: "SATA Controller".into(),
                port,
                device: 0,
            },
            kind: MediumKind::HardDisk,
            location: Some(location.to_path_buf()),
        }
    }

    #[tokio::test]
    async fn test_machine_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::in_memory().unwrap();

        let id = registry.create_machine(&spec(root.path(), "web")).await.unwrap();
        assert!(root.path().join("web").join(SETTINGS_FILE).is_file());

        registry.add_storage_controller(&id, &sata()).await.unwrap();
        let disk = root.path().join("web").join("disk1.vmdk");
        std::fs::write(&disk, b"x").unwrap();
        registry.attach_medium(&id, &disk_at(&disk, 0)).await.unwrap();

        let busy = registry.attach_medium(&id, &disk_at(&disk, 0)).await.unwrap_err();
        assert_eq!(busy.result_code(), Some(error_codes::SLOT_BUSY));

        registry.register_machine(&id).await.unwrap();
        assert_eq!(registry.registered().unwrap(), vec![id]);

        let err = registry.delete_machine_settings(&id).await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidState(_)));

        registry.detach_medium(&id, &disk_at(&disk, 0).slot).await.unwrap();
        registry.unregister_machine(&id).await.unwrap();
        registry.delete_machine_settings(&id).await.unwrap();
        assert!(!root.path().join("web").exists());
        assert!(registry.get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registered_name() {
        let root = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::in_memory().unwrap();

        let first = registry.create_machine(&spec(root.path(), "db")).await.unwrap();
        registry.register_machine(&first).await.unwrap();

        let mut second = spec(root.path(), "db");
        second.settings_dir = root.path().join("db-2");
        let err = registry.create_machine(&second).await.unwrap_err();
        assert!(matches!(err, ImportError::Registration { .. }));
        assert_eq!(err.result_code(), Some(error_codes::DUPLICATE_NAME));
    }

    #[tokio::test]
    async fn test_existing_folder_is_not_reused() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("taken")).unwrap();
        let registry = LocalRegistry::in_memory().unwrap();
        let err = registry
            .create_machine(&spec(root.path(), "taken"))
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), Some(error_codes::FOLDER_EXISTS));
        assert!(root.path().join("taken").exists());
    }

    /// A folder whose settings file path exceeds PATH_MAX while the folder
    /// itself does not.
    #[cfg(target_os = "linux")]
    fn folder_without_room_for_settings(root: &Path) -> PathBuf {
        let mut dir = root.to_path_buf();
        let target = 4096 - SETTINGS_FILE.len();
        while dir.as_os_str().len() + 202 < target {
            dir.push("d".repeat(200));
        }
        let rest = target - dir.as_os_str().len() - 1;
        dir.push("m".repeat(rest));
        dir
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_settings_write_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::in_memory().unwrap();
        let mut broken = spec(root.path(), "broken");
        broken.settings_dir = folder_without_room_for_settings(root.path());

        let err = registry.create_machine(&broken).await.unwrap_err();
        assert!(matches!(err, ImportError::StorageIo { .. }));
        assert!(registry.list().unwrap().is_empty());
        assert!(!broken.settings_dir.exists());

        // The name stays free for a later attempt.
        let id = registry.create_machine(&spec(root.path(), "broken")).await.unwrap();
        assert_eq!(registry.list().unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn test_attach_requires_controller_and_range() {
        let root = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::in_memory().unwrap();
        let id = registry.create_machine(&spec(root.path(), "vm")).await.unwrap();
        let disk = root.path().join("vm").join("d.vmdk");
        std::fs::write(&disk, b"x").unwrap();

        let err = registry.attach_medium(&id, &disk_at(&disk, 0)).await.unwrap_err();
        assert_eq!(err.result_code(), Some(error_codes::NO_SUCH_CONTROLLER));

        registry.add_storage_controller(&id, &sata()).await.unwrap();
        let err = registry.attach_medium(&id, &disk_at(&disk, 99)).await.unwrap_err();
        assert_eq!(err.result_code(), Some(error_codes::SLOT_OUT_OF_RANGE));
    }

    #[tokio::test]
    async fn test_reopen_recovers_machines() {
        let root = tempfile::tempdir().unwrap();
        let db_path = root.path().join("db").join("registry.db");

        let id = {
            let registry = LocalRegistry::open(&db_path).unwrap();
            let id = registry.create_machine(&spec(root.path(), "keep")).await.unwrap();
            registry.register_machine(&id).await.unwrap();
            id
        };

        let reopened = LocalRegistry::open(&db_path).unwrap();
        let record = reopened.get(&id).unwrap().unwrap();
        assert!(record.registered);
        assert_eq!(record.name(), "keep");
    }
}
