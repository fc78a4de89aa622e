//! Machine registry and medium storage interfaces.
//!
//! The import engine drives two external services:
//!
//! - [`MachineRegistry`]: creates, configures, registers and removes machines
//! - [`MediumStore`]: copies, converts and deletes disk images
//!
//! Both are internally synchronized and shared as `Arc<dyn ...>`. Reference
//! implementations live in [`local`] and [`file_store`].

pub mod file_store;
pub mod local;

pub use file_store::FileMediumStore;
pub use local::LocalRegistry;

use crate::progress::Progress;
use async_trait::async_trait;
use ovfimport_shared::errors::{ImportError, ImportResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Registry identifier of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(Uuid);

impl MachineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MachineId {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ImportError::InvalidArgument(format!("invalid machine id '{}': {}", s, e)))
    }
}

/// Everything needed to create a machine shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    /// Guest OS type identifier ("Ubuntu", "WindowsXP", ...).
    pub os_type: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub description: Option<String>,
    /// Descriptive facts (product, vendor, license, ...).
    pub metadata: BTreeMap<String, String>,
    /// Folder holding the machine's settings and disks.
    pub settings_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageBus {
    Ide,
    Sata,
    Sas,
    Scsi,
}

impl StorageBus {
    /// Ports per controller.
    pub fn port_count(self) -> u32 {
        match self {
            Self::Ide => 2,
            Self::Sata => 30,
            Self::Sas => 255,
            Self::Scsi => 16,
        }
    }

    /// Devices per port.
    pub fn devices_per_port(self) -> u32 {
        match self {
            Self::Ide => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSpec {
    /// Unique per machine ("IDE Controller", "SATA Controller 2", ...).
    pub name: String,
    pub bus: StorageBus,
    /// Chipset model ("PIIX4", "AHCI", "LsiLogic", ...).
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentSlot {
    pub controller: String,
    pub port: u32,
    pub device: u32,
}

impl fmt::Display for AttachmentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.controller, self.port, self.device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediumKind {
    HardDisk,
    Dvd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumAttachment {
    pub slot: AttachmentSlot,
    pub kind: MediumKind,
    /// Image location; `None` for an empty drive.
    pub location: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapterSpec {
    pub model: String,
    /// Network the adapter connects to, as named in the descriptor.
    pub network: String,
}

/// Non-storage devices of a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub network_adapters: Vec<NetworkAdapterSpec>,
    pub usb_controller: Option<String>,
    pub sound_card: Option<String>,
    pub floppy_drives: u32,
}

impl DeviceSettings {
    pub fn is_empty(&self) -> bool {
        self.network_adapters.is_empty()
            && self.usb_controller.is_none()
            && self.sound_card.is_none()
            && self.floppy_drives == 0
    }
}

/// Full persisted settings of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSettings {
    pub spec: MachineSpec,
    pub controllers: Vec<ControllerSpec>,
    pub attachments: Vec<MediumAttachment>,
    pub devices: DeviceSettings,
}

impl MachineSettings {
    pub fn new(spec: MachineSpec) -> Self {
        Self {
            spec,
            controllers: Vec::new(),
            attachments: Vec::new(),
            devices: DeviceSettings::default(),
        }
    }

    pub fn controller(&self, name: &str) -> Option<&ControllerSpec> {
        self.controllers.iter().find(|c| c.name == name)
    }
}

/// Image copy or conversion job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCopyRequest {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Source format URI or name, as declared by the descriptor.
    pub source_format: String,
    pub target_format: String,
    pub block_size: usize,
}

/// Machine registry operations used by the importer.
///
/// Errors should be `Registration` (or `StorageIo` for settings files), with
/// the service's result code when one exists.
#[async_trait]
pub trait MachineRegistry: Send + Sync {
    async fn create_machine(&self, spec: &MachineSpec) -> ImportResult<MachineId>;

    async fn add_storage_controller(
        &self,
        machine: &MachineId,
        controller: &ControllerSpec,
    ) -> ImportResult<()>;

    async fn configure_devices(
        &self,
        machine: &MachineId,
        devices: &DeviceSettings,
    ) -> ImportResult<()>;

    async fn attach_medium(
        &self,
        machine: &MachineId,
        attachment: &MediumAttachment,
    ) -> ImportResult<()>;

    async fn detach_medium(&self, machine: &MachineId, slot: &AttachmentSlot) -> ImportResult<()>;

    async fn register_machine(&self, machine: &MachineId) -> ImportResult<()>;

    async fn unregister_machine(&self, machine: &MachineId) -> ImportResult<()>;

    /// Remove an unregistered machine's settings and its folder.
    async fn delete_machine_settings(&self, machine: &MachineId) -> ImportResult<()>;
}

/// Disk image operations used by the importer.
///
/// Copies run in the background; the returned [`Progress`] completes when the
/// target is fully written, and honours `cancel()` at block granularity.
#[async_trait]
pub trait MediumStore: Send + Sync {
    async fn copy_image(&self, request: &ImageCopyRequest) -> ImportResult<Progress>;

    async fn convert_image(&self, request: &ImageCopyRequest) -> ImportResult<Progress>;

    /// Delete an image. Deleting a missing image succeeds.
    async fn delete_image(&self, location: &Path) -> ImportResult<()>;
}
