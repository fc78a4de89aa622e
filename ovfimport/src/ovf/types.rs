//! Raw, document-ordered object graph of an OVF descriptor.
//!
//! These types mirror the XML closely and carry no interpretation beyond
//! number parsing. They only live between `read()` and `interpret()`.

use std::path::PathBuf;

/// Parsed OVF envelope.
#[derive(Debug, Clone, Default)]
pub struct OvfEnvelope {
    /// `ovf:version` of the envelope ("0.9", "1.0", "2.0", ...).
    pub version: String,
    /// Absolute path of the descriptor file.
    pub descriptor_path: PathBuf,
    /// Directory holding the descriptor and its referenced files.
    pub package_dir: PathBuf,
    pub references: Vec<FileReference>,
    pub disks: Vec<DiskDefinition>,
    pub networks: Vec<NetworkDefinition>,
    /// Virtual systems in document order, collections flattened.
    pub systems: Vec<RawVirtualSystem>,
}

impl OvfEnvelope {
    pub fn file_by_id(&self, id: &str) -> Option<&FileReference> {
        self.references.iter().find(|f| f.id == id)
    }

    pub fn disk_by_id(&self, disk_id: &str) -> Option<&DiskDefinition> {
        self.disks.iter().find(|d| d.disk_id == disk_id)
    }
}

/// `References/File`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReference {
    pub id: String,
    pub href: String,
    pub size: Option<u64>,
    pub compression: Option<String>,
}

/// `DiskSection/Disk`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskDefinition {
    pub disk_id: String,
    pub file_ref: Option<String>,
    /// Capacity in bytes, allocation units applied.
    pub capacity: Option<u64>,
    /// Format URI, e.g. `http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized`.
    pub format: String,
    pub populated_size: Option<u64>,
}

/// `NetworkSection/Network`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDefinition {
    pub name: String,
    pub description: Option<String>,
}

/// One `VirtualSystem` element.
#[derive(Debug, Clone, Default)]
pub struct RawVirtualSystem {
    /// `ovf:id` attribute.
    pub id: String,
    /// `<Name>` child, if present.
    pub name: Option<String>,
    /// Sections in document order.
    pub sections: Vec<RawSection>,
}

impl RawVirtualSystem {
    pub fn hardware(&self) -> Option<&RawHardwareSection> {
        self.sections.iter().find_map(|s| match s {
            RawSection::VirtualHardware(hw) => Some(hw),
            _ => None,
        })
    }

    pub fn operating_system(&self) -> Option<&RawOperatingSystem> {
        self.sections.iter().find_map(|s| match s {
            RawSection::OperatingSystem(os) => Some(os),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum RawSection {
    OperatingSystem(RawOperatingSystem),
    Product(RawProduct),
    Annotation(String),
    Eula(String),
    VirtualHardware(RawHardwareSection),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOperatingSystem {
    /// CIM operating system id (`ovf:id`).
    pub id: Option<u32>,
    /// Vendor OS type hint (`vmw:osType`).
    pub os_type: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawProduct {
    pub product: Option<String>,
    pub product_url: Option<String>,
    pub vendor: Option<String>,
    pub vendor_url: Option<String>,
    pub version: Option<String>,
    pub full_version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RawHardwareSection {
    /// `System/VirtualSystemType`, e.g. "vmx-07".
    pub system_type: Option<String>,
    /// Resource items in document order.
    pub items: Vec<RawHardwareItem>,
}

/// One `Item` / `StorageItem` / `EthernetPortItem` of a hardware section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawHardwareItem {
    pub instance_id: String,
    /// CIM resource type code. `None` when absent or not numeric.
    pub resource_type: Option<u32>,
    pub resource_sub_type: Option<String>,
    pub element_name: Option<String>,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub virtual_quantity: Option<u64>,
    pub allocation_units: Option<String>,
    pub address: Option<String>,
    pub address_on_parent: Option<String>,
    pub parent: Option<String>,
    pub host_resource: Vec<String>,
    pub connection: Vec<String>,
    pub automatic_allocation: Option<bool>,
}

impl RawHardwareItem {
    /// Human-readable identification for warnings and logs.
    pub fn display_name(&self) -> String {
        let name = self
            .element_name
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or("unnamed");
        format!("item {} ({})", self.instance_id, name)
    }
}
