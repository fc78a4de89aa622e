//! Interpreted appliance model: one description per virtual system, each a
//! document-ordered list of typed configuration facts.

use ovfimport_shared::errors::{ImportError, ImportResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Declares [`DescriptionType`] together with its `ALL` table and console
/// labels, so a variant cannot exist without both.
macro_rules! description_types {
    ($($variant:ident => $label:literal,)+) => {
        /// Kind of a configuration fact.
        #[allow(clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum DescriptionType {
            $($variant,)+
        }

        impl DescriptionType {
            /// Every type, in declaration order.
            pub const ALL: &'static [DescriptionType] = &[$(Self::$variant,)+];

            /// Short console label.
            pub fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }
    };
}

description_types! {
    OS => "ostype",
    Name => "name",
    Product => "product",
    ProductUrl => "producturl",
    Vendor => "vendor",
    VendorUrl => "vendorurl",
    Version => "version",
    Description => "description",
    License => "license",
    CPU => "cpu",
    Memory => "memory",
    ControllerIDE => "ide",
    ControllerSATA => "sata",
    ControllerSAS => "sas",
    ControllerSCSI => "scsi",
    HardDiskImage => "hd",
    CDROM => "cdrom",
    Floppy => "floppy",
    NetworkAdapter => "net",
    USBController => "usb",
    SoundCard => "sound",
}

impl DescriptionType {
    /// Name and OS are always imported.
    pub fn can_disable(self) -> bool {
        !matches!(self, Self::Name | Self::OS)
    }
}

impl fmt::Display for DescriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One configuration fact of a virtual system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorItem {
    pub kind: DescriptionType,
    /// Identifier inside the descriptor (InstanceID, diskId), may be empty.
    pub reference_id: String,
    /// Value as found in the descriptor.
    pub ovf_value: String,
    /// Caller-supplied replacement for `ovf_value`.
    pub override_value: Option<String>,
    /// Type-specific extra settings, `key=value;key=value`.
    pub extra_config: String,
    pub enabled: bool,
}

impl DescriptorItem {
    pub fn new(kind: DescriptionType, ovf_value: impl Into<String>) -> Self {
        Self {
            kind,
            reference_id: String::new(),
            ovf_value: ovf_value.into(),
            override_value: None,
            extra_config: String::new(),
            enabled: true,
        }
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = reference_id.into();
        self
    }

    pub fn with_extra(mut self, extra_config: impl Into<String>) -> Self {
        self.extra_config = extra_config.into();
        self
    }

    /// Override when present, OVF value otherwise.
    pub fn effective_value(&self) -> &str {
        self.override_value.as_deref().unwrap_or(&self.ovf_value)
    }

    /// Look up `key` in `extra_config`.
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra_config
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
    }
}

impl fmt::Display for DescriptorItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type {}, ovf: \"{}\", override: \"{}\", extra: \"{}\"",
            self.kind.label(),
            self.ovf_value,
            self.override_value.as_deref().unwrap_or(""),
            self.extra_config
        )
    }
}

/// One machine definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualSystemDescription {
    /// `ovf:id` of the virtual system.
    pub ovf_id: String,
    /// Items in document order. Positions are stable indexes for overrides.
    pub items: Vec<DescriptorItem>,
}

impl VirtualSystemDescription {
    pub fn new(ovf_id: impl Into<String>) -> Self {
        Self {
            ovf_id: ovf_id.into(),
            items: Vec::new(),
        }
    }

    /// Items of `kind` with their positions.
    pub fn items_of(
        &self,
        kind: DescriptionType,
    ) -> impl Iterator<Item = (usize, &DescriptorItem)> + '_ {
        self.items
            .iter()
            .enumerate()
            .filter(move |(_, item)| item.kind == kind)
    }

    pub fn first(&self, kind: DescriptionType) -> Option<&DescriptorItem> {
        self.items.iter().find(|item| item.kind == kind)
    }

    /// Effective machine name.
    pub fn name(&self) -> &str {
        self.first(DescriptionType::Name)
            .map(DescriptorItem::effective_value)
            .unwrap_or(&self.ovf_id)
    }
}

/// Interpreted appliance: descriptions in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplianceDescriptor {
    /// Directory disk image hrefs are resolved against.
    pub package_dir: PathBuf,
    pub systems: Vec<VirtualSystemDescription>,
}

/// Caller edits keyed by `(system index, item position)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOverrides {
    values: BTreeMap<(usize, usize), String>,
    disabled: BTreeSet<(usize, usize)>,
}

impl ImportOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, system: usize, item: usize, value: impl Into<String>) -> &mut Self {
        self.values.insert((system, item), value.into());
        self
    }

    pub fn disable(&mut self, system: usize, item: usize) -> &mut Self {
        self.disabled.insert((system, item));
        self
    }

    pub fn get(&self, system: usize, item: usize) -> Option<&str> {
        self.values.get(&(system, item)).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.disabled.is_empty()
    }

    /// Check every key against `descriptor`.
    pub fn validate(&self, descriptor: &ApplianceDescriptor) -> ImportResult<()> {
        let lookup = |&(system, item): &(usize, usize)| {
            descriptor
                .systems
                .get(system)
                .and_then(|s| s.items.get(item))
                .ok_or_else(|| {
                    ImportError::InvalidArgument(format!(
                        "no item {} in virtual system {}",
                        item, system
                    ))
                })
        };

        for key in self.values.keys() {
            lookup(key)?;
        }
        for key in &self.disabled {
            let item = lookup(key)?;
            if !item.kind.can_disable() {
                return Err(ImportError::InvalidArgument(format!(
                    "{} item {} of virtual system {} cannot be disabled",
                    item.kind, key.1, key.0
                )));
            }
        }
        Ok(())
    }

    /// Copy of `descriptor` with these overrides applied.
    pub fn apply(&self, descriptor: &ApplianceDescriptor) -> ImportResult<ApplianceDescriptor> {
        self.validate(descriptor)?;

        let mut applied = descriptor.clone();
        for (&(system, item), value) in &self.values {
            applied.systems[system].items[item].override_value = Some(value.clone());
        }
        for &(system, item) in &self.disabled {
            applied.systems[system].items[item].enabled = false;
        }
        Ok(applied)
    }
}
