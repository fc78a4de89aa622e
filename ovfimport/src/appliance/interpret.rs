//! Mapping of the raw envelope into typed descriptions.

use super::description::{
    ApplianceDescriptor, DescriptionType, DescriptorItem, VirtualSystemDescription,
};
use crate::ovf::cim::{self, ResourceType};
use crate::ovf::types::{OvfEnvelope, RawHardwareItem, RawSection, RawVirtualSystem};
use ovfimport_shared::errors::{ImportError, ImportResult};

/// Result of interpretation: the model plus recoverable problems.
#[derive(Debug, Clone, Default)]
pub struct Interpretation {
    pub descriptor: ApplianceDescriptor,
    /// `UnsupportedHardware` errors for skipped items.
    pub warnings: Vec<ImportError>,
}

pub fn interpret(envelope: &OvfEnvelope) -> ImportResult<Interpretation> {
    let mut interpretation = Interpretation {
        descriptor: ApplianceDescriptor {
            package_dir: envelope.package_dir.clone(),
            systems: Vec::with_capacity(envelope.systems.len()),
        },
        warnings: Vec::new(),
    };

    for (index, system) in envelope.systems.iter().enumerate() {
        let description =
            interpret_system(envelope, system, index, &mut interpretation.warnings)?;
        interpretation.descriptor.systems.push(description);
    }

    tracing::info!(
        systems = interpretation.descriptor.systems.len(),
        warnings = interpretation.warnings.len(),
        "Appliance interpreted"
    );

    Ok(interpretation)
}

fn interpret_system(
    envelope: &OvfEnvelope,
    system: &RawVirtualSystem,
    index: usize,
    warnings: &mut Vec<ImportError>,
) -> ImportResult<VirtualSystemDescription> {
    let name = system
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or_else(|| Some(system.id.clone()).filter(|id| !id.trim().is_empty()))
        .ok_or_else(|| {
            ImportError::Format(format!("virtual system {} has neither a Name nor an id", index))
        })?;

    if system.operating_system().is_none() {
        return Err(ImportError::Format(format!(
            "virtual system '{}' has no OperatingSystemSection",
            name
        )));
    }

    let mut description = VirtualSystemDescription::new(&system.id);
    description
        .items
        .push(DescriptorItem::new(DescriptionType::Name, name));

    for section in &system.sections {
        match section {
            RawSection::OperatingSystem(os) => {
                let value = match (os.id, &os.os_type) {
                    (Some(id), _) => id.to_string(),
                    (None, Some(os_type)) => os_type.clone(),
                    (None, None) => String::new(),
                };
                description.items.push(
                    DescriptorItem::new(DescriptionType::OS, value)
                        .with_extra(os.description.clone().unwrap_or_default()),
                );
            }
            RawSection::Product(product) => {
                let version = product.version.as_ref().or(product.full_version.as_ref());
                let fields = [
                    (DescriptionType::Product, product.product.as_ref()),
                    (DescriptionType::ProductUrl, product.product_url.as_ref()),
                    (DescriptionType::Vendor, product.vendor.as_ref()),
                    (DescriptionType::VendorUrl, product.vendor_url.as_ref()),
                    (DescriptionType::Version, version),
                ];
                for (kind, value) in fields {
                    if let Some(value) = value {
                        description.items.push(DescriptorItem::new(kind, value));
                    }
                }
            }
            RawSection::Annotation(text) => {
                if !text.is_empty() {
                    description
                        .items
                        .push(DescriptorItem::new(DescriptionType::Description, text));
                }
            }
            RawSection::Eula(text) => {
                if !text.is_empty() {
                    description
                        .items
                        .push(DescriptorItem::new(DescriptionType::License, text));
                }
            }
            RawSection::VirtualHardware(hw) => {
                for item in &hw.items {
                    match hardware_item(envelope, item) {
                        Ok(mapped) => description.items.push(mapped),
                        Err(warning) => {
                            tracing::warn!(
                                system = index,
                                item = %item.instance_id,
                                "Skipping hardware item: {}",
                                warning
                            );
                            warnings.push(warning);
                        }
                    }
                }
            }
        }
    }

    Ok(description)
}

fn hardware_item(envelope: &OvfEnvelope, item: &RawHardwareItem) -> ImportResult<DescriptorItem> {
    let unsupported = |reason: &str| {
        ImportError::UnsupportedHardware(format!("{}: {}", item.display_name(), reason))
    };

    let code = item
        .resource_type
        .ok_or_else(|| unsupported("missing or non-numeric resource type"))?;
    let kind = ResourceType::from_code(code)
        .ok_or_else(|| unsupported(&format!("resource type {} is not supported", code)))?;

    let sub_type = item.resource_sub_type.clone().unwrap_or_default();
    let mapped = match kind {
        ResourceType::Processor => DescriptorItem::new(
            DescriptionType::CPU,
            item.virtual_quantity.unwrap_or(1).to_string(),
        ),
        ResourceType::Memory => {
            let quantity = item
                .virtual_quantity
                .ok_or_else(|| unsupported("memory item without a quantity"))?;
            let megabytes = cim::quantity_to_megabytes(quantity, item.allocation_units.as_deref())
                .ok_or_else(|| {
                    unsupported(&format!(
                        "unknown allocation units '{}'",
                        item.allocation_units.as_deref().unwrap_or_default()
                    ))
                })?;
            DescriptorItem::new(DescriptionType::Memory, megabytes.to_string())
        }
        ResourceType::IdeController => DescriptorItem::new(
            DescriptionType::ControllerIDE,
            or_default(&sub_type, "PIIX4"),
        ),
        ResourceType::ParallelScsiHba => {
            let kind = if sub_type.eq_ignore_ascii_case("LsiLogicSAS") {
                DescriptionType::ControllerSAS
            } else {
                DescriptionType::ControllerSCSI
            };
            DescriptorItem::new(kind, or_default(&sub_type, "LsiLogic"))
        }
        ResourceType::OtherStorageDevice => {
            if !sub_type.eq_ignore_ascii_case("AHCI") {
                return Err(unsupported(&format!(
                    "storage device subtype '{}' is not supported",
                    sub_type
                )));
            }
            DescriptorItem::new(DescriptionType::ControllerSATA, sub_type)
        }
        ResourceType::DiskDrive => return disk_item(envelope, item),
        ResourceType::CdDrive | ResourceType::DvdDrive => DescriptorItem::new(
            DescriptionType::CDROM,
            item.host_resource.first().cloned().unwrap_or_default(),
        )
        .with_extra(slot_extra(item)),
        ResourceType::FloppyDrive => DescriptorItem::new(
            DescriptionType::Floppy,
            item.host_resource.first().cloned().unwrap_or_default(),
        ),
        ResourceType::EthernetAdapter => {
            DescriptorItem::new(DescriptionType::NetworkAdapter, sub_type).with_extra(format!(
                "network={}",
                item.connection.first().map(String::as_str).unwrap_or_default()
            ))
        }
        ResourceType::UsbController => DescriptorItem::new(DescriptionType::USBController, sub_type),
        ResourceType::SoundCard => DescriptorItem::new(DescriptionType::SoundCard, sub_type),
    };

    Ok(mapped.with_reference(&item.instance_id))
}

/// Disk drives resolve `ovf:/disk/<id>` through the disk and file tables.
fn disk_item(envelope: &OvfEnvelope, item: &RawHardwareItem) -> ImportResult<DescriptorItem> {
    let unsupported = |reason: String| {
        ImportError::UnsupportedHardware(format!("{}: {}", item.display_name(), reason))
    };

    let host_resource = item
        .host_resource
        .first()
        .ok_or_else(|| unsupported("disk drive without a host resource".into()))?;
    let disk_id = host_resource
        .strip_prefix("ovf:/disk/")
        .or_else(|| host_resource.strip_prefix("/disk/"))
        .ok_or_else(|| unsupported(format!("host resource '{}' is not a disk", host_resource)))?;
    let disk = envelope
        .disk_by_id(disk_id)
        .ok_or_else(|| unsupported(format!("disk '{}' is not defined", disk_id)))?;
    let file = disk
        .file_ref
        .as_deref()
        .and_then(|file_ref| envelope.file_by_id(file_ref))
        .ok_or_else(|| unsupported(format!("disk '{}' has no backing file", disk_id)))?;

    let mut extra = slot_extra(item);
    if !disk.format.is_empty() {
        extra.push_str(";format=");
        extra.push_str(&disk.format);
    }

    Ok(DescriptorItem::new(DescriptionType::HardDiskImage, &file.href)
        .with_reference(&disk.disk_id)
        .with_extra(extra))
}

fn slot_extra(item: &RawHardwareItem) -> String {
    format!(
        "controller={};channel={}",
        item.parent.as_deref().unwrap_or_default(),
        item.address_on_parent.as_deref().unwrap_or("0")
    )
}

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}
