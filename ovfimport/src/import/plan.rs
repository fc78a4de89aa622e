//! Turning an interpreted virtual system into a weighted task plan.
//!
//! Everything that can be decided without side effects is decided here, so a
//! bad override fails before any machine exists.

use super::tasks::{
    CreateMachineTask, DevicesTask, DiskImageTask, DiskSource, RegisterTask, StorageControllersTask,
};
use super::types::{ImportCtx, PlannedController};
use crate::appliance::description::{DescriptionType, DescriptorItem, VirtualSystemDescription};
use crate::options::ImportOptions;
use crate::ovf::cim;
use crate::ovf::manifest::is_plain_relative;
use crate::pipeline::{BoxedTask, ExecutionPlan, Stage};
use crate::registry::{
    AttachmentSlot, ControllerSpec, DeviceSettings, MachineSpec, NetworkAdapterSpec, StorageBus,
};
use ovfimport_shared::errors::{ImportError, ImportResult};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;
pub const DEFAULT_MEMORY_MB: u64 = 512;
/// Weight of every non-disk step.
pub const STEP_WEIGHT: u64 = 1;

/// Plan for one virtual system.
pub struct SystemPlan {
    pub system_index: usize,
    pub system: VirtualSystemDescription,
    pub plan: ExecutionPlan<ImportCtx>,
    pub weight: u64,
    pub task_count: usize,
}

pub fn build_system_plan(
    system_index: usize,
    system: &VirtualSystemDescription,
    package_dir: &Path,
    options: &ImportOptions,
) -> ImportResult<SystemPlan> {
    let invalid = |message: String| {
        ImportError::InvalidArgument(format!("virtual system {}: {}", system_index, message))
    };

    let spec = machine_spec(system, &options.machines_dir()).map_err(|e| match e {
        ImportError::InvalidArgument(message) => invalid(message),
        other => other,
    })?;
    let (controller_specs, controllers) = plan_controllers(system);

    let mut disks = Vec::new();
    let mut disk_weight = 0;
    for (index, item) in system.items_of(DescriptionType::HardDiskImage) {
        if !item.enabled {
            continue;
        }
        let slot = resolve_slot(item, &controllers).ok_or_else(|| {
            invalid(format!(
                "disk '{}' (item {}) refers to controller '{}' which is not imported",
                item.ovf_value,
                index,
                item.extra("controller").unwrap_or_default()
            ))
        })?;
        let source = package_dir.join(&item.ovf_value);
        let target = disk_target(item, &spec.settings_dir).map_err(|path| {
            invalid(format!(
                "disk target '{}' (item {}) must be a relative path inside the machine folder",
                path, index
            ))
        })?;
        let size = std::fs::metadata(&source).map(|m| m.len()).unwrap_or(0);
        let weight = (size / MIB).max(1);
        disk_weight += weight;

        disks.push(DiskImageTask::new(
            DiskSource {
                item_index: index,
                source,
                target,
                format: item.extra("format").unwrap_or_default().to_string(),
                slot,
            },
            weight,
        ));
    }

    let (devices, dvd_slots) = device_settings(system, &controllers);

    let task_count = 4 + disks.len();
    let weight = STEP_WEIGHT * 4 + disk_weight;

    let mut storage: Vec<BoxedTask<ImportCtx>> =
        vec![Box::new(StorageControllersTask::new(controller_specs))];
    for task in disks {
        storage.push(Box::new(task));
    }

    let plan = ExecutionPlan::<ImportCtx>::new()
        .stage(Stage::new("machine", vec![Box::new(CreateMachineTask::new(spec))]))
        .stage(Stage::new("storage", storage))
        .stage(Stage::new(
            "devices",
            vec![Box::new(DevicesTask::new(devices, dvd_slots))],
        ))
        .stage(Stage::new("register", vec![Box::new(RegisterTask)]));

    Ok(SystemPlan {
        system_index,
        system: system.clone(),
        plan,
        weight,
        task_count,
    })
}

fn enabled<'a>(
    system: &'a VirtualSystemDescription,
    kind: DescriptionType,
) -> impl Iterator<Item = &'a DescriptorItem> + 'a {
    system
        .items_of(kind)
        .map(|(_, item)| item)
        .filter(|item| item.enabled)
}

/// Machine shell settings from Name, OS, CPU, Memory and descriptive items.
pub fn machine_spec(system: &VirtualSystemDescription, machines_dir: &Path) -> ImportResult<MachineSpec> {
    let name = system.name().trim().to_string();
    if name.is_empty() {
        return Err(ImportError::InvalidArgument("machine name is empty".into()));
    }

    let os_type = system
        .first(DescriptionType::OS)
        .map(|item| guest_os_type(item.effective_value()))
        .unwrap_or_else(|| "Other".to_string());

    let cpu_count = match enabled(system, DescriptionType::CPU).next() {
        Some(item) => item
            .effective_value()
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                ImportError::InvalidArgument(format!(
                    "invalid CPU count '{}'",
                    item.effective_value()
                ))
            })?,
        None => 1,
    };

    let memory_mb = match enabled(system, DescriptionType::Memory).next() {
        Some(item) => item
            .effective_value()
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                ImportError::InvalidArgument(format!(
                    "invalid memory size '{}'",
                    item.effective_value()
                ))
            })?,
        None => DEFAULT_MEMORY_MB,
    };

    let mut metadata = BTreeMap::new();
    for kind in [
        DescriptionType::Product,
        DescriptionType::ProductUrl,
        DescriptionType::Vendor,
        DescriptionType::VendorUrl,
        DescriptionType::Version,
        DescriptionType::License,
    ] {
        if let Some(item) = enabled(system, kind).next() {
            metadata.insert(kind.label().to_string(), item.effective_value().to_string());
        }
    }

    let description = enabled(system, DescriptionType::Description)
        .next()
        .map(|item| item.effective_value().to_string());

    Ok(MachineSpec {
        settings_dir: machines_dir.join(sanitize_name(&name)),
        name,
        os_type,
        cpu_count,
        memory_mb,
        description,
        metadata,
    })
}

/// Numeric values are CIM ids, anything else is taken as a type name.
pub fn guest_os_type(value: &str) -> String {
    let value = value.trim();
    match value.parse::<u32>() {
        Ok(id) => cim::guest_os_type(id).to_string(),
        Err(_) if value.is_empty() => "Other".to_string(),
        Err(_) => value.to_string(),
    }
}

/// Folder-safe machine name.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" => "machine".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

fn controller_base_name(bus: StorageBus) -> &'static str {
    match bus {
        StorageBus::Ide => "IDE Controller",
        StorageBus::Sata => "SATA Controller",
        StorageBus::Sas => "SAS Controller",
        StorageBus::Scsi => "SCSI Controller",
    }
}

fn plan_controllers(
    system: &VirtualSystemDescription,
) -> (Vec<ControllerSpec>, HashMap<String, PlannedController>) {
    let mut specs = Vec::new();
    let mut by_ref = HashMap::new();
    let mut per_bus: HashMap<StorageBus, usize> = HashMap::new();

    for item in system.items.iter().filter(|i| i.enabled) {
        let bus = match item.kind {
            DescriptionType::ControllerIDE => StorageBus::Ide,
            DescriptionType::ControllerSATA => StorageBus::Sata,
            DescriptionType::ControllerSAS => StorageBus::Sas,
            DescriptionType::ControllerSCSI => StorageBus::Scsi,
            _ => continue,
        };
        let count = per_bus.entry(bus).or_insert(0);
        *count += 1;
        let name = if *count == 1 {
            controller_base_name(bus).to_string()
        } else {
            format!("{} {}", controller_base_name(bus), count)
        };

        specs.push(ControllerSpec {
            name: name.clone(),
            bus,
            model: item.effective_value().to_string(),
        });
        by_ref.insert(item.reference_id.clone(), PlannedController { name, bus });
    }

    (specs, by_ref)
}

/// Attachment slot from `controller=<ref>;channel=<n>`.
fn resolve_slot(
    item: &DescriptorItem,
    controllers: &HashMap<String, PlannedController>,
) -> Option<AttachmentSlot> {
    let controller = controllers.get(item.extra("controller")?)?;
    let channel: u32 = item.extra("channel").and_then(|c| c.parse().ok()).unwrap_or(0);
    let devices = controller.bus.devices_per_port();
    Some(AttachmentSlot {
        controller: controller.name.clone(),
        port: channel / devices,
        device: channel % devices,
    })
}

/// Override path when given (relative to the machine folder), otherwise
/// the image file name inside the machine folder. An override that leaves
/// the folder is returned as the error.
fn disk_target(item: &DescriptorItem, machine_dir: &Path) -> Result<PathBuf, String> {
    let target = match item.override_value.as_deref().map(str::trim) {
        Some(path) if !path.is_empty() => {
            if !is_plain_relative(path) {
                return Err(path.to_string());
            }
            machine_dir.join(path)
        }
        _ => {
            let file_name = Path::new(&item.ovf_value)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&item.ovf_value));
            machine_dir.join(file_name)
        }
    };
    Ok(target)
}

fn device_settings(
    system: &VirtualSystemDescription,
    controllers: &HashMap<String, PlannedController>,
) -> (DeviceSettings, Vec<AttachmentSlot>) {
    let network_adapters = enabled(system, DescriptionType::NetworkAdapter)
        .map(|item| NetworkAdapterSpec {
            model: item.effective_value().to_string(),
            network: item.extra("network").unwrap_or_default().to_string(),
        })
        .collect();

    let usb_controller = enabled(system, DescriptionType::USBController)
        .next()
        .map(|item| item.effective_value().to_string());
    let sound_card = enabled(system, DescriptionType::SoundCard)
        .next()
        .map(|item| item.effective_value().to_string());
    let floppy_drives = enabled(system, DescriptionType::Floppy).count() as u32;

    let mut dvd_slots = Vec::new();
    for item in enabled(system, DescriptionType::CDROM) {
        match resolve_slot(item, controllers) {
            Some(slot) => dvd_slots.push(slot),
            None => tracing::warn!(
                item = %item.reference_id,
                "CD-ROM drive has no imported controller, skipping"
            ),
        }
    }

    (
        DeviceSettings {
            network_adapters,
            usb_controller,
            sound_card,
            floppy_drives,
        },
        dvd_slots,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::description::DescriptorItem;

    fn system() -> VirtualSystemDescription {
        let mut system = VirtualSystemDescription::new("vm");
        system.items = vec![
            DescriptorItem::new(DescriptionType::Name, "web/server"),
            DescriptorItem::new(DescriptionType::OS, "94"),
            DescriptorItem::new(DescriptionType::Vendor, "Acme"),
            DescriptorItem::new(DescriptionType::CPU, "2").with_reference("1"),
            DescriptorItem::new(DescriptionType::Memory, "1024").with_reference("2"),
            DescriptorItem::new(DescriptionType::ControllerIDE, "PIIX4").with_reference("3"),
            DescriptorItem::new(DescriptionType::ControllerIDE, "PIIX4").with_reference("4"),
            DescriptorItem::new(DescriptionType::HardDiskImage, "disk1.vmdk")
                .with_reference("d1")
                .with_extra("controller=4;channel=3"),
            DescriptorItem::new(DescriptionType::CDROM, "")
                .with_reference("5")
                .with_extra("controller=3;channel=1"),
        ];
        system
    }

    #[test]
    fn test_machine_spec() {
        let spec = machine_spec(&system(), Path::new("/machines")).unwrap();
        assert_eq!(spec.name, "web/server");
        assert_eq!(spec.settings_dir, PathBuf::from("/machines/web_server"));
        assert_eq!(spec.os_type, "Ubuntu");
        assert_eq!(spec.cpu_count, 2);
        assert_eq!(spec.memory_mb, 1024);
        assert_eq!(spec.metadata.get("vendor").map(String::as_str), Some("Acme"));
    }

    #[test]
    fn test_invalid_cpu_override() {
        let mut system = system();
        system.items[3].override_value = Some("lots".into());
        let err = machine_spec(&system, Path::new("/machines")).unwrap_err();
        assert!(matches!(err, ImportError::InvalidArgument(_)));
    }

    #[test]
    fn test_controller_names_and_slots() {
        let system = system();
        let (specs, by_ref) = plan_controllers(&system);
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["IDE Controller", "IDE Controller 2"]);

        let slot = resolve_slot(&system.items[7], &by_ref).unwrap();
        assert_eq!(
            slot,
            AttachmentSlot {
                controller: "IDE Controller 2".into(),
                port: 1,
                device: 1
            }
        );

        let (_, dvd_slots) = device_settings(&system, &by_ref);
        assert_eq!(dvd_slots[0].controller, "IDE Controller");
        assert_eq!((dvd_slots[0].port, dvd_slots[0].device), (0, 1));
    }

    #[test]
    fn test_disk_on_missing_controller_fails_planning() {
        let mut system = system();
        system.items[6].enabled = false;
        let options = ImportOptions {
            home_dir: PathBuf::from("/home/ovf"),
            ..Default::default()
        };
        let err = build_system_plan(0, &system, Path::new("/pkg"), &options)
            .err()
            .unwrap();
        assert!(matches!(err, ImportError::InvalidArgument(_)));
    }

    #[test]
    fn test_disk_target_stays_in_machine_folder() {
        let machine_dir = Path::new("/machines/vm");
        let mut disk = system().items[7].clone();
        assert_eq!(
            disk_target(&disk, machine_dir),
            Ok(PathBuf::from("/machines/vm/disk1.vmdk"))
        );

        disk.override_value = Some("disks/boot.vmdk".into());
        assert_eq!(
            disk_target(&disk, machine_dir),
            Ok(PathBuf::from("/machines/vm/disks/boot.vmdk"))
        );

        for escape in ["/data/boot.vmdk", "../other/boot.vmdk", "disks/../../boot.vmdk"] {
            disk.override_value = Some(escape.into());
            assert_eq!(disk_target(&disk, machine_dir), Err(escape.to_string()));
        }

        let options = ImportOptions {
            home_dir: PathBuf::from("/home/ovf"),
            ..Default::default()
        };
        let mut system = system();
        system.items[7].override_value = Some("/etc/boot.vmdk".into());
        let err = build_system_plan(0, &system, Path::new("/pkg"), &options)
            .err()
            .unwrap();
        assert!(matches!(err, ImportError::InvalidArgument(_)));
    }

    #[test]
    fn test_plan_weights() {
        let options = ImportOptions {
            home_dir: PathBuf::from("/home/ovf"),
            ..Default::default()
        };
        let plan = build_system_plan(0, &system(), Path::new("/pkg"), &options).unwrap();
        // missing source: disk weighs the minimum
        assert_eq!(plan.weight, 5);
        assert_eq!(plan.task_count, 5);
        assert_eq!(plan.plan.task_count(), 5);
    }

    #[test]
    fn test_os_and_name_helpers() {
        assert_eq!(guest_os_type("36"), "Linux");
        assert_eq!(guest_os_type("Windows10_64"), "Windows10_64");
        assert_eq!(guest_os_type(""), "Other");
        assert_eq!(sanitize_name(".."), "__");
        assert_eq!(sanitize_name("  "), "machine");
    }
}
