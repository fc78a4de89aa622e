//! Fixtures and scriptable fakes shared by unit tests.

use crate::progress::Progress;
use crate::registry::{
    AttachmentSlot, ControllerSpec, DeviceSettings, ImageCopyRequest, MachineId, MachineRegistry,
    MachineSpec, MediumAttachment, MediumStore,
};
use async_trait::async_trait;
use ovfimport_shared::errors::{ImportError, ImportResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub mod fixtures {
    use sha2::{Digest, Sha256};
    use std::path::{Path, PathBuf};

    const NAMESPACES: &str = concat!(
        r#"xmlns="http://schemas.dmtf.org/ovf/envelope/1" "#,
        r#"xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1" "#,
        r#"xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData" "#,
        r#"xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData" "#,
        r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance""#,
    );

    pub const DISK_FILES: [&str; 2] = ["web-disk1.vmdk", "db-disk1.vmdk"];

    /// Envelope with the given `References` and `DiskSection` contents, a
    /// single NAT network and `body` as its content.
    pub fn ovf_document(references: &str, disks: &str, body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope {NAMESPACES} ovf:version="1.0">
  <References>{references}</References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    {disks}
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="NAT"><Description>The NAT network</Description></Network>
  </NetworkSection>
  {body}
</Envelope>"#
        )
    }

    /// Virtual system with a Name, an Ubuntu OS section and `items`.
    pub fn system_xml(id: &str, name: &str, items: &str) -> String {
        format!(
            r#"<VirtualSystem ovf:id="{id}">
    <Info>A virtual machine</Info>
    <Name>{name}</Name>
    <OperatingSystemSection ovf:id="94">
      <Info>The kind of installed guest operating system</Info>
      <Description>Ubuntu</Description>
    </OperatingSystemSection>
    <VirtualHardwareSection>
      <Info>Virtual hardware requirements</Info>
      <System>
        <vssd:ElementName>Virtual Hardware Family</vssd:ElementName>
        <vssd:InstanceID>0</vssd:InstanceID>
        <vssd:VirtualSystemType>vmx-07</vssd:VirtualSystemType>
      </System>
      {items}
    </VirtualHardwareSection>
  </VirtualSystem>"#
        )
    }

    pub fn cpu_item(id: &str, count: u32) -> String {
        format!(
            r#"<Item>
        <rasd:Caption>{count} virtual CPU</rasd:Caption>
        <rasd:ElementName>{count} virtual CPU</rasd:ElementName>
        <rasd:InstanceID>{id}</rasd:InstanceID>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>{count}</rasd:VirtualQuantity>
      </Item>"#
        )
    }

    pub fn memory_item(id: &str, megabytes: u64) -> String {
        format!(
            r#"<Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:ElementName>{megabytes}MB of memory</rasd:ElementName>
        <rasd:InstanceID>{id}</rasd:InstanceID>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>{megabytes}</rasd:VirtualQuantity>
      </Item>"#
        )
    }

    pub fn ide_item(id: &str) -> String {
        format!(
            r#"<Item>
        <rasd:Address>0</rasd:Address>
        <rasd:ElementName>ideController0</rasd:ElementName>
        <rasd:InstanceID>{id}</rasd:InstanceID>
        <rasd:ResourceSubType>PIIX4</rasd:ResourceSubType>
        <rasd:ResourceType>5</rasd:ResourceType>
      </Item>"#
        )
    }

    fn sata_item(id: &str) -> String {
        format!(
            r#"<Item>
        <rasd:Address>0</rasd:Address>
        <rasd:ElementName>sataController0</rasd:ElementName>
        <rasd:InstanceID>{id}</rasd:InstanceID>
        <rasd:ResourceSubType>AHCI</rasd:ResourceSubType>
        <rasd:ResourceType>20</rasd:ResourceType>
      </Item>"#
        )
    }

    fn disk_item(id: &str, parent: &str, disk_id: &str) -> String {
        format!(
            r#"<Item>
        <rasd:AddressOnParent>0</rasd:AddressOnParent>
        <rasd:ElementName>disk0</rasd:ElementName>
        <rasd:HostResource>ovf:/disk/{disk_id}</rasd:HostResource>
        <rasd:InstanceID>{id}</rasd:InstanceID>
        <rasd:Parent>{parent}</rasd:Parent>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>"#
        )
    }

    /// Two systems: "web" with a full device set on a SATA disk, and "db"
    /// with a single SATA disk.
    pub fn two_system_ovf() -> String {
        let references = r#"
    <File ovf:id="file1" ovf:href="web-disk1.vmdk" ovf:size="3072"/>
    <File ovf:id="file2" ovf:href="db-disk1.vmdk" ovf:size="2048"/>"#;
        let disks = r#"
    <Disk ovf:diskId="web-disk1" ovf:fileRef="file1" ovf:capacity="4" ovf:capacityAllocationUnits="byte * 2^30" ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#sparse"/>
    <Disk ovf:diskId="db-disk1" ovf:fileRef="file2" ovf:capacity="8" ovf:capacityAllocationUnits="byte * 2^30" ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#sparse"/>"#;

        let web_items = [
            cpu_item("1", 2),
            memory_item("2", 1024),
            ide_item("3"),
            sata_item("4"),
            disk_item("5", "4", "web-disk1"),
            r#"<Item>
        <rasd:AutomaticAllocation>true</rasd:AutomaticAllocation>
        <rasd:Connection>NAT</rasd:Connection>
        <rasd:ElementName>ethernet0</rasd:ElementName>
        <rasd:InstanceID>6</rasd:InstanceID>
        <rasd:ResourceSubType>E1000</rasd:ResourceSubType>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
      <Item ovf:required="false">
        <rasd:Address>0</rasd:Address>
        <rasd:ElementName>usb</rasd:ElementName>
        <rasd:InstanceID>7</rasd:InstanceID>
        <rasd:ResourceType>23</rasd:ResourceType>
      </Item>
      <Item ovf:required="false">
        <rasd:ElementName>sound</rasd:ElementName>
        <rasd:InstanceID>8</rasd:InstanceID>
        <rasd:ResourceSubType>ensoniq1371</rasd:ResourceSubType>
        <rasd:ResourceType>35</rasd:ResourceType>
      </Item>"#
                .to_string(),
        ]
        .concat();

        let web = format!(
            r#"<VirtualSystem ovf:id="web">
    <Info>Web front end</Info>
    <Name>web-server</Name>
    <OperatingSystemSection ovf:id="94">
      <Info>The kind of installed guest operating system</Info>
      <Description>Ubuntu</Description>
    </OperatingSystemSection>
    <ProductSection>
      <Info>Product information</Info>
      <Product>Acme Web</Product>
      <Vendor>Acme</Vendor>
      <Version>2.1</Version>
    </ProductSection>
    <AnnotationSection>
      <Info>Notes</Info>
      <Annotation>Serves the shop front end</Annotation>
    </AnnotationSection>
    <VirtualHardwareSection>
      <Info>Virtual hardware requirements</Info>
      <System>
        <vssd:ElementName>Virtual Hardware Family</vssd:ElementName>
        <vssd:InstanceID>0</vssd:InstanceID>
        <vssd:VirtualSystemType>vmx-07</vssd:VirtualSystemType>
      </System>
      {web_items}
    </VirtualHardwareSection>
  </VirtualSystem>"#
        );

        let db_items = [
            cpu_item("1", 1),
            memory_item("2", 2048),
            sata_item("3"),
            disk_item("4", "3", "db-disk1"),
        ]
        .concat();
        let db = system_xml("db", "db-server", &db_items);

        ovf_document(
            references,
            disks,
            &format!(
                r#"<VirtualSystemCollection ovf:id="shop">
    <Info>Shop appliance</Info>
    {web}
    {db}
  </VirtualSystemCollection>"#
            ),
        )
    }

    /// Disk image contents used by the package writers.
    pub fn disk_contents(name: &str) -> Vec<u8> {
        let len = if name.starts_with("web") { 3072 } else { 2048 };
        (0..len).map(|i| (i % 251) as u8 ^ name.len() as u8).collect()
    }

    /// Write `app.ovf` and both disk images into `<dir>/pkg`, plus `app.mf`
    /// when `with_manifest` is set. Returns the descriptor path.
    pub fn write_package(dir: &Path, xml: &str, with_manifest: bool) -> PathBuf {
        let pkg = dir.join("pkg");
        std::fs::create_dir_all(&pkg).unwrap();
        let descriptor = pkg.join("app.ovf");
        std::fs::write(&descriptor, xml).unwrap();

        let mut manifest = String::new();
        for name in DISK_FILES {
            let data = disk_contents(name);
            std::fs::write(pkg.join(name), &data).unwrap();
            manifest.push_str(&format!("SHA256({})= {}\n", name, hex::encode(Sha256::digest(&data))));
        }
        if with_manifest {
            manifest.push_str(&format!(
                "SHA256(app.ovf)= {}\n",
                hex::encode(Sha256::digest(xml.as_bytes()))
            ));
            std::fs::write(pkg.join("app.mf"), manifest).unwrap();
        }
        descriptor
    }

    /// Write an OVA archive with the descriptor first, then the disks.
    pub fn write_ova(dir: &Path, xml: &str) -> PathBuf {
        let path = dir.join("app.ova");
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);

        let mut append = |name: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        };
        append("app.ovf", xml.as_bytes());
        for name in DISK_FILES {
            append(name, &disk_contents(name));
        }

        builder.into_inner().unwrap();
        path
    }
}

/// Registry call, recorded before the call's outcome is decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateMachine(String),
    AddStorageController(MachineId, String),
    ConfigureDevices(MachineId),
    AttachMedium(MachineId, AttachmentSlot),
    DetachMedium(MachineId, AttachmentSlot),
    RegisterMachine(MachineId),
    UnregisterMachine(MachineId),
    DeleteMachineSettings(MachineId),
}

#[derive(Debug, Clone)]
pub struct FakeMachine {
    pub spec: MachineSpec,
    pub controllers: Vec<ControllerSpec>,
    pub attachments: Vec<MediumAttachment>,
    pub devices: DeviceSettings,
    pub registered: bool,
}

#[derive(Default)]
struct RegistryState {
    calls: Vec<Call>,
    failures: HashMap<&'static str, ImportError>,
    machines: Vec<(MachineId, FakeMachine)>,
}

/// In-memory registry with a call log and per-operation failure injection.
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `operation` fail with `error`.
    pub fn fail_on(&self, operation: &'static str, error: ImportError) {
        self.state.lock().failures.insert(operation, error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Ids of the machines that still exist, in creation order.
    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.state.lock().machines.iter().map(|(id, _)| *id).collect()
    }

    pub fn registered(&self) -> Vec<MachineId> {
        self.state
            .lock()
            .machines
            .iter()
            .filter(|(_, m)| m.registered)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn machine(&self, id: &MachineId) -> Option<FakeMachine> {
        self.state
            .lock()
            .machines
            .iter()
            .find(|(mid, _)| mid == id)
            .map(|(_, m)| m.clone())
    }

    /// Insert a machine directly, without recording a call.
    pub fn seed_machine(&self, name: &str, registered: bool) -> MachineId {
        let id = MachineId::new();
        self.state.lock().machines.push((
            id,
            FakeMachine {
                spec: MachineSpec {
                    name: name.to_string(),
                    os_type: "Other".into(),
                    cpu_count: 1,
                    memory_mb: 512,
                    description: None,
                    metadata: Default::default(),
                    settings_dir: PathBuf::from("/machines").join(name),
                },
                controllers: Vec::new(),
                attachments: Vec::new(),
                devices: DeviceSettings::default(),
                registered,
            },
        ));
        id
    }

    fn begin(&self, operation: &'static str, call: Call) -> ImportResult<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.failures.get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn with_machine<T>(
        &self,
        id: &MachineId,
        change: impl FnOnce(&mut FakeMachine) -> ImportResult<T>,
    ) -> ImportResult<T> {
        let mut state = self.state.lock();
        let machine = state
            .machines
            .iter_mut()
            .find(|(mid, _)| mid == id)
            .map(|(_, m)| m)
            .ok_or_else(|| ImportError::NotFound(format!("machine {}", id)))?;
        change(machine)
    }
}

#[async_trait]
impl MachineRegistry for FakeRegistry {
    async fn create_machine(&self, spec: &MachineSpec) -> ImportResult<MachineId> {
        self.begin("create_machine", Call::CreateMachine(spec.name.clone()))?;
        let id = MachineId::new();
        self.state.lock().machines.push((
            id,
            FakeMachine {
                spec: spec.clone(),
                controllers: Vec::new(),
                attachments: Vec::new(),
                devices: DeviceSettings::default(),
                registered: false,
            },
        ));
        Ok(id)
    }

    async fn add_storage_controller(
        &self,
        machine: &MachineId,
        controller: &ControllerSpec,
    ) -> ImportResult<()> {
        self.begin(
            "add_storage_controller",
            Call::AddStorageController(*machine, controller.name.clone()),
        )?;
        self.with_machine(machine, |m| {
            m.controllers.push(controller.clone());
            Ok(())
        })
    }

    async fn configure_devices(
        &self,
        machine: &MachineId,
        devices: &DeviceSettings,
    ) -> ImportResult<()> {
        self.begin("configure_devices", Call::ConfigureDevices(*machine))?;
        self.with_machine(machine, |m| {
            m.devices = devices.clone();
            Ok(())
        })
    }

    async fn attach_medium(
        &self,
        machine: &MachineId,
        attachment: &MediumAttachment,
    ) -> ImportResult<()> {
        self.begin(
            "attach_medium",
            Call::AttachMedium(*machine, attachment.slot.clone()),
        )?;
        self.with_machine(machine, |m| {
            m.attachments.push(attachment.clone());
            Ok(())
        })
    }

    async fn detach_medium(&self, machine: &MachineId, slot: &AttachmentSlot) -> ImportResult<()> {
        self.begin("detach_medium", Call::DetachMedium(*machine, slot.clone()))?;
        self.with_machine(machine, |m| {
            m.attachments.retain(|a| &a.slot != slot);
            Ok(())
        })
    }

    async fn register_machine(&self, machine: &MachineId) -> ImportResult<()> {
        self.begin("register_machine", Call::RegisterMachine(*machine))?;
        self.with_machine(machine, |m| {
            m.registered = true;
            Ok(())
        })
    }

    async fn unregister_machine(&self, machine: &MachineId) -> ImportResult<()> {
        self.begin("unregister_machine", Call::UnregisterMachine(*machine))?;
        self.with_machine(machine, |m| {
            m.registered = false;
            Ok(())
        })
    }

    async fn delete_machine_settings(&self, machine: &MachineId) -> ImportResult<()> {
        self.begin("delete_machine_settings", Call::DeleteMachineSettings(*machine))?;
        let mut state = self.state.lock();
        let before = state.machines.len();
        state.machines.retain(|(id, _)| id != machine);
        if state.machines.len() == before {
            return Err(ImportError::NotFound(format!("machine {}", machine)));
        }
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    copies: Vec<ImageCopyRequest>,
    conversions: Vec<ImageCopyRequest>,
    deleted: Vec<PathBuf>,
    fail_sources: HashMap<String, ImportError>,
    delete_error: Option<ImportError>,
    stall: bool,
}

/// Medium store that copies synchronously, with failure injection by source
/// file name and a mode where copies only end when cancelled.
#[derive(Default)]
pub struct FakeMediumStore {
    state: Mutex<StoreState>,
}

impl FakeMediumStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of a source named `file_name` complete with `error`.
    pub fn fail_copies_of(&self, file_name: &str, error: ImportError) {
        self.state
            .lock()
            .fail_sources
            .insert(file_name.to_string(), error);
    }

    /// Copies write a partial target and then wait for cancellation.
    pub fn stall_copies(&self) {
        self.state.lock().stall = true;
    }

    pub fn fail_deletes(&self, error: ImportError) {
        self.state.lock().delete_error = Some(error);
    }

    pub fn copies(&self) -> Vec<ImageCopyRequest> {
        self.state.lock().copies.clone()
    }

    pub fn conversions(&self) -> Vec<ImageCopyRequest> {
        self.state.lock().conversions.clone()
    }

    /// Delete attempts, in call order.
    pub fn deleted(&self) -> Vec<PathBuf> {
        self.state.lock().deleted.clone()
    }

    fn start(&self, request: &ImageCopyRequest) -> ImportResult<Progress> {
        let file_name = request
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (failure, stall) = {
            let state = self.state.lock();
            (state.fail_sources.get(&file_name).cloned(), state.stall)
        };

        let (progress, mut reporter) = Progress::new(format!("copy {}", file_name), 1);
        reporter.begin_operation("copy", 1);

        if let Some(error) = failure {
            std::fs::write(&request.target, b"partial")?;
            reporter.set_operation_percent(40);
            reporter.complete(Err(error));
            return Ok(progress);
        }

        if stall {
            std::fs::write(&request.target, b"partial")?;
            reporter.set_operation_percent(10);
            let token = reporter.cancellation_token();
            tokio::spawn(async move {
                token.cancelled().await;
                let result = reporter.checkpoint();
                reporter.complete(result);
            });
            return Ok(progress);
        }

        match std::fs::read(&request.source) {
            Ok(data) => std::fs::write(&request.target, data)?,
            Err(_) => std::fs::write(&request.target, b"")?,
        }
        reporter.set_operation_percent(100);
        reporter.complete(Ok(()));
        Ok(progress)
    }
}

#[async_trait]
impl MediumStore for FakeMediumStore {
    async fn copy_image(&self, request: &ImageCopyRequest) -> ImportResult<Progress> {
        self.state.lock().copies.push(request.clone());
        self.start(request)
    }

    async fn convert_image(&self, request: &ImageCopyRequest) -> ImportResult<Progress> {
        self.state.lock().conversions.push(request.clone());
        self.start(request)
    }

    async fn delete_image(&self, location: &Path) -> ImportResult<()> {
        let error = {
            let mut state = self.state.lock();
            state.deleted.push(location.to_path_buf());
            state.delete_error.clone()
        };
        if let Some(error) = error {
            return Err(error);
        }
        match std::fs::remove_file(location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
