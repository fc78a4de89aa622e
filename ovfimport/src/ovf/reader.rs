//! Streaming OVF descriptor reader.
//!
//! Walks the XML once with `quick-xml` and builds an [`OvfEnvelope`]. Only
//! local element names are matched, so any namespace prefix works. OVF 0.9
//! `Section`/`Content` elements are canonicalized through their `xsi:type`
//! (`ovf:DiskSection_Type` → `DiskSection`).

use super::types::{
    DiskDefinition, FileReference, NetworkDefinition, OvfEnvelope, RawHardwareItem,
    RawHardwareSection, RawOperatingSystem, RawProduct, RawSection, RawVirtualSystem,
};
use super::cim;
use ovfimport_shared::errors::{ImportError, ImportResult};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::path::Path;

const ITEM_ELEMENTS: [&str; 3] = ["Item", "StorageItem", "EthernetPortItem"];

/// Parse descriptor XML into the raw envelope graph.
///
/// `descriptor_path` is recorded in the envelope; its parent directory becomes
/// the package directory that file references are resolved against.
pub fn parse_descriptor(xml: &str, descriptor_path: &Path) -> ImportResult<OvfEnvelope> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut builder = DescriptorBuilder::new(descriptor_path);

    loop {
        let event = reader.read_event().map_err(|e| {
            ImportError::Format(format!(
                "malformed XML at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(ref e) => builder.open(e)?,
            Event::Empty(ref e) => {
                builder.open(e)?;
                builder.close()?;
            }
            Event::End(_) => builder.close()?,
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .map_err(|e| ImportError::Format(format!("invalid text content: {}", e)))?;
                builder.text.push_str(&text);
            }
            Event::CData(ref c) => {
                builder.text.push_str(&String::from_utf8_lossy(c.as_ref()));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    builder.finish()
}

enum OpenSection {
    OperatingSystem(RawOperatingSystem),
    Product(RawProduct),
    Annotation(String),
    Eula(String),
    Hardware(RawHardwareSection),
}

impl OpenSection {
    fn into_raw(self) -> RawSection {
        match self {
            Self::OperatingSystem(os) => RawSection::OperatingSystem(os),
            Self::Product(p) => RawSection::Product(p),
            Self::Annotation(a) => RawSection::Annotation(a),
            Self::Eula(l) => RawSection::Eula(l),
            Self::Hardware(hw) => RawSection::VirtualHardware(hw),
        }
    }
}

struct DescriptorBuilder {
    envelope: OvfEnvelope,
    /// Canonical names of the currently open elements.
    path: Vec<String>,
    text: String,
    seen_root: bool,
    system: Option<RawVirtualSystem>,
    section: Option<(String, OpenSection)>,
    item: Option<RawHardwareItem>,
    network: Option<NetworkDefinition>,
}

impl DescriptorBuilder {
    fn new(descriptor_path: &Path) -> Self {
        let package_dir = descriptor_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self {
            envelope: OvfEnvelope {
                descriptor_path: descriptor_path.to_path_buf(),
                package_dir,
                ..Default::default()
            },
            path: Vec::new(),
            text: String::new(),
            seen_root: false,
            system: None,
            section: None,
            item: None,
            network: None,
        }
    }

    fn open(&mut self, e: &BytesStart<'_>) -> ImportResult<()> {
        let attrs = attributes(e)?;
        let name = canonical_name(e, &attrs);
        self.text.clear();

        if self.path.is_empty() {
            if self.seen_root {
                return Err(ImportError::Format(format!(
                    "unexpected second root element <{}>",
                    name
                )));
            }
            if name != "Envelope" {
                return Err(ImportError::Format(format!(
                    "root element is <{}>, expected <Envelope>",
                    name
                )));
            }
            self.seen_root = true;
            self.envelope.version = attrs.get("version").cloned().unwrap_or_default();
            self.path.push(name);
            return Ok(());
        }

        let parent = self.path.last().map(String::as_str).unwrap_or_default();

        match (parent, name.as_str()) {
            ("References", "File") => {
                self.envelope.references.push(FileReference {
                    id: required(&attrs, "id", "File")?,
                    href: required(&attrs, "href", "File")?,
                    size: optional_number(&attrs, "size", "File")?,
                    compression: attrs.get("compression").cloned(),
                });
            }
            ("DiskSection", "Disk") => {
                let units = attrs.get("capacityAllocationUnits").map(String::as_str);
                let capacity = attrs
                    .get("capacity")
                    .and_then(|c| c.parse::<u64>().ok())
                    .and_then(|c| match units {
                        Some(units) => cim::allocation_unit_bytes(units)
                            .and_then(|multiplier| c.checked_mul(multiplier)),
                        None => Some(c),
                    });
                self.envelope.disks.push(DiskDefinition {
                    disk_id: required(&attrs, "diskId", "Disk")?,
                    file_ref: attrs.get("fileRef").cloned(),
                    capacity,
                    format: attrs.get("format").cloned().unwrap_or_default(),
                    populated_size: optional_number(&attrs, "populatedSize", "Disk")?,
                });
            }
            ("NetworkSection", "Network") => {
                self.network = Some(NetworkDefinition {
                    name: required(&attrs, "name", "Network")?,
                    description: None,
                });
            }
            (_, "VirtualSystem") => {
                if self.system.is_some() {
                    return Err(ImportError::Format(
                        "VirtualSystem elements cannot be nested".into(),
                    ));
                }
                self.system = Some(RawVirtualSystem {
                    id: attrs.get("id").cloned().unwrap_or_default(),
                    ..Default::default()
                });
            }
            ("VirtualSystem", section_name) => {
                let section = match section_name {
                    "OperatingSystemSection" => {
                        Some(OpenSection::OperatingSystem(RawOperatingSystem {
                            id: attrs.get("id").and_then(|id| id.trim().parse().ok()),
                            os_type: attrs.get("osType").cloned(),
                            description: None,
                        }))
                    }
                    "ProductSection" => Some(OpenSection::Product(RawProduct::default())),
                    "AnnotationSection" => Some(OpenSection::Annotation(String::new())),
                    "EulaSection" => Some(OpenSection::Eula(String::new())),
                    "VirtualHardwareSection" => {
                        Some(OpenSection::Hardware(RawHardwareSection::default()))
                    }
                    _ => None,
                };
                if let Some(section) = section {
                    self.section = Some((section_name.to_string(), section));
                }
            }
            ("VirtualHardwareSection", element) if ITEM_ELEMENTS.contains(&element) => {
                if matches!(self.section, Some((_, OpenSection::Hardware(_)))) {
                    self.item = Some(RawHardwareItem::default());
                }
            }
            _ => {}
        }

        self.path.push(name);
        Ok(())
    }

    fn close(&mut self) -> ImportResult<()> {
        let name = self
            .path
            .pop()
            .ok_or_else(|| ImportError::Format("unbalanced end tag".into()))?;
        let text = std::mem::take(&mut self.text).trim().to_string();
        let parent = self.path.last().map(String::as_str).unwrap_or_default();

        // Fields of the open hardware item.
        if ITEM_ELEMENTS.contains(&parent)
            && let Some(item) = self.item.as_mut()
        {
            return set_item_field(item, &name, text);
        }

        match (parent, name.as_str()) {
            ("VirtualHardwareSection", element) if ITEM_ELEMENTS.contains(&element) => {
                if let Some(item) = self.item.take()
                    && let Some((_, OpenSection::Hardware(hw))) = self.section.as_mut()
                {
                    hw.items.push(item);
                }
            }
            ("System", "VirtualSystemType") => {
                if let Some((_, OpenSection::Hardware(hw))) = self.section.as_mut() {
                    hw.system_type = non_empty(text);
                }
            }
            ("Network", "Description") => {
                if let Some(network) = self.network.as_mut() {
                    network.description = non_empty(text);
                }
            }
            ("NetworkSection", "Network") => {
                if let Some(network) = self.network.take() {
                    self.envelope.networks.push(network);
                }
            }
            ("VirtualSystem", "Name") => {
                if let Some(system) = self.system.as_mut() {
                    system.name = non_empty(text);
                }
            }
            ("VirtualSystem", section_name)
                if self
                    .section
                    .as_ref()
                    .is_some_and(|(open, _)| open == section_name) =>
            {
                if let Some((_, section)) = self.section.take()
                    && let Some(system) = self.system.as_mut()
                {
                    system.sections.push(section.into_raw());
                }
            }
            (_, "VirtualSystem") => {
                if let Some(system) = self.system.take() {
                    self.envelope.systems.push(system);
                }
            }
            (section_name, field) => {
                if let Some((open, section)) = self.section.as_mut()
                    && open == section_name
                {
                    set_section_field(section, field, text);
                }
            }
        }

        Ok(())
    }

    fn finish(self) -> ImportResult<OvfEnvelope> {
        if !self.seen_root {
            return Err(ImportError::Format("document has no root element".into()));
        }
        if let Some(open) = self.path.last() {
            return Err(ImportError::Format(format!(
                "unexpected end of document inside <{}>",
                open
            )));
        }

        let envelope = self.envelope;
        if envelope.systems.is_empty() {
            return Err(ImportError::Format(
                "descriptor contains no VirtualSystem".into(),
            ));
        }
        for (index, system) in envelope.systems.iter().enumerate() {
            if system.hardware().is_none() {
                return Err(ImportError::Format(format!(
                    "virtual system {} ('{}') has no VirtualHardwareSection",
                    index, system.id
                )));
            }
        }

        tracing::debug!(
            version = %envelope.version,
            systems = envelope.systems.len(),
            files = envelope.references.len(),
            disks = envelope.disks.len(),
            "Parsed OVF descriptor"
        );

        Ok(envelope)
    }
}

fn set_item_field(item: &mut RawHardwareItem, field: &str, text: String) -> ImportResult<()> {
    match field {
        "InstanceID" | "InstanceId" => item.instance_id = text,
        "ResourceType" => item.resource_type = text.parse().ok(),
        "ResourceSubType" => item.resource_sub_type = non_empty(text),
        "ElementName" => item.element_name = non_empty(text),
        "Caption" => item.caption = non_empty(text),
        "Description" => item.description = non_empty(text),
        "VirtualQuantity" => {
            if !text.is_empty() {
                let quantity = text.parse().map_err(|_| {
                    ImportError::Format(format!(
                        "hardware item '{}': invalid VirtualQuantity '{}'",
                        item.instance_id, text
                    ))
                })?;
                item.virtual_quantity = Some(quantity);
            }
        }
        "AllocationUnits" => item.allocation_units = non_empty(text),
        "Address" => item.address = non_empty(text),
        "AddressOnParent" => item.address_on_parent = non_empty(text),
        "Parent" => item.parent = non_empty(text),
        "HostResource" => {
            if !text.is_empty() {
                item.host_resource.push(text);
            }
        }
        "Connection" => {
            if !text.is_empty() {
                item.connection.push(text);
            }
        }
        "AutomaticAllocation" => {
            item.automatic_allocation = match text.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            }
        }
        _ => {}
    }
    Ok(())
}

fn set_section_field(section: &mut OpenSection, field: &str, text: String) {
    match section {
        OpenSection::OperatingSystem(os) => {
            if field == "Description" {
                os.description = non_empty(text);
            }
        }
        OpenSection::Product(product) => {
            let slot = match field {
                "Product" => &mut product.product,
                "ProductUrl" => &mut product.product_url,
                "Vendor" => &mut product.vendor,
                "VendorUrl" => &mut product.vendor_url,
                "Version" => &mut product.version,
                "FullVersion" => &mut product.full_version,
                _ => return,
            };
            *slot = non_empty(text);
        }
        OpenSection::Annotation(annotation) => {
            if field == "Annotation" {
                *annotation = text;
            }
        }
        OpenSection::Eula(license) => {
            if field == "License" {
                *license = text;
            }
        }
        OpenSection::Hardware(_) => {}
    }
}

/// Attributes keyed by local name.
fn attributes(e: &BytesStart<'_>) -> ImportResult<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ImportError::Format(format!("invalid attribute: {}", err)))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| ImportError::Format(format!("invalid attribute value: {}", err)))?
            .to_string();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

/// Local element name, with OVF 0.9 `Section`/`Content` resolved by `xsi:type`.
fn canonical_name(e: &BytesStart<'_>, attrs: &HashMap<String, String>) -> String {
    let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
    if local != "Section" && local != "Content" {
        return local;
    }

    match attrs.get("type") {
        Some(xsi_type) => {
            let unprefixed = xsi_type.rsplit(':').next().unwrap_or(xsi_type);
            unprefixed
                .strip_suffix("_Type")
                .unwrap_or(unprefixed)
                .to_string()
        }
        None => local,
    }
}

fn required(attrs: &HashMap<String, String>, key: &str, element: &str) -> ImportResult<String> {
    attrs.get(key).cloned().ok_or_else(|| {
        ImportError::Format(format!("<{}> is missing required attribute '{}'", element, key))
    })
}

fn optional_number(
    attrs: &HashMap<String, String>,
    key: &str,
    element: &str,
) -> ImportResult<Option<u64>> {
    attrs
        .get(key)
        .map(|value| {
            value.trim().parse::<u64>().map_err(|_| {
                ImportError::Format(format!(
                    "<{}> attribute '{}' is not a number: '{}'",
                    element, key, value
                ))
            })
        })
        .transpose()
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}
