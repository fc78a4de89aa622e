//! CIM code tables used by OVF descriptors.

/// CIM_ResourceAllocationSettingData resource types the importer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Processor,
    Memory,
    IdeController,
    ParallelScsiHba,
    EthernetAdapter,
    FloppyDrive,
    CdDrive,
    DvdDrive,
    DiskDrive,
    OtherStorageDevice,
    UsbController,
    SoundCard,
}

impl ResourceType {
    pub fn from_code(code: u32) -> Option<Self> {
        let kind = match code {
            3 => Self::Processor,
            4 => Self::Memory,
            5 => Self::IdeController,
            6 => Self::ParallelScsiHba,
            10 => Self::EthernetAdapter,
            14 => Self::FloppyDrive,
            15 => Self::CdDrive,
            16 => Self::DvdDrive,
            17 => Self::DiskDrive,
            20 => Self::OtherStorageDevice,
            23 => Self::UsbController,
            35 => Self::SoundCard,
            _ => return None,
        };
        Some(kind)
    }
}

/// Map a CIM operating system id to a guest OS type identifier.
///
/// Unknown ids map to "Other".
pub fn guest_os_type(cim_id: u32) -> &'static str {
    match cim_id {
        2 => "MacOS",
        36 => "Linux",
        42 => "FreeBSD",
        43 => "FreeBSD_64",
        58 => "Windows2000",
        67 => "WindowsXP",
        69 => "Windows2003",
        70 => "Windows2003_64",
        71 => "WindowsXP_64",
        73 => "WindowsVista",
        74 => "WindowsVista_64",
        76 => "Windows2008",
        77 => "Windows2008_64",
        79 => "RedHat",
        80 => "RedHat_64",
        82 => "Solaris",
        83 => "Solaris_64",
        84 => "OpenSUSE",
        85 => "OpenSUSE_64",
        93 => "Debian",
        94 => "Ubuntu",
        95 => "Debian_64",
        96 => "Ubuntu_64",
        99 => "Linux",
        100 => "Linux_64",
        101 => "Linux24",
        102 => "Linux26",
        103 => "Windows7",
        105 => "Windows7_64",
        _ => "Other",
    }
}

/// Multiplier in bytes for an OVF allocation-units string.
///
/// Accepts the programmatic form (`byte * 2^20`, `byte*2^30`), plain `byte`
/// and the legacy names (`KiloBytes`, `MegaBytes`, `GigaBytes`).
pub fn allocation_unit_bytes(units: &str) -> Option<u64> {
    let compact: String = units.chars().filter(|c| !c.is_whitespace()).collect();
    let lower = compact.to_ascii_lowercase();

    match lower.as_str() {
        "byte" | "bytes" => return Some(1),
        "kilobytes" | "kb" => return Some(1 << 10),
        "megabytes" | "mb" => return Some(1 << 20),
        "gigabytes" | "gb" => return Some(1 << 30),
        _ => {}
    }

    let rest = lower.strip_prefix("byte*")?;
    let (base, exponent) = rest.split_once('^')?;
    let base: u64 = base.parse().ok()?;
    let exponent: u32 = exponent.parse().ok()?;
    base.checked_pow(exponent)
}

/// Convert a quantity in the given allocation units to megabytes.
///
/// Missing units are taken as megabytes, the common default for memory.
pub fn quantity_to_megabytes(quantity: u64, units: Option<&str>) -> Option<u64> {
    let multiplier = match units {
        Some(units) => allocation_unit_bytes(units)?,
        None => 1 << 20,
    };
    quantity.checked_mul(multiplier).map(|bytes| bytes >> 20)
}
