//! Device and line-configuration types shared by the core and the hosts

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// USB interface class code for CDC communications
pub const USB_CLASS_CDC: u8 = 0x02;

/// Baud rates offered to users when picking a line speed
pub const STANDARD_BAUD_RATES: [u32; 8] =
    [9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600];

/// A device as reported by the host enumeration layer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawDevice {
    /// System path or identifier, e.g. `/dev/bus/usb/001/004`
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Class codes of every interface in the active configuration
    pub interface_classes: Vec<u8>,
}

/// Serial driver family of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    #[default]
    Unknown,
    CdcAcm,
    Ch34x,
    CommonUsb,
    Cp21xx,
    Ftdi,
    Prolific,
}

/// Known (vendor, product) signatures for the vendor-specific drivers
const SIGNATURES: &[(DriverKind, u16, &[u16])] = &[
    (
        DriverKind::Ftdi,
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
    ),
    (DriverKind::Cp21xx, 0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA80]),
    (
        DriverKind::Prolific,
        0x067B,
        &[0x2303, 0x23A3, 0x23B3, 0x23C3, 0x23D3, 0x23E3, 0x23F3],
    ),
    (DriverKind::Ch34x, 0x1A86, &[0x7523, 0x5523, 0x7522]),
];

impl DriverKind {
    /// Built-in signature probing
    ///
    /// Vendor-specific chips are matched by identifier first; anything else
    /// exposing a CDC communications interface is treated as CDC-ACM.
    pub fn probe(vendor_id: u16, product_id: u16, interface_classes: &[u8]) -> Option<Self> {
        for (kind, vid, pids) in SIGNATURES {
            if *vid == vendor_id && pids.contains(&product_id) {
                return Some(*kind);
            }
        }

        if interface_classes.contains(&USB_CLASS_CDC) {
            return Some(DriverKind::CdcAcm);
        }

        None
    }

    /// Whether the kind names a usable serial driver
    pub fn is_serial(&self) -> bool {
        !matches!(self, DriverKind::Unknown)
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DriverKind::Unknown => "Unknown",
            DriverKind::CdcAcm => "Cdc Acm",
            DriverKind::Ch34x => "Ch34x",
            DriverKind::CommonUsb => "CommonUsb",
            DriverKind::Cp21xx => "Cp21xx",
            DriverKind::Ftdi => "Ftdi",
            DriverKind::Prolific => "Prolific",
        };
        f.write_str(label)
    }
}

impl FromStr for DriverKind {
    type Err = InvalidParameter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "unknown" => Ok(DriverKind::Unknown),
            "cdcacm" => Ok(DriverKind::CdcAcm),
            "ch34x" => Ok(DriverKind::Ch34x),
            "commonusb" => Ok(DriverKind::CommonUsb),
            "cp21xx" => Ok(DriverKind::Cp21xx),
            "ftdi" => Ok(DriverKind::Ftdi),
            "prolific" => Ok(DriverKind::Prolific),
            _ => Err(InvalidParameter::new("driver kind", s)),
        }
    }
}

/// Caller-supplied (vendor, product) to driver mapping, checked before probing
#[derive(Debug, Clone, Default)]
pub struct DriverOverrides {
    table: HashMap<(u16, u16), DriverKind>,
}

impl DriverOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vendor_id: u16, product_id: u16, kind: DriverKind) {
        self.table.insert((vendor_id, product_id), kind);
    }

    pub fn lookup(&self, vendor_id: u16, product_id: u16) -> Option<DriverKind> {
        self.table.get(&(vendor_id, product_id)).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl FromIterator<((u16, u16), DriverKind)> for DriverOverrides {
    fn from_iter<I: IntoIterator<Item = ((u16, u16), DriverKind)>>(iter: I) -> Self {
        Self {
            table: iter.into_iter().collect(),
        }
    }
}

/// Snapshot of one attached device, produced fresh by every enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub device: RawDevice,
    pub driver: DriverKind,
    pub permission_granted: bool,
}

impl DeviceDescriptor {
    pub fn path(&self) -> &str {
        &self.device.path
    }

    pub fn vendor_id(&self) -> u16 {
        self.device.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.device.product_id
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.device.manufacturer.as_deref()
    }

    /// Human readable label used by device pickers
    pub fn display_name(&self) -> String {
        match self.manufacturer() {
            Some(name) if !name.is_empty() => {
                format!("{} ({}, {})", name, self.driver, self.path())
            }
            _ => format!(
                "{} 0x{:04X}:0x{:04X} ({})",
                self.driver,
                self.vendor_id(),
                self.product_id(),
                self.path()
            ),
        }
    }
}

/// How `open` picks a device out of an enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Exact system path
    Path(String),
    /// First device with these identifiers
    VendorProduct { vendor_id: u16, product_id: u16 },
    /// First device with a known serial driver
    Any,
}

impl DeviceSelector {
    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        match self {
            DeviceSelector::Path(path) => descriptor.path() == path,
            DeviceSelector::VendorProduct {
                vendor_id,
                product_id,
            } => descriptor.vendor_id() == *vendor_id && descriptor.product_id() == *product_id,
            DeviceSelector::Any => descriptor.driver.is_serial(),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Path(path) => write!(f, "path:{}", path),
            DeviceSelector::VendorProduct {
                vendor_id,
                product_id,
            } => write!(f, "0x{:04x}:0x{:04x}", vendor_id, product_id),
            DeviceSelector::Any => f.write_str("any"),
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = InvalidParameter;

    /// Accepts `any`, `path:<system path>`, a bare absolute path, or `VID:PID`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("any") {
            return Ok(DeviceSelector::Any);
        }
        if let Some(path) = s.strip_prefix("path:") {
            return Ok(DeviceSelector::Path(path.to_string()));
        }
        if s.starts_with('/') {
            return Ok(DeviceSelector::Path(s.to_string()));
        }

        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| InvalidParameter::new("device selector", s))?;
        Ok(DeviceSelector::VendorProduct {
            vendor_id: parse_hex_id(vid)?,
            product_id: parse_hex_id(pid)?,
        })
    }
}

/// Parse a 16-bit USB identifier written as `0x1A86` or `1a86`
pub fn parse_hex_id(s: &str) -> Result<u16, InvalidParameter> {
    let trimmed = s.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 4 {
        return Err(InvalidParameter::new("USB identifier", s));
    }
    u16::from_str_radix(hex, 16).map_err(|_| InvalidParameter::new("USB identifier", s))
}

/// A value outside the domain of a line parameter or identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {name}: {value}")]
pub struct InvalidParameter {
    pub name: &'static str,
    pub value: String,
}

impl InvalidParameter {
    pub fn new(name: &'static str, value: impl fmt::Display) -> Self {
        Self {
            name,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    pub fn bits(&self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = InvalidParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            _ => Err(InvalidParameter::new("data bits", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    /// Integer encoding used by the host interface (1, 3 for 1.5, 2)
    pub fn code(&self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::OnePointFive => 3,
            StopBits::Two => 2,
        }
    }
}

impl TryFrom<u8> for StopBits {
    type Error = InvalidParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StopBits::One),
            3 => Ok(StopBits::OnePointFive),
            2 => Ok(StopBits::Two),
            _ => Err(InvalidParameter::new("stop bits", value)),
        }
    }
}

impl FromStr for StopBits {
    type Err = InvalidParameter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            other => Err(InvalidParameter::new("stop bits", other)),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopBits::One => f.write_str("1"),
            StopBits::OnePointFive => f.write_str("1.5"),
            StopBits::Two => f.write_str("2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub fn code(&self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
            Parity::Mark => 3,
            Parity::Space => 4,
        }
    }

    fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        }
    }
}

impl TryFrom<u8> for Parity {
    type Error = InvalidParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Parity::None),
            1 => Ok(Parity::Odd),
            2 => Ok(Parity::Even),
            3 => Ok(Parity::Mark),
            4 => Ok(Parity::Space),
            _ => Err(InvalidParameter::new("parity", value)),
        }
    }
}

/// Serial line configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineParameters {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl LineParameters {
    pub fn new(baud_rate: u32, data_bits: DataBits, stop_bits: StopBits, parity: Parity) -> Self {
        Self {
            baud_rate,
            data_bits,
            stop_bits,
            parity,
        }
    }

    /// Build from the integer encodings used across the host interface
    pub fn from_codes(
        baud_rate: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: u8,
    ) -> Result<Self, InvalidParameter> {
        let params = Self {
            baud_rate,
            data_bits: DataBits::try_from(data_bits)?,
            stop_bits: StopBits::try_from(stop_bits)?,
            parity: Parity::try_from(parity)?,
        };
        params.validate()?;
        Ok(params)
    }

    /// Checks that can be made without asking the transport
    pub fn validate(&self) -> Result<(), InvalidParameter> {
        if self.baud_rate == 0 {
            return Err(InvalidParameter::new("baud rate", self.baud_rate));
        }
        Ok(())
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

impl Default for LineParameters {
    fn default() -> Self {
        Self::new(115_200, DataBits::Eight, StopBits::One, Parity::None)
    }
}

impl fmt::Display for LineParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits.bits(),
            self.parity.letter(),
            self.stop_bits
        )
    }
}
